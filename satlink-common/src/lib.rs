//! Shared data model and coordination wire contract for the satlink
//! ground segment. Used by the coordination server and by field unit agents.

pub mod protocol;
pub mod types;

pub use protocol::{
    AggregateRequest, AggregateState, AssignmentUpdate, AzElTarget, ClientEvent, ErrorNotice, PollRequest,
    PresenceReport, ResultReport, SatelliteSelection, ServerEvent, TelemetryReport,
};
pub use types::{
    ConnectionState, GpsFix, LookAngle, Observer, PassEntry, PointingResult, Slot, SlotError,
    UnitView,
};
