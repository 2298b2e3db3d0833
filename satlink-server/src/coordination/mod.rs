///! Coordination server: long-lived WebSocket connections from field units
///! and observer dashboards.

mod hub;
mod session;
mod socket;

pub use hub::CoordinationHub;
pub use session::{ConnectionId, TargetSource, TrackingMode};
pub use socket::ws_handler;
