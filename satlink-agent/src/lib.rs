///! satlink field unit agent
///!
///! Keeps a field unit registered with the coordination server, points the antenna at the
///! targets it streams, and reports telemetry and pointing results back.

pub mod config;
pub mod connection;
pub mod logging;
pub mod rotator;

pub use connection::{FieldUnitAgent, LinkState};
