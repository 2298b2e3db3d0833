///! satlink ground-segment coordination server
///!
///! Field unit registry, pass scheduling, slot assignment, and the realtime
///! coordination channel that streams pointing targets to field units.

pub mod artifacts;
pub mod assigner;
pub mod config;
pub mod coordination;
pub mod ephemeris;
pub mod error;
pub mod http;
pub mod logging;
pub mod planner;
pub mod presence;
pub mod registry;
pub mod scheduled;
pub mod scheduler;

pub use error::{GroundError, GroundResult};
