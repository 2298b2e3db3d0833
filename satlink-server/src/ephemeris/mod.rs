///! Ephemeris boundary
///!
///! The scheduler and the coordination server only ever ask one question:
///! where is satellite X, seen from this observer, at instant T. Propagation
///! itself lives behind the `Ephemeris` trait.

mod catalog;
mod propagator;

pub use catalog::{TleCatalog, TwoLineElement};
pub use propagator::Sgp4Ephemeris;

use chrono::{DateTime, Utc};
use satlink_common::{LookAngle, Observer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EphemerisError {
    #[error("satellite not found: {0}")]
    SatelliteNotFound(String),

    #[error("propagation failed for {satellite}: {reason}")]
    Propagation { satellite: String, reason: String },
}

impl EphemerisError {
    pub fn propagation(satellite: &str, reason: impl ToString) -> Self {
        EphemerisError::Propagation {
            satellite: satellite.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub trait Ephemeris: Send + Sync {
    fn look_angle(
        &self,
        satellite: &str,
        observer: &Observer,
        at: DateTime<Utc>,
    ) -> Result<LookAngle, EphemerisError>;

    fn knows(&self, satellite: &str) -> bool;
}
