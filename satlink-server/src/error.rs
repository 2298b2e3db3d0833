///! Error kinds shared by the registry, scheduler, assigner and coordination server.
use chrono::{DateTime, Utc};
use satlink_common::Slot;
use thiserror::Error;

use crate::ephemeris::EphemerisError;

#[derive(Debug, Error)]
pub enum GroundError {
    /// Malformed record; the item is skipped and the batch continues
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown field unit: {0}")]
    UnknownUnit(String),

    #[error("slot {requested} conflicts with {existing} on unit {unit_id}")]
    SlotConflict {
        unit_id: String,
        requested: Slot,
        existing: Slot,
    },

    #[error("field unit {unit_id} timed out (last seen {last_seen})")]
    LivenessTimeout {
        unit_id: String,
        last_seen: DateTime<Utc>,
    },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error(transparent)]
    Ephemeris(#[from] EphemerisError),

    /// Process-level persistence failure. Fatal for the caller.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl GroundError {
    pub fn validation(msg: impl Into<String>) -> Self {
        GroundError::Validation(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, GroundError::Storage(_))
    }
}

impl From<satlink_common::SlotError> for GroundError {
    fn from(e: satlink_common::SlotError) -> Self {
        GroundError::Validation(e.to_string())
    }
}

pub type GroundResult<T> = Result<T, GroundError>;
