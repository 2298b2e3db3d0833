use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Half-open time interval `[start, end)` reserved on a field unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("slot start {start} is not before end {end}")]
    Empty {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("slot duration must be positive, got {0}s")]
    NonPositiveDuration(i64),
    #[error("slot of {duration_secs}s starting at {start} is out of range")]
    OutOfRange {
        start: DateTime<Utc>,
        duration_secs: i64,
    },
}

impl Slot {
    /// Build a slot, rejecting empty or inverted intervals.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, SlotError> {
        if start >= end {
            return Err(SlotError::Empty { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn starting_at(start: DateTime<Utc>, duration_secs: i64) -> Result<Self, SlotError> {
        if duration_secs <= 0 {
            return Err(SlotError::NonPositiveDuration(duration_secs));
        }
        let end = Duration::try_seconds(duration_secs)
            .and_then(|duration| start.checked_add_signed(duration))
            .ok_or(SlotError::OutOfRange { start, duration_secs })?;
        Self::new(start, end)
    }

    /// Deserialized slots bypass `new`, so callers re-check before trusting them.
    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    /// Two half-open intervals overlap iff each starts before the other ends.
    /// Back-to-back slots (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Slot) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// One candidate visibility opportunity produced by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassEntry {
    pub satellite: String,
    pub start_time: DateTime<Utc>,
    pub duration_secs: i64,
}

impl PassEntry {
    pub fn new(satellite: impl Into<String>, start_time: DateTime<Utc>, duration_secs: i64) -> Self {
        Self {
            satellite: satellite.into(),
            start_time,
            duration_secs,
        }
    }

    /// The slot this pass would occupy on a field unit.
    pub fn slot(&self) -> Result<Slot, SlotError> {
        Slot::starting_at(self.start_time, self.duration_secs)
    }
}

/// Ground observer location (WGS-84 geodetic).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observer {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    #[serde(default)]
    pub altitude_m: f64,
}

impl Default for Observer {
    fn default() -> Self {
        Self {
            latitude_deg: 28.6139,
            longitude_deg: 77.2090,
            altitude_m: 216.0,
        }
    }
}

/// Instantaneous pointing solution from the observer to a satellite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LookAngle {
    pub azimuth_deg: f64,
    pub elevation_deg: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_km: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
}

/// Connection state of a field unit as seen by the coordination server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Offline,
    Connected,
    /// Connected and bound to a satellite
    Assigned,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Offline => "offline",
            ConnectionState::Connected => "connected",
            ConnectionState::Assigned => "assigned",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pointing result self-reported by a unit. Display/audit only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointingResult {
    pub az: f64,
    pub el: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps: Option<GpsFix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satellite_name: Option<String>,
    pub reported_at: DateTime<Utc>,
}

/// One row of the aggregate state pushed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitView {
    pub fu_id: String,
    pub address: String,
    pub last_seen: DateTime<Utc>,
    pub state: ConnectionState,
    pub occupied_slots: Vec<Slot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satellite: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<PointingResult>,
}
