///! Pass scheduler
///!
///! Turns a list of satellite names into candidate `PassEntry`s over a
///! lookahead horizon. Visibility comes from the `Ephemeris`; this module only
///! decides what to sample and when.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use satlink_common::{Observer, PassEntry};

use crate::config::{MAX_HORIZON_HOURS, MAX_SAMPLE_STEP_MINUTES, ScheduleConfig};
use crate::ephemeris::{Ephemeris, EphemerisError};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub horizon: Duration,
    pub sample_step: Duration,
    pub pass_duration_secs: i64,
    pub min_elevation_deg: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&ScheduleConfig::default())
    }
}

impl From<&ScheduleConfig> for SchedulerSettings {
    fn from(config: &ScheduleConfig) -> Self {
        Self {
            horizon: Duration::hours(config.horizon_hours.min(MAX_HORIZON_HOURS) as i64),
            sample_step: Duration::minutes(config.sample_step_minutes.clamp(1, MAX_SAMPLE_STEP_MINUTES) as i64),
            pass_duration_secs: config.pass_duration_secs,
            min_elevation_deg: config.min_elevation_deg,
        }
    }
}

/// Per-satellite outcome of one scheduling run
#[derive(Debug, Clone, PartialEq)]
pub enum SatelliteOutcome {
    Scheduled { satellite: String, entries: usize },
    NotFound { satellite: String },
    Unschedulable { satellite: String, reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleRun {
    /// Sorted ascending by start; ties keep satellite request order
    pub entries: Vec<PassEntry>,
    pub outcomes: Vec<SatelliteOutcome>,
}

pub struct PassScheduler {
    ephemeris: Arc<dyn Ephemeris>,
    settings: SchedulerSettings,
}

impl PassScheduler {
    pub fn new(ephemeris: Arc<dyn Ephemeris>, settings: SchedulerSettings) -> Self {
        Self {
            ephemeris,
            settings,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Sample every `sample_step` across `[start, start + horizon)`. Each
    /// visible sample becomes its own entry; adjacent detections of the same
    /// satellite are not merged.
    pub fn generate_passes(
        &self,
        satellites: &[String],
        observer: &Observer,
        start: DateTime<Utc>,
    ) -> ScheduleRun {
        let mut run = ScheduleRun::default();

        for satellite in satellites {
            match self.sample_satellite(satellite, observer, start) {
                Ok(entries) => {
                    tracing::info!("Scheduled {} entries for {}", entries.len(), satellite);
                    run.outcomes.push(SatelliteOutcome::Scheduled {
                        satellite: satellite.clone(),
                        entries: entries.len(),
                    });
                    run.entries.extend(entries);
                }
                Err(EphemerisError::SatelliteNotFound(_)) => {
                    tracing::warn!("{} has no TLE, skipping", satellite);
                    run.outcomes.push(SatelliteOutcome::NotFound {
                        satellite: satellite.clone(),
                    });
                }
                Err(e) => {
                    tracing::warn!("{} is unschedulable this run: {}", satellite, e);
                    run.outcomes.push(SatelliteOutcome::Unschedulable {
                        satellite: satellite.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        // Stable sort keeps request order for equal starts
        run.entries.sort_by_key(|entry| entry.start_time);
        run
    }

    fn sample_satellite(
        &self,
        satellite: &str,
        observer: &Observer,
        start: DateTime<Utc>,
    ) -> Result<Vec<PassEntry>, EphemerisError> {
        if !self.ephemeris.knows(satellite) {
            return Err(EphemerisError::SatelliteNotFound(satellite.to_string()));
        }

        let end = start + self.settings.horizon;
        let mut entries = Vec::new();
        let mut at = start;
        while at < end {
            let angle = self.ephemeris.look_angle(satellite, observer, at)?;
            if angle.elevation_deg > self.settings.min_elevation_deg {
                entries.push(PassEntry::new(satellite, at, self.settings.pass_duration_secs));
            }
            at += self.settings.sample_step;
        }
        Ok(entries)
    }
}
