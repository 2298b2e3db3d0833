use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use satlink_common::{AzElTarget, Observer, ServerEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::ephemeris::{Ephemeris, EphemerisError};

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingMode {
    Idle,
    Tracking { satellite: String },
}

impl TrackingMode {
    pub fn satellite(&self) -> Option<&str> {
        match self {
            TrackingMode::Idle => None,
            TrackingMode::Tracking { satellite } => Some(satellite),
        }
    }
}

/// Binding of a field unit to the connection it currently speaks through.
/// Owns the unit's target stream; at most one stream per unit.
pub struct Session {
    pub conn_id: ConnectionId,
    pub mode: TrackingMode,
    stream: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(conn_id: ConnectionId) -> Self {
        Self {
            conn_id,
            mode: TrackingMode::Idle,
            stream: None,
        }
    }

    pub fn start_tracking(&mut self, satellite: String, stream: JoinHandle<()>) {
        self.stop_stream();
        self.mode = TrackingMode::Tracking { satellite };
        self.stream = Some(stream);
    }

    pub fn stop_stream(&mut self) {
        if let Some(handle) = self.stream.take() {
            handle.abort();
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

/// Everything a target stream needs, detached from the hub.
#[derive(Clone)]
pub struct TargetSource {
    pub ephemeris: Arc<dyn Ephemeris>,
    pub observer: Observer,
}

impl TargetSource {
    pub fn compute(&self, unit_id: &str, satellite: &str) -> Result<AzElTarget, EphemerisError> {
        let now = Utc::now();
        let angle = self.ephemeris.look_angle(satellite, &self.observer, now)?;
        Ok(AzElTarget {
            fu_id: unit_id.to_string(),
            satellite_name: satellite.to_string(),
            az: angle.azimuth_deg,
            el: angle.elevation_deg,
            computed_at: now,
        })
    }

    /// Push a target now and then every `period` until aborted or the
    /// connection goes away.
    pub fn spawn_stream(
        &self,
        tx: mpsc::Sender<ServerEvent>,
        unit_id: String,
        satellite: String,
        period: Duration,
    ) -> JoinHandle<()> {
        let source = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match source.compute(&unit_id, &satellite) {
                    Ok(target) => {
                        if tx.send(ServerEvent::AzElTarget(target)).await.is_err() {
                            tracing::debug!("Target stream for {} lost its connection", unit_id);
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("No target for {} / {}: {}", unit_id, satellite, e),
                }
            }
        })
    }
}
