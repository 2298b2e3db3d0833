///! Hardware seams: the antenna rotator and the local sensors.
///!
///! Real units drive motors and read I2C sensors; the stand-ins here only log, which is
///! enough to run an agent against a live server without hardware attached.
use std::time::Instant;

use async_trait::async_trait;
use satlink_common::LookAngle;
use serde_json::{Value, json};
use tokio::sync::Mutex;

/// Normalize to `[0, 360)`.
pub fn wrap360(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}

/// Signed shortest rotation from `current` to `target`, in `(-180, 180]`.
pub fn pointing_error(target: f64, current: f64) -> f64 {
    let e = wrap360(target - current);
    if e > 180.0 { e - 360.0 } else { e }
}

#[async_trait]
pub trait Rotator: Send + Sync {
    /// Move towards `target` and return where the antenna ended up.
    async fn point(&self, target: LookAngle) -> anyhow::Result<LookAngle>;
}

pub trait TelemetrySource: Send + Sync {
    /// One `sensor_data` object; must serialize to a JSON object.
    fn read(&self) -> Value;
}

/// Rotator without motors: logs the move and reports the target as reached.
pub struct LoggingRotator {
    position: Mutex<LookAngle>,
    threshold_deg: f64,
}

impl LoggingRotator {
    pub fn new(threshold_deg: f64) -> Self {
        Self {
            position: Mutex::new(LookAngle {
                azimuth_deg: 0.0,
                elevation_deg: 0.0,
                range_km: None,
            }),
            threshold_deg,
        }
    }

    pub async fn position(&self) -> LookAngle {
        *self.position.lock().await
    }
}

#[async_trait]
impl Rotator for LoggingRotator {
    async fn point(&self, target: LookAngle) -> anyhow::Result<LookAngle> {
        let mut position = self.position.lock().await;
        let error = pointing_error(target.azimuth_deg, position.azimuth_deg);

        if error.abs() < self.threshold_deg {
            tracing::debug!("Azimuth error {:.2} deg below threshold, holding", error);
        } else {
            tracing::info!(
                "[ROTATE] az {:.2} -> {:.2} ({:+.2} deg), el {:.2}",
                position.azimuth_deg,
                wrap360(target.azimuth_deg),
                error,
                target.elevation_deg
            );
            position.azimuth_deg = wrap360(target.azimuth_deg);
        }
        position.elevation_deg = target.elevation_deg;

        Ok(*position)
    }
}

/// Reports process uptime in place of real sensors.
pub struct UptimeTelemetry {
    started: Instant,
}

impl UptimeTelemetry {
    pub fn new() -> Self {
        Self { started: Instant::now() }
    }
}

impl Default for UptimeTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySource for UptimeTelemetry {
    fn read(&self) -> Value {
        json!({
            "status": "healthy",
            "uptime_secs": self.started.elapsed().as_secs(),
        })
    }
}
