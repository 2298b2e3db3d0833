use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use satlink_common::{LookAngle, Observer};

use super::{Ephemeris, EphemerisError, TleCatalog};

// WGS-84
const EARTH_EQUATORIAL_RADIUS_KM: f64 = 6378.137;
const EARTH_ECCENTRICITY_SQ: f64 = 0.00669437999014;

const MILLIS_PER_DAY: f64 = 86_400_000.0;
/// 2000-01-01T12:00:00Z
const J2000_UNIX_MILLIS: i64 = 946_728_000_000;
const DAYS_PER_JULIAN_CENTURY: f64 = 36_525.0;
const GMST_BASE_DEG: f64 = 280.46061837;
const GMST_ROTATION_PER_DAY: f64 = 360.98564736629;
const GMST_CORRECTION: f64 = 0.000387933;

struct Propagator {
    epoch: DateTime<Utc>,
    constants: sgp4::Constants,
}

/// SGP4 propagation over a `TleCatalog`. Element sets are parsed once; a
/// malformed TLE makes that satellite fail with `Propagation` on every call.
pub struct Sgp4Ephemeris {
    satellites: HashMap<String, Result<Propagator, String>>,
}

impl Sgp4Ephemeris {
    pub fn new(catalog: &TleCatalog) -> Self {
        let mut satellites = HashMap::new();
        for name in catalog.names() {
            let Some(tle) = catalog.get(name) else {
                continue;
            };
            let parsed = build_propagator(name, &tle.line1, &tle.line2);
            if let Err(e) = &parsed {
                tracing::warn!("TLE for {} is unusable: {}", name, e);
            }
            satellites.insert(name.to_string(), parsed);
        }
        tracing::info!("Loaded {} satellites into the SGP4 ephemeris", satellites.len());
        Self { satellites }
    }
}

fn build_propagator(name: &str, line1: &str, line2: &str) -> Result<Propagator, String> {
    let elements = sgp4::Elements::from_tle(
        Some(name.to_string()),
        line1.trim().as_bytes(),
        line2.trim().as_bytes(),
    )
    .map_err(|e| e.to_string())?;
    let constants = sgp4::Constants::from_elements(&elements).map_err(|e| e.to_string())?;
    Ok(Propagator {
        epoch: Utc.from_utc_datetime(&elements.datetime),
        constants,
    })
}

impl Ephemeris for Sgp4Ephemeris {
    fn look_angle(
        &self,
        satellite: &str,
        observer: &Observer,
        at: DateTime<Utc>,
    ) -> Result<LookAngle, EphemerisError> {
        let propagator = self
            .satellites
            .get(satellite)
            .ok_or_else(|| EphemerisError::SatelliteNotFound(satellite.to_string()))?
            .as_ref()
            .map_err(|e| EphemerisError::propagation(satellite, e))?;

        let minutes = (at - propagator.epoch).num_milliseconds() as f64 / 60_000.0;
        let prediction = propagator
            .constants
            .propagate(sgp4::MinutesSinceEpoch(minutes))
            .map_err(|e| EphemerisError::propagation(satellite, e))?;

        let satellite_ecef = teme_to_ecef(prediction.position, greenwich_mean_sidereal_time(at));
        Ok(look_angle_from(observer, satellite_ecef))
    }

    fn knows(&self, satellite: &str) -> bool {
        self.satellites.contains_key(satellite)
    }
}

/// GMST in radians.
fn greenwich_mean_sidereal_time(at: DateTime<Utc>) -> f64 {
    let days = (at.timestamp_millis() - J2000_UNIX_MILLIS) as f64 / MILLIS_PER_DAY;
    let centuries = days / DAYS_PER_JULIAN_CENTURY;
    let degrees = GMST_BASE_DEG
        + GMST_ROTATION_PER_DAY * days
        + GMST_CORRECTION * centuries * centuries
        - centuries * centuries * centuries / 38_710_000.0;
    degrees.rem_euclid(360.0).to_radians()
}

fn teme_to_ecef(position: [f64; 3], gmst: f64) -> [f64; 3] {
    let (sin_g, cos_g) = gmst.sin_cos();
    [
        cos_g * position[0] + sin_g * position[1],
        -sin_g * position[0] + cos_g * position[1],
        position[2],
    ]
}

fn observer_ecef_km(observer: &Observer) -> [f64; 3] {
    let lat = observer.latitude_deg.to_radians();
    let lon = observer.longitude_deg.to_radians();
    let (sin_lat, cos_lat) = lat.sin_cos();
    let (sin_lon, cos_lon) = lon.sin_cos();
    let n = EARTH_EQUATORIAL_RADIUS_KM / (1.0 - EARTH_ECCENTRICITY_SQ * sin_lat * sin_lat).sqrt();
    let alt_km = observer.altitude_m / 1000.0;
    [
        (n + alt_km) * cos_lat * cos_lon,
        (n + alt_km) * cos_lat * sin_lon,
        (n * (1.0 - EARTH_ECCENTRICITY_SQ) + alt_km) * sin_lat,
    ]
}

/// Topocentric azimuth (from north, clockwise) and elevation of an ECEF point.
fn look_angle_from(observer: &Observer, target_ecef: [f64; 3]) -> LookAngle {
    let origin = observer_ecef_km(observer);
    let d = [
        target_ecef[0] - origin[0],
        target_ecef[1] - origin[1],
        target_ecef[2] - origin[2],
    ];

    let (sin_lat, cos_lat) = observer.latitude_deg.to_radians().sin_cos();
    let (sin_lon, cos_lon) = observer.longitude_deg.to_radians().sin_cos();

    let east = -sin_lon * d[0] + cos_lon * d[1];
    let north = -sin_lat * cos_lon * d[0] - sin_lat * sin_lon * d[1] + cos_lat * d[2];
    let up = cos_lat * cos_lon * d[0] + cos_lat * sin_lon * d[1] + sin_lat * d[2];

    let range = (east * east + north * north + up * up).sqrt();
    let elevation = if range > 0.0 { (up / range).clamp(-1.0, 1.0).asin() } else { 0.0 };

    LookAngle {
        azimuth_deg: east.atan2(north).to_degrees().rem_euclid(360.0),
        elevation_deg: elevation.to_degrees(),
        range_km: Some(range),
    }
}
