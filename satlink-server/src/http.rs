///! HTTP surface and router assembly.
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use satlink_common::TelemetryReport;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::coordination::{CoordinationHub, ws_handler};
use crate::planner::Planner;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<CoordinationHub>,
    pub planner: Arc<Planner>,
    /// Names in the TLE catalog
    pub satellites: Arc<Vec<String>>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/units", get(units))
        .route("/satellites", get(satellites))
        .route("/schedule/{unit_id}", get(schedule_for_unit))
        .route("/unassigned", get(unassigned))
        .route("/telemetry", post(telemetry))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "units": state.hub.registry().len().await,
        "connections": state.hub.connection_count().await,
    }))
}

async fn units(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.unit_views().await)
}

async fn satellites(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.satellites.as_ref().clone())
}

/// Empty list for units with nothing booked, known or not.
async fn schedule_for_unit(State(state): State<AppState>, Path(unit_id): Path<String>) -> impl IntoResponse {
    Json(state.planner.book().await.for_unit(&unit_id))
}

async fn unassigned(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.planner.book().await.unassigned().to_vec())
}

async fn telemetry(State(state): State<AppState>, Json(body): Json<Value>) -> impl IntoResponse {
    let report: TelemetryReport = match serde_json::from_value(body) {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!("Rejected telemetry over HTTP: {}", e);
            return (StatusCode::BAD_REQUEST, Json(json!({"status": "invalid", "error": e.to_string()})));
        }
    };

    match state.hub.record_telemetry(report, None).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))),
        Err(e) if e.is_fatal() => {
            tracing::error!("Telemetry could not be stored: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "error": e.to_string()})),
            )
        }
        Err(e) => {
            tracing::warn!("Rejected telemetry over HTTP: {}", e);
            (StatusCode::BAD_REQUEST, Json(json!({"status": "invalid", "error": e.to_string()})))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactWriter;
    use crate::coordination::TargetSource;
    use crate::ephemeris::testing::FixedEphemeris;
    use crate::registry::{Announcer, FieldUnitRegistry};
    use crate::scheduler::{PassScheduler, SchedulerSettings};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{Duration, TimeZone, Utc};
    use satlink_common::Observer;
    use tower::ServiceExt;

    struct Fixture {
        state: AppState,
        dir: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = std::env::temp_dir().join(format!("satlink_http_{}", uuid::Uuid::now_v7()));
        let epoch = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let ephemeris = Arc::new(FixedEphemeris::new(epoch).with_visible("NOAA 15", &[0, 30]));
        let registry = Arc::new(FieldUnitRegistry::in_memory());
        let hub = Arc::new(CoordinationHub::new(
            registry.clone(),
            TargetSource {
                ephemeris: ephemeris.clone(),
                observer: Observer::default(),
            },
            std::time::Duration::from_secs(5),
        ));
        let planner = Arc::new(Planner::new(
            PassScheduler::new(ephemeris, SchedulerSettings::default()),
            registry,
            hub.clone(),
            ArtifactWriter::new(&dir),
            vec!["NOAA 15".to_string()],
            Observer::default(),
            Duration::minutes(5),
        ));
        Fixture {
            state: AppState {
                hub,
                planner,
                satellites: Arc::new(vec!["NOAA 15".to_string()]),
            },
            dir,
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let f = fixture();
        let response = build_router(f.state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_telemetry_accepted_and_invalid() {
        let f = fixture();
        let router = build_router(f.state.clone());

        let response = router
            .clone()
            .oneshot(post_json("/telemetry", r#"{"fu_id":"FU1","sensor_data":{"temp":20.5}}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = router
            .clone()
            .oneshot(post_json("/telemetry", r#"{"fu_id":"","sensor_data":{}}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .oneshot(post_json("/telemetry", r#"{"sensor_data":{}}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let views = f.state.hub.unit_views().await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].sensor_data.as_ref().unwrap()["temp"], 20.5);
    }

    #[tokio::test]
    async fn test_schedule_for_unit() {
        let f = fixture();
        let epoch = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        f.state
            .hub
            .registry()
            .register_at("FU1", "10.0.0.1", None, Announcer::Unit, epoch)
            .await
            .unwrap();
        f.state.planner.run_at(epoch).await.unwrap();

        let router = build_router(f.state);
        let response = router
            .clone()
            .oneshot(Request::builder().uri("/schedule/FU1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let passes = body_json(response).await;
        assert_eq!(passes.as_array().unwrap().len(), 2);
        assert_eq!(passes[0]["assigned_fu"], "FU1");
        assert_eq!(passes[0]["satellite"], "NOAA 15");

        let response = router
            .oneshot(Request::builder().uri("/schedule/NOBODY").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await.as_array().unwrap().is_empty());

        tokio::fs::remove_dir_all(&f.dir).await.ok();
    }
}
