///! Coordination hub
///!
///! Per-connection routing, per-unit tracking sessions, and the aggregate view
///! pushed to observers. Connections that never speak for a unit are
///! observers (dashboards); a connection is bound to a unit by the first
///! unit-originated frame it sends.
///!
///! Lock order: `sessions` -> `connections` -> `board` -> `evicted`. The
///! registry's own lock is always taken last.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use satlink_common::{
    AggregateState, AssignmentUpdate, ClientEvent, ConnectionState, ErrorNotice, PassEntry,
    PointingResult, PresenceReport, ResultReport, SatelliteSelection, ServerEvent, TelemetryReport,
    UnitView,
};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc};
use uuid::Uuid;

use super::session::{ConnectionId, Session, TargetSource, TrackingMode};
use crate::error::{GroundError, GroundResult};
use crate::registry::{Announcer, DEFAULT_LIVENESS_TIMEOUT_SECS, FieldUnit, FieldUnitRegistry};

const OUTBOUND_QUEUE: usize = 64;

struct Connection {
    tx: mpsc::Sender<ServerEvent>,
    unit: Option<String>,
}

/// Latest unit-reported data, shown to observers and never authoritative
#[derive(Debug, Clone, Default)]
struct UnitBoard {
    sensor_data: Option<Value>,
    last_result: Option<PointingResult>,
}

pub struct CoordinationHub {
    registry: Arc<FieldUnitRegistry>,
    targets: TargetSource,
    stream_interval: Duration,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    sessions: Mutex<HashMap<String, Session>>,
    board: RwLock<HashMap<String, UnitBoard>>,
    /// Last view of reaped units, shown Offline until they come back
    evicted: RwLock<HashMap<String, UnitView>>,
    liveness_timeout: chrono::Duration,
}

impl CoordinationHub {
    pub fn new(registry: Arc<FieldUnitRegistry>, targets: TargetSource, stream_interval: Duration) -> Self {
        Self {
            registry,
            targets,
            stream_interval,
            connections: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            board: RwLock::new(HashMap::new()),
            evicted: RwLock::new(HashMap::new()),
            liveness_timeout: chrono::Duration::seconds(DEFAULT_LIVENESS_TIMEOUT_SECS),
        }
    }

    pub fn with_liveness_timeout(mut self, timeout: chrono::Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<FieldUnitRegistry> {
        &self.registry
    }

    /// Register a new connection and push the current aggregate to it.
    pub async fn connect(&self) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let conn_id = Uuid::now_v7();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        self.connections
            .write()
            .await
            .insert(conn_id, Connection { tx, unit: None });

        tracing::info!("Connection {} opened", conn_id);
        // New connections start as observers, so this reaches them too
        self.broadcast_aggregate().await;
        (conn_id, rx)
    }

    /// Tear down the connection. If it carried a unit's session the stream
    /// stops and the unit shows Offline; a later reconnect starts Idle.
    pub async fn disconnect(&self, conn_id: ConnectionId) {
        let unit = {
            let mut sessions = self.sessions.lock().await;
            let removed = self.connections.write().await.remove(&conn_id);
            // Only drop the session if it still belongs to this connection
            let unit = removed
                .and_then(|c| c.unit)
                .filter(|unit_id| sessions.get(unit_id).is_some_and(|s| s.conn_id == conn_id));
            if let Some(mut session) = unit.as_ref().and_then(|unit_id| sessions.remove(unit_id)) {
                session.stop_stream();
            }
            unit
        };

        match unit {
            Some(unit_id) => {
                tracing::info!("Field unit {} disconnected ({})", unit_id, conn_id);
                self.set_state(&unit_id, ConnectionState::Offline).await;
            }
            None => tracing::info!("Connection {} closed", conn_id),
        }
        self.broadcast_aggregate().await;
    }

    /// Parse and dispatch one text frame. Rejections go back to the sender
    /// only; the connection stays open.
    pub async fn handle_text(&self, conn_id: ConnectionId, peer: IpAddr, text: &str) {
        let event = match ClientEvent::from_json(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Malformed frame on {}: {}", conn_id, e);
                self.send_error(conn_id, format!("malformed frame: {}", e)).await;
                return;
            }
        };

        let wire_name = event.wire_name();
        if let Err(e) = self.handle_event(conn_id, peer, event).await {
            if e.is_fatal() {
                tracing::error!("{} on {} hit a fatal error: {}", wire_name, conn_id, e);
            } else {
                tracing::warn!("{} on {} rejected: {}", wire_name, conn_id, e);
            }
            self.send_error(conn_id, e.to_string()).await;
        }
    }

    pub async fn handle_event(&self, conn_id: ConnectionId, peer: IpAddr, event: ClientEvent) -> GroundResult<()> {
        if let ClientEvent::RequestClients(_) = event {
            let aggregate = self.aggregate().await;
            self.send_to(conn_id, aggregate).await;
            return Ok(());
        }

        let unit_id = event.fu_id().unwrap_or_default().trim().to_string();
        if unit_id.is_empty() {
            return Err(GroundError::validation(format!("{} without fu_id", event.wire_name())));
        }

        match event {
            // May come from an operator dashboard; never binds the sender
            ClientEvent::SelectSatellite(selection) => {
                self.ensure_not_foreign(conn_id, &unit_id).await?;
                self.select_satellite(&unit_id, &selection.satellite_name).await
            }
            ClientEvent::FieldUnitPresence(report) => {
                self.bind(conn_id, &unit_id, peer).await?;
                self.on_presence(&unit_id, peer, report).await
            }
            ClientEvent::TelemetryReport(report) => {
                self.bind(conn_id, &unit_id, peer).await?;
                self.record_telemetry(report, Some(peer)).await
            }
            ClientEvent::ResultReport(report) => {
                self.bind(conn_id, &unit_id, peer).await?;
                self.on_result(report, peer).await
            }
            ClientEvent::PollRequest(_) => {
                self.bind(conn_id, &unit_id, peer).await?;
                self.on_poll(conn_id, &unit_id, peer).await
            }
            ClientEvent::RequestClients(_) => Ok(()),
        }
    }

    async fn on_presence(&self, unit_id: &str, peer: IpAddr, report: PresenceReport) -> GroundResult<()> {
        let PresenceReport { occupied_slots, .. } = report;
        let outcome = self
            .registry
            .register(unit_id, &peer.to_string(), occupied_slots, Announcer::Unit)
            .await?;
        if outcome.created {
            // Reaped while the connection stayed open
            self.restore_connection_state(unit_id).await;
        }
        self.broadcast_aggregate().await;
        Ok(())
    }

    /// Store telemetry for a unit. Also the entry point for `POST /telemetry`.
    pub async fn record_telemetry(&self, report: TelemetryReport, peer: Option<IpAddr>) -> GroundResult<()> {
        let unit_id = report.fu_id.trim();
        if unit_id.is_empty() {
            return Err(GroundError::validation("telemetry without fu_id"));
        }
        if !report.sensor_data.is_object() {
            return Err(GroundError::validation("sensor_data must be a JSON object"));
        }

        self.touch(unit_id, peer).await?;
        self.board
            .write()
            .await
            .entry(unit_id.to_string())
            .or_default()
            .sensor_data = Some(report.sensor_data);

        tracing::debug!("Telemetry from {}", unit_id);
        self.broadcast_aggregate().await;
        Ok(())
    }

    async fn on_result(&self, report: ResultReport, peer: IpAddr) -> GroundResult<()> {
        if !report.az.is_finite() || !report.el.is_finite() {
            return Err(GroundError::validation("az/el must be finite numbers"));
        }

        self.touch(&report.fu_id, Some(peer)).await?;
        tracing::info!(
            "{} reports AZ={:.2} EL={:.2} for {}",
            report.fu_id,
            report.az,
            report.el,
            report.satellite_name.as_deref().unwrap_or("-")
        );

        let result = PointingResult {
            az: report.az,
            el: report.el,
            gps: report.gps,
            satellite_name: report.satellite_name,
            reported_at: Utc::now(),
        };
        self.board
            .write()
            .await
            .entry(report.fu_id)
            .or_default()
            .last_result = Some(result);

        self.broadcast_aggregate().await;
        Ok(())
    }

    /// Re-send the current target of a tracking unit.
    async fn on_poll(&self, conn_id: ConnectionId, unit_id: &str, peer: IpAddr) -> GroundResult<()> {
        self.touch(unit_id, Some(peer)).await?;

        let satellite = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(unit_id)
                .and_then(|s| s.mode.satellite().map(str::to_string))
        };
        let Some(satellite) = satellite else {
            return Err(GroundError::validation(format!("{} has no satellite selected", unit_id)));
        };

        let target = self.targets.compute(unit_id, &satellite)?;
        self.send_to(conn_id, ServerEvent::AzElTarget(target)).await;
        Ok(())
    }

    /// Put `unit_id` into Tracking for `satellite`: relay the selection,
    /// replace any running stream, and push the first target immediately.
    pub async fn select_satellite(&self, unit_id: &str, satellite: &str) -> GroundResult<()> {
        let satellite = satellite.trim();
        if satellite.is_empty() {
            return Err(GroundError::validation("select_satellite without satellite_name"));
        }
        if !self.targets.ephemeris.knows(satellite) {
            return Err(crate::ephemeris::EphemerisError::SatelliteNotFound(satellite.to_string()).into());
        }
        match self.registry.check_live(unit_id, Utc::now(), self.liveness_timeout).await {
            Ok(_) | Err(GroundError::UnknownUnit(_)) => {}
            Err(e @ GroundError::LivenessTimeout { .. }) => {
                self.drop_stale_session(unit_id).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(unit_id) else {
                return Err(GroundError::Transport(format!("{} is not connected", unit_id)));
            };

            let connections = self.connections.read().await;
            let Some(connection) = connections.get(&session.conn_id) else {
                return Err(GroundError::Transport(format!("{} is not connected", unit_id)));
            };

            let relay = ServerEvent::SelectSatellite(SatelliteSelection {
                fu_id: unit_id.to_string(),
                satellite_name: satellite.to_string(),
            });
            if connection.tx.try_send(relay).is_err() {
                tracing::warn!("Could not relay selection to {}", unit_id);
            }

            let stream = self.targets.spawn_stream(
                connection.tx.clone(),
                unit_id.to_string(),
                satellite.to_string(),
                self.stream_interval,
            );
            session.start_tracking(satellite.to_string(), stream);
        }

        tracing::info!("{} now tracking {}", unit_id, satellite);
        self.set_state(unit_id, ConnectionState::Assigned).await;
        self.broadcast_aggregate().await;
        Ok(())
    }

    /// Tear down sessions of units the registry has evicted. A unit that
    /// registered again after the reap keeps its session.
    pub async fn evict(&self, units: &[FieldUnit]) {
        if units.is_empty() {
            return;
        }
        {
            let mut sessions = self.sessions.lock().await;
            let mut connections = self.connections.write().await;
            let mut board = self.board.write().await;
            let mut evicted = self.evicted.write().await;
            for unit in units {
                if self.registry.get(&unit.id).await.is_some() {
                    tracing::info!("{} came back before teardown, keeping its session", unit.id);
                    continue;
                }
                if let Some(mut session) = sessions.remove(&unit.id) {
                    session.stop_stream();
                    if let Some(connection) = connections.get_mut(&session.conn_id) {
                        connection.unit = None;
                    }
                    tracing::info!("Tore down session of evicted unit {}", unit.id);
                }

                let mut view = unit.to_view();
                view.state = ConnectionState::Offline;
                if let Some(entry) = board.remove(&unit.id) {
                    view.sensor_data = entry.sensor_data;
                    view.last_result = entry.last_result;
                }
                evicted.insert(unit.id.clone(), view);
            }
        }
        self.broadcast_aggregate().await;
    }

    /// A unit gone quiet past the liveness timeout loses its session before
    /// the reaper gets to it.
    async fn drop_stale_session(&self, unit_id: &str) {
        {
            let mut sessions = self.sessions.lock().await;
            let mut connections = self.connections.write().await;
            if let Some(mut session) = sessions.remove(unit_id) {
                session.stop_stream();
                if let Some(connection) = connections.get_mut(&session.conn_id) {
                    connection.unit = None;
                }
            }
        }
        tracing::warn!("{} missed its liveness window, marking offline", unit_id);
        self.set_state(unit_id, ConnectionState::Offline).await;
        self.broadcast_aggregate().await;
    }

    /// Deliver newly assigned passes to a connected unit. Returns whether
    /// the unit was reachable.
    pub async fn push_assignments(&self, unit_id: &str, passes: Vec<PassEntry>) -> bool {
        let conn_id = match self.sessions.lock().await.get(unit_id) {
            Some(session) => session.conn_id,
            None => return false,
        };
        let update = ServerEvent::AssignmentUpdate(AssignmentUpdate {
            fu_id: unit_id.to_string(),
            passes,
        });
        self.send_to(conn_id, update).await
    }

    pub async fn tracking_mode(&self, unit_id: &str) -> Option<TrackingMode> {
        self.sessions.lock().await.get(unit_id).map(|s| s.mode.clone())
    }

    pub async fn is_streaming(&self, unit_id: &str) -> bool {
        self.sessions
            .lock()
            .await
            .get(unit_id)
            .is_some_and(|s| s.is_streaming())
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Full unit list, as pushed to observers.
    pub async fn unit_views(&self) -> Vec<UnitView> {
        let units = self.registry.snapshot().await;
        let modes: HashMap<String, TrackingMode> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .map(|(id, s)| (id.clone(), s.mode.clone()))
                .collect()
        };
        let board = self.board.read().await;
        let evicted = self.evicted.read().await;

        let mut views: Vec<UnitView> = units
            .iter()
            .map(|unit| {
                let mut view = unit.to_view();
                view.satellite = modes
                    .get(&unit.id)
                    .and_then(|m| m.satellite().map(str::to_string));
                if let Some(entry) = board.get(&unit.id) {
                    view.sensor_data = entry.sensor_data.clone();
                    view.last_result = entry.last_result.clone();
                }
                view
            })
            .collect();

        let before = views.len();
        views.extend(
            evicted
                .values()
                .filter(|gone| !units.iter().any(|u| u.id == gone.fu_id))
                .cloned(),
        );
        if views.len() > before {
            views.sort_by(|a, b| a.fu_id.cmp(&b.fu_id));
        }
        views
    }

    async fn aggregate(&self) -> ServerEvent {
        ServerEvent::AggregateState(AggregateState {
            units: self.unit_views().await,
            generated_at: Utc::now(),
        })
    }

    /// Send the aggregate to every observer connection. Slow observers
    /// miss this round and catch up on the next change.
    pub async fn broadcast_aggregate(&self) {
        let aggregate = self.aggregate().await;
        let connections = self.connections.read().await;
        for (conn_id, connection) in connections.iter().filter(|(_, c)| c.unit.is_none()) {
            if let Err(mpsc::error::TrySendError::Full(_)) = connection.tx.try_send(aggregate.clone()) {
                tracing::debug!("Observer {} is behind, skipping aggregate", conn_id);
            }
        }
    }

    /// Bind the connection to `unit_id` on first contact. A unit that was
    /// bound elsewhere moves over; its old session is dropped and the new
    /// one starts Idle.
    async fn bind(&self, conn_id: ConnectionId, unit_id: &str, peer: IpAddr) -> GroundResult<()> {
        let newly_bound = {
            let mut sessions = self.sessions.lock().await;
            let mut connections = self.connections.write().await;

            let Some(connection) = connections.get_mut(&conn_id) else {
                return Err(GroundError::Transport(format!("connection {} is gone", conn_id)));
            };
            match connection.unit.as_deref() {
                Some(bound) if bound == unit_id => false,
                Some(bound) => {
                    return Err(GroundError::validation(format!(
                        "connection is bound to {}, not {}",
                        bound, unit_id
                    )));
                }
                None => {
                    connection.unit = Some(unit_id.to_string());
                    if let Some(previous) = sessions.insert(unit_id.to_string(), Session::new(conn_id)) {
                        tracing::info!("{} moved from {} to {}", unit_id, previous.conn_id, conn_id);
                        if let Some(old) = connections.get_mut(&previous.conn_id) {
                            old.unit = None;
                        }
                    }
                    true
                }
            }
        };

        if newly_bound {
            tracing::info!("Connection {} bound to field unit {} @ {}", conn_id, unit_id, peer);
            self.touch(unit_id, Some(peer)).await?;
            self.set_state(unit_id, ConnectionState::Connected).await;
        }
        Ok(())
    }

    /// A bound connection may only speak for its own unit.
    async fn ensure_not_foreign(&self, conn_id: ConnectionId, unit_id: &str) -> GroundResult<()> {
        let connections = self.connections.read().await;
        match connections.get(&conn_id).and_then(|c| c.unit.as_deref()) {
            Some(bound) if bound != unit_id => Err(GroundError::validation(format!(
                "connection is bound to {}, not {}",
                bound, unit_id
            ))),
            _ => Ok(()),
        }
    }

    /// Refresh liveness; an unknown unit is a fresh registration.
    async fn touch(&self, unit_id: &str, peer: Option<IpAddr>) -> GroundResult<()> {
        match self.registry.heartbeat(unit_id).await {
            Ok(()) => Ok(()),
            Err(GroundError::UnknownUnit(_)) => {
                let address = peer.map(|ip| ip.to_string()).unwrap_or_default();
                self.registry
                    .register(unit_id, &address, None, Announcer::Unit)
                    .await?;
                self.restore_connection_state(unit_id).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Re-apply the session-derived state to a freshly (re)created record.
    async fn restore_connection_state(&self, unit_id: &str) {
        self.evicted.write().await.remove(unit_id);
        let state = match self.sessions.lock().await.get(unit_id).map(|s| &s.mode) {
            Some(TrackingMode::Tracking { .. }) => ConnectionState::Assigned,
            Some(TrackingMode::Idle) => ConnectionState::Connected,
            None => return,
        };
        self.set_state(unit_id, state).await;
    }

    async fn set_state(&self, unit_id: &str, state: ConnectionState) {
        match self.registry.set_connection_state(unit_id, state).await {
            Ok(()) | Err(GroundError::UnknownUnit(_)) => {}
            Err(e) => tracing::warn!("Could not mark {} {}: {}", unit_id, state, e),
        }
    }

    async fn send_to(&self, conn_id: ConnectionId, event: ServerEvent) -> bool {
        let tx = match self.connections.read().await.get(&conn_id) {
            Some(connection) => connection.tx.clone(),
            None => return false,
        };
        tx.send(event).await.is_ok()
    }

    async fn send_error(&self, conn_id: ConnectionId, message: String) {
        self.send_to(conn_id, ServerEvent::Error(ErrorNotice { message })).await;
    }
}
