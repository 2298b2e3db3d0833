use anyhow::{Context, Result};
use futures::{Sink, SinkExt, StreamExt};
use satlink_common::{
    ClientEvent, LookAngle, PassEntry, PollRequest, PresenceReport, ResultReport, SatelliteSelection,
    ServerEvent, TelemetryReport,
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Instant, interval_at, sleep};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::config::AgentConfig;
use crate::rotator::{Rotator, TelemetrySource};

/// Link state towards the coordination server
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum LinkState {
    Connected,
    #[default]
    Disconnected,
    Connecting,
}

#[derive(Debug, Default)]
struct AgentState {
    link: LinkState,
    /// Survives reconnects; the server forgets it, so it is re-selected on every connect
    satellite: Option<String>,
    passes: Vec<PassEntry>,
}

/// Field unit side of the coordination channel, reconnecting from scratch after every drop
pub struct FieldUnitAgent {
    config: AgentConfig,
    rotator: Arc<dyn Rotator>,
    telemetry: Arc<dyn TelemetrySource>,
    state: RwLock<AgentState>,
}

impl FieldUnitAgent {
    pub fn new(config: AgentConfig, rotator: Arc<dyn Rotator>, telemetry: Arc<dyn TelemetrySource>) -> Self {
        let state = AgentState {
            satellite: config.satellite.clone(),
            ..Default::default()
        };
        Self {
            config,
            rotator,
            telemetry,
            state: RwLock::new(state),
        }
    }

    pub fn unit_id(&self) -> &str {
        &self.config.unit_id
    }

    pub async fn link_state(&self) -> LinkState {
        self.state.read().await.link
    }

    pub async fn satellite(&self) -> Option<String> {
        self.state.read().await.satellite.clone()
    }

    /// Passes most recently pushed by the planner
    pub async fn passes(&self) -> Vec<PassEntry> {
        self.state.read().await.passes.clone()
    }

    /// Connect, serve the session until it drops, wait, repeat. Never returns.
    pub async fn run(self: Arc<Self>) {
        let reconnect_interval = self.config.reconnect_interval();

        loop {
            self.state.write().await.link = LinkState::Connecting;

            match self.run_session().await {
                Ok(()) => tracing::warn!("Coordination server closed the connection"),
                Err(e) => tracing::warn!("Coordination session failed: {:#}", e),
            }
            self.state.write().await.link = LinkState::Disconnected;

            tracing::info!("Reconnecting in {}s", reconnect_interval.as_secs());
            sleep(reconnect_interval).await;
        }
    }

    /// One connection lifetime. `Ok(())` when the server closes the socket.
    pub async fn run_session(&self) -> Result<()> {
        tracing::info!("Connecting to coordination server at {}...", self.config.server_url);
        let (socket, _) = connect_async(self.config.server_url.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", self.config.server_url))?;
        let (mut sink, mut stream) = socket.split();

        for event in self.opening_frames().await {
            send_event(&mut sink, &event).await?;
        }
        self.state.write().await.link = LinkState::Connected;
        tracing::info!("Connected as {}", self.config.unit_id);

        // The opening frames already covered the first tick of each timer
        let heartbeat_period = self.config.heartbeat_interval();
        let telemetry_period = self.config.telemetry_interval();
        let poll_period = self.config.poll_interval();
        let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
        let mut telemetry = interval_at(Instant::now() + telemetry_period, telemetry_period);
        let poll_every = poll_period.unwrap_or(heartbeat_period);
        let mut poll = interval_at(Instant::now() + poll_every, poll_every);

        loop {
            let tracking = self.state.read().await.satellite.is_some();

            tokio::select! {
                _ = heartbeat.tick() => {
                    send_event(&mut sink, &self.presence()).await?;
                    tracing::debug!("Heartbeat sent");
                }
                _ = telemetry.tick() => {
                    send_event(&mut sink, &self.telemetry_report()).await?;
                }
                _ = poll.tick(), if poll_period.is_some() && tracking => {
                    let request = ClientEvent::PollRequest(PollRequest {
                        fu_id: self.config.unit_id.clone(),
                    });
                    send_event(&mut sink, &request).await?;
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        for reply in self.handle_frame(&text).await {
                            send_event(&mut sink, &reply).await?;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("Coordination socket read failed"),
                }
            }
        }
    }

    /// Presence first so the connection is bound before anything that needs it.
    async fn opening_frames(&self) -> Vec<ClientEvent> {
        let mut frames = vec![self.presence(), self.telemetry_report()];
        if let Some(satellite) = self.satellite().await {
            tracing::info!("Re-selecting {} after connect", satellite);
            frames.push(ClientEvent::SelectSatellite(SatelliteSelection {
                fu_id: self.config.unit_id.clone(),
                satellite_name: satellite,
            }));
        }
        frames
    }

    fn presence(&self) -> ClientEvent {
        ClientEvent::FieldUnitPresence(PresenceReport {
            fu_id: self.config.unit_id.clone(),
            occupied_slots: None,
        })
    }

    fn telemetry_report(&self) -> ClientEvent {
        ClientEvent::TelemetryReport(TelemetryReport {
            fu_id: self.config.unit_id.clone(),
            sensor_data: self.telemetry.read(),
        })
    }

    async fn handle_frame(&self, text: &str) -> Vec<ClientEvent> {
        match ServerEvent::from_json(text) {
            Ok(event) => self.handle_event(event).await,
            Err(e) => {
                tracing::warn!("Ignoring unreadable server frame: {}", e);
                Vec::new()
            }
        }
    }

    /// Apply one server event and return the frames to send back.
    pub async fn handle_event(&self, event: ServerEvent) -> Vec<ClientEvent> {
        match event {
            ServerEvent::AzElTarget(target) => {
                if target.fu_id != self.config.unit_id {
                    tracing::debug!("Ignoring target addressed to {}", target.fu_id);
                    return Vec::new();
                }

                let reached = match self
                    .rotator
                    .point(LookAngle {
                        azimuth_deg: target.az,
                        elevation_deg: target.el,
                        range_km: None,
                    })
                    .await
                {
                    Ok(reached) => reached,
                    Err(e) => {
                        tracing::error!("Rotator failed to reach target for {}: {:#}", target.satellite_name, e);
                        return Vec::new();
                    }
                };
                self.state.write().await.satellite = Some(target.satellite_name.clone());

                vec![ClientEvent::ResultReport(ResultReport {
                    fu_id: self.config.unit_id.clone(),
                    az: reached.azimuth_deg,
                    el: reached.elevation_deg,
                    gps: self.config.gps,
                    satellite_name: Some(target.satellite_name),
                })]
            }
            ServerEvent::SelectSatellite(selection) => {
                if selection.fu_id == self.config.unit_id {
                    tracing::info!("Operator selected {}", selection.satellite_name);
                    self.state.write().await.satellite = Some(selection.satellite_name);
                }
                Vec::new()
            }
            ServerEvent::AssignmentUpdate(update) => {
                if update.fu_id == self.config.unit_id {
                    match update.passes.first() {
                        Some(next) => tracing::info!(
                            "Received {} assigned passes, next {} at {}",
                            update.passes.len(),
                            next.satellite,
                            next.start_time
                        ),
                        None => tracing::info!("Assigned passes cleared"),
                    }
                    self.state.write().await.passes = update.passes;
                }
                Vec::new()
            }
            ServerEvent::AggregateState(state) => {
                tracing::debug!("Aggregate state with {} units", state.units.len());
                Vec::new()
            }
            ServerEvent::Error(notice) => {
                tracing::warn!("Server rejected a frame: {}", notice.message);
                Vec::new()
            }
        }
    }
}

async fn send_event<S>(sink: &mut S, event: &ClientEvent) -> Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = event.to_json()?;
    sink.send(Message::Text(text))
        .await
        .with_context(|| format!("Failed to send {}", event.wire_name()))
}
