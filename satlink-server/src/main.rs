use satlink_server::artifacts::ArtifactWriter;
use satlink_server::config;
use satlink_server::coordination::{CoordinationHub, TargetSource};
use satlink_server::ephemeris::{Sgp4Ephemeris, TleCatalog};
use satlink_server::http::{AppState, build_router};
use satlink_server::planner::Planner;
use satlink_server::presence::PresenceListener;
use satlink_server::registry::FieldUnitRegistry;
use satlink_server::scheduled::{ScheduledTaskConfig, ScheduledTaskManager};
use satlink_server::scheduler::{PassScheduler, SchedulerSettings};

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config::DEFAULT_CONFIG_PATH.to_string());
    let config = config::read_config(&config_path)?;

    // Initialize logging
    let _logging_guard = satlink_server::logging::init_logging(
        &config.log_dir,
        "satlink-server",
        &config.log_level,
        config.log_retention_days,
    )?;

    tracing::info!("satlink server starting...");
    tracing::info!("Server will listen on {}", config.server_address());

    let registry = Arc::new(
        FieldUnitRegistry::open(config.data_path())
            .await
            .context("Failed to open field unit registry")?,
    );
    let mut storage_failures = registry.storage_failures();

    let catalog = TleCatalog::load_or_empty(&config.tle_file)?;
    let satellites = Arc::new(catalog.names().map(str::to_string).collect::<Vec<_>>());
    let ephemeris = Arc::new(Sgp4Ephemeris::new(&catalog));

    let hub = Arc::new(
        CoordinationHub::new(
            registry.clone(),
            TargetSource {
                ephemeris: ephemeris.clone(),
                observer: config.observer,
            },
            config.stream_interval(),
        )
        .with_liveness_timeout(config.liveness_timeout()),
    );

    let planner = Arc::new(Planner::new(
        PassScheduler::new(ephemeris, SchedulerSettings::from(&config.schedule)),
        registry.clone(),
        hub.clone(),
        ArtifactWriter::new(config.data_path()),
        config.schedule.satellites.clone(),
        config.observer,
        config.liveness_timeout(),
    ));

    // Configure and start scheduled tasks
    let task_config = ScheduledTaskConfig {
        reap_interval_secs: config.reap_interval_secs,
        liveness_timeout: config.liveness_timeout(),
        planning_interval_minutes: config.planning_interval_minutes,
        perform_initial_planning: true,
    };
    let mut task_manager = ScheduledTaskManager::new(task_config, registry.clone(), hub.clone(), planner.clone());
    task_manager.start_all();

    let presence = PresenceListener::bind(&config.presence_address(), registry.clone()).await?;
    let presence_task = tokio::spawn(async move {
        if let Err(e) = presence.run().await {
            tracing::error!("Presence listener stopped: {}", e);
        }
    });

    let router = build_router(AppState {
        hub,
        planner,
        satellites,
    });
    let listener = tokio::net::TcpListener::bind(config.server_address())
        .await
        .with_context(|| format!("Failed to bind {}", config.server_address()))?;
    tracing::info!("HTTP/WebSocket server starting on {}", listener.local_addr()?);

    let (fatal_tx, mut fatal_rx) = tokio::sync::oneshot::channel::<String>();
    tokio::spawn(async move {
        while storage_failures.changed().await.is_ok() {
            if let Some(message) = storage_failures.borrow().clone() {
                let _ = fatal_tx.send(message);
                return;
            }
        }
    });

    let shutdown = async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for ctrl-c: {}", e);
                }
                tracing::info!("Shutdown requested");
            }
            message = &mut fatal_rx => {
                if let Ok(message) = message {
                    tracing::error!("Registry storage failed, shutting down: {}", message);
                }
            }
        }
    };

    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;

    task_manager.shutdown();
    presence_task.abort();

    registry.flush().await.context("Final registry snapshot failed")?;
    tracing::info!("Registry persisted, bye");

    Ok(())
}
