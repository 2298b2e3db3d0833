use satlink_agent::config;
use satlink_agent::connection::FieldUnitAgent;
use satlink_agent::rotator::{LoggingRotator, UptimeTelemetry};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config::DEFAULT_CONFIG_PATH.to_string());
    let config = config::read_config(&config_path)?;
    let _logging_guard = satlink_agent::logging::init_logging(&config.log_dir, "satlink-agent", &config.log_level)?;

    tracing::info!("satlink agent {} started.", config.unit_id);

    let agent = Arc::new(FieldUnitAgent::new(
        config.clone(),
        Arc::new(LoggingRotator::new(config.pointing_threshold_deg)),
        Arc::new(UptimeTelemetry::new()),
    ));

    tokio::select! {
        _ = agent.clone().run() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Shutdown signal received.");
        }
    }

    Ok(())
}
