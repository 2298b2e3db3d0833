///! Scheduled task manager - owns every periodic background task
///!
///! - Liveness reaper (every `reap_interval_secs`)
///! - Planning cycle (every `planning_interval_minutes`, aligned to the wall clock)

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::coordination::CoordinationHub;
use crate::planner::Planner;
use crate::registry::FieldUnitRegistry;

/// Configuration for scheduled tasks
#[derive(Debug, Clone)]
pub struct ScheduledTaskConfig {
    pub reap_interval_secs: u64,

    pub liveness_timeout: ChronoDuration,

    pub planning_interval_minutes: u64,

    /// Run one planning cycle right away instead of waiting for the boundary
    pub perform_initial_planning: bool,
}

impl Default for ScheduledTaskConfig {
    fn default() -> Self {
        Self {
            reap_interval_secs: 60,
            liveness_timeout: ChronoDuration::minutes(5),
            planning_interval_minutes: 60,
            perform_initial_planning: true,
        }
    }
}

pub struct ScheduledTaskManager {
    config: ScheduledTaskConfig,
    registry: Arc<FieldUnitRegistry>,
    hub: Arc<CoordinationHub>,
    planner: Arc<Planner>,
    task_handles: Vec<JoinHandle<()>>,
}

impl ScheduledTaskManager {
    pub fn new(
        config: ScheduledTaskConfig,
        registry: Arc<FieldUnitRegistry>,
        hub: Arc<CoordinationHub>,
        planner: Arc<Planner>,
    ) -> Self {
        Self {
            config,
            registry,
            hub,
            planner,
            task_handles: Vec::new(),
        }
    }

    pub fn start_all(&mut self) {
        tracing::info!("Starting scheduled task manager...");

        let reaper = self.start_reaper_task();
        self.task_handles.push(reaper);

        let planning = self.start_planning_task();
        self.task_handles.push(planning);

        tracing::info!(
            "Started {} scheduled tasks (reaper every {} s, planning every {} min)",
            self.task_handles.len(),
            self.config.reap_interval_secs,
            self.config.planning_interval_minutes
        );
    }

    fn start_reaper_task(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let hub = self.hub.clone();
        let period = Duration::from_secs(self.config.reap_interval_secs.max(1));
        let timeout = self.config.liveness_timeout;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                Self::run_reaper(&registry, &hub, Utc::now(), timeout).await;
            }
        })
    }

    /// One reaper pass: evict stale units and tear down whatever they still hold.
    pub async fn run_reaper(
        registry: &FieldUnitRegistry,
        hub: &CoordinationHub,
        now: DateTime<Utc>,
        timeout: ChronoDuration,
    ) -> Vec<String> {
        match registry.reap_expired(now, timeout).await {
            Ok(evicted) => {
                let ids: Vec<String> = evicted.iter().map(|u| u.id.clone()).collect();
                if !evicted.is_empty() {
                    tracing::info!("Reaper evicted {} units: {:?}", ids.len(), ids);
                    hub.evict(&evicted).await;
                }
                ids
            }
            Err(e) => {
                tracing::error!("Reaper failed: {}", e);
                Vec::new()
            }
        }
    }

    fn start_planning_task(&self) -> JoinHandle<()> {
        let planner = self.planner.clone();
        let interval_minutes = self.config.planning_interval_minutes.max(1);
        let perform_initial = self.config.perform_initial_planning;

        tracing::info!(
            "Scheduling planning task (interval: {} minutes, initial: {})",
            interval_minutes,
            perform_initial
        );

        tokio::spawn(async move {
            if perform_initial {
                tracing::info!("Performing initial planning run...");
                if let Err(e) = planner.run_once().await {
                    tracing::error!("Initial planning run failed: {}", e);
                }
            }
            Self::planning_loop(planner, interval_minutes).await;
        })
    }

    async fn planning_loop(planner: Arc<Planner>, interval_minutes: u64) {
        loop {
            let now = Utc::now();
            let next_trigger = Self::calculate_next_planning_time(now, interval_minutes);
            let sleep_duration = (next_trigger - now)
                .to_std()
                .unwrap_or(Duration::from_secs(60));

            tracing::info!(
                "Next planning run at: {} (in {:.1} min)",
                next_trigger.format("%Y-%m-%d %H:%M:%S UTC"),
                sleep_duration.as_secs_f64() / 60.0
            );

            tokio::time::sleep(sleep_duration).await;

            if let Err(e) = planner.run_once().await {
                tracing::error!("Planning run failed: {}", e);
            }
        }
    }

    /// Next multiple of `interval_minutes` since midnight UTC, strictly after `now`.
    fn calculate_next_planning_time(now: DateTime<Utc>, interval_minutes: u64) -> DateTime<Utc> {
        let step = (interval_minutes.max(1) * 60) as i64;
        let secs = now.timestamp();
        let next = secs - secs.rem_euclid(step) + step;
        DateTime::from_timestamp(next, 0).unwrap_or(now + ChronoDuration::seconds(step))
    }

    /// Gracefully shutdown all tasks
    pub fn shutdown(self) {
        tracing::info!("Shutting down scheduled task manager...");

        for handle in self.task_handles {
            handle.abort();
        }

        tracing::info!("All scheduled tasks stopped");
    }
}
