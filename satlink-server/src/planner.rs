///! Planning cycle: scheduler -> assigner -> artifacts -> connected units.
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use satlink_common::{Observer, PassEntry};
use tokio::sync::RwLock;

use crate::artifacts::{ArtifactWriter, AssignmentArtifact, AssignmentRecord, UnassignedRecord};
use crate::assigner::{AssignmentReport, SlotAssigner};
use crate::coordination::CoordinationHub;
use crate::error::GroundResult;
use crate::registry::FieldUnitRegistry;
use crate::scheduler::PassScheduler;

/// Assignments still ahead of us, per unit, plus the last run's leftovers.
#[derive(Debug, Clone, Default)]
pub struct AssignmentBook {
    units: BTreeMap<String, Vec<AssignmentRecord>>,
    unassigned: Vec<UnassignedRecord>,
}

impl AssignmentBook {
    pub fn for_unit(&self, fu_id: &str) -> Vec<AssignmentRecord> {
        self.units.get(fu_id).cloned().unwrap_or_default()
    }

    pub fn unassigned(&self) -> &[UnassignedRecord] {
        &self.unassigned
    }

    /// Same satellite, same start, any unit.
    pub fn contains(&self, entry: &PassEntry) -> bool {
        self.units.values().flatten().any(|record| {
            record.satellite == entry.satellite && record.start_time == entry.start_time
        })
    }

    fn prune_finished(&mut self, now: DateTime<Utc>) {
        for records in self.units.values_mut() {
            records.retain(|record| record.end_time().is_some_and(|end| end > now));
        }
        self.units.retain(|_, records| !records.is_empty());
    }

    fn record(&mut self, report: &AssignmentReport) {
        for assignment in &report.assignments {
            self.units
                .entry(assignment.fu_id.clone())
                .or_default()
                .push(AssignmentRecord::from(assignment));
        }
        for records in self.units.values_mut() {
            records.sort_by_key(|record| record.start_time);
        }
        self.unassigned = report.unassigned.iter().map(UnassignedRecord::from).collect();
    }

    pub fn to_artifact(&self) -> AssignmentArtifact {
        AssignmentArtifact {
            units: self.units.clone(),
            unassigned: self.unassigned.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanningSummary {
    pub scheduled: usize,
    pub assigned: usize,
    pub unassigned: usize,
    pub notified: usize,
}

pub struct Planner {
    scheduler: PassScheduler,
    registry: Arc<FieldUnitRegistry>,
    hub: Arc<CoordinationHub>,
    artifacts: ArtifactWriter,
    satellites: Vec<String>,
    observer: Observer,
    liveness_timeout: Duration,
    book: RwLock<AssignmentBook>,
}

impl Planner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: PassScheduler,
        registry: Arc<FieldUnitRegistry>,
        hub: Arc<CoordinationHub>,
        artifacts: ArtifactWriter,
        satellites: Vec<String>,
        observer: Observer,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            scheduler,
            registry,
            hub,
            artifacts,
            satellites,
            observer,
            liveness_timeout,
            book: RwLock::new(AssignmentBook::default()),
        }
    }

    pub async fn book(&self) -> AssignmentBook {
        self.book.read().await.clone()
    }

    pub async fn run_once(&self) -> GroundResult<PlanningSummary> {
        self.run_at(Utc::now()).await
    }

    /// Sampling starts on a `sample_step` boundary so consecutive runs
    /// produce the same instants and already booked passes are skipped.
    pub async fn run_at(&self, now: DateTime<Utc>) -> GroundResult<PlanningSummary> {
        let start = align_down(now, self.scheduler.settings().sample_step);
        let run = self.scheduler.generate_passes(&self.satellites, &self.observer, start);
        self.artifacts.write_schedule(&run.entries).await?;

        let scheduled = run.entries.len();
        let fresh: Vec<PassEntry> = {
            let book = self.book.read().await;
            run.entries.into_iter().filter(|entry| !book.contains(entry)).collect()
        };

        let report = SlotAssigner::new(&self.registry, self.liveness_timeout)
            .assign_at(fresh, now)
            .await?;

        let (artifact, touched) = {
            let mut book = self.book.write().await;
            book.prune_finished(now);
            book.record(&report);

            let mut touched: BTreeMap<String, Vec<PassEntry>> = BTreeMap::new();
            for assignment in &report.assignments {
                touched.entry(assignment.fu_id.clone()).or_insert_with(|| {
                    book.for_unit(&assignment.fu_id)
                        .iter()
                        .map(AssignmentRecord::entry)
                        .collect()
                });
            }
            (book.to_artifact(), touched)
        };
        self.artifacts.write_assignments(&artifact).await?;

        let mut notified = 0;
        for (fu_id, passes) in touched {
            if self.hub.push_assignments(&fu_id, passes).await {
                notified += 1;
            } else {
                tracing::debug!("{} is not connected, assignments wait in the book", fu_id);
            }
        }

        let summary = PlanningSummary {
            scheduled,
            assigned: report.assignments.len(),
            unassigned: report.unassigned.len(),
            notified,
        };
        tracing::info!(
            "Planning run: {} scheduled, {} assigned, {} unassigned, {} units notified",
            summary.scheduled,
            summary.assigned,
            summary.unassigned,
            summary.notified
        );
        Ok(summary)
    }
}

fn align_down(at: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    let step = step.num_seconds();
    if step <= 0 {
        return at;
    }
    let secs = at.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(step), 0).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::TargetSource;
    use crate::ephemeris::testing::FixedEphemeris;
    use crate::registry::Announcer;
    use crate::scheduler::SchedulerSettings;
    use chrono::TimeZone;
    use satlink_common::{ClientEvent, PresenceReport, ServerEvent};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    struct Fixture {
        planner: Planner,
        hub: Arc<CoordinationHub>,
        registry: Arc<FieldUnitRegistry>,
        dir: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = std::env::temp_dir().join(format!("satlink_planner_{}", uuid::Uuid::now_v7()));
        let ephemeris = Arc::new(
            FixedEphemeris::new(t0())
                .with_visible("NOAA 15", &[0, 30])
                .with_visible("NOAA 19", &[0, 60]),
        );
        let registry = Arc::new(FieldUnitRegistry::in_memory());
        let hub = Arc::new(CoordinationHub::new(
            registry.clone(),
            TargetSource {
                ephemeris: ephemeris.clone(),
                observer: Observer::default(),
            },
            std::time::Duration::from_secs(5),
        ));
        let scheduler = PassScheduler::new(
            ephemeris,
            SchedulerSettings {
                horizon: Duration::hours(2),
                sample_step: Duration::minutes(15),
                pass_duration_secs: 600,
                min_elevation_deg: 10.0,
            },
        );
        let planner = Planner::new(
            scheduler,
            registry.clone(),
            hub.clone(),
            ArtifactWriter::new(&dir),
            vec!["NOAA 15".to_string(), "NOAA 19".to_string()],
            Observer::default(),
            Duration::minutes(5),
        );
        Fixture {
            planner,
            hub,
            registry,
            dir,
        }
    }

    #[test]
    fn test_align_down() {
        let at = t0() + Duration::minutes(7) + Duration::seconds(13);
        assert_eq!(align_down(at, Duration::minutes(15)), t0());
        assert_eq!(align_down(t0(), Duration::minutes(15)), t0());
    }

    #[tokio::test]
    async fn test_plan_assigns_and_writes_artifacts() {
        let f = fixture();
        for id in ["FU1", "FU2"] {
            f.registry
                .register_at(id, "10.0.0.1", None, Announcer::Unit, t0())
                .await
                .unwrap();
        }

        let summary = f.planner.run_at(t0()).await.unwrap();
        assert_eq!(summary.scheduled, 4);
        assert_eq!(summary.assigned, 4);
        assert_eq!(summary.unassigned, 0);

        // Two passes at T0 overlap, so they land on different units
        let book = f.planner.book().await;
        assert_eq!(book.for_unit("FU1").len(), 3);
        assert_eq!(book.for_unit("FU2").len(), 1);
        assert!(f.dir.join("schedule.json").exists());
        assert!(f.dir.join("assignments.json").exists());

        tokio::fs::remove_dir_all(&f.dir).await.ok();
    }

    #[tokio::test]
    async fn test_rerun_does_not_rebook_or_report_busy() {
        let f = fixture();
        f.registry
            .register_at("FU1", "10.0.0.1", None, Announcer::Unit, t0())
            .await
            .unwrap();

        let first = f.planner.run_at(t0()).await.unwrap();
        assert_eq!(first.assigned, 3);
        assert_eq!(first.unassigned, 1);

        let second = f.planner.run_at(t0() + Duration::minutes(2)).await.unwrap();
        assert_eq!(second.assigned, 0);
        // Only the pass that never fit is retried
        assert_eq!(second.unassigned, 1);
        assert_eq!(f.registry.get("FU1").await.unwrap().slots.len(), 3);
        assert_eq!(f.planner.book().await.unassigned().len(), 1);

        tokio::fs::remove_dir_all(&f.dir).await.ok();
    }

    #[tokio::test]
    async fn test_connected_unit_receives_assignment_update() {
        let f = fixture();
        let (conn, mut rx) = f.hub.connect().await;
        let presence = ClientEvent::FieldUnitPresence(PresenceReport {
            fu_id: "FU1".to_string(),
            occupied_slots: None,
        });
        f.hub
            .handle_event(conn, "10.0.0.9".parse().unwrap(), presence)
            .await
            .unwrap();
        // Pin liveness to the planning clock
        f.registry.heartbeat_at("FU1", t0()).await.unwrap();
        while rx.try_recv().is_ok() {}

        let summary = f.planner.run_at(t0()).await.unwrap();
        assert_eq!(summary.notified, 1);
        match rx.recv().await.unwrap() {
            ServerEvent::AssignmentUpdate(update) => {
                assert_eq!(update.fu_id, "FU1");
                assert_eq!(update.passes.len(), 3);
                assert!(update.passes.windows(2).all(|p| p[0].start_time <= p[1].start_time));
            }
            other => panic!("expected assignment update, got {:?}", other),
        }

        tokio::fs::remove_dir_all(&f.dir).await.ok();
    }
}
