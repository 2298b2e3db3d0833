///! Field unit registry
///!
///! Owns every `FieldUnit` record and its slot set. All slot writes go through
///! this API; mutations are serialized behind one writer lock and each one is
///! followed by a snapshot to stable storage. Reads hand out copies.

mod slots;
mod store;

pub use slots::SlotSet;
pub use store::{PersistedUnit, REGISTRY_FILE, RegistrySnapshot, SnapshotStore};
pub(crate) use store::write_json_atomic;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use satlink_common::{ConnectionState, Slot, UnitView};
use tokio::sync::{RwLock, watch};

use crate::error::{GroundError, GroundResult};

pub const DEFAULT_LIVENESS_TIMEOUT_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq)]
pub struct FieldUnit {
    pub id: String,
    pub address: String,
    pub last_seen: DateTime<Utc>,
    pub slots: SlotSet,
    pub state: ConnectionState,
}

impl FieldUnit {
    fn new(id: &str, address: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            last_seen: now,
            slots: SlotSet::new(),
            state: ConnectionState::Offline,
        }
    }

    /// Live while `last_seen >= now - timeout`.
    pub fn is_live(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.last_seen >= now - timeout
    }

    pub fn to_view(&self) -> UnitView {
        UnitView {
            fu_id: self.id.clone(),
            address: self.address.clone(),
            last_seen: self.last_seen,
            state: self.state,
            occupied_slots: self.slots.to_vec(),
            satellite: None,
            sensor_data: None,
            last_result: None,
        }
    }
}

/// Who is announcing the slots in a `register` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announcer {
    /// The unit itself; its report replaces the stored set
    Unit,
    /// Server-side confirmation; merged into the stored set
    Internal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub created: bool,
    /// Reported slots that were malformed or overlapped an earlier one
    pub dropped_slots: Vec<Slot>,
}

/// Point-in-time copy of the registry, filtered to live units on iteration.
/// Iterate as many times as needed; nothing is re-read from the registry.
#[derive(Debug, Clone)]
pub struct LiveUnits {
    units: Vec<FieldUnit>,
    cutoff: DateTime<Utc>,
}

impl LiveUnits {
    pub fn iter(&self) -> impl Iterator<Item = &FieldUnit> {
        self.units.iter().filter(|u| u.last_seen >= self.cutoff)
    }

    pub fn ids(&self) -> Vec<String> {
        self.iter().map(|u| u.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

pub struct FieldUnitRegistry {
    /// BTreeMap so iteration is in ascending unit id
    units: RwLock<BTreeMap<String, FieldUnit>>,
    store: Option<SnapshotStore>,
    storage_failure: watch::Sender<Option<String>>,
}

impl FieldUnitRegistry {
    /// Registry without stable storage (tests, dry runs).
    pub fn in_memory() -> Self {
        Self {
            units: RwLock::new(BTreeMap::new()),
            store: None,
            storage_failure: watch::channel(None).0,
        }
    }

    /// Open a registry backed by `<data_dir>/registry.json`, restoring any
    /// previous snapshot. Restored units start `Offline`.
    pub async fn open(data_dir: impl AsRef<Path>) -> GroundResult<Self> {
        let store = SnapshotStore::in_dir(data_dir);
        let snapshot = store.load().await?;

        let units: BTreeMap<String, FieldUnit> = snapshot
            .into_iter()
            .map(|(id, record)| {
                let unit = FieldUnit {
                    id: id.clone(),
                    address: record.address,
                    last_seen: record.last_seen,
                    slots: record.occupied_slots,
                    state: ConnectionState::Offline,
                };
                (id, unit)
            })
            .collect();

        tracing::info!("Restored {} field units from {:?}", units.len(), store.path());

        Ok(Self {
            units: RwLock::new(units),
            store: Some(store),
            storage_failure: watch::channel(None).0,
        })
    }

    /// Fires with a message once a snapshot write fails.
    pub fn storage_failures(&self) -> watch::Receiver<Option<String>> {
        self.storage_failure.subscribe()
    }

    pub async fn register(
        &self,
        unit_id: &str,
        address: &str,
        reported: Option<Vec<Slot>>,
        announcer: Announcer,
    ) -> GroundResult<Registration> {
        self.register_at(unit_id, address, reported, announcer, Utc::now())
            .await
    }

    /// Upsert a unit and refresh its liveness.
    ///
    /// * `Announcer::Unit` with `Some(slots)` replaces the stored set; invalid
    ///   or mutually overlapping entries are dropped and reported back.
    /// * `Announcer::Unit` with `None` keeps the stored set.
    /// * `Announcer::Internal` merges; any conflict rejects the whole call with
    ///   `SlotConflict` and nothing is changed.
    pub async fn register_at(
        &self,
        unit_id: &str,
        address: &str,
        reported: Option<Vec<Slot>>,
        announcer: Announcer,
        now: DateTime<Utc>,
    ) -> GroundResult<Registration> {
        let unit_id = validate_unit_id(unit_id)?;

        let mut units = self.units.write().await;
        let created = !units.contains_key(unit_id);
        let mut dropped_slots = Vec::new();

        let mut unit = units
            .get(unit_id)
            .cloned()
            .unwrap_or_else(|| FieldUnit::new(unit_id, address, now));

        match (announcer, reported) {
            (_, None) => {}
            (Announcer::Unit, Some(slots)) => {
                let (set, rejected) = SlotSet::from_reported(slots);
                unit.slots = set;
                dropped_slots = rejected;
            }
            (Announcer::Internal, Some(slots)) => {
                let mut merged = unit.slots.clone();
                for slot in slots {
                    if !slot.is_valid() {
                        return Err(GroundError::validation(format!("invalid slot {}", slot)));
                    }
                    if merged.contains(&slot) {
                        continue;
                    }
                    merged.insert(slot).map_err(|existing| GroundError::SlotConflict {
                        unit_id: unit_id.to_string(),
                        requested: slot,
                        existing,
                    })?;
                }
                unit.slots = merged;
            }
        }

        if !address.is_empty() {
            unit.address = address.to_string();
        }
        unit.last_seen = now;
        units.insert(unit_id.to_string(), unit);

        if created {
            tracing::info!("Registered field unit {} @ {}", unit_id, address);
        } else {
            tracing::debug!("Field unit {} re-announced @ {}", unit_id, address);
        }
        if !dropped_slots.is_empty() {
            tracing::warn!(
                "Field unit {} reported {} invalid or overlapping slots, dropped",
                unit_id,
                dropped_slots.len()
            );
        }

        self.persist(&units).await?;
        Ok(Registration {
            created,
            dropped_slots,
        })
    }

    pub async fn heartbeat(&self, unit_id: &str) -> GroundResult<()> {
        self.heartbeat_at(unit_id, Utc::now()).await
    }

    pub async fn heartbeat_at(&self, unit_id: &str, now: DateTime<Utc>) -> GroundResult<()> {
        let mut units = self.units.write().await;
        let unit = units
            .get_mut(unit_id)
            .ok_or_else(|| GroundError::UnknownUnit(unit_id.to_string()))?;
        unit.last_seen = now;
        self.persist(&units).await
    }

    /// Snapshot of units live at `now`.
    pub async fn list_live_units(&self, now: DateTime<Utc>, timeout: Duration) -> LiveUnits {
        let units = self.units.read().await;
        LiveUnits {
            units: units.values().cloned().collect(),
            cutoff: now - timeout,
        }
    }

    /// Remove every unit whose last contact is strictly older than `now - timeout`
    /// and hand back what was removed.
    pub async fn reap_expired(&self, now: DateTime<Utc>, timeout: Duration) -> GroundResult<Vec<FieldUnit>> {
        let cutoff = now - timeout;
        let mut units = self.units.write().await;

        let expired: Vec<String> = units
            .values()
            .filter(|u| u.last_seen < cutoff)
            .map(|u| u.id.clone())
            .collect();

        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let mut removed = Vec::with_capacity(expired.len());
        for id in &expired {
            if let Some(unit) = units.remove(id) {
                tracing::info!(
                    "Evicting field unit {} (last seen {})",
                    id,
                    unit.last_seen.to_rfc3339()
                );
                removed.push(unit);
            }
        }
        removed.sort_by(|a, b| a.id.cmp(&b.id));

        self.persist(&units).await?;
        Ok(removed)
    }

    /// Atomically check and insert `slot` into the unit's set. This is the
    /// sole commit point for assignments.
    pub async fn occupy(&self, unit_id: &str, slot: Slot) -> GroundResult<()> {
        if !slot.is_valid() {
            return Err(GroundError::validation(format!("invalid slot {}", slot)));
        }

        let mut units = self.units.write().await;
        let unit = units
            .get_mut(unit_id)
            .ok_or_else(|| GroundError::UnknownUnit(unit_id.to_string()))?;

        unit.slots
            .insert(slot)
            .map_err(|existing| GroundError::SlotConflict {
                unit_id: unit_id.to_string(),
                requested: slot,
                existing,
            })?;

        tracing::debug!("Field unit {} occupied {}", unit_id, slot);
        self.persist(&units).await
    }

    /// Fails `LivenessTimeout` for a registered unit that has gone quiet
    /// but has not been reaped yet.
    pub async fn check_live(
        &self,
        unit_id: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> GroundResult<FieldUnit> {
        let unit = self
            .get(unit_id)
            .await
            .ok_or_else(|| GroundError::UnknownUnit(unit_id.to_string()))?;
        if !unit.is_live(now, timeout) {
            return Err(GroundError::LivenessTimeout {
                unit_id: unit.id,
                last_seen: unit.last_seen,
            });
        }
        Ok(unit)
    }

    /// Runtime-only; not persisted.
    pub async fn set_connection_state(&self, unit_id: &str, state: ConnectionState) -> GroundResult<()> {
        let mut units = self.units.write().await;
        let unit = units
            .get_mut(unit_id)
            .ok_or_else(|| GroundError::UnknownUnit(unit_id.to_string()))?;
        if unit.state != state {
            tracing::debug!("Field unit {}: {} -> {}", unit_id, unit.state, state);
            unit.state = state;
        }
        Ok(())
    }

    pub async fn get(&self, unit_id: &str) -> Option<FieldUnit> {
        self.units.read().await.get(unit_id).cloned()
    }

    /// Every registered unit, ascending by id.
    pub async fn snapshot(&self) -> Vec<FieldUnit> {
        self.units.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.units.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.units.read().await.is_empty()
    }

    /// Write the current state out, e.g. on shutdown.
    pub async fn flush(&self) -> GroundResult<()> {
        let units = self.units.read().await;
        self.persist(&units).await
    }

    async fn persist(&self, units: &BTreeMap<String, FieldUnit>) -> GroundResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        if let Err(e) = store.save(&store::to_snapshot(units.values())).await {
            tracing::error!("Registry snapshot failed: {}", e);
            self.storage_failure.send_replace(Some(e.to_string()));
            return Err(e);
        }
        Ok(())
    }
}

fn validate_unit_id(unit_id: &str) -> GroundResult<&str> {
    let trimmed = unit_id.trim();
    if trimmed.is_empty() {
        return Err(GroundError::validation("field unit id must not be empty"));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    fn slot(from_secs: i64, to_secs: i64) -> Slot {
        Slot::new(t0() + Duration::seconds(from_secs), t0() + Duration::seconds(to_secs)).unwrap()
    }

    fn temp_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("satlink_registry_{}", uuid::Uuid::now_v7()))
    }

    #[tokio::test]
    async fn test_register_then_heartbeat() {
        let registry = FieldUnitRegistry::in_memory();
        let outcome = registry
            .register_at("FU1", "10.0.0.1", None, Announcer::Unit, t0())
            .await
            .unwrap();
        assert!(outcome.created);

        registry.heartbeat_at("FU1", t0() + Duration::seconds(30)).await.unwrap();
        let unit = registry.get("FU1").await.unwrap();
        assert_eq!(unit.last_seen, t0() + Duration::seconds(30));
        assert_eq!(unit.state, ConnectionState::Offline);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_unit() {
        let registry = FieldUnitRegistry::in_memory();
        let err = registry.heartbeat_at("ghost", t0()).await.unwrap_err();
        assert!(matches!(err, GroundError::UnknownUnit(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_empty_unit_id_rejected() {
        let registry = FieldUnitRegistry::in_memory();
        let err = registry
            .register_at("  ", "10.0.0.1", None, Announcer::Unit, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, GroundError::Validation(_)));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_unit_report_replaces_slots() {
        let registry = FieldUnitRegistry::in_memory();
        registry
            .register_at("FU1", "a", Some(vec![slot(0, 100)]), Announcer::Unit, t0())
            .await
            .unwrap();
        let outcome = registry
            .register_at(
                "FU1",
                "a",
                Some(vec![slot(500, 600), slot(550, 650)]),
                Announcer::Unit,
                t0(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.dropped_slots, vec![slot(550, 650)]);
        let unit = registry.get("FU1").await.unwrap();
        assert_eq!(unit.slots.to_vec(), vec![slot(500, 600)]);
    }

    #[tokio::test]
    async fn test_presence_without_slots_keeps_history() {
        let registry = FieldUnitRegistry::in_memory();
        registry
            .register_at("FU1", "a", Some(vec![slot(0, 100)]), Announcer::Unit, t0())
            .await
            .unwrap();
        registry
            .register_at("FU1", "b", None, Announcer::Unit, t0())
            .await
            .unwrap();

        let unit = registry.get("FU1").await.unwrap();
        assert_eq!(unit.address, "b");
        assert_eq!(unit.slots.to_vec(), vec![slot(0, 100)]);
    }

    #[tokio::test]
    async fn test_internal_merge_is_all_or_nothing() {
        let registry = FieldUnitRegistry::in_memory();
        registry
            .register_at("FU1", "a", Some(vec![slot(0, 100)]), Announcer::Unit, t0())
            .await
            .unwrap();

        registry
            .register_at("FU1", "a", Some(vec![slot(200, 300), slot(0, 100)]), Announcer::Internal, t0())
            .await
            .unwrap();
        assert_eq!(registry.get("FU1").await.unwrap().slots.len(), 2);

        let err = registry
            .register_at("FU1", "a", Some(vec![slot(400, 500), slot(250, 350)]), Announcer::Internal, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, GroundError::SlotConflict { .. }));
        assert_eq!(
            registry.get("FU1").await.unwrap().slots.to_vec(),
            vec![slot(0, 100), slot(200, 300)]
        );
    }

    #[tokio::test]
    async fn test_occupy_conflict_leaves_set_unchanged() {
        let registry = FieldUnitRegistry::in_memory();
        registry
            .register_at("FU1", "a", Some(vec![slot(-100, 200)]), Announcer::Unit, t0())
            .await
            .unwrap();
        let before = registry.get("FU1").await.unwrap().slots;

        let err = registry.occupy("FU1", slot(0, 600)).await.unwrap_err();
        match err {
            GroundError::SlotConflict { existing, .. } => assert_eq!(existing, slot(-100, 200)),
            other => panic!("expected SlotConflict, got {:?}", other),
        }
        assert_eq!(registry.get("FU1").await.unwrap().slots, before);

        registry.occupy("FU1", slot(200, 800)).await.unwrap();
        let after = registry.get("FU1").await.unwrap().slots;
        assert_eq!(after.len(), 2);
        assert!(after.is_disjoint());
    }

    #[tokio::test]
    async fn test_occupy_unknown_unit() {
        let registry = FieldUnitRegistry::in_memory();
        let err = registry.occupy("FU9", slot(0, 10)).await.unwrap_err();
        assert!(matches!(err, GroundError::UnknownUnit(_)));
    }

    #[tokio::test]
    async fn test_concurrent_occupy_commits_once() {
        let registry = Arc::new(FieldUnitRegistry::in_memory());
        registry
            .register_at("FU1", "a", None, Announcer::Unit, t0())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.occupy("FU1", slot(i * 10, i * 10 + 600)).await.is_ok()
            }));
        }

        let mut committed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                committed += 1;
            }
        }
        assert_eq!(committed, 1);
        assert!(registry.get("FU1").await.unwrap().slots.is_disjoint());
    }

    #[tokio::test]
    async fn test_reap_expired_boundary_and_idempotence() {
        let registry = FieldUnitRegistry::in_memory();
        let timeout = Duration::minutes(5);
        let now = t0() + Duration::minutes(10);

        registry.register_at("OLD", "a", None, Announcer::Unit, now - Duration::minutes(6)).await.unwrap();
        registry.register_at("EDGE", "b", None, Announcer::Unit, now - timeout).await.unwrap();
        registry.register_at("NEW", "c", None, Announcer::Unit, now).await.unwrap();

        let removed = registry.reap_expired(now, timeout).await.unwrap();
        let ids: Vec<&str> = removed.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["OLD"]);

        let again = registry.reap_expired(now, timeout).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_single_heartbeat_then_silence_is_evicted() {
        let registry = FieldUnitRegistry::in_memory();
        registry.register_at("FU1", "a", None, Announcer::Unit, t0()).await.unwrap();
        registry.heartbeat_at("FU1", t0()).await.unwrap();

        let removed = registry
            .reap_expired(t0() + Duration::minutes(6), Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, "FU1");
        assert_eq!(removed[0].last_seen, t0());
        assert!(registry.get("FU1").await.is_none());
    }

    #[tokio::test]
    async fn test_live_units_are_restartable() {
        let registry = FieldUnitRegistry::in_memory();
        registry.register_at("B", "b", None, Announcer::Unit, t0()).await.unwrap();
        registry.register_at("A", "a", None, Announcer::Unit, t0()).await.unwrap();
        registry.register_at("STALE", "s", None, Announcer::Unit, t0() - Duration::hours(1)).await.unwrap();

        let live = registry.list_live_units(t0(), Duration::minutes(5)).await;
        assert_eq!(live.ids(), vec!["A", "B"]);
        // Second pass yields the same sequence
        assert_eq!(live.iter().map(|u| u.id.as_str()).collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(live.len(), 2);
    }

    #[tokio::test]
    async fn test_check_live() {
        let registry = FieldUnitRegistry::in_memory();
        registry.register_at("FU1", "a", None, Announcer::Unit, t0()).await.unwrap();

        assert!(registry.check_live("FU1", t0(), Duration::minutes(5)).await.is_ok());
        let err = registry
            .check_live("FU1", t0() + Duration::minutes(7), Duration::minutes(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GroundError::LivenessTimeout { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_reload_reproduces_units() {
        let dir = temp_dir();
        {
            let registry = FieldUnitRegistry::open(&dir).await.unwrap();
            registry
                .register_at("FU1", "10.0.0.1", Some(vec![slot(300, 400), slot(0, 100)]), Announcer::Unit, t0())
                .await
                .unwrap();
            registry.register_at("FU2", "10.0.0.2", None, Announcer::Unit, t0()).await.unwrap();
            registry.occupy("FU2", slot(50, 650)).await.unwrap();
            registry.set_connection_state("FU2", ConnectionState::Connected).await.unwrap();
        }

        let reloaded = FieldUnitRegistry::open(&dir).await.unwrap();
        let fu1 = reloaded.get("FU1").await.unwrap();
        let fu2 = reloaded.get("FU2").await.unwrap();
        assert_eq!(fu1.address, "10.0.0.1");
        assert_eq!(fu1.last_seen, t0());
        assert_eq!(fu1.slots.to_vec(), vec![slot(0, 100), slot(300, 400)]);
        assert_eq!(fu2.slots.to_vec(), vec![slot(50, 650)]);
        // Connection state is not persisted
        assert_eq!(fu2.state, ConnectionState::Offline);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
