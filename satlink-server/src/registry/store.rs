///! Stable-storage snapshot of the registry.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use super::FieldUnit;
use super::slots::SlotSet;
use crate::error::{GroundError, GroundResult};

pub const REGISTRY_FILE: &str = "registry.json";

/// On-disk record. Connection state is runtime-only and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedUnit {
    pub address: String,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub occupied_slots: SlotSet,
}

pub type RegistrySnapshot = BTreeMap<String, PersistedUnit>;

pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir.as_ref().join(REGISTRY_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means an empty registry. A corrupt file is moved aside
    /// and the registry starts empty.
    pub async fn load(&self) -> GroundResult<RegistrySnapshot> {
        if !self.path.exists() {
            tracing::debug!("No registry snapshot at {:?}", self.path);
            return Ok(RegistrySnapshot::new());
        }

        let content = fs::read_to_string(&self.path)
            .await
            .map_err(|e| GroundError::Storage(format!("read {:?}: {}", self.path, e)))?;

        if content.trim().is_empty() {
            return Ok(RegistrySnapshot::new());
        }

        match serde_json::from_str::<RegistrySnapshot>(&content) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                let aside = self.path.with_extension("json.corrupt");
                tracing::warn!(
                    "Registry snapshot {:?} is malformed ({}), moving it to {:?} and starting empty",
                    self.path,
                    e,
                    aside
                );
                fs::rename(&self.path, &aside)
                    .await
                    .map_err(|e| GroundError::Storage(format!("rename {:?}: {}", self.path, e)))?;
                Ok(RegistrySnapshot::new())
            }
        }
    }

    /// Write-then-rename so a crash never leaves a torn snapshot.
    pub async fn save(&self, snapshot: &RegistrySnapshot) -> GroundResult<()> {
        write_json_atomic(&self.path, snapshot).await
    }
}

pub(crate) fn to_snapshot<'a>(units: impl Iterator<Item = &'a FieldUnit>) -> RegistrySnapshot {
    units
        .map(|unit| {
            (
                unit.id.clone(),
                PersistedUnit {
                    address: unit.address.clone(),
                    last_seen: unit.last_seen,
                    occupied_slots: unit.slots.clone(),
                },
            )
        })
        .collect()
}

pub(crate) async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> GroundResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| GroundError::Storage(format!("create {:?}: {}", parent, e)))?;
        }
    }

    let content = serde_json::to_string_pretty(value)
        .map_err(|e| GroundError::Storage(format!("serialize {:?}: {}", path, e)))?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)
        .await
        .map_err(|e| GroundError::Storage(format!("write {:?}: {}", tmp, e)))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| GroundError::Storage(format!("rename {:?}: {}", tmp, e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> SnapshotStore {
        let dir = std::env::temp_dir().join(format!("satlink_store_{}", uuid::Uuid::now_v7()));
        SnapshotStore::in_dir(dir)
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let store = temp_store();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_moved_aside() {
        let store = temp_store();
        fs::create_dir_all(store.path().parent().unwrap()).await.unwrap();
        fs::write(store.path(), "{ not json").await.unwrap();

        assert!(store.load().await.unwrap().is_empty());
        assert!(!store.path().exists());
        assert!(store.path().with_extension("json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_persisted_format() {
        let store = temp_store();
        let mut snapshot = RegistrySnapshot::new();
        snapshot.insert(
            "FU1".to_string(),
            PersistedUnit {
                address: "10.0.0.7".to_string(),
                last_seen: "2026-10-19T12:00:00Z".parse().unwrap(),
                occupied_slots: SlotSet::new(),
            },
        );
        store.save(&snapshot).await.unwrap();

        let raw = fs::read_to_string(store.path()).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["FU1"]["address"], "10.0.0.7");
        assert_eq!(value["FU1"]["last_seen"], "2026-10-19T12:00:00Z");
        assert!(value["FU1"]["occupied_slots"].as_array().unwrap().is_empty());
    }
}
