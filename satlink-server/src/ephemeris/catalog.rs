use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoLineElement {
    pub line1: String,
    pub line2: String,
}

/// Satellite name -> TLE pair. Refreshing the file is someone else's job;
/// the catalog is loaded once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TleCatalog {
    entries: BTreeMap<String, TwoLineElement>,
}

impl TleCatalog {
    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read TLE catalog {:?}", path))?;
        Self::from_json(&content).with_context(|| format!("Failed to parse TLE catalog {:?}", path))
    }

    /// Missing file yields an empty catalog; every satellite is then skipped
    /// by the scheduler with a warning.
    pub fn load_or_empty(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("TLE catalog {:?} not found, starting with an empty catalog", path);
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn insert(&mut self, name: impl Into<String>, tle: TwoLineElement) {
        self.entries.insert(name.into(), tle);
    }

    pub fn get(&self, name: &str) -> Option<&TwoLineElement> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
