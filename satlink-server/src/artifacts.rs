///! Schedule and assignment artifacts written under `data_dir`.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use satlink_common::PassEntry;
use serde::{Deserialize, Serialize};

use crate::assigner::{Assignment, Unassigned, UnassignedReason};
use crate::error::GroundResult;
use crate::registry::write_json_atomic;

pub const SCHEDULE_FILE: &str = "schedule.json";
pub const ASSIGNMENTS_FILE: &str = "assignments.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub satellite: String,
    pub start_time: DateTime<Utc>,
    /// Unix seconds of `start_time`
    pub timestamp: i64,
    pub duration: i64,
}

impl From<&PassEntry> for ScheduleRecord {
    fn from(entry: &PassEntry) -> Self {
        Self {
            satellite: entry.satellite.clone(),
            start_time: entry.start_time,
            timestamp: entry.start_time.timestamp(),
            duration: entry.duration_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub satellite: String,
    pub timestamp: i64,
    pub start_time: DateTime<Utc>,
    pub duration: i64,
    pub assigned_fu: String,
    pub fu_address: String,
}

impl AssignmentRecord {
    pub fn entry(&self) -> PassEntry {
        PassEntry::new(self.satellite.clone(), self.start_time, self.duration)
    }

    /// `None` when the record does not describe a valid slot.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.entry().slot().ok().map(|slot| slot.end)
    }
}

impl From<&Assignment> for AssignmentRecord {
    fn from(assignment: &Assignment) -> Self {
        Self {
            satellite: assignment.entry.satellite.clone(),
            timestamp: assignment.entry.start_time.timestamp(),
            start_time: assignment.entry.start_time,
            duration: assignment.entry.duration_secs,
            assigned_fu: assignment.fu_id.clone(),
            fu_address: assignment.fu_address.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnassignedRecord {
    pub satellite: String,
    pub timestamp: i64,
    pub start_time: DateTime<Utc>,
    pub duration: i64,
    pub reason: UnassignedReason,
}

impl From<&Unassigned> for UnassignedRecord {
    fn from(unassigned: &Unassigned) -> Self {
        Self {
            satellite: unassigned.entry.satellite.clone(),
            timestamp: unassigned.entry.start_time.timestamp(),
            start_time: unassigned.entry.start_time,
            duration: unassigned.entry.duration_secs,
            reason: unassigned.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentArtifact {
    /// Unit id -> its passes, ascending by start
    pub units: BTreeMap<String, Vec<AssignmentRecord>>,
    pub unassigned: Vec<UnassignedRecord>,
}

pub struct ArtifactWriter {
    data_dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    pub fn schedule_path(&self) -> PathBuf {
        self.data_dir.join(SCHEDULE_FILE)
    }

    pub fn assignments_path(&self) -> PathBuf {
        self.data_dir.join(ASSIGNMENTS_FILE)
    }

    pub async fn write_schedule(&self, entries: &[PassEntry]) -> GroundResult<()> {
        let records: Vec<ScheduleRecord> = entries.iter().map(ScheduleRecord::from).collect();
        write_json_atomic(&self.schedule_path(), &records).await?;
        tracing::debug!("Wrote {} schedule entries to {:?}", records.len(), self.schedule_path());
        Ok(())
    }

    pub async fn write_assignments(&self, artifact: &AssignmentArtifact) -> GroundResult<()> {
        write_json_atomic(&self.assignments_path(), artifact).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use satlink_common::Slot;

    #[tokio::test]
    async fn test_artifact_layout() {
        let dir = std::env::temp_dir().join(format!("satlink_artifacts_{}", uuid::Uuid::now_v7()));
        let writer = ArtifactWriter::new(&dir);
        let start = Utc.with_ymd_and_hms(2026, 10, 19, 6, 15, 0).unwrap();
        let entry = PassEntry::new("NOAA 19", start, 600);

        writer.write_schedule(std::slice::from_ref(&entry)).await.unwrap();
        let raw = tokio::fs::read_to_string(writer.schedule_path()).await.unwrap();
        let schedule: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(schedule[0]["satellite"], "NOAA 19");
        assert_eq!(schedule[0]["start_time"], "2026-10-19T06:15:00Z");
        assert_eq!(schedule[0]["timestamp"], start.timestamp());

        let assignment = Assignment {
            entry: entry.clone(),
            fu_id: "FU2".to_string(),
            slot: Slot::starting_at(start, 600).unwrap(),
            fu_address: "10.0.0.2".to_string(),
        };
        let mut artifact = AssignmentArtifact::default();
        artifact
            .units
            .insert("FU2".to_string(), vec![AssignmentRecord::from(&assignment)]);
        artifact.unassigned.push(UnassignedRecord::from(&Unassigned {
            entry,
            reason: UnassignedReason::AllUnitsBusy,
        }));
        writer.write_assignments(&artifact).await.unwrap();

        let raw = tokio::fs::read_to_string(writer.assignments_path()).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["units"]["FU2"][0]["assigned_fu"], "FU2");
        assert_eq!(value["units"]["FU2"][0]["fu_address"], "10.0.0.2");
        assert_eq!(value["unassigned"][0]["reason"]["kind"], "all_units_busy");

        let back: AssignmentArtifact = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, artifact);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
