///! Slot assigner
///!
///! Conflict-aware first fit: entries in ascending start order, units in
///! ascending id order, first unit whose slot set is free wins. The registry's
///! `occupy` is the only commit point.

use chrono::{DateTime, Duration, Utc};
use satlink_common::{PassEntry, Slot};
use serde::{Deserialize, Serialize};

use crate::error::GroundError;
use crate::registry::FieldUnitRegistry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub entry: PassEntry,
    pub fu_id: String,
    pub slot: Slot,
    pub fu_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnassignedReason {
    /// No live unit had a free slot
    AllUnitsBusy,
    /// Lost the race for the chosen unit to a concurrent run
    SlotConflict { unit_id: String },
    Validation { message: String },
}

impl std::fmt::Display for UnassignedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnassignedReason::AllUnitsBusy => write!(f, "AllUnitsBusy"),
            UnassignedReason::SlotConflict { unit_id } => write!(f, "SlotConflict({})", unit_id),
            UnassignedReason::Validation { message } => write!(f, "ValidationError({})", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unassigned {
    pub entry: PassEntry,
    pub reason: UnassignedReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignmentReport {
    pub assignments: Vec<Assignment>,
    pub unassigned: Vec<Unassigned>,
}

impl AssignmentReport {
    pub fn for_unit<'a>(&'a self, fu_id: &'a str) -> impl Iterator<Item = &'a Assignment> + 'a {
        self.assignments.iter().filter(move |a| a.fu_id == fu_id)
    }
}

pub struct SlotAssigner<'a> {
    registry: &'a FieldUnitRegistry,
    liveness_timeout: Duration,
}

impl<'a> SlotAssigner<'a> {
    pub fn new(registry: &'a FieldUnitRegistry, liveness_timeout: Duration) -> Self {
        Self {
            registry,
            liveness_timeout,
        }
    }

    pub async fn assign(&self, entries: Vec<PassEntry>) -> Result<AssignmentReport, GroundError> {
        self.assign_at(entries, Utc::now()).await
    }

    /// Every entry ends up either assigned or unassigned with a reason.
    /// Only a storage failure aborts the batch.
    pub async fn assign_at(
        &self,
        mut entries: Vec<PassEntry>,
        now: DateTime<Utc>,
    ) -> Result<AssignmentReport, GroundError> {
        entries.sort_by_key(|entry| entry.start_time);
        let mut report = AssignmentReport::default();

        for entry in entries {
            let slot = match validate_entry(&entry) {
                Ok(slot) => slot,
                Err(message) => {
                    tracing::warn!("Rejecting pass entry {:?}: {}", entry, message);
                    report.unassigned.push(Unassigned {
                        entry,
                        reason: UnassignedReason::Validation { message },
                    });
                    continue;
                }
            };

            // Fresh read per entry; never reuse a snapshot across commits
            let live = self.registry.list_live_units(now, self.liveness_timeout).await;
            let candidate = live.iter().find(|unit| unit.slots.find_conflict(&slot).is_none());

            let Some(unit) = candidate else {
                if live.is_empty() {
                    tracing::debug!("No live units for {} at {}", entry.satellite, slot);
                } else {
                    tracing::debug!("No free unit for {} at {}", entry.satellite, slot);
                }
                report.unassigned.push(Unassigned {
                    entry,
                    reason: UnassignedReason::AllUnitsBusy,
                });
                continue;
            };

            match self.registry.occupy(&unit.id, slot).await {
                Ok(()) => {
                    tracing::info!("Assigned {} {} to {}", entry.satellite, slot, unit.id);
                    report.assignments.push(Assignment {
                        entry,
                        fu_id: unit.id.clone(),
                        slot,
                        fu_address: unit.address.clone(),
                    });
                }
                Err(GroundError::SlotConflict { unit_id, .. }) => {
                    tracing::warn!(
                        "Slot {} on {} was taken concurrently, leaving {} unassigned",
                        slot,
                        unit_id,
                        entry.satellite
                    );
                    report.unassigned.push(Unassigned {
                        entry,
                        reason: UnassignedReason::SlotConflict { unit_id },
                    });
                }
                Err(GroundError::UnknownUnit(unit_id)) => {
                    // Reaped between the read and the commit
                    tracing::warn!("{} disappeared before commit", unit_id);
                    report.unassigned.push(Unassigned {
                        entry,
                        reason: UnassignedReason::AllUnitsBusy,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            "Assignment run: {} assigned, {} unassigned",
            report.assignments.len(),
            report.unassigned.len()
        );
        Ok(report)
    }
}

fn validate_entry(entry: &PassEntry) -> Result<Slot, String> {
    if entry.satellite.trim().is_empty() {
        return Err("missing satellite id".to_string());
    }
    entry.slot().map_err(|e| e.to_string())
}
