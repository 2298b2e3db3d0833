///! Ordered, non-overlapping set of occupied slots for one field unit.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use satlink_common::Slot;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Slots keyed by start. Because members never overlap, ends are sorted too,
/// so the only candidate for a conflict with `[s, e)` is the last member
/// starting before `e`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotSet {
    by_start: BTreeMap<DateTime<Utc>, DateTime<Utc>>,
}

impl SlotSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a unit's own report. Invalid or overlapping entries are
    /// returned separately instead of poisoning the whole set.
    pub fn from_reported(slots: impl IntoIterator<Item = Slot>) -> (Self, Vec<Slot>) {
        let mut sorted: Vec<Slot> = slots.into_iter().collect();
        sorted.sort();

        let mut set = Self::new();
        let mut rejected = Vec::new();
        for slot in sorted {
            if !slot.is_valid() || set.insert(slot).is_err() {
                rejected.push(slot);
            }
        }
        (set, rejected)
    }

    pub fn find_conflict(&self, slot: &Slot) -> Option<Slot> {
        let (&start, &end) = self.by_start.range(..slot.end).next_back()?;
        let candidate = Slot { start, end };
        candidate.overlaps(slot).then_some(candidate)
    }

    /// Insert `slot`, or return the existing slot it overlaps.
    pub fn insert(&mut self, slot: Slot) -> Result<(), Slot> {
        if let Some(existing) = self.find_conflict(&slot) {
            return Err(existing);
        }
        self.by_start.insert(slot.start, slot.end);
        Ok(())
    }

    pub fn contains(&self, slot: &Slot) -> bool {
        self.by_start.get(&slot.start) == Some(&slot.end)
    }

    pub fn iter(&self) -> impl Iterator<Item = Slot> + '_ {
        self.by_start
            .iter()
            .map(|(&start, &end)| Slot { start, end })
    }

    pub fn to_vec(&self) -> Vec<Slot> {
        self.iter().collect()
    }

    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }

    /// True when no two members overlap. Holds by construction; tests assert it.
    pub fn is_disjoint(&self) -> bool {
        let slots = self.to_vec();
        slots.windows(2).all(|pair| pair[0].end <= pair[1].start)
    }
}

impl Serialize for SlotSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for SlotSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let slots = Vec::<Slot>::deserialize(deserializer)?;
        let (set, rejected) = SlotSet::from_reported(slots);
        if !rejected.is_empty() {
            tracing::warn!("Dropped {} invalid or overlapping stored slots", rejected.len());
        }
        Ok(set)
    }
}
