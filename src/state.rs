//! Process-wide occupancy read model.
//!
//! One `LotState` per configured source, written only by that source's pipeline step
//! and read by any number of API handlers. Writers replace the whole value; readers
//! receive an `Arc` to an immutable snapshot, so counts are never observed half
//! updated.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::history::HistoryLog;
use crate::OccupancySnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// Configured, no frame classified yet.
    Pending,
    Active,
    /// The source could not be opened. Permanent for the process lifetime.
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    /// Local wall-clock time of day, `HH:MM:SS`.
    pub time: String,
    pub available: u32,
    pub occupied: u32,
}

impl From<&OccupancySnapshot> for HistoryEntry {
    fn from(snapshot: &OccupancySnapshot) -> Self {
        Self {
            time: DateTime::<Local>::from(snapshot.captured_at)
                .format("%H:%M:%S")
                .to_string(),
            available: snapshot.available,
            occupied: snapshot.occupied,
        }
    }
}

/// Externally visible aggregate for one source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LotState {
    pub status: SourceStatus,
    pub total: u32,
    pub available: u32,
    pub occupied: u32,
    pub history: Vec<HistoryEntry>,
}

impl LotState {
    pub fn pending(configured_spots: usize) -> Self {
        Self {
            status: SourceStatus::Pending,
            total: configured_spots as u32,
            available: 0,
            occupied: 0,
            history: Vec::new(),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            status: SourceStatus::Unavailable,
            total: 0,
            available: 0,
            occupied: 0,
            history: Vec::new(),
        }
    }

    /// Rebuild from the latest snapshot; `total` is always `available + occupied`.
    pub fn active(snapshot: &OccupancySnapshot, history: &HistoryLog) -> Self {
        Self {
            status: SourceStatus::Active,
            total: snapshot.total(),
            available: snapshot.available,
            occupied: snapshot.occupied,
            history: history.iter().map(HistoryEntry::from).collect(),
        }
    }

    pub fn summary(&self) -> LotSummary {
        LotSummary {
            status: self.status,
            total: self.total,
            available: self.available,
            occupied: self.occupied,
        }
    }
}

/// `LotState` without history, for the all-sources overview.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LotSummary {
    pub status: SourceStatus,
    pub total: u32,
    pub available: u32,
    pub occupied: u32,
}

/// Holder for every source's current `LotState`. The set of sources is fixed when the
/// registry is built.
#[derive(Debug, Default)]
pub struct LotRegistry {
    lots: BTreeMap<String, RwLock<Arc<LotState>>>,
}

impl LotRegistry {
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = (S, LotState)>,
        S: Into<String>,
    {
        let lots = sources
            .into_iter()
            .map(|(id, state)| (id.into(), RwLock::new(Arc::new(state))))
            .collect();
        Self { lots }
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.lots.contains_key(source_id)
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.lots.keys().map(String::as_str)
    }

    /// Replace the state for `source_id`. Returns false for unknown sources.
    pub fn publish(&self, source_id: &str, state: LotState) -> bool {
        let Some(slot) = self.lots.get(source_id) else {
            return false;
        };
        let next = Arc::new(state);
        *slot.write().unwrap_or_else(PoisonError::into_inner) = next;
        true
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<LotState>> {
        self.lots
            .get(source_id)
            .map(|slot| slot.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Summary of every source, keyed by id.
    pub fn overview(&self) -> BTreeMap<String, LotSummary> {
        self.lots
            .iter()
            .map(|(id, slot)| {
                let state = slot.read().unwrap_or_else(PoisonError::into_inner);
                (id.clone(), state.summary())
            })
            .collect()
    }
}
