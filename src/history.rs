//! Bounded occupancy history.
//!
//! `HistoryLog` keeps the most recent snapshots for one source (drop-oldest).
//! `HistorySampler` decides which classified frames are worth a history entry so the
//! log's growth rate does not follow the source frame rate.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::OccupancySnapshot;

pub const DEFAULT_HISTORY_CAPACITY: usize = 50;
pub const DEFAULT_SAMPLE_EVERY_N_FRAMES: u64 = 10;

#[derive(Clone, Debug)]
pub struct HistoryLog {
    entries: VecDeque<OccupancySnapshot>,
    capacity: usize,
}

impl HistoryLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest entries beyond capacity.
    pub fn record(&mut self, snapshot: OccupancySnapshot) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(snapshot);
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &OccupancySnapshot> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&OccupancySnapshot> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

/// Samples every Nth classified frame, optionally also enforcing a minimum wall-clock
/// spacing between recorded entries.
#[derive(Clone, Debug)]
pub struct HistorySampler {
    every_n_frames: u64,
    min_interval: Option<Duration>,
    classified: u64,
    last_recorded: Option<Instant>,
}

impl HistorySampler {
    pub fn new(every_n_frames: u64, min_interval: Option<Duration>) -> Self {
        Self {
            every_n_frames: every_n_frames.max(1),
            min_interval,
            classified: 0,
            last_recorded: None,
        }
    }

    /// Count one classified frame and report whether it should be recorded.
    pub fn should_record(&mut self, now: Instant) -> bool {
        self.classified += 1;
        if self.classified % self.every_n_frames != 0 {
            return false;
        }
        if let (Some(interval), Some(last)) = (self.min_interval, self.last_recorded) {
            if now.saturating_duration_since(last) < interval {
                return false;
            }
        }
        self.last_recorded = Some(now);
        true
    }

    pub fn classified(&self) -> u64 {
        self.classified
    }
}

impl Default for HistorySampler {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_EVERY_N_FRAMES, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn snapshot(i: u32) -> OccupancySnapshot {
        OccupancySnapshot {
            captured_at: UNIX_EPOCH + Duration::from_secs(i as u64),
            available: i,
            occupied: 100 - i,
        }
    }

    #[test]
    fn keeps_most_recent_fifty_in_order() {
        let mut log = HistoryLog::default();
        for i in 0..60 {
            log.record(snapshot(i));
        }
        assert_eq!(log.len(), 50);
        let kept: Vec<u32> = log.iter().map(|s| s.available).collect();
        assert_eq!(kept, (10..60).collect::<Vec<_>>());
        assert_eq!(log.latest().map(|s| s.available), Some(59));
    }

    #[test]
    fn timestamps_stay_monotonic() {
        let mut log = HistoryLog::new(5);
        for i in 0..12 {
            log.record(snapshot(i));
        }
        let times: Vec<SystemTime> = log.iter().map(|s| s.captured_at).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut log = HistoryLog::new(0);
        log.record(snapshot(1));
        log.record(snapshot(2));
        assert_eq!(log.len(), 1);
        assert_eq!(log.capacity(), 1);
    }

    #[test]
    fn samples_every_tenth_frame() {
        let mut sampler = HistorySampler::default();
        let now = Instant::now();
        let mut recorded = Vec::new();
        for _ in 0..35 {
            if sampler.should_record(now) {
                recorded.push(sampler.classified());
            }
        }
        assert_eq!(recorded, vec![10, 20, 30]);
    }

    #[test]
    fn min_interval_suppresses_bursts() {
        let mut sampler = HistorySampler::new(1, Some(Duration::from_secs(1)));
        let start = Instant::now();
        assert!(sampler.should_record(start));
        assert!(!sampler.should_record(start + Duration::from_millis(500)));
        assert!(sampler.should_record(start + Duration::from_millis(1000)));
        assert!(!sampler.should_record(start + Duration::from_millis(1999)));
    }
}
