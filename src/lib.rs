//! Parking occupancy monitor.
//!
//! This crate samples one or more looping video sources, classifies fixed regions
//! ("spots") of each frame as occupied or free, and serves the resulting occupancy
//! state plus an annotated live MJPEG feed to remote viewers.
//!
//! # Architecture
//!
//! Data flows leaf-first:
//!
//! 1. `spots`: per-source region geometry (loaded once at startup).
//! 2. `ingest`: frame sources and the `SourcePacer`, which consumes frames at the
//!    source's native rate regardless of how fast the control loop spins.
//! 3. `classify`: pure pixel-statistics classifier producing verdicts and an
//!    annotated frame.
//! 4. `history` / `state`: bounded occupancy history and the atomically replaced
//!    per-source read model.
//! 5. `distribute`: drop-oldest fan-out of encoded frames to any number of viewers.
//! 6. `pipeline`: the supervisor loop tying one pacer + classifier per source.
//! 7. `api`: read API and multipart live stream over HTTP/1.1.
//!
//! Memory is bounded everywhere a slow or absent consumer could otherwise cause growth:
//! history is capped, each viewer queue is capped, and the supervisor never blocks on
//! a viewer.

use anyhow::{anyhow, Result};
use std::time::SystemTime;

pub mod api;
pub mod classify;
pub mod config;
pub mod distribute;
pub mod frame;
pub mod history;
pub mod ingest;
pub mod pipeline;
pub mod spots;
pub mod state;

pub use classify::{classify, Classification, ClassifierParams, SpotVerdict};
pub use distribute::{FrameDistributor, Subscription};
pub use frame::{EncodedFrame, Frame};
pub use history::{HistoryLog, HistorySampler};
pub use ingest::{FrameSource, Pace, PacerState, SourcePacer};
pub use pipeline::{SourcePipeline, Supervisor};
pub use spots::{InMemorySpotStore, JsonSpotStore, SpotStore};
pub use state::{HistoryEntry, LotRegistry, LotState, SourceStatus};

/// Fraction of a spot's area that foreground pixels must exceed for the spot to be
/// reported as occupied.
pub const OCCUPANCY_THRESHOLD: f64 = 0.2;

// -------------------- Regions --------------------

/// Axis-aligned rectangle in source pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!(
                "region must have positive width and height (got {}x{})",
                width,
                height
            ));
        }
        x.checked_add(width)
            .zip(y.checked_add(height))
            .ok_or_else(|| anyhow!("region extent overflows pixel coordinates"))?;
        Ok(Self {
            x,
            y,
            width,
            height,
        })
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Exclusive right edge, saturating at `u32::MAX`.
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// Exclusive bottom edge, saturating at `u32::MAX`.
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// True when the whole rectangle lies inside a `width` x `height` frame.
    /// Empty or overflowing rectangles never fit.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        if self.width == 0 || self.height == 0 {
            return false;
        }
        match (self.x.checked_add(self.width), self.y.checked_add(self.height)) {
            (Some(right), Some(bottom)) => right <= width && bottom <= height,
            _ => false,
        }
    }

    /// Inclusive hit test, matching how a pointer on the border selects a spot.
    pub fn contains(&self, px: u32, py: u32) -> bool {
        px >= self.x && px <= self.right() && py >= self.y && py <= self.bottom()
    }

    pub fn as_tuple(&self) -> [u32; 4] {
        [self.x, self.y, self.width, self.height]
    }
}

// -------------------- Occupancy --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Occupancy {
    Free,
    Occupied,
}

impl Occupancy {
    /// A spot is free iff its foreground count does not exceed `area * threshold`.
    pub fn from_foreground(foreground: u64, region: &Region, threshold: f64) -> Self {
        if foreground as f64 <= region.area() as f64 * threshold {
            Occupancy::Free
        } else {
            Occupancy::Occupied
        }
    }

    pub fn is_free(self) -> bool {
        matches!(self, Occupancy::Free)
    }
}

/// Counts derived from one classification cycle. Never mutated once built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OccupancySnapshot {
    pub captured_at: SystemTime,
    pub available: u32,
    pub occupied: u32,
}

impl OccupancySnapshot {
    pub fn from_verdicts<'a>(
        captured_at: SystemTime,
        verdicts: impl IntoIterator<Item = &'a Occupancy>,
    ) -> Self {
        let mut available = 0u32;
        let mut occupied = 0u32;
        for verdict in verdicts {
            if verdict.is_free() {
                available += 1;
            } else {
                occupied += 1;
            }
        }
        Self {
            captured_at,
            available,
            occupied,
        }
    }

    pub fn total(&self) -> u32 {
        self.available + self.occupied
    }
}

/// Source identifiers double as URL query values and file-name stems.
pub fn validate_source_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 {
        return Err(anyhow!("source id must be 1..=64 characters"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(anyhow!(
            "source id '{}' may only contain ASCII letters, digits, '_' or '-'",
            id
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn region_rejects_empty_extent() {
        assert!(Region::new(0, 0, 0, 10).is_err());
        assert!(Region::new(0, 0, 10, 0).is_err());
        assert!(Region::new(u32::MAX, 0, 10, 10).is_err());
    }

    #[test]
    fn region_bounds_and_hit_test() -> Result<()> {
        let region = Region::new(10, 20, 90, 30)?;
        assert_eq!(region.area(), 2700);
        assert!(region.fits_within(100, 50));
        assert!(!region.fits_within(99, 50));
        assert!(region.contains(10, 20));
        assert!(region.contains(100, 50));
        assert!(!region.contains(101, 50));
        Ok(())
    }

    #[test]
    fn unchecked_regions_never_fit() {
        let overflowing = Region {
            x: u32::MAX,
            y: 0,
            width: 10,
            height: 10,
        };
        assert_eq!(overflowing.right(), u32::MAX);
        assert!(!overflowing.fits_within(u32::MAX, u32::MAX));

        let empty = Region {
            x: 0,
            y: 0,
            width: 0,
            height: 5,
        };
        assert!(!empty.fits_within(100, 100));
    }

    #[test]
    fn sparse_foreground_is_free() -> Result<()> {
        let region = Region::new(0, 0, 90, 30)?;
        assert_eq!(
            Occupancy::from_foreground(100, &region, OCCUPANCY_THRESHOLD),
            Occupancy::Free
        );
        // Exactly at the threshold is still free.
        assert_eq!(
            Occupancy::from_foreground(540, &region, OCCUPANCY_THRESHOLD),
            Occupancy::Free
        );
        Ok(())
    }

    #[test]
    fn dense_foreground_is_occupied() -> Result<()> {
        let region = Region::new(0, 0, 90, 30)?;
        assert_eq!(
            Occupancy::from_foreground(1200, &region, OCCUPANCY_THRESHOLD),
            Occupancy::Occupied
        );
        assert_eq!(
            Occupancy::from_foreground(541, &region, OCCUPANCY_THRESHOLD),
            Occupancy::Occupied
        );
        Ok(())
    }

    #[test]
    fn snapshot_counts_verdicts() {
        let verdicts = [Occupancy::Occupied, Occupancy::Free, Occupancy::Free];
        let snap = OccupancySnapshot::from_verdicts(UNIX_EPOCH, &verdicts);
        assert_eq!(snap.available, 2);
        assert_eq!(snap.occupied, 1);
        assert_eq!(snap.total(), 3);
    }

    #[test]
    fn source_ids_are_restricted() {
        assert!(validate_source_id("lot1").is_ok());
        assert!(validate_source_id("north-deck_2").is_ok());
        assert!(validate_source_id("").is_err());
        assert!(validate_source_id("lot 1").is_err());
        assert!(validate_source_id("../etc").is_err());
    }
}
