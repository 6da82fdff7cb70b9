//! Event-driven spot editing.
//!
//! The editor owns the region list for one source. Each event is an explicit state
//! transition; transitions that change geometry are persisted before returning.

use anyhow::{anyhow, Result};
use std::sync::Arc;

use super::SpotStore;
use crate::Region;

pub const DEFAULT_SPOT_WIDTH: u32 = 90;
pub const DEFAULT_SPOT_HEIGHT: u32 = 30;
/// Resizing never shrinks a side below this many pixels.
pub const MIN_SPOT_SIDE: u32 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditEvent {
    /// Primary button down: grab the spot under the pointer, or add a new one.
    Press { x: u32, y: u32 },
    /// Pointer moved while a spot is grabbed.
    Drag { x: u32, y: u32 },
    Release,
    /// Delete the first spot containing the point.
    RemoveAt { x: u32, y: u32 },
    Reset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditOutcome {
    Added(usize),
    Grabbed(usize),
    Resized(usize),
    Released,
    Removed(usize),
    Cleared,
    Ignored,
}

#[derive(Clone, Copy, Debug)]
struct Grab {
    index: usize,
    last_x: u32,
    last_y: u32,
}

pub struct SpotEditor {
    source_id: String,
    store: Arc<dyn SpotStore>,
    regions: Vec<Region>,
    grab: Option<Grab>,
}

impl SpotEditor {
    /// Start from whatever the store currently holds for `source_id`.
    pub fn load(source_id: &str, store: Arc<dyn SpotStore>) -> Result<Self> {
        let regions = store.load(source_id)?;
        Ok(Self {
            source_id: source_id.to_string(),
            store,
            regions,
            grab: None,
        })
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Index of the spot currently being resized.
    pub fn grabbed(&self) -> Option<usize> {
        self.grab.map(|grab| grab.index)
    }

    pub fn apply(&mut self, event: EditEvent) -> Result<EditOutcome> {
        match event {
            EditEvent::Press { x, y } => {
                if let Some(index) = self.hit(x, y) {
                    self.grab = Some(Grab {
                        index,
                        last_x: x,
                        last_y: y,
                    });
                    return Ok(EditOutcome::Grabbed(index));
                }
                let region = Region::new(x, y, DEFAULT_SPOT_WIDTH, DEFAULT_SPOT_HEIGHT)?;
                self.regions.push(region);
                self.persist()?;
                Ok(EditOutcome::Added(self.regions.len() - 1))
            }
            EditEvent::Drag { x, y } => {
                let Some(grab) = self.grab else {
                    return Ok(EditOutcome::Ignored);
                };
                let dx = x as i64 - grab.last_x as i64;
                let dy = y as i64 - grab.last_y as i64;
                self.resize_by(grab.index, dx, dy)?;
                self.grab = Some(Grab {
                    index: grab.index,
                    last_x: x,
                    last_y: y,
                });
                Ok(EditOutcome::Resized(grab.index))
            }
            EditEvent::Release => {
                if self.grab.take().is_some() {
                    Ok(EditOutcome::Released)
                } else {
                    Ok(EditOutcome::Ignored)
                }
            }
            EditEvent::RemoveAt { x, y } => {
                let Some(index) = self.hit(x, y) else {
                    return Ok(EditOutcome::Ignored);
                };
                self.regions.remove(index);
                self.grab = None;
                self.persist()?;
                Ok(EditOutcome::Removed(index))
            }
            EditEvent::Reset => {
                self.regions.clear();
                self.grab = None;
                self.persist()?;
                Ok(EditOutcome::Cleared)
            }
        }
    }

    /// Grow or shrink spot `index` by a signed delta, clamped to the minimum side.
    pub fn resize_by(&mut self, index: usize, dx: i64, dy: i64) -> Result<()> {
        let region = self
            .regions
            .get(index)
            .copied()
            .ok_or_else(|| anyhow!("spot {} does not exist", index))?;
        let width = clamp_side(region.width as i64 + dx);
        let height = clamp_side(region.height as i64 + dy);
        self.regions[index] = Region::new(region.x, region.y, width, height)?;
        self.persist()
    }

    fn hit(&self, x: u32, y: u32) -> Option<usize> {
        self.regions.iter().position(|region| region.contains(x, y))
    }

    fn persist(&self) -> Result<()> {
        self.store.save(&self.source_id, &self.regions)
    }
}

fn clamp_side(value: i64) -> u32 {
    value.clamp(MIN_SPOT_SIDE as i64, u32::MAX as i64) as u32
}
