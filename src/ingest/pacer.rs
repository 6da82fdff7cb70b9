//! Wall-clock pacing for a single frame source.
//!
//! `SourcePacer::advance` may be called as often as the supervisor likes; it only
//! touches the source when at least one frame interval has elapsed since the last
//! accepted read. Frames that fell due in between are skipped with `grab()` (no pixel
//! conversion) and exactly one frame is decoded and returned.
//!
//! End of stream is not an error: the source is rewound and treated as a loop.

use anyhow::{anyhow, Result};
use std::time::Instant;

use super::FrameSource;
use crate::frame::Frame;

/// Upper bound on frames discarded in one catch-up, in seconds of source time.
const MAX_CATCH_UP_SECS: f64 = 10.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacerState {
    Opening,
    Ready,
    /// Open failed. Permanent; `advance` always returns `Skip`.
    Failed,
}

#[derive(Debug)]
pub enum Pace {
    Frame(Frame),
    Skip,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacerStats {
    pub delivered: u64,
    pub discarded: u64,
    pub skips: u64,
    pub rewinds: u64,
}

pub struct SourcePacer {
    source_id: String,
    source: Option<Box<dyn FrameSource>>,
    state: PacerState,
    fps: f64,
    last_tick: Instant,
    stats: PacerStats,
    dimensions: Option<(u32, u32)>,
}

impl SourcePacer {
    /// Run `opener` once. A failure is logged here and never retried.
    pub fn open<F>(source_id: &str, opener: F, now: Instant) -> Self
    where
        F: FnOnce() -> Result<Box<dyn FrameSource>>,
    {
        let mut pacer = Self {
            source_id: source_id.to_string(),
            source: None,
            state: PacerState::Opening,
            fps: 0.0,
            last_tick: now,
            stats: PacerStats::default(),
            dimensions: None,
        };
        match opener().and_then(|source| {
            let fps = source.fps();
            if fps.is_finite() && fps > 0.0 {
                Ok((source, fps))
            } else {
                Err(anyhow!("source reports unusable frame rate {}", fps))
            }
        }) {
            Ok((source, fps)) => {
                log::info!(
                    "source {}: opened {} at {:.2} fps",
                    source_id,
                    source.describe(),
                    fps
                );
                pacer.source = Some(source);
                pacer.fps = fps;
                pacer.state = PacerState::Ready;
            }
            Err(err) => {
                log::error!("source {}: unavailable: {:#}", source_id, err);
                pacer.state = PacerState::Failed;
            }
        }
        pacer
    }

    /// Wrap an already opened source.
    pub fn from_source(source_id: &str, source: Box<dyn FrameSource>, now: Instant) -> Self {
        Self::open(source_id, move || Ok(source), now)
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn state(&self) -> PacerState {
        self.state
    }

    pub fn is_available(&self) -> bool {
        self.state != PacerState::Failed
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn stats(&self) -> PacerStats {
        self.stats
    }

    /// Dimensions of the last delivered frame.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    /// Number of whole frame intervals between the last accepted read and `now`.
    pub fn frames_due(&self, now: Instant) -> u64 {
        if self.state != PacerState::Ready {
            return 0;
        }
        let elapsed = now.saturating_duration_since(self.last_tick);
        (elapsed.as_nanos() as f64 * self.fps / 1e9).floor() as u64
    }

    /// Produce the frame due at `now`, or `Skip` when none is due yet.
    pub fn advance(&mut self, now: Instant) -> Result<Pace> {
        let due = self.frames_due(now);
        let Some(source) = self.source.as_mut() else {
            self.stats.skips += 1;
            return Ok(Pace::Skip);
        };
        if due == 0 {
            self.stats.skips += 1;
            return Ok(Pace::Skip);
        }

        let max_discard = (self.fps * MAX_CATCH_UP_SECS).ceil() as u64;
        let discard = (due - 1).min(max_discard);
        for _ in 0..discard {
            if !source.grab()? {
                source.rewind()?;
                self.stats.rewinds += 1;
                log::debug!("source {}: end of stream, rewound", self.source_id);
                if !source.grab()? {
                    return Err(anyhow!("source {} has no frames after rewind", self.source_id));
                }
            }
            self.stats.discarded += 1;
        }

        let frame = match source.read()? {
            Some(frame) => frame,
            None => {
                source.rewind()?;
                self.stats.rewinds += 1;
                log::debug!("source {}: end of stream, rewound", self.source_id);
                source
                    .read()?
                    .ok_or_else(|| anyhow!("source {} has no frames after rewind", self.source_id))?
            }
        };

        self.last_tick = now;
        self.stats.delivered += 1;
        self.dimensions = Some((frame.width(), frame.height()));
        Ok(Pace::Frame(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Calls {
        grabs: u64,
        reads: u64,
        rewinds: u64,
    }

    /// Finite source of `len` frames that records how it is driven.
    struct ScriptedSource {
        len: u64,
        position: u64,
        calls: Arc<Mutex<Calls>>,
    }

    impl ScriptedSource {
        fn boxed(len: u64) -> (Box<dyn FrameSource>, Arc<Mutex<Calls>>) {
            let calls = Arc::new(Mutex::new(Calls::default()));
            let source = Self {
                len,
                position: 0,
                calls: calls.clone(),
            };
            (Box::new(source), calls)
        }
    }

    impl FrameSource for ScriptedSource {
        fn fps(&self) -> f64 {
            10.0
        }

        fn grab(&mut self) -> Result<bool> {
            self.calls.lock().unwrap().grabs += 1;
            if self.position >= self.len {
                return Ok(false);
            }
            self.position += 1;
            Ok(true)
        }

        fn read(&mut self) -> Result<Option<Frame>> {
            self.calls.lock().unwrap().reads += 1;
            if self.position >= self.len {
                return Ok(None);
            }
            let frame = Frame::new(RgbImage::new(4, 3), self.position);
            self.position += 1;
            Ok(Some(frame))
        }

        fn rewind(&mut self) -> Result<()> {
            self.calls.lock().unwrap().rewinds += 1;
            self.position = 0;
            Ok(())
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    fn position(pace: Pace) -> u64 {
        match pace {
            Pace::Frame(frame) => frame.position,
            Pace::Skip => panic!("expected a frame"),
        }
    }

    #[test]
    fn empty_source_errors_instead_of_discarding() {
        let start = Instant::now();
        let (source, calls) = ScriptedSource::boxed(0);
        let mut pacer = SourcePacer::from_source("lot1", source, start);
        assert!(pacer.advance(start + Duration::from_millis(350)).is_err());
        assert_eq!(pacer.stats().discarded, 0);
        assert_eq!(calls.lock().unwrap().reads, 0);
    }

    #[test]
    fn skips_until_one_interval_elapsed() -> Result<()> {
        let start = Instant::now();
        let (source, calls) = ScriptedSource::boxed(100);
        let mut pacer = SourcePacer::from_source("lot1", source, start);
        assert_eq!(pacer.state(), PacerState::Ready);

        for ms in [0, 10, 50, 99] {
            assert!(matches!(
                pacer.advance(start + Duration::from_millis(ms))?,
                Pace::Skip
            ));
        }
        assert_eq!(calls.lock().unwrap().reads, 0);

        assert_eq!(position(pacer.advance(start + Duration::from_millis(100))?), 0);
        assert!(matches!(
            pacer.advance(start + Duration::from_millis(150))?,
            Pace::Skip
        ));
        assert_eq!(position(pacer.advance(start + Duration::from_millis(200))?), 1);
        assert_eq!(pacer.stats().delivered, 2);
        assert_eq!(pacer.stats().skips, 5);
        assert_eq!(pacer.dimensions(), Some((4, 3)));
        Ok(())
    }

    #[test]
    fn late_call_discards_missed_frames() -> Result<()> {
        let start = Instant::now();
        let (source, calls) = ScriptedSource::boxed(100);
        let mut pacer = SourcePacer::from_source("lot1", source, start);

        assert_eq!(position(pacer.advance(start + Duration::from_millis(350))?), 2);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.grabs, 2);
        assert_eq!(calls.reads, 1);
        assert_eq!(pacer.stats().discarded, 2);
        Ok(())
    }

    #[test]
    fn end_of_stream_rewinds() -> Result<()> {
        let start = Instant::now();
        let (source, calls) = ScriptedSource::boxed(2);
        let mut pacer = SourcePacer::from_source("lot1", source, start);

        let mut positions = Vec::new();
        for step in 1..=5u64 {
            positions.push(position(
                pacer.advance(start + Duration::from_millis(100 * step))?,
            ));
        }
        assert_eq!(positions, vec![0, 1, 0, 1, 0]);
        assert_eq!(pacer.stats().rewinds, 2);
        assert_eq!(calls.lock().unwrap().rewinds, 2);
        assert_eq!(pacer.state(), PacerState::Ready);
        Ok(())
    }

    #[test]
    fn discards_wrap_around_the_loop() -> Result<()> {
        let start = Instant::now();
        let (source, _) = ScriptedSource::boxed(3);
        let mut pacer = SourcePacer::from_source("lot1", source, start);
        // Five frames due on a three-frame loop: 0,1,2 grabbed, rewind, 0 grabbed, read 1.
        assert_eq!(position(pacer.advance(start + Duration::from_millis(500))?), 1);
        assert_eq!(pacer.stats().rewinds, 1);
        Ok(())
    }

    #[test]
    fn failed_open_is_permanent() -> Result<()> {
        let start = Instant::now();
        let attempts = Arc::new(Mutex::new(0));
        let counter = attempts.clone();
        let mut pacer = SourcePacer::open(
            "lot9",
            move || {
                *counter.lock().unwrap() += 1;
                Err(anyhow!("no such file"))
            },
            start,
        );
        assert_eq!(pacer.state(), PacerState::Failed);
        assert!(!pacer.is_available());
        for secs in 1..5 {
            assert!(matches!(
                pacer.advance(start + Duration::from_secs(secs))?,
                Pace::Skip
            ));
        }
        assert_eq!(*attempts.lock().unwrap(), 1);
        assert_eq!(pacer.dimensions(), None);
        Ok(())
    }
}
