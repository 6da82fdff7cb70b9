//! Frame ingestion.
//!
//! This module provides the frame sources a pipeline can read from and the
//! `SourcePacer` that meters them:
//! - Local video files (feature: ingest-file-ffmpeg)
//! - Still images (`.jpg`, `.jpeg`, `.png`, `.bmp`), served as a one-frame loop
//! - Synthetic parking scenes (`stub://<name>`) for demos and tests
//!
//! Only local paths are accepted. Every source is treated as an endless loop: the
//! pacer rewinds it when it runs out of frames.

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod pacer;

use anyhow::Result;

use crate::frame::Frame;

pub use file::{FileConfig, FileSource};
pub use pacer::{Pace, PacerState, PacerStats, SourcePacer};

/// A seekable, rewindable frame stream.
pub trait FrameSource: Send {
    /// Intrinsic frame rate in frames per second.
    fn fps(&self) -> f64;

    /// Advance past one frame without producing pixels, as cheaply as the medium
    /// allows. Returns `false` at end of stream.
    fn grab(&mut self) -> Result<bool>;

    /// Decode the next frame. `None` at end of stream.
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Seek back to the first frame.
    fn rewind(&mut self) -> Result<()>;

    /// Human-readable origin for diagnostics.
    fn describe(&self) -> String;
}
