//! Local file frame source.
//!
//! `FileSource` picks a backend from the configured path:
//! - `stub://<name>`: synthetic parking scene (always available)
//! - still images: decoded once with `image`, replayed as a one-frame stream
//! - anything else: FFmpeg decode (feature: ingest-file-ffmpeg)
//!
//! The file source MUST NOT fetch remote URLs.

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use std::path::Path;

use super::FrameSource;
#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use crate::frame::Frame;
use crate::Region;

/// Frame rate assumed for still images when none is configured.
pub const DEFAULT_STILL_FPS: f64 = 1.0;

const STILL_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Configuration for a local file source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Local file path (e.g., "assets/video-1.mp4") or `stub://<name>`.
    pub path: String,
    /// Overrides the intrinsic frame rate when set.
    pub fps: Option<f64>,
}

impl FileConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            fps: None,
        }
    }
}

/// Local file frame source.
pub struct FileSource {
    backend: FileBackend,
    fps_override: Option<f64>,
}

enum FileBackend {
    Synthetic(SyntheticScene),
    Still(StillImageSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    /// Open the source. Failure here is permanent for the caller.
    pub fn open(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes): '{}'",
                config.path
            ));
        }
        if let Some(fps) = config.fps {
            if !(fps.is_finite() && fps > 0.0) {
                return Err(anyhow!("fps override must be positive, got {}", fps));
            }
        }
        let backend = if let Some(name) = config.path.strip_prefix("stub://") {
            FileBackend::Synthetic(SyntheticScene::new(name))
        } else if is_still_image(&config.path) {
            FileBackend::Still(StillImageSource::open(&config.path)?)
        } else {
            open_video(&config.path)?
        };
        log::info!("FileSource: opened {}", config.path);
        Ok(Self {
            backend,
            fps_override: config.fps,
        })
    }

    fn inner(&self) -> &dyn FrameSource {
        match &self.backend {
            FileBackend::Synthetic(source) => source,
            FileBackend::Still(source) => source,
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn FrameSource {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source,
            FileBackend::Still(source) => source,
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source,
        }
    }
}

impl FrameSource for FileSource {
    fn fps(&self) -> f64 {
        self.fps_override.unwrap_or_else(|| self.inner().fps())
    }

    fn grab(&mut self) -> Result<bool> {
        self.inner_mut().grab()
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        self.inner_mut().read()
    }

    fn rewind(&mut self) -> Result<()> {
        self.inner_mut().rewind()
    }

    fn describe(&self) -> String {
        self.inner().describe()
    }
}

#[cfg(feature = "ingest-file-ffmpeg")]
fn open_video(path: &str) -> Result<FileBackend> {
    Ok(FileBackend::Ffmpeg(FfmpegFileSource::open(path)?))
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
fn open_video(path: &str) -> Result<FileBackend> {
    Err(anyhow!(
        "video file '{}' requires the ingest-file-ffmpeg feature",
        path
    ))
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}

fn is_still_image(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            STILL_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

// ----------------------------------------------------------------------------
// Still image source
// ----------------------------------------------------------------------------

struct StillImageSource {
    path: String,
    image: RgbImage,
    consumed: bool,
}

impl StillImageSource {
    fn open(path: &str) -> Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("failed to decode image '{}'", path))?
            .into_rgb8();
        Ok(Self {
            path: path.to_string(),
            image,
            consumed: false,
        })
    }
}

impl FrameSource for StillImageSource {
    fn fps(&self) -> f64 {
        DEFAULT_STILL_FPS
    }

    fn grab(&mut self) -> Result<bool> {
        if self.consumed {
            return Ok(false);
        }
        self.consumed = true;
        Ok(true)
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if self.consumed {
            return Ok(None);
        }
        self.consumed = true;
        Ok(Some(Frame::new(self.image.clone(), 0)))
    }

    fn rewind(&mut self) -> Result<()> {
        self.consumed = false;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} ({}x{} still)", self.path, self.image.width(), self.image.height())
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for demos and tests
// ----------------------------------------------------------------------------

pub const SYNTHETIC_WIDTH: u32 = 640;
pub const SYNTHETIC_HEIGHT: u32 = 480;
pub const SYNTHETIC_FPS: f64 = 10.0;
/// Frames per pass before the synthetic stream reports end of stream.
pub const SYNTHETIC_LOOP_FRAMES: u64 = 120;

const ASPHALT: Rgb<u8> = Rgb([110, 110, 110]);
const SPOT_COLUMNS: u32 = 5;
const SPOT_ROWS: u32 = 2;

/// Spot layout painted by the synthetic scene, two rows of five 90x30 bays.
pub fn synthetic_layout() -> Vec<Region> {
    let mut regions = Vec::with_capacity((SPOT_COLUMNS * SPOT_ROWS) as usize);
    for row in 0..SPOT_ROWS {
        for col in 0..SPOT_COLUMNS {
            regions.push(Region {
                x: 40 + col * 115,
                y: 140 + row * 160,
                width: 90,
                height: 30,
            });
        }
    }
    regions
}

/// Whether bay `slot` holds a car at `position` within the loop.
pub fn synthetic_occupied(slot: usize, position: u64) -> bool {
    (position / 30 + slot as u64) % 3 != 0
}

struct SyntheticScene {
    name: String,
    position: u64,
}

impl SyntheticScene {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            position: 0,
        }
    }

    fn render(&self) -> RgbImage {
        let mut image = RgbImage::from_pixel(SYNTHETIC_WIDTH, SYNTHETIC_HEIGHT, ASPHALT);
        for (slot, bay) in synthetic_layout().iter().enumerate() {
            if !synthetic_occupied(slot, self.position) {
                continue;
            }
            // Textured body inset from the bay outline.
            for y in bay.y + 3..bay.bottom() - 3 {
                for x in bay.x + 3..bay.right() - 3 {
                    let dark = ((x - bay.x) / 6 + (y - bay.y) / 6) % 2 == 0;
                    let value = if dark { 30 } else { 220 };
                    image.put_pixel(x, y, Rgb([value, value, value]));
                }
            }
        }
        image
    }
}

impl FrameSource for SyntheticScene {
    fn fps(&self) -> f64 {
        SYNTHETIC_FPS
    }

    fn grab(&mut self) -> Result<bool> {
        if self.position >= SYNTHETIC_LOOP_FRAMES {
            return Ok(false);
        }
        self.position += 1;
        Ok(true)
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if self.position >= SYNTHETIC_LOOP_FRAMES {
            return Ok(None);
        }
        let frame = Frame::new(self.render(), self.position);
        self.position += 1;
        Ok(Some(frame))
    }

    fn rewind(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("stub://{} (synthetic)", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, ClassifierParams};

    #[test]
    fn rejects_remote_urls() {
        assert!(FileSource::open(FileConfig::new("rtsp://camera/stream")).is_err());
        assert!(FileSource::open(FileConfig::new("http://example.com/a.mp4")).is_err());
        assert!(FileSource::open(FileConfig::new("  ")).is_err());
    }

    #[test]
    fn missing_still_image_fails_to_open() {
        assert!(FileSource::open(FileConfig::new("/nonexistent/lot.png")).is_err());
    }

    #[test]
    fn rejects_bad_fps_override() {
        let config = FileConfig {
            path: "stub://lot".to_string(),
            fps: Some(0.0),
        };
        assert!(FileSource::open(config).is_err());
    }

    #[test]
    fn synthetic_stream_ends_and_rewinds() -> Result<()> {
        let mut source = FileSource::open(FileConfig::new("stub://lot"))?;
        assert_eq!(source.fps(), SYNTHETIC_FPS);
        let mut frames = 0;
        while source.read()?.is_some() {
            frames += 1;
        }
        assert_eq!(frames, SYNTHETIC_LOOP_FRAMES);
        assert!(!source.grab()?);
        source.rewind()?;
        let first = source.read()?.expect("frame after rewind");
        assert_eq!(first.position, 0);
        assert_eq!(first.width(), SYNTHETIC_WIDTH);
        Ok(())
    }

    #[test]
    fn synthetic_cars_classify_as_occupied() -> Result<()> {
        let mut source = FileSource::open(FileConfig::new("stub://lot"))?;
        let frame = source.read()?.expect("first frame");
        let layout = synthetic_layout();
        let result = classify(&frame.image, &layout, &ClassifierParams::default());
        for verdict in &result.verdicts {
            assert_eq!(
                verdict.occupancy.is_free(),
                !synthetic_occupied(verdict.index, 0),
                "bay {}",
                verdict.index
            );
        }
        Ok(())
    }

    #[test]
    fn still_image_replays_after_rewind() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("lot.png");
        RgbImage::from_pixel(8, 6, Rgb([10, 20, 30])).save(&path)?;
        let config = FileConfig {
            path: path.to_string_lossy().to_string(),
            fps: Some(2.0),
        };
        let mut source = FileSource::open(config)?;
        assert_eq!(source.fps(), 2.0);
        assert!(source.read()?.is_some());
        assert!(source.read()?.is_none());
        source.rewind()?;
        let frame = source.read()?.expect("replayed frame");
        assert_eq!((frame.width(), frame.height()), (8, 6));
        Ok(())
    }
}
