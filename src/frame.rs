//! Decoded and encoded frames.
//!
//! - `Frame`: one decoded RGB frame handed from a source to the classifier.
//! - `EncodedFrame`: compressed JPEG bytes shared between viewers. Cloning is cheap
//!   (reference counted) so one encode serves every subscriber.
//! - `placeholder_frame()`: the "no feed" image a stream emits while starved.

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use std::sync::Arc;
use std::time::SystemTime;

use crate::classify::annotate::{draw_text, text_width};

/// Default JPEG quality for the live stream.
pub const DEFAULT_JPEG_QUALITY: u8 = 70;

/// Placeholder dimensions match the common 640x480 feed size.
pub const PLACEHOLDER_WIDTH: u32 = 640;
pub const PLACEHOLDER_HEIGHT: u32 = 480;

/// One decoded frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    /// Position of this frame within the current pass over the source (0-based).
    pub position: u64,
}

impl Frame {
    pub fn new(image: RgbImage, position: u64) -> Self {
        Self { image, position }
    }

    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, position: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("RGB buffer does not match {}x{}", width, height))?;
        Ok(Self { image, position })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Opaque compressed image. Only the most recent few exist at any time.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    /// Monotonic per-distributor sequence number, assigned at publish time.
    pub sequence: u64,
    pub encoded_at: SystemTime,
    jpeg: Arc<[u8]>,
}

impl EncodedFrame {
    pub fn new(jpeg: Vec<u8>) -> Self {
        Self {
            sequence: 0,
            encoded_at: SystemTime::now(),
            jpeg: Arc::from(jpeg),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.jpeg
    }

    pub fn len(&self) -> usize {
        self.jpeg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jpeg.is_empty()
    }

    pub(crate) fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

/// Encode an RGB image as a baseline JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<EncodedFrame> {
    let mut buffer = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(EncodedFrame::new(buffer))
}

/// Black frame with a centred "no video feed available" banner.
pub fn placeholder_image() -> RgbImage {
    let mut image = RgbImage::from_pixel(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT, Rgb([0, 0, 0]));
    let text = "NO VIDEO FEED AVAILABLE";
    let scale = 3;
    let x = (PLACEHOLDER_WIDTH as i32 - text_width(text, scale)) / 2;
    let y = PLACEHOLDER_HEIGHT as i32 / 2 - 7 * scale as i32 / 2;
    draw_text(&mut image, x, y, text, scale, Rgb([255, 255, 255]));
    image
}

pub fn placeholder_frame() -> Result<EncodedFrame> {
    encode_jpeg(&placeholder_image(), DEFAULT_JPEG_QUALITY)
}
