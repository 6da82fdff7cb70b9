//! Local video file source using FFmpeg.
//!
//! Frames are decoded in-memory and converted to RGB only when the pacer asks for a
//! frame it will actually classify; discarded frames are decoded but never scaled.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::FrameSource;
use crate::frame::Frame;

/// Used when the container does not report a usable frame rate.
const FALLBACK_FPS: f64 = 30.0;

pub(crate) struct FfmpegFileSource {
    path: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    fps: f64,
    position: u64,
    draining: bool,
}

impl FfmpegFileSource {
    pub(crate) fn open(path: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open file input '{}' with ffmpeg", path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let fps = [input_stream.avg_frame_rate(), input_stream.rate()]
            .into_iter()
            .map(f64::from)
            .find(|rate| rate.is_finite() && *rate > 0.0)
            .unwrap_or(FALLBACK_FPS);
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "FileSource: {} is {}x{} @ {:.2} fps (ffmpeg)",
            path,
            decoder.width(),
            decoder.height(),
            fps
        );

        Ok(Self {
            path: path.to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            fps,
            position: 0,
            draining: false,
        })
    }

    fn next_packet(&mut self) -> Option<ffmpeg::Packet> {
        for (stream, packet) in self.input.packets() {
            if stream.index() == self.stream_index {
                return Some(packet);
            }
        }
        None
    }

    /// Decode the next video frame into `decoded`. `false` at end of stream.
    fn decode_next(&mut self, decoded: &mut ffmpeg::frame::Video) -> Result<bool> {
        loop {
            if self.decoder.receive_frame(decoded).is_ok() {
                return Ok(true);
            }
            if self.draining {
                return Ok(false);
            }
            match self.next_packet() {
                Some(packet) => self
                    .decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?,
                None => {
                    self.decoder
                        .send_eof()
                        .context("signal end of stream to ffmpeg decoder")?;
                    self.draining = true;
                }
            }
        }
    }
}

impl FrameSource for FfmpegFileSource {
    fn fps(&self) -> f64 {
        self.fps
    }

    fn grab(&mut self) -> Result<bool> {
        let mut decoded = ffmpeg::frame::Video::empty();
        if !self.decode_next(&mut decoded)? {
            return Ok(false);
        }
        self.position += 1;
        Ok(true)
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        if !self.decode_next(&mut decoded)? {
            return Ok(None);
        }
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
        let frame = Frame::from_rgb(pixels, width, height, self.position)?;
        self.position += 1;
        Ok(Some(frame))
    }

    fn rewind(&mut self) -> Result<()> {
        self.input
            .seek(0, ..)
            .with_context(|| format!("rewind '{}'", self.path))?;
        self.decoder.flush();
        self.draining = false;
        self.position = 0;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} (ffmpeg)", self.path)
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
