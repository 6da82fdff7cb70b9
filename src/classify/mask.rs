//! Foreground mask extraction.
//!
//! Stages run in a fixed order, each consuming the previous stage's output:
//! luminance, 3x3 Gaussian smoothing, inverted adaptive Gaussian threshold,
//! 5x5 median filter, 3x3 dilation. Every stage is integer-deterministic on output
//! so identical frames always produce identical masks.

use image::{GrayImage, Luma, RgbImage};

use crate::Region;

/// Smoothing kernel size and sigma.
pub const BLUR_KERNEL: usize = 3;
pub const BLUR_SIGMA: f32 = 1.0;
/// Neighbourhood size for the adaptive threshold (odd).
pub const ADAPTIVE_BLOCK: usize = 25;
/// Bias subtracted from the local mean before comparing.
pub const ADAPTIVE_BIAS: i32 = 16;
/// Median filter window (odd).
pub const MEDIAN_KERNEL: usize = 5;

pub const FOREGROUND: u8 = 255;
pub const BACKGROUND: u8 = 0;

/// Full mask pipeline. Foreground (255) marks dense or textured pixels.
pub fn foreground_mask(frame: &RgbImage) -> GrayImage {
    let gray = luminance(frame);
    let smoothed = gaussian_blur(&gray, BLUR_KERNEL, BLUR_SIGMA);
    let thresholded = adaptive_threshold_inv(&smoothed, ADAPTIVE_BLOCK, ADAPTIVE_BIAS);
    let cleaned = median_binary(&thresholded, MEDIAN_KERNEL);
    dilate_3x3(&cleaned)
}

/// Number of foreground pixels inside `region`. The region must fit the mask.
pub fn count_foreground(mask: &GrayImage, region: &Region) -> u64 {
    let mut count = 0u64;
    for y in region.y..region.bottom() {
        for x in region.x..region.right() {
            if mask.get_pixel(x, y).0[0] != BACKGROUND {
                count += 1;
            }
        }
    }
    count
}

/// ITU-R BT.601 luma in 14-bit fixed point.
pub fn luminance(frame: &RgbImage) -> GrayImage {
    let mut out = GrayImage::new(frame.width(), frame.height());
    for (dst, src) in out.pixels_mut().zip(frame.pixels()) {
        let [r, g, b] = src.0;
        let y = (r as u32 * 4899 + g as u32 * 9617 + b as u32 * 1868 + (1 << 13)) >> 14;
        *dst = Luma([y.min(255) as u8]);
    }
    out
}

pub fn gaussian_blur(src: &GrayImage, size: usize, sigma: f32) -> GrayImage {
    let kernel = gaussian_kernel(size, sigma);
    let (w, h) = (src.width() as usize, src.height() as usize);
    let blurred = separable_filter(src.as_raw(), w, h, &kernel, Border::Reflect101);
    let pixels = blurred.iter().map(|v| round_u8(*v)).collect();
    GrayImage::from_raw(w as u32, h as u32, pixels).unwrap_or_else(|| GrayImage::new(0, 0))
}

/// Inverted binary threshold against a Gaussian-weighted local mean.
///
/// A pixel becomes foreground unless it is brighter than `mean - bias`. The mean
/// replicates edge pixels past the frame border.
pub fn adaptive_threshold_inv(src: &GrayImage, block: usize, bias: i32) -> GrayImage {
    let sigma = 0.3 * ((block as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let kernel = gaussian_kernel(block, sigma);
    let (w, h) = (src.width() as usize, src.height() as usize);
    let means = separable_filter(src.as_raw(), w, h, &kernel, Border::Replicate);
    let pixels = src
        .as_raw()
        .iter()
        .zip(means.iter())
        .map(|(&value, &mean)| {
            if value as i32 > round_u8(mean) as i32 - bias {
                BACKGROUND
            } else {
                FOREGROUND
            }
        })
        .collect();
    GrayImage::from_raw(w as u32, h as u32, pixels).unwrap_or_else(|| GrayImage::new(0, 0))
}

/// Median of a binary image: foreground iff the majority of the window is.
/// Borders replicate the edge pixel.
pub fn median_binary(src: &GrayImage, size: usize) -> GrayImage {
    let (w, h) = (src.width() as i64, src.height() as i64);
    let radius = (size / 2) as i64;
    let majority = (size * size / 2 + 1) as u32;
    let mut out = GrayImage::new(src.width(), src.height());
    for y in 0..h {
        for x in 0..w {
            let mut lit = 0u32;
            for dy in -radius..=radius {
                let sy = (y + dy).clamp(0, h - 1) as u32;
                for dx in -radius..=radius {
                    let sx = (x + dx).clamp(0, w - 1) as u32;
                    if src.get_pixel(sx, sy).0[0] != BACKGROUND {
                        lit += 1;
                    }
                }
            }
            let value = if lit >= majority { FOREGROUND } else { BACKGROUND };
            out.put_pixel(x as u32, y as u32, Luma([value]));
        }
    }
    out
}

/// One iteration of 3x3 max filtering. Pixels outside the image are ignored.
pub fn dilate_3x3(src: &GrayImage) -> GrayImage {
    let (w, h) = (src.width() as i64, src.height() as i64);
    let mut out = GrayImage::new(src.width(), src.height());
    for y in 0..h {
        for x in 0..w {
            let mut max = 0u8;
            for sy in (y - 1).max(0)..=(y + 1).min(h - 1) {
                for sx in (x - 1).max(0)..=(x + 1).min(w - 1) {
                    max = max.max(src.get_pixel(sx as u32, sy as u32).0[0]);
                }
            }
            out.put_pixel(x as u32, y as u32, Luma([max]));
        }
    }
    out
}

fn gaussian_kernel(size: usize, sigma: f32) -> Vec<f32> {
    let center = (size / 2) as f32;
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..size)
        .map(|i| {
            let d = i as f32 - center;
            (-(d * d) / denom).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= sum;
    }
    kernel
}

/// How a filter samples coordinates outside the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Border {
    /// `dcb|abcd|cba`: mirror without repeating the edge pixel.
    Reflect101,
    /// `aaa|abcd|ddd`
    Replicate,
}

impl Border {
    fn index(self, i: i64, n: i64) -> usize {
        match self {
            Border::Reflect101 => reflect101(i, n),
            Border::Replicate => i.clamp(0, (n - 1).max(0)) as usize,
        }
    }
}

/// Horizontal then vertical pass.
fn separable_filter(src: &[u8], w: usize, h: usize, kernel: &[f32], border: Border) -> Vec<f32> {
    let radius = (kernel.len() / 2) as i64;
    let mut horizontal = vec![0f32; w * h];
    for y in 0..h {
        let row = &src[y * w..(y + 1) * w];
        for x in 0..w {
            let mut acc = 0f32;
            for (k, weight) in kernel.iter().enumerate() {
                let sx = border.index(x as i64 + k as i64 - radius, w as i64);
                acc += row[sx] as f32 * weight;
            }
            horizontal[y * w + x] = acc;
        }
    }
    let mut out = vec![0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0f32;
            for (k, weight) in kernel.iter().enumerate() {
                let sy = border.index(y as i64 + k as i64 - radius, h as i64);
                acc += horizontal[sy * w + x] * weight;
            }
            out[y * w + x] = acc;
        }
    }
    out
}

fn reflect101(mut i: i64, n: i64) -> usize {
    if n <= 1 {
        return 0;
    }
    loop {
        if i < 0 {
            i = -i;
        } else if i >= n {
            i = 2 * n - 2 - i;
        } else {
            return i as usize;
        }
    }
}

fn round_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
