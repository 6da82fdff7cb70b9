//! Occupancy classification.
//!
//! `classify` turns a decoded frame plus a spot list into per-spot verdicts and an
//! annotated copy of the frame. It holds no state between calls, so any number of
//! pipelines may call it concurrently and identical inputs always give identical
//! outputs.
//!
//! Spots that do not lie fully inside the frame are left out of both the verdicts and
//! the drawing; their indices are reported in `Classification::skipped` so the caller
//! can log them.

pub mod annotate;
pub mod mask;

use image::{GrayImage, Rgb, RgbImage};
use std::time::SystemTime;

use crate::{Occupancy, OccupancySnapshot, Region, OCCUPANCY_THRESHOLD};
use annotate::{
    draw_region, draw_text, fill_rect, text_height, text_width, FREE_COLOR, LABEL_COLOR,
    OCCUPIED_COLOR, STATUS_COLOR,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClassifierParams {
    /// Fraction of spot area above which the spot counts as occupied.
    pub occupancy_threshold: f64,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        Self {
            occupancy_threshold: OCCUPANCY_THRESHOLD,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpotVerdict {
    /// Index of the spot in the configured list.
    pub index: usize,
    pub region: Region,
    pub foreground: u64,
    pub occupancy: Occupancy,
}

#[derive(Clone, Debug)]
pub struct Classification {
    pub verdicts: Vec<SpotVerdict>,
    /// Indices of spots that were out of frame bounds.
    pub skipped: Vec<usize>,
    pub annotated: RgbImage,
}

impl Classification {
    pub fn available(&self) -> u32 {
        self.verdicts
            .iter()
            .filter(|v| v.occupancy.is_free())
            .count() as u32
    }

    pub fn occupied(&self) -> u32 {
        self.verdicts.len() as u32 - self.available()
    }

    pub fn snapshot(&self, captured_at: SystemTime) -> OccupancySnapshot {
        OccupancySnapshot::from_verdicts(captured_at, self.verdicts.iter().map(|v| &v.occupancy))
    }
}

pub fn classify(frame: &RgbImage, regions: &[Region], params: &ClassifierParams) -> Classification {
    let mask = mask::foreground_mask(frame);
    let (verdicts, skipped) = evaluate(&mask, regions, params);
    let annotated = render(frame, &verdicts);
    Classification {
        verdicts,
        skipped,
        annotated,
    }
}

/// Apply the occupancy rule to an already computed foreground mask.
pub fn evaluate(
    mask: &GrayImage,
    regions: &[Region],
    params: &ClassifierParams,
) -> (Vec<SpotVerdict>, Vec<usize>) {
    let mut verdicts = Vec::with_capacity(regions.len());
    let mut skipped = Vec::new();
    for (index, region) in regions.iter().enumerate() {
        if !region.fits_within(mask.width(), mask.height()) {
            skipped.push(index);
            continue;
        }
        let foreground = mask::count_foreground(mask, region);
        verdicts.push(SpotVerdict {
            index,
            region: *region,
            foreground,
            occupancy: Occupancy::from_foreground(foreground, region, params.occupancy_threshold),
        });
    }
    (verdicts, skipped)
}

fn render(frame: &RgbImage, verdicts: &[SpotVerdict]) -> RgbImage {
    let mut annotated = frame.clone();
    let mut free = 0usize;
    for verdict in verdicts {
        let (color, thickness) = match verdict.occupancy {
            Occupancy::Free => {
                free += 1;
                (FREE_COLOR, 3)
            }
            Occupancy::Occupied => (OCCUPIED_COLOR, 2),
        };
        draw_region(&mut annotated, &verdict.region, thickness, color);
        let label_y = verdict.region.bottom() as i32 - 5 - text_height(1);
        draw_text(
            &mut annotated,
            verdict.region.x as i32 + 5,
            label_y,
            &verdict.foreground.to_string(),
            1,
            LABEL_COLOR,
        );
    }

    let status = format!("Free: {}/{}", free, verdicts.len());
    let (x, y, scale) = (20, 16, 2);
    fill_rect(
        &mut annotated,
        x - 4,
        y - 4,
        x + text_width(&status, scale) + 2,
        y + text_height(scale) + 3,
        Rgb([0, 0, 0]),
    );
    draw_text(&mut annotated, x, y, &status, scale, STATUS_COLOR);
    annotated
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use image::Luma;

    const BG: Rgb<u8> = Rgb([128, 128, 128]);

    /// Paint an 8px checkerboard, the texture a parked car leaves in the mask.
    fn park_car(image: &mut RgbImage, region: &Region) {
        for y in region.y..region.bottom() {
            for x in region.x..region.right() {
                let dark = ((x - region.x) / 8 + (y - region.y) / 8) % 2 == 0;
                let value = if dark { 0 } else { 255 };
                image.put_pixel(x, y, Rgb([value, value, value]));
            }
        }
    }

    fn lot() -> Result<Vec<Region>> {
        Ok(vec![
            Region::new(40, 80, 90, 30)?,
            Region::new(160, 80, 90, 30)?,
            Region::new(280, 80, 90, 30)?,
        ])
    }

    #[test]
    fn empty_lot_is_all_free() -> Result<()> {
        let frame = RgbImage::from_pixel(400, 200, BG);
        let result = classify(&frame, &lot()?, &ClassifierParams::default());
        assert_eq!(result.verdicts.len(), 3);
        assert!(result.verdicts.iter().all(|v| v.occupancy == Occupancy::Free));
        assert_eq!(result.available(), 3);
        assert_eq!(result.occupied(), 0);
        Ok(())
    }

    #[test]
    fn textured_spot_is_occupied() -> Result<()> {
        let regions = lot()?;
        let mut frame = RgbImage::from_pixel(400, 200, BG);
        park_car(&mut frame, &regions[1]);
        let result = classify(&frame, &regions, &ClassifierParams::default());
        let occupancy: Vec<_> = result.verdicts.iter().map(|v| v.occupancy).collect();
        assert_eq!(
            occupancy,
            vec![Occupancy::Free, Occupancy::Occupied, Occupancy::Free]
        );
        assert!(result.verdicts[1].foreground > 540);

        let snap = result.snapshot(SystemTime::UNIX_EPOCH);
        assert_eq!(snap.total(), 3);
        assert_eq!(snap.available, 2);
        assert_eq!(snap.occupied, 1);
        Ok(())
    }

    #[test]
    fn classification_is_deterministic() -> Result<()> {
        let regions = lot()?;
        let mut frame = RgbImage::from_pixel(400, 200, BG);
        park_car(&mut frame, &regions[0]);
        park_car(&mut frame, &regions[2]);
        let params = ClassifierParams::default();
        let first = classify(&frame, &regions, &params);
        let second = classify(&frame, &regions, &params);
        assert_eq!(first.verdicts, second.verdicts);
        assert_eq!(first.skipped, second.skipped);
        assert_eq!(first.annotated, second.annotated);
        Ok(())
    }

    #[test]
    fn out_of_bounds_spots_are_skipped() -> Result<()> {
        let frame = RgbImage::from_pixel(200, 100, BG);
        let regions = vec![
            Region::new(10, 10, 90, 30)?,
            Region::new(150, 10, 90, 30)?,
            Region::new(500, 500, 10, 10)?,
        ];
        let result = classify(&frame, &regions, &ClassifierParams::default());
        assert_eq!(result.verdicts.len(), 1);
        assert_eq!(result.verdicts[0].index, 0);
        assert_eq!(result.skipped, vec![1, 2]);
        // Skipped spots are not drawn.
        assert_eq!(*result.annotated.get_pixel(150, 20), BG);
        Ok(())
    }

    #[test]
    fn overflowing_spot_is_skipped() {
        let frame = RgbImage::from_pixel(200, 100, BG);
        let regions = vec![Region {
            x: u32::MAX,
            y: 10,
            width: 10,
            height: 10,
        }];
        let result = classify(&frame, &regions, &ClassifierParams::default());
        assert!(result.verdicts.is_empty());
        assert_eq!(result.skipped, vec![0]);
    }

    #[test]
    fn rule_applies_to_mask_counts() -> Result<()> {
        let region = Region::new(0, 0, 90, 30)?;
        let params = ClassifierParams::default();

        let mut sparse = GrayImage::new(90, 30);
        for i in 0..100u32 {
            sparse.put_pixel(i % 90, i / 90, Luma([mask::FOREGROUND]));
        }
        let (verdicts, _) = evaluate(&sparse, &[region], &params);
        assert_eq!(verdicts[0].foreground, 100);
        assert_eq!(verdicts[0].occupancy, Occupancy::Free);

        let mut dense = GrayImage::new(90, 30);
        for i in 0..1200u32 {
            dense.put_pixel(i % 90, i / 90, Luma([mask::FOREGROUND]));
        }
        let (verdicts, _) = evaluate(&dense, &[region], &params);
        assert_eq!(verdicts[0].foreground, 1200);
        assert_eq!(verdicts[0].occupancy, Occupancy::Occupied);
        Ok(())
    }

    #[test]
    fn annotation_marks_verdict_colors() -> Result<()> {
        let regions = lot()?;
        let mut frame = RgbImage::from_pixel(400, 200, BG);
        park_car(&mut frame, &regions[1]);
        let result = classify(&frame, &regions, &ClassifierParams::default());
        assert_eq!(*result.annotated.get_pixel(40, 95), FREE_COLOR);
        assert_eq!(*result.annotated.get_pixel(160, 95), OCCUPIED_COLOR);
        // Input frame is untouched.
        assert_eq!(*frame.get_pixel(40, 95), BG);
        Ok(())
    }

    #[test]
    fn empty_region_list_still_annotates_status() {
        let frame = RgbImage::from_pixel(200, 100, BG);
        let result = classify(&frame, &[], &ClassifierParams::default());
        assert!(result.verdicts.is_empty());
        assert_ne!(result.annotated, frame);
    }
}
