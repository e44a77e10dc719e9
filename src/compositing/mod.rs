//! compositing — background blur + per-pixel alpha blend
//!
//! The bokeh look is produced cheaply: downscale the frame hard, box-blur at
//! the small size (sliding-window sums, cost independent of radius), then
//! upscale back. At 12% linear scale a radius-25 blur covers most of the
//! reduced image, which is exactly the heavy, detail-free background wanted.
//!
//! All scratch buffers live in the compositor and are reallocated only when
//! the frame dimensions change; the steady-state per-frame cost is zero heap
//! allocations.

use image::RgbImage;
use thiserror::Error;
use tracing::debug_span;

use crate::masking::AlphaMask;

// ── Tuning constants ─────────────────────────────────────────────────────────

/// Linear downscale factor for the background blur pass.
const DOWNSCALE: f32 = 0.12;
/// Box blur radius at the downscaled resolution.
const BLUR_RADIUS: usize = 25;

#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("mask is {mask_w}x{mask_h} but frame is {frame_w}x{frame_h}")]
    DimensionMismatch {
        mask_w: u32,
        mask_h: u32,
        frame_w: u32,
        frame_h: u32,
    },
    #[error("frame is empty")]
    EmptyFrame,
    #[error("scratch buffer allocation failed")]
    Allocation,
}

/// Blurs the background and composites it against the sharp frame.
///
/// One instance per pipeline; the scratch buffers are private and the
/// returned reference points at the internal result image, valid until the
/// next call.
pub struct BlurCompositor {
    width: u32,
    height: u32,
    small: Vec<u8>,
    small_scratch: Vec<u8>,
    blurred: Vec<u8>,
    result: RgbImage,
}

impl BlurCompositor {
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            small: Vec::new(),
            small_scratch: Vec::new(),
            blurred: Vec::new(),
            result: RgbImage::new(0, 0),
        }
    }

    /// Blend sharp and blurred pixels according to `mask`.
    ///
    /// Rejections (dimension mismatch, empty frame) leave the previous
    /// result intact; the caller keeps displaying its last good frame
    /// instead of flashing black. Whether an all-zero mask is worth
    /// compositing is the caller's call — here it just produces a fully
    /// blurred frame.
    pub fn composite(
        &mut self,
        sharp: &RgbImage,
        mask: &AlphaMask,
    ) -> Result<&RgbImage, CompositeError> {
        let _span = debug_span!("composite").entered();

        let (width, height) = sharp.dimensions();
        if width == 0 || height == 0 {
            return Err(CompositeError::EmptyFrame);
        }
        if mask.width() != width || mask.height() != height {
            return Err(CompositeError::DimensionMismatch {
                mask_w: mask.width(),
                mask_h: mask.height(),
                frame_w: width,
                frame_h: height,
            });
        }
        self.ensure_buffers(width, height)?;
        self.render_background(sharp);

        // Per-pixel fixed-point blend; alpha 255 and 0 pass pixels through
        // exactly.
        let _blend = debug_span!("blend").entered();
        let sharp_px = sharp.as_raw();
        let out_px: &mut [u8] = &mut self.result;
        let mask_px = mask.data();
        for i in 0..(width as usize * height as usize) {
            let a = mask_px[i] as u16;
            let base = i * 3;
            match a {
                255 => out_px[base..base + 3].copy_from_slice(&sharp_px[base..base + 3]),
                0 => out_px[base..base + 3].copy_from_slice(&self.blurred[base..base + 3]),
                _ => {
                    let inv = 255 - a;
                    for c in 0..3 {
                        let s = sharp_px[base + c] as u16;
                        let b = self.blurred[base + c] as u16;
                        out_px[base + c] = ((a * s + inv * b + 127) / 255) as u8;
                    }
                }
            }
        }

        Ok(&self.result)
    }

    /// Resize scratch buffers iff the frame dimensions changed.
    ///
    /// The stored dimensions are only updated once every buffer is in
    /// place, so a failed resize forces a fresh attempt on the next call.
    fn ensure_buffers(&mut self, width: u32, height: u32) -> Result<(), CompositeError> {
        if self.width == width && self.height == height {
            return Ok(());
        }
        let (sw, sh) = small_dims(width, height);
        let small_len = sw * sh * 3;
        let full_len = width as usize * height as usize * 3;
        grow(&mut self.small, small_len)?;
        grow(&mut self.small_scratch, small_len)?;
        grow(&mut self.blurred, full_len)?;
        self.result = RgbImage::new(width, height);
        self.width = width;
        self.height = height;
        Ok(())
    }

    /// Downscale, box blur at the small size, upscale into `self.blurred`.
    fn render_background(&mut self, sharp: &RgbImage) {
        let _span = debug_span!("background_blur").entered();

        let width = self.width as usize;
        let height = self.height as usize;
        let (sw, sh) = small_dims(self.width, self.height);
        let src = sharp.as_raw();

        // Point-sample downscale; no interpolation, the blur erases any
        // sampling artifacts anyway.
        for sy in 0..sh {
            let y = sy * height / sh;
            for sx in 0..sw {
                let x = sx * width / sw;
                let s = (y * width + x) * 3;
                let d = (sy * sw + sx) * 3;
                self.small[d..d + 3].copy_from_slice(&src[s..s + 3]);
            }
        }

        box_blur_rows(&self.small, &mut self.small_scratch, sw, sh, BLUR_RADIUS);
        box_blur_cols(&self.small_scratch, &mut self.small, sw, sh, BLUR_RADIUS);

        // Nearest upscale back to full resolution.
        for y in 0..height {
            let sy = y * sh / height;
            let small_row = sy * sw;
            let out_row = y * width;
            for x in 0..width {
                let sx = x * sw / width;
                let s = (small_row + sx) * 3;
                let d = (out_row + x) * 3;
                self.blurred[d..d + 3].copy_from_slice(&self.small[s..s + 3]);
            }
        }
    }
}

impl Default for BlurCompositor {
    fn default() -> Self {
        Self::new()
    }
}

fn grow(buf: &mut Vec<u8>, len: usize) -> Result<(), CompositeError> {
    buf.clear();
    buf.try_reserve_exact(len)
        .map_err(|_| CompositeError::Allocation)?;
    buf.resize(len, 0);
    Ok(())
}

fn small_dims(width: u32, height: u32) -> (usize, usize) {
    let sw = ((width as f32 * DOWNSCALE) as usize).max(1);
    let sh = ((height as f32 * DOWNSCALE) as usize).max(1);
    (sw, sh)
}

/// Horizontal sliding-window box blur. Per row, per channel: keep a running
/// sum over a window of up to `2r+1` pixels, add the pixel entering and
/// subtract the one leaving. The window clamps at row ends (no wraparound,
/// no zero padding), so constant rows stay constant.
fn box_blur_rows(src: &[u8], dst: &mut [u8], width: usize, height: usize, radius: usize) {
    let r = radius.min(width.saturating_sub(1));
    for y in 0..height {
        let row = y * width * 3;
        let mut sums = [0u32; 3];
        // Prime the window for x = 0: pixels [0, r].
        for x in 0..=r {
            for c in 0..3 {
                sums[c] += src[row + x * 3 + c] as u32;
            }
        }
        for x in 0..width {
            let lo = x.saturating_sub(r);
            let hi = (x + r).min(width - 1);
            let count = (hi - lo + 1) as u32;
            for c in 0..3 {
                dst[row + x * 3 + c] = (sums[c] / count) as u8;
            }
            // Slide: next window is [lo', hi'] for x+1.
            if x + 1 < width {
                let enter = x + 1 + r;
                if enter < width {
                    for c in 0..3 {
                        sums[c] += src[row + enter * 3 + c] as u32;
                    }
                }
                if x + 1 > r {
                    let leave = x - r;
                    for c in 0..3 {
                        sums[c] -= src[row + leave * 3 + c] as u32;
                    }
                }
            }
        }
    }
}

/// Vertical pass of the sliding-window box blur, same window discipline.
fn box_blur_cols(src: &[u8], dst: &mut [u8], width: usize, height: usize, radius: usize) {
    let r = radius.min(height.saturating_sub(1));
    for x in 0..width {
        let mut sums = [0u32; 3];
        for y in 0..=r {
            let p = (y * width + x) * 3;
            for c in 0..3 {
                sums[c] += src[p + c] as u32;
            }
        }
        for y in 0..height {
            let lo = y.saturating_sub(r);
            let hi = (y + r).min(height - 1);
            let count = (hi - lo + 1) as u32;
            let p = (y * width + x) * 3;
            for c in 0..3 {
                dst[p + c] = (sums[c] / count) as u8;
            }
            if y + 1 < height {
                let enter = y + 1 + r;
                if enter < height {
                    let q = (enter * width + x) * 3;
                    for c in 0..3 {
                        sums[c] += src[q + c] as u32;
                    }
                }
                if y + 1 > r {
                    let q = ((y - r) * width + x) * 3;
                    for c in 0..3 {
                        sums[c] -= src[q + c] as u32;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use crate::masking::{MaskGenerator, ProbabilityField};
    use image::Rgb;
    use ndarray::Array2;

    fn gradient_frame(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                (x * 255 / width.max(1)) as u8,
                (y * 255 / height.max(1)) as u8,
                ((x + y) % 256) as u8,
            ])
        })
    }

    /// Build a real mask through the generator so `is_blank` is honest.
    fn solid_mask(width: u32, height: u32, foreground: bool) -> crate::masking::AlphaMask {
        if !foreground {
            return crate::masking::AlphaMask::blank(width, height);
        }
        let mut gen = MaskGenerator::new();
        let field: ProbabilityField = Array2::from_elem((height as usize, width as usize), 1.0);
        // Subject box covering everything makes the mask solid 255 in the
        // interior (feathering only softens the outer edge).
        gen.generate(
            &field,
            Rect::new(-20.0, -20.0, width as f32 + 20.0, height as f32 + 20.0),
            &[],
        )
    }

    #[test]
    fn all_foreground_mask_reproduces_sharp_interior() {
        let frame = gradient_frame(64, 48);
        let mask = solid_mask(64, 48, true);
        let mut comp = BlurCompositor::new();
        let out = comp.composite(&frame, &mask).unwrap();

        // Interior pixels carry alpha 255 and must be bit-exact.
        for y in 12..36 {
            for x in 16..48 {
                assert_eq!(mask.value_at(x, y), 255);
                assert_eq!(out.get_pixel(x, y), frame.get_pixel(x, y));
            }
        }
    }

    #[test]
    fn all_zero_mask_reproduces_blurred_frame_exactly() {
        let frame = gradient_frame(64, 48);
        let mask = solid_mask(64, 48, false);
        let mut comp = BlurCompositor::new();
        let out = comp.composite(&frame, &mask).unwrap().clone();
        assert_eq!(out.as_raw().as_slice(), comp.blurred.as_slice());
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let frame = gradient_frame(64, 48);
        let mask = solid_mask(32, 48, true);
        let mut comp = BlurCompositor::new();
        assert!(matches!(
            comp.composite(&frame, &mask),
            Err(CompositeError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn constant_color_survives_blur_within_rounding() {
        let frame = RgbImage::from_pixel(80, 60, Rgb([123, 45, 200]));
        let mut comp = BlurCompositor::new();
        comp.ensure_buffers(80, 60).unwrap();
        comp.render_background(&frame);
        for px in comp.blurred.chunks_exact(3) {
            assert!((px[0] as i16 - 123).abs() <= 1);
            assert!((px[1] as i16 - 45).abs() <= 1);
            assert!((px[2] as i16 - 200).abs() <= 1);
        }
    }

    #[test]
    fn background_pixels_come_from_blurred_frame() {
        // Frame with a hard left/right split; a subject mask on the left
        // leaves the right half fully blurred, so the split edge smears.
        let frame = RgbImage::from_fn(100, 60, |x, _| {
            if x < 50 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });

        let mut gen = MaskGenerator::new();
        let field: ProbabilityField = Array2::from_shape_fn((60, 100), |(_, x)| {
            if x < 40 {
                1.0
            } else {
                0.0
            }
        });
        let mask = gen.generate(&field, Rect::new(0.0, 0.0, 40.0, 60.0), &[]);

        let mut comp = BlurCompositor::new();
        let out = comp.composite(&frame, &mask).unwrap();

        // Deep in the masked-out right half the output equals the blurred
        // background; radius 25 at 12% scale spans the whole row, so every
        // background pixel is a white/black mix.
        let split_px = out.get_pixel(70, 30);
        assert_eq!(mask.value_at(70, 30), 0);
        assert!(split_px[0] > 20 && split_px[0] < 235, "expected smear, got {split_px:?}");
    }

    #[test]
    fn buffers_track_dimension_changes() {
        let mut comp = BlurCompositor::new();
        let a = gradient_frame(64, 48);
        let mask_a = solid_mask(64, 48, true);
        comp.composite(&a, &mask_a).unwrap();
        assert_eq!(comp.result.dimensions(), (64, 48));

        let b = gradient_frame(32, 24);
        let mask_b = solid_mask(32, 24, true);
        comp.composite(&b, &mask_b).unwrap();
        assert_eq!(comp.result.dimensions(), (32, 24));
    }
}
