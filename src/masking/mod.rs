//! masking — subject-exclusive alpha mask from a generic foreground field
//!
//! The probability field says "this pixel looks like foreground" without
//! knowing which subject the user picked. This module gates the field to the
//! tracked box, hard-excludes every other detected subject, and runs the
//! result through dilation, temporal EMA, and edge feathering so the final
//! silhouette is stable frame-to-frame and soft at the edges.
//!
//! Pipeline order matters: exclusion runs both before dilation (so excluded
//! regions don't regrow) and again after feathering (so blur bleed can't
//! leak back in).

use ndarray::Array2;
use tracing::{debug, debug_span};

use crate::geometry::Rect;

/// Dense per-pixel foreground likelihood for the current frame, `[0, 1]`,
/// shape `(height, width)`. Not subject-specific.
pub type ProbabilityField = Array2<f32>;

// ── Tuning constants ─────────────────────────────────────────────────────────

/// Subject box growth per axis before gating, compensates for field
/// imprecision at silhouette edges.
const BOX_EXPAND_FRAC: f32 = 0.15;
/// Binarization threshold for gated probabilities.
const FOREGROUND_THRESHOLD: f32 = 0.25;
/// Minimum foreground fraction inside the un-expanded subject box; below
/// this the field is considered invalid for the subject.
const MIN_COVERAGE: f32 = 0.02;
/// 3x3 max-filter passes.
const DILATE_ITERATIONS: usize = 2;
/// EMA weight of the current frame's mask.
const TEMPORAL_CURRENT_WEIGHT: f32 = 0.70;
/// Gaussian feather radius (sigma = radius / 3).
const FEATHER_RADIUS: usize = 6;

/// Per-pixel alpha, 255 = keep sharp, 0 = blur.
#[derive(Debug, Clone)]
pub struct AlphaMask {
    data: Vec<u8>,
    width: u32,
    height: u32,
    blank: bool,
}

impl AlphaMask {
    /// All-zero mask, the "no subject visible this frame" sentinel.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            data: vec![0; (width as usize) * (height as usize)],
            width,
            height,
            blank: true,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// True when no pixel is foreground; callers must treat a blank mask as
    /// "freeze on the last good output", never composite it.
    pub fn is_blank(&self) -> bool {
        self.blank
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn value_at(&self, x: u32, y: u32) -> u8 {
        self.data[(y as usize) * (self.width as usize) + x as usize]
    }
}

/// Converts a foreground-probability field plus tracker geometry into a
/// single-subject alpha mask.
///
/// Holds the previous frame's mask for temporal smoothing, keyed only by
/// dimensions — call [`MaskGenerator::reset_temporal_state`] whenever the
/// tracked subject changes, or the old subject's history contaminates the
/// new one.
pub struct MaskGenerator {
    prev: Vec<f32>,
    prev_width: usize,
    prev_height: usize,
    work: Vec<f32>,
    scratch: Vec<f32>,
    kernel: [f32; 2 * FEATHER_RADIUS + 1],
}

impl MaskGenerator {
    pub fn new() -> Self {
        Self {
            prev: Vec::new(),
            prev_width: 0,
            prev_height: 0,
            work: Vec::new(),
            scratch: Vec::new(),
            kernel: gaussian_kernel(),
        }
    }

    /// Drop the stored previous mask. Must be called when the subject
    /// changes; the temporal EMA knows nothing about subject identity.
    pub fn reset_temporal_state(&mut self) {
        debug!("resetting mask temporal state");
        self.prev.clear();
        self.prev_width = 0;
        self.prev_height = 0;
    }

    /// Produce the alpha mask for one frame.
    ///
    /// Returns a blank mask when the field is degenerate, the subject box is
    /// empty, or foreground coverage inside the subject box is implausibly
    /// low. A blank result leaves temporal state untouched so one bad field
    /// doesn't erase good history.
    pub fn generate(
        &mut self,
        field: &ProbabilityField,
        subject: Rect,
        exclude: &[Rect],
    ) -> AlphaMask {
        let _span = debug_span!("generate_mask").entered();

        let (height, width) = field.dim();
        if width == 0 || height == 0 || subject.is_empty() {
            return AlphaMask::blank(width as u32, height as u32);
        }
        let Some(values) = field.as_slice() else {
            // Non-contiguous fields don't occur in practice; treat as invalid.
            self.reset_temporal_state();
            return AlphaMask::blank(width as u32, height as u32);
        };

        let len = width * height;
        if self.work.len() != len {
            self.work.resize(len, 0.0);
            self.scratch.resize(len, 0.0);
        }

        // 1+2. Gate to the expanded subject box and binarize.
        let expanded = subject
            .expand(BOX_EXPAND_FRAC)
            .clamp_to(width as u32, height as u32);
        let gate = PixelRect::from_rect(&expanded, width, height);
        self.work.fill(0.0);
        for y in gate.y0..gate.y1 {
            let row = y * width;
            for x in gate.x0..gate.x1 {
                self.work[row + x] = if values[row + x] >= FOREGROUND_THRESHOLD {
                    1.0
                } else {
                    0.0
                };
            }
        }

        // 3. Coverage sanity check inside the un-expanded box.
        let inner = PixelRect::from_rect(
            &subject.clamp_to(width as u32, height as u32),
            width,
            height,
        );
        let inner_area = inner.area();
        if inner_area == 0 {
            return AlphaMask::blank(width as u32, height as u32);
        }
        let mut covered = 0usize;
        for y in inner.y0..inner.y1 {
            let row = y * width;
            for x in inner.x0..inner.x1 {
                if self.work[row + x] > 0.0 {
                    covered += 1;
                }
            }
        }
        let coverage = covered as f32 / inner_area as f32;
        if coverage < MIN_COVERAGE {
            debug!(coverage, "foreground coverage too low, mask invalid");
            return AlphaMask::blank(width as u32, height as u32);
        }

        // 4. Exclusion pass 1, before dilation so excluded regions don't regrow.
        zero_rects(&mut self.work, width, height, exclude);

        // 5. Dilate to close segmentation gaps.
        {
            let _span = debug_span!("dilate").entered();
            for _ in 0..DILATE_ITERATIONS {
                dilate3x3(&self.work, &mut self.scratch, width, height);
                std::mem::swap(&mut self.work, &mut self.scratch);
            }
        }

        // 6. Temporal EMA against the stored previous mask.
        if self.prev_width == width && self.prev_height == height {
            let p = 1.0 - TEMPORAL_CURRENT_WEIGHT;
            for (cur, &old) in self.work.iter_mut().zip(self.prev.iter()) {
                *cur = TEMPORAL_CURRENT_WEIGHT * *cur + p * old;
            }
        }
        // The blend (pre-feather) becomes the new history, so feathering
        // never compounds across frames.
        self.prev.clear();
        self.prev.extend_from_slice(&self.work);
        self.prev_width = width;
        self.prev_height = height;

        // 7. Feather the silhouette edge.
        {
            let _span = debug_span!("feather").entered();
            blur_separable(
                &mut self.work,
                &mut self.scratch,
                width,
                height,
                &self.kernel,
            );
        }

        // 8. Exclusion pass 2: dilation/feathering bleed back in, re-zero.
        zero_rects(&mut self.work, width, height, exclude);

        // 9. Scale to u8.
        let mut data = vec![0u8; len];
        let mut blank = true;
        for (dst, &v) in data.iter_mut().zip(self.work.iter()) {
            let byte = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
            if byte != 0 {
                blank = false;
            }
            *dst = byte;
        }

        AlphaMask {
            data,
            width: width as u32,
            height: height as u32,
            blank,
        }
    }
}

impl Default for MaskGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Integer pixel bounds of a float rect, clamped to the image.
struct PixelRect {
    x0: usize,
    x1: usize,
    y0: usize,
    y1: usize,
}

impl PixelRect {
    fn from_rect(rect: &Rect, width: usize, height: usize) -> Self {
        let x0 = rect.left.floor().max(0.0) as usize;
        let y0 = rect.top.floor().max(0.0) as usize;
        let x1 = (rect.right.ceil().max(0.0) as usize).min(width);
        let y1 = (rect.bottom.ceil().max(0.0) as usize).min(height);
        Self {
            x0: x0.min(x1),
            x1,
            y0: y0.min(y1),
            y1,
        }
    }

    fn area(&self) -> usize {
        (self.x1 - self.x0) * (self.y1 - self.y0)
    }
}

fn zero_rects(mask: &mut [f32], width: usize, height: usize, rects: &[Rect]) {
    for rect in rects {
        let px = PixelRect::from_rect(rect, width, height);
        for y in px.y0..px.y1 {
            let row = y * width;
            mask[row + px.x0..row + px.x1].fill(0.0);
        }
    }
}

/// One pass of a 3x3 max filter, edge pixels clamp to the image.
fn dilate3x3(src: &[f32], dst: &mut [f32], width: usize, height: usize) {
    for y in 0..height {
        let y0 = y.saturating_sub(1);
        let y1 = (y + 1).min(height - 1);
        for x in 0..width {
            let x0 = x.saturating_sub(1);
            let x1 = (x + 1).min(width - 1);
            let mut m = 0.0f32;
            for yy in y0..=y1 {
                let row = yy * width;
                for xx in x0..=x1 {
                    m = m.max(src[row + xx]);
                }
            }
            dst[y * width + x] = m;
        }
    }
}

/// Separable Gaussian blur; `scratch` holds the row-pass intermediate.
/// Window clamps at image edges with kernel renormalization, so a constant
/// mask stays constant.
fn blur_separable(
    mask: &mut [f32],
    scratch: &mut [f32],
    width: usize,
    height: usize,
    kernel: &[f32],
) {
    let radius = kernel.len() / 2;

    // Rows.
    for y in 0..height {
        let row = y * width;
        for x in 0..width {
            let mut acc = 0.0f32;
            let mut norm = 0.0f32;
            let lo = x.saturating_sub(radius);
            let hi = (x + radius).min(width - 1);
            for xx in lo..=hi {
                let w = kernel[xx + radius - x];
                acc += w * mask[row + xx];
                norm += w;
            }
            scratch[row + x] = acc / norm;
        }
    }

    // Columns.
    for y in 0..height {
        let lo = y.saturating_sub(radius);
        let hi = (y + radius).min(height - 1);
        for x in 0..width {
            let mut acc = 0.0f32;
            let mut norm = 0.0f32;
            for yy in lo..=hi {
                let w = kernel[yy + radius - y];
                acc += w * scratch[yy * width + x];
                norm += w;
            }
            mask[y * width + x] = acc / norm;
        }
    }
}

fn gaussian_kernel() -> [f32; 2 * FEATHER_RADIUS + 1] {
    let sigma = FEATHER_RADIUS as f32 / 3.0;
    let mut kernel = [0.0f32; 2 * FEATHER_RADIUS + 1];
    let mut sum = 0.0f32;
    for (i, w) in kernel.iter_mut().enumerate() {
        let d = i as f32 - FEATHER_RADIUS as f32;
        *w = (-d * d / (2.0 * sigma * sigma)).exp();
        sum += *w;
    }
    for w in kernel.iter_mut() {
        *w /= sum;
    }
    kernel
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn field_with_blob(
        width: usize,
        height: usize,
        blob: (usize, usize, usize, usize),
    ) -> ProbabilityField {
        let (x0, y0, x1, y1) = blob;
        Array2::from_shape_fn((height, width), |(y, x)| {
            if x >= x0 && x < x1 && y >= y0 && y < y1 {
                0.95
            } else {
                0.0
            }
        })
    }

    #[test]
    fn subject_blob_survives_excluded_blob_does_not() {
        let mut gen = MaskGenerator::new();
        let mut field = field_with_blob(160, 90, (20, 20, 60, 60));
        // Second person on the right.
        for y in 20..60 {
            for x in 100..140 {
                field[(y, x)] = 0.95;
            }
        }

        let subject = Rect::new(20.0, 20.0, 60.0, 60.0);
        let other = Rect::new(100.0, 20.0, 140.0, 60.0);
        let mask = gen.generate(&field, subject, &[other]);

        assert!(!mask.is_blank());
        assert!(mask.value_at(40, 40) > 200);
        // Exclusion is exact zero everywhere inside the other box.
        for y in 20..60 {
            for x in 100..140 {
                assert_eq!(mask.value_at(x, y), 0, "leak at ({x},{y})");
            }
        }
    }

    #[test]
    fn exclusion_holds_across_repeated_frames() {
        let mut gen = MaskGenerator::new();
        let field = field_with_blob(160, 90, (20, 20, 140, 60));
        let subject = Rect::new(20.0, 20.0, 140.0, 60.0);
        let other = Rect::new(100.0, 20.0, 140.0, 60.0);

        // Temporal EMA must not leak excluded history back in.
        for _ in 0..5 {
            let mask = gen.generate(&field, subject, &[other]);
            for y in 20..60 {
                for x in 100..140 {
                    assert_eq!(mask.value_at(x, y), 0);
                }
            }
        }
    }

    #[test]
    fn low_coverage_yields_blank_mask() {
        let mut gen = MaskGenerator::new();
        // One foreground pixel in a 40x40 box is 0.06% coverage.
        let field = field_with_blob(160, 90, (30, 30, 31, 31));
        let mask = gen.generate(&field, Rect::new(20.0, 20.0, 60.0, 60.0), &[]);
        assert!(mask.is_blank());
    }

    #[test]
    fn pixels_outside_expanded_box_are_gated_out() {
        let mut gen = MaskGenerator::new();
        // Foreground everywhere, subject in the middle.
        let field = Array2::from_elem((90, 160), 1.0);
        let mask = gen.generate(&field, Rect::new(60.0, 30.0, 100.0, 60.0), &[]);
        assert!(!mask.is_blank());
        // Far corner is outside expansion + dilation + feather reach.
        assert_eq!(mask.value_at(5, 5), 0);
        assert_eq!(mask.value_at(155, 85), 0);
    }

    #[test]
    fn empty_subject_box_yields_blank_mask() {
        let mut gen = MaskGenerator::new();
        let field = Array2::from_elem((90, 160), 1.0);
        let mask = gen.generate(&field, Rect::default(), &[]);
        assert!(mask.is_blank());
    }

    #[test]
    fn temporal_smoothing_carries_history() {
        let mut gen = MaskGenerator::new();
        let subject = Rect::new(20.0, 20.0, 60.0, 60.0);

        let on = field_with_blob(160, 90, (20, 20, 60, 60));
        gen.generate(&on, subject, &[]);

        // Next frame the blob shrinks; history keeps the lost region nonzero.
        let shrunk = field_with_blob(160, 90, (20, 20, 60, 40));
        let mask = gen.generate(&shrunk, subject, &[]);
        assert!(mask.value_at(40, 52) > 0);

        // After a reset, the same shrunk field leaves that region dark.
        gen.reset_temporal_state();
        let mask = gen.generate(&shrunk, subject, &[]);
        assert!(mask.value_at(40, 55) < 40);
    }

    #[test]
    fn blank_abort_preserves_history() {
        let mut gen = MaskGenerator::new();
        let subject = Rect::new(20.0, 20.0, 60.0, 60.0);
        let good = field_with_blob(160, 90, (20, 20, 60, 60));
        gen.generate(&good, subject, &[]);

        let bad = Array2::from_elem((90, 160), 0.0);
        assert!(gen.generate(&bad, subject, &[]).is_blank());

        // History still blends into the next good frame.
        let mask = gen.generate(&good, subject, &[]);
        assert!(!mask.is_blank());
    }
}
