//! Axis-aligned rectangle math used by the tracker and mask generator.

/// Axis-aligned rectangle in image pixel coordinates.
///
/// A rect with `left >= right` or `top >= bottom` is empty and acts as the
/// "no detection" sentinel throughout the crate.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Rect {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        if self.is_empty() {
            0.0
        } else {
            self.width() * self.height()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.left + self.right) / 2.0,
            (self.top + self.bottom) / 2.0,
        )
    }

    /// Grow the rect by `frac` of its own width/height on each axis.
    pub fn expand(&self, frac: f32) -> Rect {
        let dx = self.width() * frac;
        let dy = self.height() * frac;
        Rect::new(self.left - dx, self.top - dy, self.right + dx, self.bottom + dy)
    }

    /// Clamp the rect to `[0, width] x [0, height]`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Rect {
        let w = width as f32;
        let h = height as f32;
        Rect::new(
            self.left.clamp(0.0, w),
            self.top.clamp(0.0, h),
            self.right.clamp(0.0, w),
            self.bottom.clamp(0.0, h),
        )
    }
}

/// Intersection-over-union of two rects, in `[0, 1]`.
///
/// Degenerate input (either rect empty) gives 0.
pub fn iou(a: &Rect, b: &Rect) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let ix = (a.right.min(b.right) - a.left.max(b.left)).max(0.0);
    let iy = (a.bottom.min(b.bottom) - a.top.max(b.top)).max(0.0);
    let intersection = ix * iy;
    if intersection <= 0.0 {
        return 0.0;
    }

    let union = a.area() + b.area() - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Euclidean distance between rect centers.
pub fn center_distance(a: &Rect, b: &Rect) -> f32 {
    let (ax, ay) = a.center();
    let (bx, by) = b.center();
    ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
}

/// Per-edge linear interpolation from `a` toward `b` by factor `t`.
///
/// Interpolating all four edges (rather than translating a fixed-size box)
/// lets the result resize as the subject's apparent size changes.
pub fn lerp(a: &Rect, b: &Rect, t: f32) -> Rect {
    Rect::new(
        a.left + (b.left - a.left) * t,
        a.top + (b.top - a.top) * t,
        a.right + (b.right - a.right) * t,
        a.bottom + (b.bottom - a.bottom) * t,
    )
}
