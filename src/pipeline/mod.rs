//! pipeline — per-frame orchestration of tracker, mask, and compositor
//!
//! External capabilities (object detector, foreground-probability provider)
//! sit behind traits so backends can be swapped; the pipeline itself never
//! fails a frame. Collaborator errors, invalid masks, and missing fields all
//! collapse to [`FrameVerdict::KeepLast`], which tells the presentation side
//! to keep showing whatever it showed last rather than flash a broken frame.

use std::time::{Duration, Instant};

use anyhow::Result;
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compositing::{BlurCompositor, CompositeError};
use crate::geometry::Rect;
use crate::masking::{AlphaMask, MaskGenerator, ProbabilityField};
use crate::tracking::{Detection, SubjectTracker};

/// Supplies per-frame bounding boxes. An empty list means "nothing detected
/// this frame", never an error.
pub trait Detector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>>;
}

/// Supplies a dense foreground-likelihood field for a frame. May be invoked
/// less often than once per frame; the pipeline tolerates fields computed
/// for an earlier frame as best effort.
pub trait ProbabilityProvider {
    fn probability_field(&mut self, frame: &RgbImage) -> Result<ProbabilityField>;
}

/// Outcome of one frame.
#[derive(Debug)]
pub enum FrameVerdict<'a> {
    /// A freshly composited sharp-subject / blurred-background frame.
    Composited(&'a RgbImage),
    /// No composite this frame — no subject, no usable mask this frame.
    /// The consumer keeps displaying its previous output.
    KeepLast,
}

/// Unexpected per-frame faults, distinct from the expected
/// [`FrameVerdict::KeepLast`] outcomes. Callers behave the same way
/// (freeze on the last good output) but can tell the two apart.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A structural guard tripped: empty frame, or a cached mask whose
    /// dimensions no longer match the frame.
    #[error("invalid input: {0}")]
    InvalidInput(CompositeError),
    /// A scratch buffer could not be (re)allocated; the next call retries
    /// the resize.
    #[error("resource exhaustion: {0}")]
    Resource(CompositeError),
}

impl From<CompositeError> for PipelineError {
    fn from(e: CompositeError) -> Self {
        match e {
            CompositeError::Allocation => PipelineError::Resource(e),
            _ => PipelineError::InvalidInput(e),
        }
    }
}

/// Owns one subject-tracking session end to end.
///
/// Tracker state, mask history, and the cached mask all belong to the
/// current subject; [`FocusPipeline::select_subject`] and
/// [`FocusPipeline::clear_selection`] reset them together so stale history
/// can never bleed into a new subject.
///
/// Frames must arrive in order and calls must be serialized by the caller
/// (one pipeline cycle in flight at a time); the smoothing and missing-frame
/// logic are sequence-dependent.
pub struct FocusPipeline {
    tracker: SubjectTracker,
    mask_gen: MaskGenerator,
    compositor: BlurCompositor,
    cached_mask: Option<AlphaMask>,
    prof_frames: u64,
    prof_mask: Duration,
    prof_composite: Duration,
}

impl FocusPipeline {
    pub fn new() -> Self {
        Self {
            tracker: SubjectTracker::new(),
            mask_gen: MaskGenerator::new(),
            compositor: BlurCompositor::new(),
            cached_mask: None,
            prof_frames: 0,
            prof_mask: Duration::ZERO,
            prof_composite: Duration::ZERO,
        }
    }

    /// Start tracking a subject. Resets tracker, mask history, and the
    /// cached mask together.
    pub fn select_subject(&mut self, detection: &Detection) {
        info!(label = %detection.label, "selecting subject");
        self.tracker.select_subject(detection);
        self.mask_gen.reset_temporal_state();
        self.cached_mask = None;
    }

    /// Stop tracking. Same atomic reset as selection.
    pub fn clear_selection(&mut self) {
        info!("clearing subject selection");
        self.tracker.clear();
        self.mask_gen.reset_temporal_state();
        self.cached_mask = None;
    }

    pub fn is_tracking(&self) -> bool {
        self.tracker.is_actively_tracking()
    }

    /// Current smoothed subject box for on-screen indication.
    pub fn subject_rect(&self) -> Rect {
        self.tracker.tracked_rect()
    }

    pub fn subject_label(&self) -> Option<&str> {
        self.tracker.label()
    }

    /// Process one frame.
    ///
    /// `field` is `None` when the probability provider skipped or timed out
    /// this frame; the cached mask from the last good field is reused. A
    /// field that yields an invalid (blank) mask instead freezes the output
    /// for this frame — the subject is affirmatively not visible, so
    /// re-compositing with old mask history would show a ghost.
    pub fn process_frame(
        &mut self,
        frame: &RgbImage,
        detections: &[Detection],
        field: Option<&ProbabilityField>,
    ) -> Result<FrameVerdict<'_>, PipelineError> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidInput(CompositeError::EmptyFrame));
        }

        let matched = self.tracker.update(detections, width, height);
        if !self.tracker.is_actively_tracking() {
            return Ok(FrameVerdict::KeepLast);
        }

        if let Some(field) = field {
            let exclude: Vec<Rect> = detections
                .iter()
                .enumerate()
                .filter(|(idx, _)| Some(*idx) != matched)
                .map(|(_, det)| det.rect)
                .collect();

            let mask_start = Instant::now();
            let mask = self
                .mask_gen
                .generate(field, self.tracker.tracked_rect(), &exclude);
            self.prof_mask += mask_start.elapsed();

            if mask.is_blank() {
                debug!("mask invalid this frame, freezing output");
                return Ok(FrameVerdict::KeepLast);
            }
            self.cached_mask = Some(mask);
        }

        let Some(mask) = self.cached_mask.as_ref() else {
            return Ok(FrameVerdict::KeepLast);
        };

        let composite_start = Instant::now();
        let result = self.compositor.composite(frame, mask);
        self.prof_composite += composite_start.elapsed();

        self.prof_frames += 1;
        if self.prof_frames % 300 == 0 {
            info!(
                frames = self.prof_frames,
                mask_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_mask.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                composite_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_composite.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                "pipeline timings"
            );
        }

        match result {
            Ok(image) => Ok(FrameVerdict::Composited(image)),
            Err(e) => {
                // Usually a cached mask from before a resolution change.
                warn!("composite rejected: {e}");
                Err(e.into())
            }
        }
    }

    /// Fold a detector's output into a detection list, treating failure as
    /// "no detections this frame".
    pub fn run_detector(detector: &mut dyn Detector, frame: &RgbImage) -> Vec<Detection> {
        match detector.detect(frame) {
            Ok(detections) => detections,
            Err(e) => {
                warn!("detector error: {e}");
                Vec::new()
            }
        }
    }
}

impl Default for FocusPipeline {
    fn default() -> Self {
        Self::new()
    }
}
