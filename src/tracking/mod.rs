//! tracking — single-subject association across detector frames
//!
//! The detector emits an unordered, unstable list of boxes each frame; this
//! module decides which of them (if any) is still the user-selected subject
//! and smooths the box so downstream masking doesn't jitter.
//!
//! Matching blends IoU with center distance: IoU alone loses fast movers
//! whose boxes stop overlapping, center distance alone confuses same-spot
//! subjects of different sizes. Either criterion on its own is enough to
//! keep a candidate eligible, which also rides out brief full occlusion.

use tracing::debug;

use crate::geometry::{self, Rect};

// ── Tuning constants ─────────────────────────────────────────────────────────

/// EMA factor toward the matched box (per-edge).
const MATCH_ALPHA: f32 = 0.35;
/// Minimum IoU for a candidate to be eligible on overlap alone.
const MIN_IOU: f32 = 0.25;
/// Center distance cap, as a fraction of the image diagonal.
const MAX_CENTER_FRAC: f32 = 0.4;
/// Consecutive unmatched frames before the subject is declared lost.
const MAX_MISSING_FRAMES: u32 = 15;
/// Score blend weights.
const IOU_WEIGHT: f32 = 0.7;
const DISTANCE_WEIGHT: f32 = 0.3;

/// One detector output box.
#[derive(Debug, Clone)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub rect: Rect,
}

/// Internal per-subject state; exists only while a subject is selected.
#[derive(Debug, Clone)]
struct TrackState {
    rect: Rect,
    smoothed: Rect,
    label: String,
    missing_frames: u32,
}

/// Tracks the one user-selected subject across frames.
///
/// Callers must feed frames in arrival order; the missing-frame counter and
/// the smoothing are sequence-dependent. One writer per instance.
pub struct SubjectTracker {
    state: Option<TrackState>,
}

impl SubjectTracker {
    pub fn new() -> Self {
        Self { state: None }
    }

    /// Lock onto a subject. Replaces any previous selection.
    pub fn select_subject(&mut self, detection: &Detection) {
        debug!(label = %detection.label, "subject selected");
        self.state = Some(TrackState {
            rect: detection.rect,
            smoothed: detection.rect,
            label: detection.label.clone(),
            missing_frames: 0,
        });
    }

    /// Drop the current subject, if any.
    pub fn clear(&mut self) {
        self.state = None;
    }

    /// Re-associate the subject with this frame's detections.
    ///
    /// Returns the index of the matched detection, or `None` when idle, when
    /// nothing eligible was found, or when the subject was just declared
    /// lost. The tracked box freezes at its last smoothed position while
    /// unmatched, so a briefly occluded subject re-locks where it vanished.
    pub fn update(
        &mut self,
        detections: &[Detection],
        image_width: u32,
        image_height: u32,
    ) -> Option<usize> {
        let state = self.state.as_mut()?;

        let diagonal =
            ((image_width as f32).powi(2) + (image_height as f32).powi(2)).sqrt();
        let max_distance = MAX_CENTER_FRAC * diagonal;

        let mut best: Option<(usize, f32)> = None;
        for (idx, det) in detections.iter().enumerate() {
            let overlap = geometry::iou(&state.smoothed, &det.rect);
            let distance = geometry::center_distance(&state.smoothed, &det.rect);
            if overlap <= MIN_IOU && distance >= max_distance {
                continue;
            }
            let score = IOU_WEIGHT * overlap
                + DISTANCE_WEIGHT * (1.0 - (distance / max_distance).min(1.0));
            // Strict > keeps the first index on exact ties.
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((idx, score)),
            }
        }

        match best {
            Some((idx, score)) => {
                state.missing_frames = 0;
                let smoothed =
                    geometry::lerp(&state.smoothed, &detections[idx].rect, MATCH_ALPHA);
                state.smoothed = smoothed;
                state.rect = smoothed;
                debug!(matched = idx, score, "subject matched");
                Some(idx)
            }
            None => {
                state.missing_frames += 1;
                debug!(missing = state.missing_frames, "subject not matched");
                if state.missing_frames >= MAX_MISSING_FRAMES {
                    debug!("missing-frame budget exhausted, subject lost");
                    self.state = None;
                }
                None
            }
        }
    }

    /// True while a subject is locked, matched or not.
    pub fn is_actively_tracking(&self) -> bool {
        self.state.is_some()
    }

    pub fn missing_frames(&self) -> u32 {
        self.state.as_ref().map_or(0, |s| s.missing_frames)
    }

    /// Last smoothed subject box; empty rect when idle.
    pub fn tracked_rect(&self) -> Rect {
        self.state.as_ref().map_or(Rect::default(), |s| s.smoothed)
    }

    pub fn label(&self) -> Option<&str> {
        self.state.as_ref().map(|s| s.label.as_str())
    }
}

impl Default for SubjectTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(left: f32, top: f32, right: f32, bottom: f32) -> Detection {
        Detection {
            label: "person".to_string(),
            confidence: 0.9,
            rect: Rect::new(left, top, right, bottom),
        }
    }

    #[test]
    fn idle_tracker_ignores_updates() {
        let mut tracker = SubjectTracker::new();
        assert_eq!(tracker.update(&[det(0.0, 0.0, 10.0, 10.0)], 640, 360), None);
        assert!(!tracker.is_actively_tracking());
    }

    #[test]
    fn stays_locked_under_jitter() {
        let mut tracker = SubjectTracker::new();
        tracker.select_subject(&det(100.0, 100.0, 200.0, 200.0));

        for i in 0..30 {
            let wobble = if i % 2 == 0 { 2.0 } else { -2.0 };
            let d = det(100.0 + wobble, 100.0 - wobble, 200.0 + wobble, 200.0 - wobble);
            assert_eq!(tracker.update(&[d], 640, 360), Some(0));
            assert_eq!(tracker.missing_frames(), 0);
        }
    }

    #[test]
    fn smoothing_converges_without_overshoot() {
        let mut tracker = SubjectTracker::new();
        tracker.select_subject(&det(0.0, 0.0, 100.0, 100.0));

        let target = det(20.0, 0.0, 120.0, 100.0);
        let mut prev_left = 0.0;
        for _ in 0..50 {
            tracker.update(&[target.clone()], 640, 360).unwrap();
            let left = tracker.tracked_rect().left;
            // Monotonic approach, never past the target edge.
            assert!(left > prev_left);
            assert!(left <= 20.0 + 1e-4);
            prev_left = left;
        }
        assert!((prev_left - 20.0).abs() < 0.01);
    }

    #[test]
    fn first_update_moves_thirty_five_percent() {
        let mut tracker = SubjectTracker::new();
        tracker.select_subject(&det(100.0, 50.0, 300.0, 250.0));
        tracker.update(&[det(108.0, 55.0, 305.0, 252.0)], 640, 360).unwrap();
        let r = tracker.tracked_rect();
        assert!((r.left - (100.0 + 0.35 * 8.0)).abs() < 1e-4);
        assert!((r.top - (50.0 + 0.35 * 5.0)).abs() < 1e-4);
        assert!((r.right - (300.0 + 0.35 * 5.0)).abs() < 1e-4);
        assert!((r.bottom - (250.0 + 0.35 * 2.0)).abs() < 1e-4);
    }

    #[test]
    fn lost_after_missing_frame_budget() {
        let mut tracker = SubjectTracker::new();
        tracker.select_subject(&det(100.0, 100.0, 200.0, 200.0));

        for frame in 1..=16 {
            assert_eq!(tracker.update(&[], 640, 360), None);
            if frame == 14 {
                assert!(tracker.is_actively_tracking());
                assert_eq!(tracker.missing_frames(), 14);
            }
        }
        assert!(!tracker.is_actively_tracking());
        assert_eq!(tracker.missing_frames(), 0);
    }

    #[test]
    fn match_resets_missing_counter() {
        let mut tracker = SubjectTracker::new();
        tracker.select_subject(&det(100.0, 100.0, 200.0, 200.0));

        for _ in 0..10 {
            tracker.update(&[], 640, 360);
        }
        assert_eq!(tracker.missing_frames(), 10);

        tracker.update(&[det(101.0, 101.0, 201.0, 201.0)], 640, 360).unwrap();
        assert_eq!(tracker.missing_frames(), 0);
    }

    #[test]
    fn far_small_candidate_is_ineligible() {
        let mut tracker = SubjectTracker::new();
        tracker.select_subject(&det(0.0, 0.0, 50.0, 50.0));
        // No overlap and center distance well past 40% of the diagonal.
        assert_eq!(tracker.update(&[det(600.0, 330.0, 640.0, 360.0)], 640, 360), None);
        assert_eq!(tracker.missing_frames(), 1);
    }

    #[test]
    fn picks_nearer_of_two_subjects() {
        let mut tracker = SubjectTracker::new();
        tracker.select_subject(&det(100.0, 50.0, 300.0, 250.0));

        let frame = [det(108.0, 55.0, 305.0, 252.0), det(402.0, 61.0, 551.0, 262.0)];
        assert_eq!(tracker.update(&frame, 640, 360), Some(0));
    }

    #[test]
    fn reselection_overwrites_previous_subject() {
        let mut tracker = SubjectTracker::new();
        tracker.select_subject(&det(0.0, 0.0, 50.0, 50.0));
        tracker.select_subject(&det(400.0, 60.0, 550.0, 260.0));
        let r = tracker.tracked_rect();
        assert_eq!(r.left, 400.0);
        assert_eq!(tracker.missing_frames(), 0);
    }
}
