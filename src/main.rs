//! Demo driver: runs the focus pipeline against a synthetic two-person
//! scene, standing in for the camera, detector, and matting model.

use anyhow::Result;
use clap::Parser;
use image::{Rgb, RgbImage};
use ndarray::Array2;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use smartfocus::{
    Detection, Detector, FocusPipeline, FrameGate, FrameVerdict, ProbabilityField,
    ProbabilityProvider, ProbabilityWorker, Rect, DEFAULT_FIELD_TIMEOUT,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Frame width
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Frame height
    #[arg(long, default_value_t = 360)]
    height: u32,

    /// Number of frames to simulate
    #[arg(long, default_value_t = 300)]
    frames: u32,

    /// Target frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

/// Two subjects drifting across the frame in opposite directions.
struct SyntheticScene {
    width: u32,
    height: u32,
    frame_index: u32,
}

impl SyntheticScene {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_index: 0,
        }
    }

    fn subject_rects(&self) -> [Rect; 2] {
        let t = self.frame_index as f32;
        let w = self.width as f32;
        let drift = (t * 1.5) % (w / 4.0);
        [
            Rect::new(40.0 + drift, 50.0, 140.0 + drift, 250.0),
            Rect::new(w - 180.0 - drift, 60.0, w - 60.0 - drift, 260.0),
        ]
    }

    fn render(&self) -> RgbImage {
        let rects = self.subject_rects();
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let fx = x as f32;
            let fy = y as f32;
            for (i, r) in rects.iter().enumerate() {
                if fx >= r.left && fx < r.right && fy >= r.top && fy < r.bottom {
                    return if i == 0 {
                        Rgb([220, 180, 140])
                    } else {
                        Rgb([140, 180, 220])
                    };
                }
            }
            // Busy background so the blur is visible.
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x ^ y) % 256) as u8])
        })
    }

    fn advance(&mut self) {
        self.frame_index += 1;
    }
}

/// Detector stand-in: reports the scene's current subject boxes.
struct SceneDetector {
    rects: [Rect; 2],
}

impl Detector for SceneDetector {
    fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<Detection>> {
        Ok(self
            .rects
            .iter()
            .map(|r| Detection {
                label: "person".to_string(),
                confidence: 0.9,
                rect: *r,
            })
            .collect())
    }
}

/// Matting stand-in: foreground likelihood from the synthetic subjects'
/// flat, saturated patch colors.
struct SceneProvider;

impl ProbabilityProvider for SceneProvider {
    fn probability_field(&mut self, frame: &RgbImage) -> Result<ProbabilityField> {
        let (width, height) = frame.dimensions();
        Ok(Array2::from_shape_fn(
            (height as usize, width as usize),
            |(y, x)| {
                let px = frame.get_pixel(x as u32, y as u32);
                if px[0] >= 140 && px[1] == 180 {
                    0.95
                } else {
                    0.0
                }
            },
        ))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("smartfocus demo starting");
    tracing::info!("Frame: {}x{}", args.width, args.height);
    tracing::info!("Target FPS: {}", args.fps);

    let mut scene = SyntheticScene::new(args.width, args.height);
    let mut detector = SceneDetector {
        rects: scene.subject_rects(),
    };
    let mut worker = ProbabilityWorker::spawn(Box::new(SceneProvider));
    let mut pipeline = FocusPipeline::new();

    let composited = Arc::new(AtomicU64::new(0));
    let kept = Arc::new(AtomicU64::new(0));
    let faults = Arc::new(AtomicU64::new(0));

    // The whole detection -> mask -> composite cycle runs on the gate's
    // worker thread; frames arriving while a cycle is still running are
    // dropped at submission, never queued.
    let gate = {
        let composited = composited.clone();
        let kept = kept.clone();
        let faults = faults.clone();
        FrameGate::spawn(move |(index, frame, rects): (u32, RgbImage, [Rect; 2])| {
            detector.rects = rects;
            let detections = FocusPipeline::run_detector(&mut detector, &frame);

            // The user picks the left-hand subject on the first frame.
            if index == 0 {
                if let Some(first) = detections.first() {
                    pipeline.select_subject(first);
                }
            }

            let field = worker.request(&frame, DEFAULT_FIELD_TIMEOUT);
            match pipeline.process_frame(&frame, &detections, field.as_ref()) {
                Ok(FrameVerdict::Composited(_)) => {
                    composited.fetch_add(1, Ordering::Relaxed);
                }
                Ok(FrameVerdict::KeepLast) => {
                    kept.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!("pipeline fault: {e}");
                    faults.fetch_add(1, Ordering::Relaxed);
                }
            }
        })
    };

    let frame_duration = Duration::from_secs_f32(1.0 / args.fps as f32);
    let mut dropped = 0u64;

    for frame_count in 0..args.frames {
        let loop_start = Instant::now();

        let frame = scene.render();
        if !gate.try_submit((frame_count, frame, scene.subject_rects())) {
            dropped += 1;
        }
        scene.advance();

        if (frame_count + 1) % 30 == 0 {
            tracing::info!(
                "Frame {}: composited={}, kept={}, dropped={}",
                frame_count + 1,
                composited.load(Ordering::Relaxed),
                kept.load(Ordering::Relaxed),
                dropped,
            );
        }

        let elapsed = loop_start.elapsed();
        if elapsed < frame_duration {
            std::thread::sleep(frame_duration - elapsed);
        }
    }

    // Give the in-flight cycle a moment to finish before the final tally.
    std::thread::sleep(frame_duration * 2);
    tracing::info!(
        "Done: {} composited, {} kept-last, {} dropped, {} faults over {} frames",
        composited.load(Ordering::Relaxed),
        kept.load(Ordering::Relaxed),
        dropped,
        faults.load(Ordering::Relaxed),
        args.frames
    );

    Ok(())
}
