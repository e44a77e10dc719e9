pub mod compositing;
pub mod geometry;
pub mod masking;
pub mod pipeline;
pub mod runtime;
pub mod tracking;

pub use compositing::{BlurCompositor, CompositeError};
pub use geometry::Rect;
pub use masking::{AlphaMask, MaskGenerator, ProbabilityField};
pub use pipeline::{Detector, FocusPipeline, FrameVerdict, PipelineError, ProbabilityProvider};
pub use runtime::{FrameGate, ProbabilityWorker, DEFAULT_FIELD_TIMEOUT};
pub use tracking::{Detection, SubjectTracker};
