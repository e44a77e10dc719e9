//! runtime — worker-thread plumbing around the per-frame pipeline
//!
//! Two policies live here, both about bounding latency:
//! - the probability provider is the one stage with unbounded latency, so it
//!   runs on its own thread behind a request/response channel with an
//!   enforced timeout per request;
//! - frames are admitted through a bounded(1) channel, so a frame arriving
//!   while the previous cycle is still running is dropped, never queued.

use std::sync::mpsc::{self, RecvTimeoutError, TrySendError};
use std::thread;
use std::time::Duration;

use image::RgbImage;
use tracing::{debug, warn};

use crate::masking::ProbabilityField;
use crate::pipeline::ProbabilityProvider;

/// Recommended per-request timeout; tolerates provider cold start on
/// constrained hardware.
pub const DEFAULT_FIELD_TIMEOUT: Duration = Duration::from_millis(250);

/// Runs a [`ProbabilityProvider`] on a dedicated thread with a bounded wait.
///
/// A request that times out is not abandoned: when its reply eventually
/// lands, the next call drains it and hands it out as a stale best-effort
/// field, which the mask pipeline tolerates by design.
pub struct ProbabilityWorker {
    request_tx: mpsc::SyncSender<RgbImage>,
    response_rx: mpsc::Receiver<Option<ProbabilityField>>,
    in_flight: bool,
}

impl ProbabilityWorker {
    pub fn spawn(mut provider: Box<dyn ProbabilityProvider + Send>) -> Self {
        let (request_tx, request_rx) = mpsc::sync_channel::<RgbImage>(1);
        let (response_tx, response_rx) = mpsc::channel();

        thread::spawn(move || {
            for frame in request_rx {
                let field = match provider.probability_field(&frame) {
                    Ok(field) => Some(field),
                    Err(e) => {
                        warn!("probability provider error: {e}");
                        None
                    }
                };
                if response_tx.send(field).is_err() {
                    break;
                }
            }
        });

        Self {
            request_tx,
            response_rx,
            in_flight: false,
        }
    }

    /// Request a field for `frame`, waiting at most `timeout`.
    ///
    /// `None` means "no field this frame" — provider failure, timeout with
    /// nothing stale to fall back on, or a dead worker. Callers reuse their
    /// cached mask in that case.
    pub fn request(&mut self, frame: &RgbImage, timeout: Duration) -> Option<ProbabilityField> {
        // A reply from a timed-out request may have landed since last call.
        let mut stale = None;
        while let Ok(late) = self.response_rx.try_recv() {
            self.in_flight = false;
            if late.is_some() {
                debug!("using late probability field as best effort");
                stale = late;
            }
        }

        if self.in_flight {
            // Previous request still running; don't stack another behind it.
            return stale;
        }

        match self.request_tx.try_send(frame.clone()) {
            Ok(()) => self.in_flight = true,
            Err(TrySendError::Full(_)) => return stale,
            Err(TrySendError::Disconnected(_)) => {
                warn!("probability worker thread is gone");
                return stale;
            }
        }

        match self.response_rx.recv_timeout(timeout) {
            Ok(field) => {
                self.in_flight = false;
                field.or(stale)
            }
            Err(RecvTimeoutError::Timeout) => {
                debug!("probability provider timed out, mask unavailable this frame");
                stale
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("probability worker thread is gone");
                self.in_flight = false;
                stale
            }
        }
    }
}

/// At-most-one-in-flight frame admission.
///
/// The handler runs on a worker thread; [`FrameGate::try_submit`] hands it
/// one item at a time and reports a dropped frame (rather than queueing)
/// whenever the previous one is still being processed.
pub struct FrameGate<T> {
    tx: mpsc::SyncSender<T>,
}

impl<T: Send + 'static> FrameGate<T> {
    pub fn spawn<F>(mut handler: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        thread::spawn(move || {
            for item in rx {
                handler(item);
            }
        });
        Self { tx }
    }

    /// Submit a frame; returns `false` when it was dropped because the
    /// worker is still busy (or gone).
    pub fn try_submit(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("pipeline busy, dropping frame");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("pipeline worker thread is gone");
                false
            }
        }
    }
}
