//! VAD listening thread
//!
//! Runs detection and turn segmentation on a dedicated thread, since the
//! WebRTC detector is not `Send`. The detector is built on that thread from a
//! factory. The turn event channel closes when the frame source closes or
//! after [`Listener::stop`]. Whether the gate currently hears speech is
//! published through [`Listener::activity`].

use crate::audio::AudioFrame;
use crate::error::VoiceResult;
use crate::turn::{GateState, TurnConfig, TurnEvent, TurnSegmenter};
use crate::vad::SpeechDetector;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Builds a detector on the listening thread.
pub type DetectorFactory = Box<dyn FnOnce() -> Box<dyn SpeechDetector> + Send>;

/// Handle to a running listening thread.
pub struct Listener {
    handle: Option<JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
}

impl Listener {
    /// Start consuming `frames`. Returns the listener and its turn events.
    pub fn spawn(
        mut frames: mpsc::UnboundedReceiver<AudioFrame>,
        detector: DetectorFactory,
        config: TurnConfig,
    ) -> VoiceResult<(Self, mpsc::UnboundedReceiver<TurnEvent>)> {
        let (mut segmenter, turn_rx) = TurnSegmenter::new(config);
        let stopping = Arc::new(AtomicBool::new(false));
        let thread_stopping = Arc::clone(&stopping);
        let active = Arc::new(AtomicBool::new(false));
        let thread_active = Arc::clone(&active);

        let handle = thread::Builder::new()
            .name("tutor-vad".to_string())
            .spawn(move || {
                let mut detector = detector();
                info!(detector = detector.name(), "🔄 VAD listening thread started");

                let mut failures = 0u64;
                while let Some(frame) = frames.blocking_recv() {
                    if thread_stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    let probability = match detector.speech_probability(&frame.samples) {
                        Ok(p) => p,
                        Err(e) => {
                            failures += 1;
                            if failures == 1 || failures % 100 == 0 {
                                warn!(failures, "VAD error, treating frame as silence: {}", e);
                            }
                            0.0
                        }
                    };
                    segmenter.push(frame, probability);
                    thread_active.store(segmenter.gate_state() != GateState::Silence, Ordering::SeqCst);
                }

                segmenter.flush();
                thread_active.store(false, Ordering::SeqCst);
                warn!("🛑 VAD listening thread ended");
            })?;

        Ok((
            Self {
                handle: Some(handle),
                stopping,
                active,
            },
            turn_rx,
        ))
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Flag that is set while the gate is anywhere but `Silence`.
    pub fn activity(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.active)
    }

    /// Ask the thread to exit at the next frame boundary.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Wait for the thread to exit. It exits once the frame source closes.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("VAD listening thread panicked");
            }
        }
    }
}
