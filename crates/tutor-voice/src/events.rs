//! Observable pipeline events
//!
//! Everything a presentation layer needs is published on an [`EventBus`].
//! Publishing never blocks the pipeline; slow subscribers lag and miss events
//! rather than stalling the turn loop.

use crate::orchestrator::PipelineState;
use crate::reply::ReplySource;
use crate::session::TeachingMode;
use std::time::Duration;
use tokio::sync::broadcast;

/// Which stage an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Capture device or frame source failure; the pipeline stops
    Device,
    Transcription,
    Reply,
    /// No backend produced audio, or the active one failed mid-reply
    Synthesis,
    /// A chunk could not be decoded or the output device rejected audio
    Playback,
}

/// Latencies for one processed input, measured from when the turn closed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnMetrics {
    pub turn_id: Option<u64>,
    pub transcription: Option<Duration>,
    pub reply: Option<Duration>,
    pub first_audio: Option<Duration>,
    pub chunks_played: usize,
    pub total: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
    /// Transcribed (or typed) user input
    UserText {
        turn_id: Option<u64>,
        text: String,
        language: String,
    },
    /// The tutor's reply. `spoken` is false when it is shown without audio.
    ReplyText {
        text: String,
        mode: TeachingMode,
        source: ReplySource,
        spoken: bool,
    },
    /// Synthesis of a reply started
    Speaking { job_id: u64 },
    /// Nothing in flight and no open turn
    Idle,
    /// The user spoke over a reply, which was cut off
    BargeIn { job_id: Option<u64> },
    TurnMetrics(TurnMetrics),
    Error { kind: ErrorKind, message: String },
}

/// Fan-out of [`PipelineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn error(&self, kind: ErrorKind, message: impl Into<String>) {
        self.emit(PipelineEvent::Error {
            kind,
            message: message.into(),
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(PipelineEvent::Idle);

        let mut rx = bus.subscribe();
        bus.error(ErrorKind::Reply, "timed out");
        assert_eq!(
            rx.recv().await.unwrap(),
            PipelineEvent::Error {
                kind: ErrorKind::Reply,
                message: "timed out".to_string()
            }
        );
        assert_eq!(bus.subscriber_count(), 1);
    }
}
