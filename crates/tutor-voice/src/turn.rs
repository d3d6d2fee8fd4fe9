//! Turn-taking: hysteresis gate and turn segmentation
//!
//! [`VoiceActivityGate`] converts per-frame speech probabilities into
//! speech-start / speech-end edges. [`TurnSegmenter`] uses those edges to cut
//! the frame stream into [`Turn`]s. The gate never looks at pipeline state, so
//! a speech-start while a reply is playing is what drives barge-in.

use crate::audio::{samples_duration, AudioFrame};
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Silence,
    PossibleSpeech,
    Speech,
    PossibleSilence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEvent {
    SpeechStart,
    SpeechEnd,
}

/// Hysteresis parameters
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Probability at or above which a frame counts as speech (default: 0.5)
    pub threshold: f32,

    /// Consecutive speech frames needed to open a turn (default: 3, 60ms)
    pub onset_frames: u32,

    /// Consecutive silence frames needed to close a turn (default: 15, 300ms)
    pub offset_frames: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            onset_frames: 3,
            offset_frames: 15,
        }
    }
}

/// Four-state hysteresis over per-frame speech probability.
#[derive(Debug, Clone)]
pub struct VoiceActivityGate {
    config: GateConfig,
    state: GateState,
    run: u32,
}

impl VoiceActivityGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            state: GateState::Silence,
            run: 0,
        }
    }

    /// Feed one frame's probability; returns an edge when one is crossed.
    pub fn update(&mut self, probability: f32) -> Option<GateEvent> {
        let speech = probability >= self.config.threshold;
        let onset = self.config.onset_frames.max(1);
        let offset = self.config.offset_frames.max(1);

        match (self.state, speech) {
            (GateState::Silence, true) | (GateState::PossibleSpeech, true) => {
                self.run += 1;
                if self.run >= onset {
                    self.state = GateState::Speech;
                    self.run = 0;
                    return Some(GateEvent::SpeechStart);
                }
                self.state = GateState::PossibleSpeech;
            }
            (GateState::PossibleSpeech, false) => {
                self.state = GateState::Silence;
                self.run = 0;
            }
            (GateState::Silence, false) => {}
            (GateState::Speech, false) | (GateState::PossibleSilence, false) => {
                self.run += 1;
                if self.run >= offset {
                    self.state = GateState::Silence;
                    self.run = 0;
                    return Some(GateEvent::SpeechEnd);
                }
                self.state = GateState::PossibleSilence;
            }
            (GateState::PossibleSilence, true) => {
                self.state = GateState::Speech;
                self.run = 0;
            }
            (GateState::Speech, true) => {}
        }
        None
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = GateState::Silence;
        self.run = 0;
    }
}

/// Why a turn was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Offset hysteresis confirmed the end of speech
    SpeechEnd,
    /// The turn hit the maximum duration and was force-closed
    MaxDuration,
    /// The frame stream ended mid-turn
    Flush,
}

/// One span of user speech, immutable once closed.
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: u64,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub started_at: Instant,
    pub ended_at: Instant,
    pub first_seq: u64,
    pub last_seq: u64,
    pub close_reason: CloseReason,
}

impl Turn {
    pub fn duration(&self) -> Duration {
        samples_duration(self.samples.len(), self.sample_rate)
    }
}

/// Events emitted by the segmenter
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// Onset confirmed; a turn is open
    Started { turn_id: u64, at: DateTime<Utc> },

    /// Turn committed and ready for transcription
    Closed(Turn),

    /// Turn ended but was shorter than the minimum and was dropped
    Discarded { turn_id: u64 },
}

/// Configuration for turn detection
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub gate: GateConfig,

    /// Sample rate for audio (default: 16000 Hz)
    pub sample_rate: u32,

    /// Hard cap before a turn is force-closed (default: 10s)
    pub max_turn_duration: Duration,

    /// Turns shorter than this are discarded (default: 100ms)
    pub min_turn_duration: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            gate: GateConfig::default(),
            sample_rate: 16000,
            max_turn_duration: Duration::from_secs(10),
            min_turn_duration: Duration::from_millis(100),
        }
    }
}

struct OpenTurn {
    id: u64,
    samples: Vec<f32>,
    started_at: Instant,
    first_seq: u64,
    last_seq: u64,
    /// Frames seen during a dropout; kept only if speech resumes.
    dropout: Vec<AudioFrame>,
}

/// Cuts a frame stream into turns using [`VoiceActivityGate`] edges.
pub struct TurnSegmenter {
    config: TurnConfig,
    gate: VoiceActivityGate,
    onset: Vec<AudioFrame>,
    current: Option<OpenTurn>,
    next_id: u64,
    event_tx: mpsc::UnboundedSender<TurnEvent>,
}

impl TurnSegmenter {
    pub fn new(config: TurnConfig) -> (Self, mpsc::UnboundedReceiver<TurnEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let segmenter = Self {
            gate: VoiceActivityGate::new(config.gate.clone()),
            config,
            onset: Vec::new(),
            current: None,
            next_id: 1,
            event_tx,
        };
        (segmenter, event_rx)
    }

    /// Process one frame with its speech probability.
    pub fn push(&mut self, frame: AudioFrame, probability: f32) {
        match self.gate.update(probability) {
            Some(GateEvent::SpeechStart) => {
                self.onset.push(frame);
                self.open_turn();
            }
            Some(GateEvent::SpeechEnd) => {
                // Trailing silence never belongs to the turn.
                self.close_turn(CloseReason::SpeechEnd);
            }
            None => match self.gate.state() {
                GateState::PossibleSpeech => self.onset.push(frame),
                GateState::Silence => self.onset.clear(),
                GateState::PossibleSilence => {
                    if let Some(turn) = self.current.as_mut() {
                        turn.dropout.push(frame);
                    }
                }
                GateState::Speech => {
                    if let Some(turn) = self.current.as_mut() {
                        for resumed in std::mem::take(&mut turn.dropout) {
                            append(turn, resumed);
                        }
                        append(turn, frame);
                    }
                }
            },
        }

        let over_limit = self
            .current
            .as_ref()
            .map(|t| samples_duration(t.samples.len(), self.config.sample_rate) >= self.config.max_turn_duration)
            .unwrap_or(false);
        if over_limit {
            warn!("⏱️ Max turn duration reached, force-closing turn");
            self.close_turn(CloseReason::MaxDuration);
            self.gate.reset();
        }
    }

    /// Close any open turn, e.g. when the frame stream ends.
    pub fn flush(&mut self) {
        if self.current.is_some() {
            self.close_turn(CloseReason::Flush);
        }
        self.gate.reset();
        self.onset.clear();
    }

    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    pub fn in_turn(&self) -> bool {
        self.current.is_some()
    }

    fn open_turn(&mut self) {
        let id = self.next_id;
        self.next_id += 1;
        let frames = std::mem::take(&mut self.onset);
        let first = frames.first().map(|f| (f.seq, f.captured_at));
        let (first_seq, started_at) = first.unwrap_or((0, Instant::now()));

        let mut turn = OpenTurn {
            id,
            samples: Vec::new(),
            started_at,
            first_seq,
            last_seq: first_seq,
            dropout: Vec::new(),
        };
        for frame in frames {
            append(&mut turn, frame);
        }
        self.current = Some(turn);

        info!(turn_id = id, "🎤 Speech started");
        self.emit(TurnEvent::Started {
            turn_id: id,
            at: Utc::now(),
        });
    }

    fn close_turn(&mut self, reason: CloseReason) {
        let Some(open) = self.current.take() else {
            return;
        };
        let duration = samples_duration(open.samples.len(), self.config.sample_rate);
        if duration < self.config.min_turn_duration {
            debug!(turn_id = open.id, ?duration, "⏭️ Turn too short, discarding");
            self.emit(TurnEvent::Discarded { turn_id: open.id });
            return;
        }

        info!(turn_id = open.id, ?duration, ?reason, "🎯 Turn closed");
        self.emit(TurnEvent::Closed(Turn {
            id: open.id,
            samples: open.samples,
            sample_rate: self.config.sample_rate,
            started_at: open.started_at,
            ended_at: Instant::now(),
            first_seq: open.first_seq,
            last_seq: open.last_seq,
            close_reason: reason,
        }));
    }

    fn emit(&self, event: TurnEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("turn event receiver dropped");
        }
    }
}

fn append(turn: &mut OpenTurn, frame: AudioFrame) {
    turn.last_seq = frame.seq;
    turn.samples.extend_from_slice(&frame.samples);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64, level: f32) -> AudioFrame {
        AudioFrame {
            seq,
            samples: vec![level; 320],
            captured_at: Instant::now(),
        }
    }

    fn feed(segmenter: &mut TurnSegmenter, seq: &mut u64, count: usize, probability: f32) {
        for _ in 0..count {
            segmenter.push(frame(*seq, probability), probability);
            *seq += 1;
        }
    }

    #[test]
    fn gate_requires_onset_run() {
        let mut gate = VoiceActivityGate::new(GateConfig::default());
        assert_eq!(gate.update(0.9), None);
        assert_eq!(gate.state(), GateState::PossibleSpeech);
        assert_eq!(gate.update(0.1), None);
        assert_eq!(gate.state(), GateState::Silence);

        assert_eq!(gate.update(0.9), None);
        assert_eq!(gate.update(0.9), None);
        assert_eq!(gate.update(0.9), Some(GateEvent::SpeechStart));
        assert_eq!(gate.state(), GateState::Speech);
    }

    #[test]
    fn gate_survives_short_dropout() {
        let mut gate = VoiceActivityGate::new(GateConfig::default());
        for _ in 0..3 {
            gate.update(1.0);
        }
        for _ in 0..14 {
            assert_eq!(gate.update(0.0), None);
        }
        assert_eq!(gate.state(), GateState::PossibleSilence);
        assert_eq!(gate.update(1.0), None);
        assert_eq!(gate.state(), GateState::Speech);

        let ends: Vec<_> = (0..15).filter_map(|_| gate.update(0.0)).collect();
        assert_eq!(ends, vec![GateEvent::SpeechEnd]);
    }

    #[test]
    fn gate_threshold_is_inclusive() {
        let mut gate = VoiceActivityGate::new(GateConfig {
            onset_frames: 1,
            ..GateConfig::default()
        });
        assert_eq!(gate.update(0.5), Some(GateEvent::SpeechStart));
    }

    #[test]
    fn segmenter_emits_one_turn_for_speech_run() {
        let (mut segmenter, mut rx) = TurnSegmenter::new(TurnConfig::default());
        let mut seq = 0;
        feed(&mut segmenter, &mut seq, 10, 0.0);
        feed(&mut segmenter, &mut seq, 25, 1.0);
        feed(&mut segmenter, &mut seq, 20, 0.0);

        let started = rx.try_recv().unwrap();
        assert!(matches!(started, TurnEvent::Started { turn_id: 1, .. }));
        match rx.try_recv().unwrap() {
            TurnEvent::Closed(turn) => {
                assert_eq!(turn.first_seq, 10);
                assert_eq!(turn.last_seq, 34);
                assert_eq!(turn.samples.len(), 25 * 320);
                assert_eq!(turn.close_reason, CloseReason::SpeechEnd);
            }
            other => panic!("expected closed turn, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropout_inside_turn_is_kept() {
        let (mut segmenter, mut rx) = TurnSegmenter::new(TurnConfig::default());
        let mut seq = 0;
        feed(&mut segmenter, &mut seq, 10, 1.0);
        feed(&mut segmenter, &mut seq, 5, 0.0);
        feed(&mut segmenter, &mut seq, 10, 1.0);
        feed(&mut segmenter, &mut seq, 15, 0.0);

        let _started = rx.try_recv().unwrap();
        match rx.try_recv().unwrap() {
            TurnEvent::Closed(turn) => {
                assert_eq!((turn.first_seq, turn.last_seq), (0, 24));
                assert_eq!(turn.samples.len(), 25 * 320);
            }
            other => panic!("expected closed turn, got {:?}", other),
        }
    }

    #[test]
    fn short_blip_is_discarded() {
        let (mut segmenter, mut rx) = TurnSegmenter::new(TurnConfig::default());
        let mut seq = 0;
        feed(&mut segmenter, &mut seq, 3, 1.0);
        feed(&mut segmenter, &mut seq, 15, 0.0);

        assert!(matches!(rx.try_recv().unwrap(), TurnEvent::Started { .. }));
        assert!(matches!(rx.try_recv().unwrap(), TurnEvent::Discarded { turn_id: 1 }));
    }

    #[test]
    fn long_turn_is_force_closed() {
        let config = TurnConfig {
            max_turn_duration: Duration::from_secs(1),
            ..TurnConfig::default()
        };
        let (mut segmenter, mut rx) = TurnSegmenter::new(config);
        let mut seq = 0;
        feed(&mut segmenter, &mut seq, 60, 1.0);

        assert!(matches!(rx.try_recv().unwrap(), TurnEvent::Started { turn_id: 1, .. }));
        match rx.try_recv().unwrap() {
            TurnEvent::Closed(turn) => {
                assert_eq!(turn.close_reason, CloseReason::MaxDuration);
                assert_eq!(turn.samples.len(), 50 * 320);
            }
            other => panic!("expected closed turn, got {:?}", other),
        }
        // Continued speech opens a fresh turn after a new onset run.
        assert!(matches!(rx.try_recv().unwrap(), TurnEvent::Started { turn_id: 2, .. }));
    }

    #[test]
    fn flush_closes_open_turn() {
        let (mut segmenter, mut rx) = TurnSegmenter::new(TurnConfig::default());
        let mut seq = 0;
        feed(&mut segmenter, &mut seq, 20, 1.0);
        segmenter.flush();
        let _started = rx.try_recv().unwrap();
        match rx.try_recv().unwrap() {
            TurnEvent::Closed(turn) => assert_eq!(turn.close_reason, CloseReason::Flush),
            other => panic!("expected closed turn, got {:?}", other),
        }
        assert!(!segmenter.in_turn());
    }
}
