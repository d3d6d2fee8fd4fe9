//! # Tutor Voice - Real-time Spoken Dialogue Pipeline
//!
//! Turn-taking front end for a language tutor: the user speaks, the turn is
//! transcribed, a reply engine answers, and the answer is streamed back as
//! audio while the VAD keeps listening for the user talking over it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Turn Pipeline                             │
//! │  ┌─────────────┐  ┌──────────────┐  ┌──────────────┐             │
//! │  │  Audio In   │→ │  VAD + Gate  │→ │  Segmenter   │── Turn ──┐  │
//! │  │   (cpal)    │  │ (webrtc-vad) │  │ (hysteresis) │          │  │
//! │  └─────────────┘  └──────────────┘  └──────────────┘          ▼  │
//! │                                          STT → Reply → Synthesis │
//! │  ┌─────────────┐    jitter buffer     ┌──────────────┐        │  │
//! │  │  Audio Out  │←─────────────────────│ Fallback TTS │←───────┘  │
//! │  │   (rodio)   │   cancel on barge-in │    chain     │           │
//! │  └─────────────┘                      └──────────────┘           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod listener;
pub mod orchestrator;
pub mod playback;
pub mod reply;
pub mod session;
pub mod stt;
pub mod synthesis;
pub mod turn;
pub mod vad;

pub use audio::{frame_channel, AudioChunk, AudioConfig, AudioFrame, AudioFrameSource, ChunkEncoding, FrameInjector};
pub use config::PipelineConfig;
pub use error::{VoiceError, VoiceResult};
pub use events::{ErrorKind, EventBus, PipelineEvent, TurnMetrics};
pub use listener::{DetectorFactory, Listener};
pub use orchestrator::{
    AudioInput, ControlCommand, PipelineHandle, PipelineParts, PipelineState, StaleRequestPolicy, TurnPipeline,
};
pub use playback::{AudioFrameSink, NullOutput, OutputDevice, PlaybackConfig, PlaybackTicket, RodioOutput, SinkEvent};
pub use reply::{EchoReplyEngine, OllamaReplyEngine, Reply, ReplyClient, ReplyConfig, ReplyEngine, ReplySource};
pub use session::{CefrLevel, ConversationSession, Difficulty, Speaker, TeachingMode, TutorParams};
#[cfg(feature = "whisper")]
pub use stt::WhisperTranscriber;
pub use stt::{
    create_transcription_engine, LanguageHint, OpenAiTranscriber, PlaceholderTranscriber, TranscriptionClient,
    TranscriptionConfig, TranscriptionEngine, Utterance,
};
pub use synthesis::{
    create_synthesis_chain, ElevenLabsStreamingBackend, HttpSpeechBackend, PiperBackend, SilentBackend, SpeechRate,
    StreamingSynthesisClient, SynthesisBackend, SynthesisConfig, SynthesisJob, SynthesisOutcome,
};
pub use turn::{CloseReason, GateConfig, GateEvent, GateState, Turn, TurnConfig, TurnEvent, TurnSegmenter, VoiceActivityGate};
pub use vad::{create_detector, DetectorKind, EnergyDetector, SpeechDetector, VadConfig, WebRtcDetector};
