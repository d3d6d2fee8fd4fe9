//! Pipeline configuration
//!
//! One plain struct per component, gathered in [`PipelineConfig`].
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | TUTOR_SAMPLE_RATE | 16000 | Capture and VAD sample rate |
//! | TUTOR_FRAME_MS | 20 | Frame length (10, 20 or 30) |
//! | TUTOR_VAD | webrtc | `webrtc` or `energy` |
//! | TUTOR_VAD_MODE | 2 | WebRTC aggressiveness 0-3 |
//! | TUTOR_VAD_THRESHOLD | 0.5 | Speech probability threshold |
//! | TUTOR_ONSET_FRAMES | 3 | Speech frames to open a turn |
//! | TUTOR_OFFSET_FRAMES | 15 | Silence frames to close a turn |
//! | TUTOR_MAX_TURN_MS | 10000 | Force-close a turn after this long |
//! | TUTOR_MIN_TURN_MS | 100 | Discard shorter turns |
//! | TUTOR_JITTER_MS | 200 | Playback jitter buffer target |
//! | TUTOR_STT_TIMEOUT_MS | 15000 | Transcription deadline |
//! | TUTOR_REPLY_TIMEOUT_MS | 20000 | Reply deadline |
//! | TUTOR_TTS_FIRST_CHUNK_MS | 350 | First-chunk budget of the first synthesis backend |
//! | TUTOR_HISTORY_WINDOW | 10 | History entries sent to the reply engine |
//! | TUTOR_ABANDON_STALE | false | Drop in-flight work when the user starts a new turn |
//! | TUTOR_LANGUAGE | auto | Transcription language hint |
//! | TUTOR_TARGET_LANGUAGE | fr | Language being learned |
//! | TUTOR_LEVEL | A2 | CEFR level |
//! | TUTOR_DIFFICULTY | 2 | 1-5 |
//! | TUTOR_TOPIC | free | Conversation topic |
//! | TUTOR_SPEECH_RATE | normal | `slow`, `normal` or `fast` |

use crate::audio::AudioConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::orchestrator::StaleRequestPolicy;
use crate::playback::PlaybackConfig;
use crate::reply::ReplyConfig;
use crate::session::{CefrLevel, Difficulty, TutorParams};
use crate::stt::{LanguageHint, TranscriptionConfig};
use crate::synthesis::{SpeechRate, SynthesisConfig};
use crate::turn::TurnConfig;
use crate::vad::{DetectorKind, VadConfig};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub turn: TurnConfig,
    pub playback: PlaybackConfig,
    pub transcription: TranscriptionConfig,
    pub reply: ReplyConfig,
    pub synthesis: SynthesisConfig,
    pub params: TutorParams,
    pub history_window: usize,
    pub stale_policy: StaleRequestPolicy,
    pub language_hint: LanguageHint,
    pub speech_rate: SpeechRate,
    /// Events buffered per subscriber before it starts lagging
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            turn: TurnConfig::default(),
            playback: PlaybackConfig::default(),
            transcription: TranscriptionConfig::default(),
            reply: ReplyConfig::default(),
            synthesis: SynthesisConfig::default(),
            params: TutorParams::default(),
            history_window: 10,
            stale_policy: StaleRequestPolicy::Queue,
            language_hint: LanguageHint::Auto,
            speech_rate: SpeechRate::Normal,
            event_capacity: 256,
        }
    }
}

impl PipelineConfig {
    /// Load from `TUTOR_*` variables. Unset or invalid => defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        let sample_rate = env_parse("TUTOR_SAMPLE_RATE", config.audio.sample_rate);
        let frame_ms = env_parse("TUTOR_FRAME_MS", 20u32);
        config.audio.sample_rate = sample_rate;
        config.audio.frame_size = (sample_rate * frame_ms / 1000) as usize;
        config.vad.sample_rate = sample_rate;
        config.turn.sample_rate = sample_rate;

        config.vad.kind = match env_opt_string("TUTOR_VAD").as_deref().map(str::to_lowercase).as_deref() {
            Some("energy") => DetectorKind::Energy,
            _ => DetectorKind::WebRtc,
        };
        config.vad.mode = env_parse("TUTOR_VAD_MODE", config.vad.mode).min(3);

        config.turn.gate.threshold = env_parse("TUTOR_VAD_THRESHOLD", config.turn.gate.threshold).clamp(0.0, 1.0);
        config.turn.gate.onset_frames = env_parse("TUTOR_ONSET_FRAMES", config.turn.gate.onset_frames);
        config.turn.gate.offset_frames = env_parse("TUTOR_OFFSET_FRAMES", config.turn.gate.offset_frames);
        config.turn.max_turn_duration = env_millis("TUTOR_MAX_TURN_MS", config.turn.max_turn_duration);
        config.turn.min_turn_duration = env_millis("TUTOR_MIN_TURN_MS", config.turn.min_turn_duration);

        config.playback.target_buffer = env_millis("TUTOR_JITTER_MS", config.playback.target_buffer);
        config.transcription.deadline = env_millis("TUTOR_STT_TIMEOUT_MS", config.transcription.deadline);
        config.reply.deadline = env_millis("TUTOR_REPLY_TIMEOUT_MS", config.reply.deadline);
        config.synthesis.first_chunk_budget =
            env_millis("TUTOR_TTS_FIRST_CHUNK_MS", config.synthesis.first_chunk_budget);

        config.history_window = env_parse("TUTOR_HISTORY_WINDOW", config.history_window);
        if env_bool("TUTOR_ABANDON_STALE", false) {
            config.stale_policy = StaleRequestPolicy::Abandon;
        }
        if let Some(hint) = env_opt_string("TUTOR_LANGUAGE") {
            config.language_hint = LanguageHint::parse(&hint);
        }
        if let Some(rate) = env_opt_string("TUTOR_SPEECH_RATE").and_then(|r| SpeechRate::parse(&r)) {
            config.speech_rate = rate;
        }

        if let Some(lang) = env_opt_string("TUTOR_TARGET_LANGUAGE") {
            config.params.target_language = lang.to_lowercase();
        }
        if let Some(level) = env_opt_string("TUTOR_LEVEL").and_then(|l| CefrLevel::parse(&l)) {
            config.params.level = level;
        }
        if let Some(difficulty) = Difficulty::new(env_parse("TUTOR_DIFFICULTY", 0u8)) {
            config.params.difficulty = difficulty;
        }
        if let Some(topic) = env_opt_string("TUTOR_TOPIC") {
            config.params.topic = topic;
        }

        config
    }

    /// Reject combinations the pipeline cannot run with.
    pub fn validate(&self) -> VoiceResult<()> {
        let rate = self.audio.sample_rate;
        if !matches!(rate, 8000 | 16000 | 32000 | 48000) {
            return Err(VoiceError::Config(format!(
                "sample rate {} is not supported by the VAD (8000, 16000, 32000 or 48000)",
                rate
            )));
        }
        if self.vad.sample_rate != rate || self.turn.sample_rate != rate {
            return Err(VoiceError::Config(format!(
                "audio ({}), VAD ({}) and turn ({}) sample rates must match",
                rate, self.vad.sample_rate, self.turn.sample_rate
            )));
        }
        let frame_ms = self.audio.frame_size as u64 * 1000 / u64::from(rate);
        if !matches!(frame_ms, 10 | 20 | 30) || self.audio.frame_size as u64 * 1000 % u64::from(rate) != 0 {
            return Err(VoiceError::Config(format!(
                "frame size {} is not 10, 20 or 30 ms at {} Hz",
                self.audio.frame_size, rate
            )));
        }
        if self.turn.gate.onset_frames == 0 || self.turn.gate.offset_frames == 0 {
            return Err(VoiceError::Config("onset and offset frame counts must be at least 1".to_string()));
        }
        if self.turn.max_turn_duration <= self.turn.min_turn_duration {
            return Err(VoiceError::Config("max turn duration must exceed the minimum".to_string()));
        }
        self.playback.validate()?;
        if self.vad.mode > 3 {
            return Err(VoiceError::Config(format!("VAD mode {} is outside 0-3", self.vad.mode)));
        }
        let deadlines = [
            ("transcription deadline", self.transcription.deadline),
            ("reply deadline", self.reply.deadline),
            ("synthesis first-chunk budget", self.synthesis.first_chunk_budget),
            ("synthesis fallback budget", self.synthesis.fallback_budget),
            ("synthesis stall timeout", self.synthesis.stall_timeout),
        ];
        if let Some((name, _)) = deadlines.iter().find(|(_, d)| d.is_zero()) {
            return Err(VoiceError::Config(format!("{} must be non-zero", name)));
        }
        if Difficulty::new(self.params.difficulty.get()).is_none() {
            return Err(VoiceError::Config("difficulty must be 1-5".to_string()));
        }
        if self.history_window == 0 {
            return Err(VoiceError::Config("history window must hold at least one entry".to_string()));
        }
        Ok(())
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => v.trim().eq_ignore_ascii_case("true") || (v.trim().is_empty() && default),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().map(Duration::from_millis).unwrap_or(default),
        Err(_) => default,
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
