//! **Speech-to-Text**: turn PCM into text for the reply step.
//!
//! [`TranscriptionClient`] wraps any [`TranscriptionEngine`] with silence
//! trimming and a deadline. Engines: OpenAI-compatible HTTP, local Whisper
//! (feature `whisper`), and a placeholder for tests and offline runs.

use crate::audio::{f32_to_pcm16, rms};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Language the user is expected to speak.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LanguageHint {
    #[default]
    Auto,
    Code(String),
}

impl LanguageHint {
    pub fn parse(value: &str) -> Self {
        let value = value.trim().to_lowercase();
        if value.is_empty() || value == "auto" {
            LanguageHint::Auto
        } else {
            LanguageHint::Code(value)
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            LanguageHint::Auto => None,
            LanguageHint::Code(code) => Some(code),
        }
    }
}

/// Result of one transcription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub text: String,
    /// ISO 639-1 code when known, otherwise whatever the engine reported
    pub language: String,
}

impl Utterance {
    pub fn empty(hint: &LanguageHint) -> Self {
        Self {
            text: String::new(),
            language: hint.code().unwrap_or("und").to_string(),
        }
    }

    /// No utterance: the pipeline skips the turn.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Backend converting mono f32 PCM to text.
#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Errors are distinct from an empty transcript.
    async fn transcribe(&self, samples: &[f32], sample_rate: u32, hint: &LanguageHint) -> VoiceResult<Utterance>;
}

#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    /// Per-call deadline (default: 15s)
    pub deadline: Duration,

    /// Window RMS below which audio counts as silence when trimming (default: 0.01)
    pub silence_rms: f32,

    /// Trimming window (default: 20ms)
    pub trim_window: Duration,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(15),
            silence_rms: 0.01,
            trim_window: Duration::from_millis(20),
        }
    }
}

/// Uniform transcription call used by the pipeline.
#[derive(Clone)]
pub struct TranscriptionClient {
    engine: Arc<dyn TranscriptionEngine>,
    config: TranscriptionConfig,
}

impl TranscriptionClient {
    pub fn new(engine: Arc<dyn TranscriptionEngine>, config: TranscriptionConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Transcribe mono f32 PCM. Near-silent input yields empty text without
    /// contacting the engine.
    pub async fn transcribe(&self, samples: &[f32], sample_rate: u32, hint: &LanguageHint) -> VoiceResult<Utterance> {
        let trimmed = trim_silence(samples, sample_rate, &self.config);
        if trimmed.is_empty() {
            debug!("Nothing audible after trimming, skipping transcription");
            return Ok(Utterance::empty(hint));
        }

        let started = Instant::now();
        let result = tokio::time::timeout(
            self.config.deadline,
            self.engine.transcribe(trimmed, sample_rate, hint),
        )
        .await
        .map_err(|_| VoiceError::timeout(self.engine.name(), self.config.deadline))?;

        let mut utterance = result?;
        utterance.text = utterance.text.trim().to_string();
        info!(
            target: "tutor::voice",
            backend = self.engine.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            language = %utterance.language,
            "📝 Transcribed {} chars",
            utterance.text.len()
        );
        Ok(utterance)
    }
}

/// Slice of `samples` between the first and last audible windows.
pub fn trim_silence<'a>(samples: &'a [f32], sample_rate: u32, config: &TranscriptionConfig) -> &'a [f32] {
    let window = ((u128::from(sample_rate) * config.trim_window.as_micros()) / 1_000_000).max(1) as usize;
    let audible = |chunk: &[f32]| rms(chunk) >= config.silence_rms;

    let windows: Vec<&[f32]> = samples.chunks(window).collect();
    let first = windows.iter().position(|w| audible(*w));
    let last = windows.iter().rposition(|w| audible(*w));
    match (first, last) {
        (Some(first), Some(last)) => {
            let start = first * window;
            let end = ((last + 1) * window).min(samples.len());
            &samples[start..end]
        }
        _ => &[],
    }
}

/// Encode f32 PCM (mono) to 16-bit WAV bytes for API upload.
pub fn pcm_f32_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let pcm = f32_to_pcm16(samples);
    let data_len = (pcm.len() * 2) as u32;

    let mut buf = Vec::with_capacity(44 + pcm.len() * 2);
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes());
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for s in pcm {
        buf.extend_from_slice(&s.to_le_bytes());
    }
    buf
}

/// Placeholder engine: returns a fixed response. Use for offline runs and tests.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderTranscriber {
    pub response: Option<String>,
}

impl PlaceholderTranscriber {
    pub fn with_response(text: impl Into<String>) -> Self {
        Self {
            response: Some(text.into()),
        }
    }
}

#[async_trait]
impl TranscriptionEngine for PlaceholderTranscriber {
    fn name(&self) -> &str {
        "placeholder"
    }

    async fn transcribe(&self, _samples: &[f32], _sample_rate: u32, hint: &LanguageHint) -> VoiceResult<Utterance> {
        Ok(Utterance {
            text: self.response.clone().unwrap_or_default(),
            language: hint.code().unwrap_or("und").to_string(),
        })
    }
}

/// OpenAI-compatible transcription API (OpenAI Whisper, Groq, local servers).
/// Uses `STT_API_URL` (default https://api.openai.com/v1), `STT_API_KEY` and
/// `STT_MODEL` (default whisper-1).
#[derive(Debug, Clone)]
pub struct OpenAiTranscriber {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    client: reqwest::Client,
}

impl OpenAiTranscriber {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("STT_API_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("STT_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| VoiceError::Config("STT requires STT_API_KEY or OPENAI_API_KEY".to_string()))?;
        let model = std::env::var("STT_MODEL").unwrap_or_else(|_| "whisper-1".to_string());
        Self::new(base_url, api_key, model)
    }
}

#[async_trait]
impl TranscriptionEngine for OpenAiTranscriber {
    fn name(&self) -> &str {
        "openai-stt"
    }

    async fn transcribe(&self, samples: &[f32], sample_rate: u32, hint: &LanguageHint) -> VoiceResult<Utterance> {
        let wav = pcm_f32_to_wav(samples, sample_rate);
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("turn.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::unavailable(self.name(), e))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");
        if let Some(code) = hint.code() {
            form = form.text("language", code.to_string());
        }

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::unavailable(self.name(), e))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::unavailable(self.name(), format!("HTTP {}: {}", status, body)));
        }

        let json: serde_json::Value = res.json().await?;
        let text = json.get("text").and_then(|t| t.as_str()).unwrap_or("").trim().to_string();
        let language = json
            .get("language")
            .and_then(|l| l.as_str())
            .map(normalize_language)
            .or_else(|| hint.code().map(str::to_string))
            .unwrap_or_else(|| "und".to_string());
        Ok(Utterance { text, language })
    }
}

/// verbose_json reports language names ("french"); the pipeline uses codes.
fn normalize_language(reported: &str) -> String {
    let lower = reported.trim().to_lowercase();
    match lower.as_str() {
        "french" => "fr".to_string(),
        "english" => "en".to_string(),
        "spanish" => "es".to_string(),
        "german" => "de".to_string(),
        "italian" => "it".to_string(),
        "portuguese" => "pt".to_string(),
        _ => lower,
    }
}

#[cfg(feature = "whisper")]
mod whisper_engine {
    use super::*;
    use std::sync::Mutex;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, WhisperState};

    /// Local Whisper: loads a ggml model (e.g. ggml-base.bin) and runs inference
    /// on a blocking thread. Audio must be 16 kHz mono.
    pub struct WhisperTranscriber {
        _context: Arc<WhisperContext>,
        state: Arc<Mutex<WhisperState>>,
    }

    impl WhisperTranscriber {
        pub fn new(model_path: &str) -> VoiceResult<Self> {
            let context = WhisperContext::new_with_params(model_path, WhisperContextParameters::default())
                .map_err(|e| VoiceError::unavailable("whisper", format!("load failed: {}", e)))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::unavailable("whisper", format!("state init failed: {}", e)))?;
            info!(model = model_path, "Whisper model loaded");
            Ok(Self {
                _context: Arc::new(context),
                state: Arc::new(Mutex::new(state)),
            })
        }

        /// Build from env: `WHISPER_MODEL_PATH` must point to a .bin model file.
        pub fn from_env() -> VoiceResult<Self> {
            let path = std::env::var("WHISPER_MODEL_PATH")
                .map_err(|_| VoiceError::Config("WHISPER_MODEL_PATH not set".to_string()))?;
            let path = path.trim();
            if path.is_empty() {
                return Err(VoiceError::Config("WHISPER_MODEL_PATH is empty".to_string()));
            }
            Self::new(path)
        }
    }

    #[async_trait]
    impl TranscriptionEngine for WhisperTranscriber {
        fn name(&self) -> &str {
            "whisper"
        }

        async fn transcribe(&self, samples: &[f32], sample_rate: u32, hint: &LanguageHint) -> VoiceResult<Utterance> {
            if sample_rate != 16000 {
                return Err(VoiceError::unavailable(
                    "whisper",
                    format!("expects 16 kHz, got {} Hz", sample_rate),
                ));
            }
            let samples = samples.to_vec();
            let language = hint.code().map(str::to_string);
            let state = Arc::clone(&self.state);

            tokio::task::spawn_blocking(move || {
                let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
                params.set_print_progress(false);
                params.set_print_realtime(false);
                params.set_no_timestamps(true);
                params.set_language(Some(language.as_deref().unwrap_or("auto")));

                let mut state = state
                    .lock()
                    .map_err(|_| VoiceError::unavailable("whisper", "state lock poisoned"))?;
                state
                    .full(params, &samples)
                    .map_err(|e| VoiceError::unavailable("whisper", format!("inference failed: {}", e)))?;
                let text = state
                    .as_iter()
                    .filter_map(|seg| seg.to_str().ok().map(str::to_string))
                    .collect::<Vec<_>>()
                    .join(" ");
                let detected = match language {
                    Some(code) => code,
                    None => state
                        .full_lang_id_from_state()
                        .ok()
                        .and_then(|id| whisper_rs::get_lang_str(id).map(str::to_string))
                        .unwrap_or_else(|| "und".to_string()),
                };
                Ok(Utterance {
                    text: text.trim().to_string(),
                    language: detected,
                })
            })
            .await
            .map_err(|e| VoiceError::unavailable("whisper", e))?
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_engine::WhisperTranscriber;

/// Pick the best available engine from the environment.
/// Priority: local Whisper (feature `whisper` + `WHISPER_MODEL_PATH`), then the
/// OpenAI-compatible API, then the placeholder.
pub fn create_transcription_engine() -> Arc<dyn TranscriptionEngine> {
    #[cfg(feature = "whisper")]
    {
        match WhisperTranscriber::from_env() {
            Ok(engine) => return Arc::new(engine),
            Err(e) => debug!("Local Whisper not used: {}", e),
        }
    }
    match OpenAiTranscriber::from_env() {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            warn!("No transcription backend configured ({}), using placeholder", e);
            Arc::new(PlaceholderTranscriber::default())
        }
    }
}
