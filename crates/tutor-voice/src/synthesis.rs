//! Streaming speech synthesis with a fallback chain
//!
//! [`StreamingSynthesisClient`] tries each [`SynthesisBackend`] in order. A
//! backend is committed once it delivers its first audio within the attempt
//! budget; after that the job never switches backend, so output from two
//! backends is never mixed. The job's cancellation token is checked at every
//! chunk boundary and dropping the backend stream closes its connection.

use crate::audio::{AudioChunk, ChunkEncoding};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::json;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Speaking rate requested from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeechRate {
    Slow,
    #[default]
    Normal,
    Fast,
}

impl SpeechRate {
    pub fn multiplier(self) -> f32 {
        match self {
            SpeechRate::Slow => 0.85,
            SpeechRate::Normal => 1.0,
            SpeechRate::Fast => 1.15,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "slow" => Some(SpeechRate::Slow),
            "normal" => Some(SpeechRate::Normal),
            "fast" => Some(SpeechRate::Fast),
            _ => None,
        }
    }
}

/// Audio produced by a backend, optionally tagged with the backend's own
/// sequence number when it may deliver out of order.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub data: Vec<u8>,
    pub encoding: ChunkEncoding,
    pub seq: Option<u64>,
}

impl SynthesizedAudio {
    pub fn pcm16(sample_rate: u32, data: Vec<u8>) -> Self {
        Self {
            data,
            encoding: ChunkEncoding::Pcm16 { sample_rate },
            seq: None,
        }
    }
}

pub type ChunkStream = BoxStream<'static, VoiceResult<SynthesizedAudio>>;

/// One link in the fallback chain.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Establish a synthesis stream for `text`. Failing to connect is an error
    /// here; failures after connecting surface as stream items.
    async fn open(&self, text: &str, rate: SpeechRate) -> VoiceResult<ChunkStream>;
}

/// A unit of speech work. Cancelling the token stops the job.
#[derive(Debug, Clone)]
pub struct SynthesisJob {
    pub id: u64,
    pub text: String,
    pub rate: SpeechRate,
    pub cancel: CancellationToken,
}

impl SynthesisJob {
    pub fn new(id: u64, text: impl Into<String>, rate: SpeechRate) -> Self {
        Self {
            id,
            text: text.into(),
            rate,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Budget for the first backend to connect and deliver audio (default: 350ms)
    pub first_chunk_budget: Duration,
    /// Budget for each later backend in the chain (default: 5s)
    pub fallback_budget: Duration,
    /// Gap between chunks after which a committed job is truncated (default: 3s)
    pub stall_timeout: Duration,
    /// Chunks buffered between producer and consumer (default: 4)
    pub channel_capacity: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            first_chunk_budget: Duration::from_millis(350),
            fallback_budget: Duration::from_secs(5),
            stall_timeout: Duration::from_secs(3),
            channel_capacity: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisOutcome {
    /// All audio from `backend` was delivered
    Completed { backend: String, chunks: usize },
    /// `backend` failed or stalled after audio had started
    Truncated { backend: String, chunks: usize, reason: String },
    /// The job's token fired or the consumer went away
    Cancelled { chunks: usize },
    /// No backend produced audio; the reply is text only
    Exhausted { failures: Vec<String> },
}

/// Restores backend order for out-of-order deliveries.
#[derive(Debug, Default)]
pub struct Resequencer {
    next: u64,
    pending: BTreeMap<u64, SynthesizedAudio>,
}

impl Resequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one item; returns everything now ready, in order.
    pub fn push(&mut self, item: SynthesizedAudio) -> Vec<SynthesizedAudio> {
        let Some(seq) = item.seq else {
            return vec![item];
        };
        if seq < self.next {
            debug!(seq, "Dropping duplicate synthesis chunk");
            return Vec::new();
        }
        self.pending.insert(seq, item);
        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            ready.push(item);
            self.next += 1;
        }
        ready
    }

    /// Remaining items in order, skipping gaps. Used when the stream ends.
    pub fn flush(&mut self) -> Vec<SynthesizedAudio> {
        let rest: Vec<_> = std::mem::take(&mut self.pending).into_values().collect();
        if let Some(last) = rest.last().and_then(|i| i.seq) {
            self.next = last + 1;
        }
        rest
    }
}

/// Chunks of one synthesis job, in playback order.
pub struct SynthesisStream {
    chunks: ReceiverStream<AudioChunk>,
    outcome: Option<oneshot::Receiver<SynthesisOutcome>>,
    task: JoinHandle<()>,
}

impl SynthesisStream {
    /// How the job ended. Call after the stream has been exhausted.
    pub async fn outcome(&mut self) -> SynthesisOutcome {
        match self.outcome.take() {
            Some(rx) => rx.await.unwrap_or(SynthesisOutcome::Cancelled { chunks: 0 }),
            None => SynthesisOutcome::Cancelled { chunks: 0 },
        }
    }
}

impl Stream for SynthesisStream {
    type Item = AudioChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<AudioChunk>> {
        Pin::new(&mut self.chunks).poll_next(cx)
    }
}

impl Drop for SynthesisStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Clone)]
pub struct StreamingSynthesisClient {
    backends: Vec<Arc<dyn SynthesisBackend>>,
    config: SynthesisConfig,
}

impl StreamingSynthesisClient {
    pub fn new(backends: Vec<Arc<dyn SynthesisBackend>>, config: SynthesisConfig) -> Self {
        Self { backends, config }
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    /// Start producing audio for `job`. Must be called inside a tokio runtime.
    pub fn synthesize(&self, job: &SynthesisJob) -> SynthesisStream {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let backends = self.backends.clone();
        let config = self.config.clone();
        let job = job.clone();

        let task = tokio::spawn(async move {
            let outcome = produce(&backends, &job, &config, &tx).await;
            match &outcome {
                SynthesisOutcome::Completed { backend, chunks } => {
                    debug!(job = job.id, backend = %backend, chunks, "Synthesis complete")
                }
                SynthesisOutcome::Cancelled { chunks } => {
                    debug!(job = job.id, chunks, "Synthesis cancelled")
                }
                other => warn!(job = job.id, "Synthesis ended early: {:?}", other),
            }
            let _ = outcome_tx.send(outcome);
        });

        SynthesisStream {
            chunks: ReceiverStream::new(rx),
            outcome: Some(outcome_rx),
            task,
        }
    }
}

enum Delivery {
    Sent,
    Stopped,
}

async fn deliver(
    tx: &mpsc::Sender<AudioChunk>,
    cancel: &CancellationToken,
    index: &mut usize,
    audio: SynthesizedAudio,
) -> Delivery {
    if audio.data.is_empty() {
        return Delivery::Sent;
    }
    if cancel.is_cancelled() {
        return Delivery::Stopped;
    }
    let chunk = AudioChunk {
        index: *index,
        data: audio.data,
        encoding: audio.encoding,
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Delivery::Stopped,
        sent = tx.send(chunk) => match sent {
            Ok(()) => {
                *index += 1;
                Delivery::Sent
            }
            Err(_) => Delivery::Stopped,
        },
    }
}

/// Open `backend` and pull until it yields its first audio.
async fn open_first(
    backend: &dyn SynthesisBackend,
    text: &str,
    rate: SpeechRate,
) -> VoiceResult<(ChunkStream, Resequencer, Vec<SynthesizedAudio>)> {
    let mut stream = backend.open(text, rate).await?;
    let mut resequencer = Resequencer::new();
    loop {
        match stream.next().await {
            Some(Ok(item)) => {
                let ready: Vec<_> = resequencer
                    .push(item)
                    .into_iter()
                    .filter(|a| !a.data.is_empty())
                    .collect();
                if !ready.is_empty() {
                    return Ok((stream, resequencer, ready));
                }
            }
            Some(Err(e)) => return Err(e),
            None => {
                let rest: Vec<_> = resequencer.flush().into_iter().filter(|a| !a.data.is_empty()).collect();
                if rest.is_empty() {
                    return Err(VoiceError::unavailable(backend.name(), "stream ended without audio"));
                }
                return Ok((stream, resequencer, rest));
            }
        }
    }
}

async fn produce(
    backends: &[Arc<dyn SynthesisBackend>],
    job: &SynthesisJob,
    config: &SynthesisConfig,
    tx: &mpsc::Sender<AudioChunk>,
) -> SynthesisOutcome {
    let cancel = &job.cancel;
    let mut failures = Vec::new();

    for (attempt, backend) in backends.iter().enumerate() {
        if cancel.is_cancelled() {
            return SynthesisOutcome::Cancelled { chunks: 0 };
        }
        let budget = if attempt == 0 {
            config.first_chunk_budget
        } else {
            config.fallback_budget
        };
        let started = Instant::now();

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SynthesisOutcome::Cancelled { chunks: 0 },
            opened = tokio::time::timeout(budget, open_first(backend.as_ref(), &job.text, job.rate)) => opened,
        };
        let (mut stream, mut resequencer, first) = match opened {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                warn!(backend = backend.name(), "Synthesis backend failed: {}", e);
                failures.push(format!("{}: {}", backend.name(), e));
                continue;
            }
            Err(_) => {
                warn!(backend = backend.name(), ?budget, "Synthesis backend missed first-chunk budget");
                failures.push(format!("{}: no audio within {:?}", backend.name(), budget));
                continue;
            }
        };

        info!(
            target: "tutor::voice",
            backend = backend.name(),
            job = job.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "🔊 First synthesis chunk"
        );

        // Committed: no fallback from here on.
        let name = backend.name().to_string();
        let mut index = 0usize;
        for audio in first {
            if let Delivery::Stopped = deliver(tx, cancel, &mut index, audio).await {
                return SynthesisOutcome::Cancelled { chunks: index };
            }
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return SynthesisOutcome::Cancelled { chunks: index },
                next = tokio::time::timeout(config.stall_timeout, stream.next()) => next,
            };
            match next {
                Err(_) => {
                    return SynthesisOutcome::Truncated {
                        backend: name,
                        chunks: index,
                        reason: format!("stalled for {:?}", config.stall_timeout),
                    }
                }
                Ok(None) => {
                    for audio in resequencer.flush() {
                        if let Delivery::Stopped = deliver(tx, cancel, &mut index, audio).await {
                            return SynthesisOutcome::Cancelled { chunks: index };
                        }
                    }
                    return SynthesisOutcome::Completed { backend: name, chunks: index };
                }
                Ok(Some(Err(e))) => {
                    return SynthesisOutcome::Truncated {
                        backend: name,
                        chunks: index,
                        reason: e.to_string(),
                    }
                }
                Ok(Some(Ok(item))) => {
                    for audio in resequencer.push(item) {
                        if let Delivery::Stopped = deliver(tx, cancel, &mut index, audio).await {
                            return SynthesisOutcome::Cancelled { chunks: index };
                        }
                    }
                }
            }
        }
    }

    SynthesisOutcome::Exhausted { failures }
}

/// Re-frame a byte stream so every item holds whole 16-bit samples.
fn align_pcm16<S>(bytes: S, sample_rate: u32, backend: &'static str) -> ChunkStream
where
    S: Stream<Item = Result<Vec<u8>, VoiceError>> + Send + 'static,
{
    bytes
        .scan(None::<u8>, move |carry, item| {
            let out = item.map(|data| {
                let mut joined = Vec::with_capacity(data.len() + 1);
                joined.extend(carry.take());
                joined.extend_from_slice(&data);
                if joined.len() % 2 == 1 {
                    *carry = joined.pop();
                }
                SynthesizedAudio::pcm16(sample_rate, joined)
            });
            if let Err(e) = &out {
                debug!(backend, "synthesis stream error: {}", e);
            }
            futures::future::ready(Some(out))
        })
        .boxed()
}

/// ElevenLabs HTTP streaming endpoint with raw PCM output.
/// Uses `ELEVENLABS_API_KEY` and `ELEVENLABS_VOICE_ID`.
#[derive(Debug, Clone)]
pub struct ElevenLabsStreamingBackend {
    pub base_url: String,
    pub api_key: String,
    pub voice_id: String,
    pub model_id: String,
    pub sample_rate: u32,
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
    client: reqwest::Client,
}

impl ElevenLabsStreamingBackend {
    pub fn new(api_key: impl Into<String>, voice_id: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            base_url: "https://api.elevenlabs.io".to_string(),
            api_key: api_key.into(),
            voice_id: voice_id.into(),
            model_id: "eleven_flash_v2_5".to_string(),
            sample_rate: 16000,
            stability: 0.6,
            similarity_boost: 0.8,
            style: 0.1,
            client,
        })
    }

    pub fn from_env() -> VoiceResult<Self> {
        let api_key = std::env::var("ELEVENLABS_API_KEY")
            .map_err(|_| VoiceError::Config("ELEVENLABS_API_KEY not set".to_string()))?;
        let voice_id = std::env::var("ELEVENLABS_VOICE_ID").unwrap_or_else(|_| "21m00Tcm4TlvDq8ikWAM".to_string());
        Self::new(api_key, voice_id)
    }

    fn url(&self) -> String {
        format!(
            "{}/v1/text-to-speech/{}/stream?output_format=pcm_{}",
            self.base_url.trim_end_matches('/'),
            self.voice_id,
            self.sample_rate
        )
    }
}

#[async_trait]
impl SynthesisBackend for ElevenLabsStreamingBackend {
    fn name(&self) -> &str {
        "elevenlabs"
    }

    async fn open(&self, text: &str, rate: SpeechRate) -> VoiceResult<ChunkStream> {
        let body = json!({
            "text": text,
            "model_id": self.model_id,
            "voice_settings": {
                "stability": self.stability,
                "similarity_boost": self.similarity_boost,
                "style": self.style,
                "speed": rate.multiplier(),
            },
        });
        let res = self
            .client
            .post(self.url())
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/pcm")
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::unavailable("elevenlabs", e))?;
        if !res.status().is_success() {
            let status = res.status();
            let detail = res.text().await.unwrap_or_default();
            return Err(VoiceError::unavailable("elevenlabs", format!("HTTP {}: {}", status, detail)));
        }

        let bytes = res.bytes_stream().map(|item| {
            item.map(|b| b.to_vec())
                .map_err(|e| VoiceError::unavailable("elevenlabs", e))
        });
        Ok(align_pcm16(bytes, self.sample_rate, "elevenlabs"))
    }
}

/// OpenAI-compatible request/response speech API (`/audio/speech`, MP3).
/// Uses `TTS_API_URL`, `TTS_API_KEY`, `TTS_MODEL` and `TTS_VOICE`.
#[derive(Debug, Clone)]
pub struct HttpSpeechBackend {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    client: reqwest::Client,
}

impl HttpSpeechBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: voice.into(),
            client,
        })
    }

    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("TTS_API_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("TTS_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| VoiceError::Config("TTS requires TTS_API_KEY or OPENAI_API_KEY".to_string()))?;
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        let voice = std::env::var("TTS_VOICE").unwrap_or_else(|_| "nova".to_string());
        Self::new(base_url, api_key, model, voice)
    }
}

#[async_trait]
impl SynthesisBackend for HttpSpeechBackend {
    fn name(&self) -> &str {
        "http-speech"
    }

    async fn open(&self, text: &str, rate: SpeechRate) -> VoiceResult<ChunkStream> {
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "response_format": "mp3",
            "speed": rate.multiplier(),
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::unavailable("http-speech", e))?;
        if !res.status().is_success() {
            let status = res.status();
            let detail = res.text().await.unwrap_or_default();
            return Err(VoiceError::unavailable("http-speech", format!("HTTP {}: {}", status, detail)));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| VoiceError::unavailable("http-speech", e))?;
        let audio = SynthesizedAudio {
            data: bytes.to_vec(),
            encoding: ChunkEncoding::Container,
            seq: None,
        };
        Ok(stream::once(async move { Ok(audio) }).boxed())
    }
}

/// Local Piper process writing raw PCM16 to stdout.
/// Uses `PIPER_BINARY` (default `piper`), `PIPER_MODEL` and `PIPER_SAMPLE_RATE`.
#[derive(Debug, Clone)]
pub struct PiperBackend {
    pub binary: String,
    pub model: String,
    pub sample_rate: u32,
}

impl PiperBackend {
    pub fn new(binary: impl Into<String>, model: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            binary: binary.into(),
            model: model.into(),
            sample_rate,
        }
    }

    pub fn from_env() -> VoiceResult<Self> {
        let model = std::env::var("PIPER_MODEL").map_err(|_| VoiceError::Config("PIPER_MODEL not set".to_string()))?;
        let binary = std::env::var("PIPER_BINARY").unwrap_or_else(|_| "piper".to_string());
        let sample_rate = std::env::var("PIPER_SAMPLE_RATE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(22050);
        Ok(Self::new(binary, model, sample_rate))
    }
}

#[async_trait]
impl SynthesisBackend for PiperBackend {
    fn name(&self) -> &str {
        "piper"
    }

    async fn open(&self, text: &str, rate: SpeechRate) -> VoiceResult<ChunkStream> {
        let length_scale = 1.0 / rate.multiplier();
        let mut child = tokio::process::Command::new(&self.binary)
            .arg("--model")
            .arg(&self.model)
            .arg("--output-raw")
            .arg("--length_scale")
            .arg(format!("{:.2}", length_scale))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::unavailable("piper", e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::unavailable("piper", "stdin not captured"))?;
        stdin.write_all(text.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VoiceError::unavailable("piper", "stdout not captured"))?;

        // The child rides along in the stream state so dropping the stream kills it.
        let bytes = stream::unfold((child, stdout), |(child, mut stdout)| async move {
            let mut buf = vec![0u8; 4096];
            match stdout.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(buf), (child, stdout)))
                }
                Err(e) => Some((Err(VoiceError::unavailable("piper", e)), (child, stdout))),
            }
        });
        Ok(align_pcm16(bytes, self.sample_rate, "piper"))
    }
}

/// Last link in the chain: logs the text and produces no audio.
#[derive(Debug, Clone, Default)]
pub struct SilentBackend;

#[async_trait]
impl SynthesisBackend for SilentBackend {
    fn name(&self) -> &str {
        "silent"
    }

    async fn open(&self, text: &str, _rate: SpeechRate) -> VoiceResult<ChunkStream> {
        info!(target: "tutor::voice", "🔇 (no audio) {}", text);
        Ok(stream::empty().boxed())
    }
}

/// Build the fallback chain from whatever the environment configures,
/// always ending with [`SilentBackend`].
pub fn create_synthesis_chain() -> Vec<Arc<dyn SynthesisBackend>> {
    let mut chain: Vec<Arc<dyn SynthesisBackend>> = Vec::new();
    match ElevenLabsStreamingBackend::from_env() {
        Ok(backend) => chain.push(Arc::new(backend)),
        Err(e) => debug!("ElevenLabs not configured: {}", e),
    }
    match HttpSpeechBackend::from_env() {
        Ok(backend) => chain.push(Arc::new(backend)),
        Err(e) => debug!("HTTP speech not configured: {}", e),
    }
    match PiperBackend::from_env() {
        Ok(backend) => chain.push(Arc::new(backend)),
        Err(e) => debug!("Piper not configured: {}", e),
    }
    chain.push(Arc::new(SilentBackend));
    chain
}
