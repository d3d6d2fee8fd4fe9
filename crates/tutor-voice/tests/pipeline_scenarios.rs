//! End-to-end turn pipeline scenarios
//!
//! Everything runs headless: audio is injected through the pipeline handle,
//! the VAD is the energy detector and the speaker is a recording device.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tutor_voice::audio::{f32_to_pcm16, pcm16_to_bytes};
use tutor_voice::reply::ChatMessage;
use tutor_voice::synthesis::{ChunkStream, SynthesizedAudio};
use tutor_voice::{
    AudioFrame, AudioFrameSink, AudioInput, ControlCommand, EnergyDetector, ErrorKind, LanguageHint, OutputDevice, PipelineConfig,
    PipelineEvent, PipelineHandle, PipelineParts, PipelineState, PlaybackConfig, ReplyClient, ReplyEngine, ReplySource,
    SinkEvent, Speaker, SpeechDetector, SpeechRate, StaleRequestPolicy, StreamingSynthesisClient, SynthesisBackend,
    TeachingMode, TranscriptionClient, TranscriptionEngine, Utterance, VoiceError, VoiceResult,
};

const RATE: u32 = 16000;
const GREETING: &str = "Bonjour ! Comment vas-tu ?";

struct FixedTranscriber {
    text: String,
    calls: AtomicUsize,
}

impl FixedTranscriber {
    fn new(text: &str) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TranscriptionEngine for FixedTranscriber {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn transcribe(&self, _samples: &[f32], _rate: u32, _hint: &LanguageHint) -> VoiceResult<Utterance> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Utterance {
            text: self.text.clone(),
            language: "fr".to_string(),
        })
    }
}

/// Every call fails as if the STT service timed out.
struct FailingTranscriber;

#[async_trait]
impl TranscriptionEngine for FailingTranscriber {
    fn name(&self) -> &str {
        "failing"
    }

    async fn transcribe(&self, _samples: &[f32], _rate: u32, _hint: &LanguageHint) -> VoiceResult<Utterance> {
        Err(VoiceError::timeout("failing", Duration::from_secs(15)))
    }
}

struct SlowReplier {
    text: String,
    delay: Duration,
    calls: AtomicUsize,
}

impl SlowReplier {
    fn new(text: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            delay,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ReplyEngine for SlowReplier {
    fn name(&self) -> &str {
        "slow"
    }

    async fn complete(&self, _messages: &[ChatMessage]) -> VoiceResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.text.clone())
    }
}

/// Chunk `i` is a constant tone of amplitude `(i + 1) * 0.1`.
struct ToneBackend {
    chunks: usize,
    chunk_ms: usize,
    texts: Mutex<Vec<String>>,
}

impl ToneBackend {
    fn new(chunks: usize, chunk_ms: usize) -> Arc<Self> {
        Arc::new(Self {
            chunks,
            chunk_ms,
            texts: Mutex::new(Vec::new()),
        })
    }

    fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SynthesisBackend for ToneBackend {
    fn name(&self) -> &str {
        "tone"
    }

    async fn open(&self, text: &str, _rate: SpeechRate) -> VoiceResult<ChunkStream> {
        self.texts.lock().unwrap().push(text.to_string());
        let samples_per_chunk = RATE as usize * self.chunk_ms / 1000;
        Ok(stream::iter(0..self.chunks)
            .then(move |i| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let tone = vec![(i + 1) as f32 * 0.1; samples_per_chunk];
                Ok(SynthesizedAudio::pcm16(RATE, pcm16_to_bytes(&f32_to_pcm16(&tone))))
            })
            .boxed())
    }
}

/// Connects, then never delivers audio.
struct StuckBackend {
    texts: Mutex<Vec<String>>,
}

#[async_trait]
impl SynthesisBackend for StuckBackend {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn open(&self, text: &str, _rate: SpeechRate) -> VoiceResult<ChunkStream> {
        self.texts.lock().unwrap().push(text.to_string());
        Ok(stream::pending().boxed())
    }
}

/// Tone at 0.1, then a chunk with an odd byte count, then a tone at 0.3.
struct GlitchBackend;

#[async_trait]
impl SynthesisBackend for GlitchBackend {
    fn name(&self) -> &str {
        "glitch"
    }

    async fn open(&self, _text: &str, _rate: SpeechRate) -> VoiceResult<ChunkStream> {
        let tone = |amplitude: f32| {
            let samples = vec![amplitude; RATE as usize * 60 / 1000];
            SynthesizedAudio::pcm16(RATE, pcm16_to_bytes(&f32_to_pcm16(&samples)))
        };
        let items: Vec<VoiceResult<SynthesizedAudio>> = vec![
            Ok(tone(0.1)),
            Ok(SynthesizedAudio::pcm16(RATE, vec![1, 2, 3])),
            Ok(tone(0.3)),
        ];
        Ok(stream::iter(items).boxed())
    }
}

struct Recorder(Arc<Mutex<Vec<f32>>>);

impl OutputDevice for Recorder {
    fn write(&mut self, samples: &[f32], _sample_rate: u32) -> VoiceResult<()> {
        self.0.lock().unwrap().extend_from_slice(samples);
        Ok(())
    }

    fn silence(&mut self) {}
}

struct Rig {
    handle: PipelineHandle,
    events: broadcast::Receiver<PipelineEvent>,
    sink: AudioFrameSink,
    sink_events: mpsc::UnboundedReceiver<SinkEvent>,
    played: Arc<Mutex<Vec<f32>>>,
}

fn rig(
    config: PipelineConfig,
    transcriber: Arc<dyn TranscriptionEngine>,
    replier: Arc<dyn ReplyEngine>,
    backends: Vec<Arc<dyn SynthesisBackend>>,
) -> Rig {
    rig_with_input(config, transcriber, replier, backends, AudioInput::Injected)
}

fn rig_with_input(
    config: PipelineConfig,
    transcriber: Arc<dyn TranscriptionEngine>,
    replier: Arc<dyn ReplyEngine>,
    backends: Vec<Arc<dyn SynthesisBackend>>,
    input: AudioInput,
) -> Rig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let played = Arc::new(Mutex::new(Vec::new()));
    let device = Arc::clone(&played);
    let (sink_tx, sink_events) = mpsc::unbounded_channel();
    let sink = AudioFrameSink::spawn(
        PlaybackConfig::default(),
        move || Ok(Box::new(Recorder(device)) as Box<dyn OutputDevice>),
        Some(sink_tx),
    )
    .unwrap();

    let parts = PipelineParts {
        transcriber: TranscriptionClient::new(transcriber, config.transcription.clone()),
        replier: ReplyClient::new(replier, config.reply.clone()),
        synthesizer: StreamingSynthesisClient::new(backends, config.synthesis.clone()),
        sink: sink.clone(),
        detector: Box::new(|| Box::new(EnergyDetector::default()) as Box<dyn SpeechDetector>),
    };
    let handle = tutor_voice::TurnPipeline::spawn(config, parts, input).unwrap();
    let events = handle.subscribe();
    Rig {
        handle,
        events,
        sink,
        sink_events,
        played,
    }
}

fn speech(ms: usize) -> Vec<f32> {
    vec![0.3; RATE as usize * ms / 1000]
}

/// Speak for `ms`, then enough silence to close the turn.
fn say(handle: &PipelineHandle, ms: usize) {
    handle.push_audio(&speech(ms)).unwrap();
    handle.push_silence(20).unwrap();
}

/// Distinct consecutive amplitude levels, in tenths.
fn levels(played: &[f32]) -> Vec<u32> {
    let mut out: Vec<u32> = Vec::new();
    for sample in played {
        let level = (sample * 10.0).round() as u32;
        if out.last() != Some(&level) {
            out.push(level);
        }
    }
    out
}

async fn next_matching<F>(rx: &mut broadcast::Receiver<PipelineEvent>, within: Duration, f: F) -> Option<PipelineEvent>
where
    F: Fn(&PipelineEvent) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            match rx.recv().await {
                Ok(event) if f(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

fn is_metrics(event: &PipelineEvent) -> bool {
    matches!(event, PipelineEvent::TurnMetrics(_))
}

#[tokio::test]
async fn silence_only_skips_the_reply() {
    let transcriber = FixedTranscriber::new("should not be used");
    let replier = SlowReplier::new(GREETING, Duration::ZERO);
    let mut rig = rig(
        PipelineConfig::default(),
        transcriber.clone(),
        replier.clone(),
        vec![ToneBackend::new(1, 20)],
    );

    rig.handle.submit_turn(vec![0.0; RATE as usize]).unwrap();
    let back_to_idle = next_matching(&mut rig.events, Duration::from_secs(2), |e| {
        matches!(
            e,
            PipelineEvent::StateChanged {
                from: PipelineState::Transcribing,
                to: PipelineState::Idle
            }
        )
    })
    .await;

    assert!(back_to_idle.is_some());
    assert_eq!(transcriber.calls.load(Ordering::SeqCst), 0);
    assert_eq!(replier.calls.load(Ordering::SeqCst), 0);
    let session = rig.handle.stop().await.unwrap();
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn greeting_is_answered_and_played_in_order() {
    let replier = SlowReplier::new(GREETING, Duration::ZERO);
    let tts = ToneBackend::new(5, 100);
    let mut rig = rig(
        PipelineConfig::default(),
        FixedTranscriber::new("Bonjour"),
        replier.clone(),
        vec![tts.clone()],
    );

    say(&rig.handle, 400);

    let user = next_matching(&mut rig.events, Duration::from_secs(2), |e| {
        matches!(e, PipelineEvent::UserText { .. })
    })
    .await;
    assert!(matches!(user, Some(PipelineEvent::UserText { ref text, .. }) if text == "Bonjour"));
    assert!(next_matching(&mut rig.events, Duration::from_secs(5), is_metrics).await.is_some());
    assert_eq!(rig.handle.state(), PipelineState::Idle);

    assert_eq!(levels(&rig.played.lock().unwrap()), vec![1, 2, 3, 4, 5]);
    let mut started = Vec::new();
    while let Ok(event) = rig.sink_events.try_recv() {
        if let SinkEvent::ChunkStarted { index } = event {
            started.push(index);
        }
    }
    assert_eq!(started, vec![0, 1, 2, 3, 4]);
    assert_eq!(tts.texts(), vec![GREETING.to_string()]);
    assert_eq!(replier.calls.load(Ordering::SeqCst), 1);

    let session = rig.handle.stop().await.unwrap();
    let history: Vec<_> = session.history().iter().map(|e| (e.speaker, e.text.as_str())).collect();
    assert_eq!(history, vec![(Speaker::User, "Bonjour"), (Speaker::Tutor, GREETING)]);
}

#[tokio::test]
async fn barge_in_cuts_the_reply_and_opens_a_new_turn() {
    let mut rig = rig(
        PipelineConfig::default(),
        FixedTranscriber::new("Bonjour"),
        SlowReplier::new(GREETING, Duration::ZERO),
        vec![ToneBackend::new(5, 500)],
    );

    say(&rig.handle, 400);
    let third_chunk = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = rig.sink_events.recv().await {
            if event == (SinkEvent::ChunkStarted { index: 2 }) {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(third_chunk, Ok(true));

    rig.handle.push_audio(&speech(200)).unwrap();
    let barge_in = next_matching(&mut rig.events, Duration::from_secs(1), |e| {
        matches!(e, PipelineEvent::BargeIn { .. })
    })
    .await;
    assert!(matches!(barge_in, Some(PipelineEvent::BargeIn { job_id: Some(1) })));
    assert!(rig.handle.wait_for_state(PipelineState::Listening, Duration::from_millis(200)).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.sink.buffered(), Duration::ZERO);
    assert!(!rig.sink.is_speaking());

    tokio::time::sleep(Duration::from_millis(800)).await;
    let heard = levels(&rig.played.lock().unwrap());
    assert!(heard.starts_with(&[1, 2, 3]));
    assert!(!heard.contains(&4) && !heard.contains(&5), "heard {:?}", heard);
    assert_eq!(rig.handle.state(), PipelineState::Listening);

    rig.handle.stop().await.unwrap();
}

#[tokio::test]
async fn stuck_backend_falls_back_with_the_full_text_once() {
    let mut config = PipelineConfig::default();
    config.synthesis.first_chunk_budget = Duration::from_millis(150);
    let stuck = Arc::new(StuckBackend {
        texts: Mutex::new(Vec::new()),
    });
    let backup = ToneBackend::new(3, 60);
    let mut rig = rig(
        config,
        FixedTranscriber::new("Bonjour"),
        SlowReplier::new(GREETING, Duration::ZERO),
        vec![stuck.clone(), backup.clone()],
    );

    rig.handle.submit_text("Bonjour").unwrap();
    assert!(next_matching(&mut rig.events, Duration::from_secs(5), is_metrics).await.is_some());

    assert_eq!(*stuck.texts.lock().unwrap(), vec![GREETING.to_string()]);
    assert_eq!(backup.texts(), vec![GREETING.to_string()]);
    assert_eq!(levels(&rig.played.lock().unwrap()), vec![1, 2, 3]);
    rig.handle.stop().await.unwrap();
}

#[tokio::test]
async fn repeat_twice_is_idempotent() {
    let replier = SlowReplier::new(GREETING, Duration::ZERO);
    let mut rig = rig(
        PipelineConfig::default(),
        FixedTranscriber::new("Bonjour"),
        replier.clone(),
        vec![ToneBackend::new(1, 20)],
    );

    rig.handle.submit_text("Bonjour").unwrap();
    assert!(next_matching(&mut rig.events, Duration::from_secs(2), is_metrics).await.is_some());

    let mut repeats = Vec::new();
    for _ in 0..2 {
        rig.handle.command(ControlCommand::Teach(TeachingMode::Repeat)).unwrap();
        let reply = next_matching(&mut rig.events, Duration::from_secs(2), |e| {
            matches!(e, PipelineEvent::ReplyText { .. })
        })
        .await;
        match reply {
            Some(PipelineEvent::ReplyText { text, source, mode, .. }) => {
                assert_eq!(source, ReplySource::Cache);
                assert_eq!(mode, TeachingMode::Repeat);
                repeats.push(text);
            }
            other => panic!("expected a reply, got {:?}", other),
        }
        assert!(next_matching(&mut rig.events, Duration::from_secs(2), is_metrics).await.is_some());
    }

    assert_eq!(repeats, vec![GREETING.to_string(), GREETING.to_string()]);
    assert_eq!(replier.calls.load(Ordering::SeqCst), 1);
    let session = rig.handle.stop().await.unwrap();
    assert_eq!(session.history().len(), 2);
}

#[tokio::test]
async fn reply_timeout_apologises_without_a_phantom_turn() {
    let mut config = PipelineConfig::default();
    config.reply.deadline = Duration::from_millis(200);
    let tts = ToneBackend::new(2, 40);
    let mut rig = rig(
        config,
        FixedTranscriber::new("Bonjour"),
        SlowReplier::new(GREETING, Duration::from_secs(5)),
        vec![tts.clone()],
    );

    say(&rig.handle, 300);
    let reply = next_matching(&mut rig.events, Duration::from_secs(3), |e| {
        matches!(e, PipelineEvent::ReplyText { .. })
    })
    .await;
    let apology = match reply {
        Some(PipelineEvent::ReplyText {
            text,
            source: ReplySource::Apology,
            spoken: true,
            ..
        }) => text,
        other => panic!("expected a spoken apology, got {:?}", other),
    };
    assert!(next_matching(&mut rig.events, Duration::from_secs(3), is_metrics).await.is_some());
    assert!(rig.handle.wait_for_state(PipelineState::Idle, Duration::from_secs(1)).await);
    assert_eq!(tts.texts(), vec![apology]);

    let session = rig.handle.stop().await.unwrap();
    let history: Vec<_> = session.history().iter().map(|e| (e.speaker, e.text.as_str())).collect();
    assert_eq!(history, vec![(Speaker::User, "Bonjour")]);
    assert!(session.last_reply().is_none());
}

#[tokio::test]
async fn queued_turn_supersedes_the_pending_reply() {
    let replier = SlowReplier::new(GREETING, Duration::from_millis(400));
    let mut rig = rig(
        PipelineConfig::default(),
        FixedTranscriber::new("Bonjour"),
        replier.clone(),
        vec![ToneBackend::new(1, 20)],
    );

    say(&rig.handle, 300);
    assert!(rig.handle.wait_for_state(PipelineState::Generating, Duration::from_secs(2)).await);
    say(&rig.handle, 300);

    let mut spoken = Vec::new();
    for _ in 0..2 {
        match next_matching(&mut rig.events, Duration::from_secs(3), |e| {
            matches!(e, PipelineEvent::ReplyText { .. })
        })
        .await
        {
            Some(PipelineEvent::ReplyText { spoken: s, .. }) => spoken.push(s),
            other => panic!("expected a reply, got {:?}", other),
        }
    }
    assert_eq!(spoken, vec![false, true]);
    assert!(next_matching(&mut rig.events, Duration::from_secs(3), is_metrics).await.is_some());

    let session = rig.handle.stop().await.unwrap();
    assert_eq!(session.history().len(), 4);
    assert_eq!(replier.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn abandon_policy_drops_the_stale_reply() {
    let mut config = PipelineConfig::default();
    config.stale_policy = StaleRequestPolicy::Abandon;
    let replier = SlowReplier::new(GREETING, Duration::from_millis(400));
    let mut rig = rig(
        config,
        FixedTranscriber::new("Bonjour"),
        replier.clone(),
        vec![ToneBackend::new(1, 20)],
    );

    say(&rig.handle, 300);
    assert!(rig.handle.wait_for_state(PipelineState::Generating, Duration::from_secs(2)).await);
    rig.handle.push_audio(&speech(300)).unwrap();
    assert!(rig.handle.wait_for_state(PipelineState::Listening, Duration::from_secs(1)).await);
    rig.handle.push_silence(20).unwrap();

    let mut replies = 0;
    while next_matching(&mut rig.events, Duration::from_secs(2), |e| {
        matches!(e, PipelineEvent::ReplyText { .. })
    })
    .await
    .is_some()
    {
        replies += 1;
    }
    assert_eq!(replies, 1);
    assert_eq!(replier.calls.load(Ordering::SeqCst), 2);

    let session = rig.handle.stop().await.unwrap();
    assert_eq!(session.history().len(), 2);
}

#[tokio::test]
async fn stop_speaking_command_silences_and_returns_to_idle() {
    let mut rig = rig(
        PipelineConfig::default(),
        FixedTranscriber::new("Bonjour"),
        SlowReplier::new(GREETING, Duration::ZERO),
        vec![ToneBackend::new(4, 500)],
    );

    rig.handle.submit_text("Bonjour").unwrap();
    assert!(rig.handle.wait_for_state(PipelineState::Speaking, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    rig.handle.command(ControlCommand::StopSpeaking).unwrap();

    assert!(rig.handle.wait_for_state(PipelineState::Idle, Duration::from_millis(300)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!rig.sink.is_speaking());
    assert_eq!(rig.sink.buffered(), Duration::ZERO);
    rig.handle.stop().await.unwrap();
}

#[tokio::test]
async fn undecodable_chunk_is_skipped_and_playback_continues() {
    let mut rig = rig(
        PipelineConfig::default(),
        FixedTranscriber::new("Bonjour"),
        SlowReplier::new(GREETING, Duration::ZERO),
        vec![Arc::new(GlitchBackend)],
    );

    rig.handle.submit_text("Bonjour").unwrap();
    let error = next_matching(&mut rig.events, Duration::from_secs(2), |e| {
        matches!(e, PipelineEvent::Error { .. })
    })
    .await;
    match error {
        Some(PipelineEvent::Error {
            kind: ErrorKind::Playback,
            message,
        }) => assert!(message.contains("chunk 1"), "{}", message),
        other => panic!("expected a playback error, got {:?}", other),
    }

    match next_matching(&mut rig.events, Duration::from_secs(3), is_metrics).await {
        Some(PipelineEvent::TurnMetrics(metrics)) => assert_eq!(metrics.chunks_played, 2),
        other => panic!("expected metrics, got {:?}", other),
    }
    assert_eq!(levels(&rig.played.lock().unwrap()), vec![1, 3]);
    assert!(rig.handle.wait_for_state(PipelineState::Idle, Duration::from_secs(1)).await);

    let session = rig.handle.stop().await.unwrap();
    assert_eq!(session.history().len(), 2);
}

#[tokio::test]
async fn failed_transcription_reports_and_returns_to_idle() {
    let replier = SlowReplier::new(GREETING, Duration::ZERO);
    let tts = ToneBackend::new(1, 20);
    let mut rig = rig(
        PipelineConfig::default(),
        Arc::new(FailingTranscriber),
        replier.clone(),
        vec![tts.clone()],
    );

    say(&rig.handle, 300);
    let error = next_matching(&mut rig.events, Duration::from_secs(2), |e| {
        matches!(e, PipelineEvent::Error { .. })
    })
    .await;
    assert!(
        matches!(
            error,
            Some(PipelineEvent::Error {
                kind: ErrorKind::Transcription,
                ..
            })
        ),
        "got {:?}",
        error
    );
    assert!(rig.handle.wait_for_state(PipelineState::Idle, Duration::from_secs(1)).await);

    assert_eq!(replier.calls.load(Ordering::SeqCst), 0);
    assert!(tts.texts().is_empty());
    let session = rig.handle.stop().await.unwrap();
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn losing_the_frame_source_is_fatal() {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel::<AudioFrame>();
    let mut rig = rig_with_input(
        PipelineConfig::default(),
        FixedTranscriber::new("Bonjour"),
        SlowReplier::new(GREETING, Duration::ZERO),
        vec![ToneBackend::new(1, 20)],
        AudioInput::Frames(frames_rx),
    );

    drop(frames_tx);
    let error = next_matching(&mut rig.events, Duration::from_secs(2), |e| {
        matches!(e, PipelineEvent::Error { .. })
    })
    .await;
    assert!(
        matches!(
            error,
            Some(PipelineEvent::Error {
                kind: ErrorKind::Device,
                ..
            })
        ),
        "got {:?}",
        error
    );
    assert!(matches!(rig.handle.stop().await, Err(VoiceError::Device(_))));
}

async fn vad_settles(handle: &PipelineHandle, active: bool) -> bool {
    tokio::time::timeout(Duration::from_secs(1), async {
        while handle.vad_active() != active {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn pcm16_speech_lights_the_vad_until_silence() {
    let mut rig = rig(
        PipelineConfig::default(),
        FixedTranscriber::new("Bonjour"),
        SlowReplier::new(GREETING, Duration::ZERO),
        vec![ToneBackend::new(1, 20)],
    );
    assert!(!rig.handle.vad_active());

    let bytes = pcm16_to_bytes(&f32_to_pcm16(&speech(300)));
    assert_eq!(rig.handle.push_pcm16(&bytes).unwrap(), 15);
    assert!(vad_settles(&rig.handle, true).await);
    assert!(rig.handle.wait_for_state(PipelineState::Listening, Duration::from_secs(1)).await);

    rig.handle.push_silence(20).unwrap();
    assert!(vad_settles(&rig.handle, false).await);
    let user = next_matching(&mut rig.events, Duration::from_secs(2), |e| {
        matches!(e, PipelineEvent::UserText { .. })
    })
    .await;
    assert!(matches!(user, Some(PipelineEvent::UserText { turn_id: Some(1), .. })));
    rig.handle.stop().await.unwrap();
}
