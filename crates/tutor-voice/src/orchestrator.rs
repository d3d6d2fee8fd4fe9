//! Turn pipeline - the main coordination layer
//!
//! Ties the listener, transcription, reply and synthesis clients and the
//! playback sink into one loop:
//!
//! ```text
//!  frames ─▶ listener (VAD + segmenter) ─▶ TurnEvent ─┐
//!                                                      ▼
//!   Idle ─▶ Listening ─▶ Transcribing ─▶ Generating ─▶ Speaking ─▶ Idle
//!                ▲                                        │
//!                └──────────── Interrupted ◀── barge-in ──┘
//! ```
//!
//! A single task owns the session and all state. Turn events, requests from
//! the handle and the in-flight stage are multiplexed with `select!`, so a
//! barge-in is handled while a reply is still streaming.

use crate::audio::{frame_channel, AudioFrame, FrameInjector};
use crate::config::PipelineConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::events::{ErrorKind, EventBus, PipelineEvent, TurnMetrics};
use crate::listener::{DetectorFactory, Listener};
use crate::playback::{AudioFrameSink, PlaybackTicket};
use crate::reply::{Reply, ReplyClient, ReplySource};
use crate::session::{ConversationSession, HistoryEntry, TeachingMode, TutorParams};
use crate::stt::{LanguageHint, TranscriptionClient, Utterance};
use crate::synthesis::{SpeechRate, StreamingSynthesisClient, SynthesisJob, SynthesisOutcome};
use crate::turn::TurnEvent;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Waiting for speech
    Idle,
    /// A turn is open and accumulating
    Listening,
    Transcribing,
    Generating,
    Speaking,
    /// Transient, while a barge-in tears down the current reply
    Interrupted,
}

/// What to do when the user starts a new turn while an earlier one is
/// still being transcribed or answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StaleRequestPolicy {
    /// Finish the earlier turn, then process the new one. A reply that becomes
    /// ready while newer input is waiting is shown and recorded but not spoken.
    #[default]
    Queue,
    /// Drop the in-flight result in favour of the new turn.
    Abandon,
}

/// Control-surface commands. All but `StopSpeaking` are applied between turns.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Teach(TeachingMode),
    SetParams(TutorParams),
    SetLanguageHint(LanguageHint),
    SetSpeechRate(SpeechRate),
    StopSpeaking,
    ClearHistory,
}

/// Injected collaborators.
pub struct PipelineParts {
    pub transcriber: TranscriptionClient,
    pub replier: ReplyClient,
    pub synthesizer: StreamingSynthesisClient,
    pub sink: AudioFrameSink,
    /// Runs on the listener thread
    pub detector: DetectorFactory,
}

/// Where frames come from.
pub enum AudioInput {
    /// A running capture source, e.g. [`crate::audio::AudioFrameSource::start`]
    Frames(mpsc::UnboundedReceiver<AudioFrame>),
    /// No device; audio is pushed through the [`PipelineHandle`]
    Injected,
}

pub struct TurnPipeline;

impl TurnPipeline {
    /// Validate `config`, start the listener thread and the pipeline task.
    pub fn spawn(config: PipelineConfig, parts: PipelineParts, input: AudioInput) -> VoiceResult<PipelineHandle> {
        config.validate()?;

        let (injector, frames) = match input {
            AudioInput::Frames(rx) => (None, rx),
            AudioInput::Injected => {
                let (injector, rx) = frame_channel(&config.audio);
                (Some(injector), rx)
            }
        };

        let PipelineParts {
            transcriber,
            replier,
            synthesizer,
            sink,
            detector,
        } = parts;

        let (listener, turn_rx) = Listener::spawn(frames, detector, config.turn.clone())?;
        let vad_active = listener.activity();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PipelineState::Idle);
        let events = EventBus::new(config.event_capacity);

        info!(
            target: "tutor::voice",
            stt = transcriber.engine_name(),
            tts = ?synthesizer.backend_names(),
            policy = ?config.stale_policy,
            "🎭 Turn pipeline starting"
        );

        let pipeline = Pipeline {
            session: ConversationSession::new(config.params.clone(), config.history_window),
            sample_rate: config.audio.sample_rate,
            policy: config.stale_policy,
            language_hint: config.language_hint.clone(),
            speech_rate: config.speech_rate,
            transcriber,
            replier,
            synthesizer,
            sink,
            events: events.clone(),
            state: PipelineState::Idle,
            state_tx,
            turn_rx,
            requests: requests_rx,
            listener: Some(listener),
            run: None,
            pending: VecDeque::new(),
            open_turn: None,
            next_job_id: 1,
        };
        let task = tokio::spawn(pipeline.run());

        Ok(PipelineHandle {
            requests: requests_tx,
            events,
            state: state_rx,
            injector,
            vad_active,
            task,
        })
    }
}

enum Request {
    Submit(Input),
    Command(ControlCommand),
    Shutdown,
}

enum Input {
    Turn { id: u64, samples: Vec<f32>, sample_rate: u32 },
    Recorded(Vec<f32>),
    Text(String),
    Teach(TeachingMode),
    Control(ControlCommand),
}

impl Input {
    /// Fresh user input, as opposed to commands.
    fn is_user_input(&self) -> bool {
        matches!(self, Input::Turn { .. } | Input::Recorded(_) | Input::Text(_))
    }
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    requests: mpsc::UnboundedSender<Request>,
    events: EventBus,
    state: watch::Receiver<PipelineState>,
    injector: Option<FrameInjector>,
    vad_active: Arc<AtomicBool>,
    task: JoinHandle<VoiceResult<ConversationSession>>,
}

impl PipelineHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PipelineState> {
        self.state.clone()
    }

    /// Wait until the pipeline reaches `target`. Returns false on timeout or
    /// if the pipeline stopped first.
    pub async fn wait_for_state(&self, target: PipelineState, within: Duration) -> bool {
        let mut rx = self.state.clone();
        let reached = matches!(
            tokio::time::timeout(within, rx.wait_for(|s| *s == target)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Push raw samples through the VAD. Only for pipelines built with
    /// [`AudioInput::Injected`].
    pub fn push_audio(&self, samples: &[f32]) -> VoiceResult<usize> {
        self.injector()?.push_samples(samples)
    }

    /// Push little-endian PCM16 at the pipeline sample rate.
    pub fn push_pcm16(&self, bytes: &[u8]) -> VoiceResult<usize> {
        self.injector()?.push_pcm16(bytes)
    }

    pub fn push_silence(&self, frames: usize) -> VoiceResult<usize> {
        self.injector()?.push_silence(frames)
    }

    /// Whether the VAD currently hears (possible) speech.
    pub fn vad_active(&self) -> bool {
        self.vad_active.load(Ordering::SeqCst)
    }

    /// Smoothed input level in `[0, 1]` for injected audio.
    pub fn volume_level(&self) -> f32 {
        self.injector.as_ref().map(|i| i.volume_level()).unwrap_or(0.0)
    }

    /// Process a pre-recorded utterance, bypassing the VAD.
    pub fn submit_turn(&self, samples: Vec<f32>) -> VoiceResult<()> {
        self.send(Request::Submit(Input::Recorded(samples)))
    }

    /// Process typed input, bypassing transcription.
    pub fn submit_text(&self, text: impl Into<String>) -> VoiceResult<()> {
        self.send(Request::Submit(Input::Text(text.into())))
    }

    pub fn command(&self, command: ControlCommand) -> VoiceResult<()> {
        self.send(Request::Command(command))
    }

    /// Cancel in-flight work, release the listener and return the session.
    pub async fn stop(mut self) -> VoiceResult<ConversationSession> {
        let _ = self.requests.send(Request::Shutdown);
        self.injector = None;
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(VoiceError::ChannelClosed(format!("pipeline task failed: {}", e))),
        }
    }

    fn injector(&self) -> VoiceResult<&FrameInjector> {
        self.injector
            .as_ref()
            .ok_or_else(|| VoiceError::Config("pipeline reads from a capture device; audio cannot be pushed".to_string()))
    }

    fn send(&self, request: Request) -> VoiceResult<()> {
        self.requests
            .send(request)
            .map_err(|_| VoiceError::ChannelClosed("pipeline stopped".to_string()))
    }
}

enum StageDone {
    Transcribed(VoiceResult<Utterance>),
    Replied(Reply),
    Spoke(SpeakReport),
}

/// One input travelling through transcribe -> reply -> speak.
struct Run {
    turn_id: Option<u64>,
    mode: TeachingMode,
    user_text: String,
    started: Instant,
    stage_started: Instant,
    metrics: TurnMetrics,
    job: Option<SynthesisJob>,
    stage: BoxFuture<'static, StageDone>,
}

#[derive(Debug, Default)]
struct SpeakReport {
    outcome: Option<SynthesisOutcome>,
    chunks: usize,
    first_audio: Option<Duration>,
    played: bool,
    failure: Option<String>,
}

struct Pipeline {
    session: ConversationSession,
    sample_rate: u32,
    policy: StaleRequestPolicy,
    language_hint: LanguageHint,
    speech_rate: SpeechRate,

    transcriber: TranscriptionClient,
    replier: ReplyClient,
    synthesizer: StreamingSynthesisClient,
    sink: AudioFrameSink,
    events: EventBus,

    state: PipelineState,
    state_tx: watch::Sender<PipelineState>,
    turn_rx: mpsc::UnboundedReceiver<TurnEvent>,
    requests: mpsc::UnboundedReceiver<Request>,
    listener: Option<Listener>,

    run: Option<Run>,
    pending: VecDeque<Input>,
    open_turn: Option<u64>,
    next_job_id: u64,
}

async fn next_stage(run: &mut Option<Run>) -> StageDone {
    match run {
        Some(run) => (&mut run.stage).await,
        None => std::future::pending().await,
    }
}

impl Pipeline {
    async fn run(mut self) -> VoiceResult<ConversationSession> {
        let fatal = loop {
            tokio::select! {
                biased;
                event = self.turn_rx.recv() => match event {
                    Some(event) => self.on_turn_event(event),
                    None => break Some(VoiceError::Device("audio input closed".to_string())),
                },
                request = self.requests.recv() => match request {
                    Some(Request::Submit(input)) => self.pending.push_back(input),
                    Some(Request::Command(ControlCommand::StopSpeaking)) => {
                        if self.stop_speaking().is_some() {
                            info!(target: "tutor::voice", "🔇 Speech stopped on request");
                        }
                    }
                    Some(Request::Command(ControlCommand::Teach(mode))) => self.pending.push_back(Input::Teach(mode)),
                    Some(Request::Command(command)) => self.pending.push_back(Input::Control(command)),
                    Some(Request::Shutdown) | None => break None,
                },
                done = next_stage(&mut self.run), if self.run.is_some() => self.on_stage_done(done),
            }
            self.advance();
        };

        self.shutdown().await;
        match fatal {
            Some(e) => {
                self.events.error(ErrorKind::Device, e.to_string());
                Err(e)
            }
            None => Ok(self.session),
        }
    }

    fn set_state(&mut self, to: PipelineState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        debug!(?from, ?to, "Pipeline state");
        let _ = self.state_tx.send(to);
        self.events.emit(PipelineEvent::StateChanged { from, to });
        if to == PipelineState::Idle {
            self.events.emit(PipelineEvent::Idle);
        }
    }

    fn on_turn_event(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::Started { turn_id, .. } => {
                self.open_turn = Some(turn_id);
                match self.state {
                    PipelineState::Idle => self.set_state(PipelineState::Listening),
                    PipelineState::Speaking => self.barge_in(turn_id),
                    PipelineState::Transcribing | PipelineState::Generating => match self.policy {
                        StaleRequestPolicy::Queue => {
                            debug!(turn_id, "New turn while busy; queued behind the current one")
                        }
                        StaleRequestPolicy::Abandon => {
                            if let Some(run) = self.run.take() {
                                info!(
                                    target: "tutor::voice",
                                    turn_id,
                                    stale = ?run.turn_id,
                                    "Abandoning stale request for newer turn"
                                );
                            }
                            self.set_state(PipelineState::Listening);
                        }
                    },
                    PipelineState::Listening | PipelineState::Interrupted => {}
                }
            }
            TurnEvent::Closed(turn) => {
                if self.open_turn == Some(turn.id) {
                    self.open_turn = None;
                }
                debug!(turn_id = turn.id, duration_ms = turn.duration().as_millis() as u64, reason = ?turn.close_reason, "Turn closed");
                self.pending.push_back(Input::Turn {
                    id: turn.id,
                    samples: turn.samples,
                    sample_rate: turn.sample_rate,
                });
            }
            TurnEvent::Discarded { turn_id } => {
                if self.open_turn == Some(turn_id) {
                    self.open_turn = None;
                }
                debug!(turn_id, "Turn too short, discarded");
            }
        }
    }

    /// Cut the current reply off. Cancelling the job and clearing the sink
    /// happen back to back on this task, so no chunk slips in between.
    fn cut_reply(&mut self) -> Option<u64> {
        let job_id = self.run.take().and_then(|run| {
            run.job.map(|job| {
                job.cancel.cancel();
                job.id
            })
        });
        self.sink.cancel();
        job_id
    }

    fn stop_speaking(&mut self) -> Option<u64> {
        if self.state != PipelineState::Speaking {
            return None;
        }
        self.cut_reply()
    }

    fn barge_in(&mut self, turn_id: u64) {
        self.set_state(PipelineState::Interrupted);
        let job_id = self.cut_reply();
        info!(target: "tutor::voice", turn_id, job = ?job_id, "✋ Barge-in, reply cancelled");
        self.events.emit(PipelineEvent::BargeIn { job_id });
        self.set_state(PipelineState::Listening);
    }

    /// Start the next queued input once nothing is in flight.
    fn advance(&mut self) {
        while self.run.is_none() {
            let Some(input) = self.pending.pop_front() else {
                let next = if self.open_turn.is_some() {
                    PipelineState::Listening
                } else {
                    PipelineState::Idle
                };
                self.set_state(next);
                return;
            };
            match input {
                Input::Control(command) => self.apply_command(command),
                Input::Turn { id, samples, sample_rate } => self.start_transcription(Some(id), samples, sample_rate),
                Input::Recorded(samples) => self.start_transcription(None, samples, self.sample_rate),
                Input::Text(text) => {
                    self.events.emit(PipelineEvent::UserText {
                        turn_id: None,
                        text: text.clone(),
                        language: self.session.params().target_language.clone(),
                    });
                    self.start_reply(None, TeachingMode::Normal, text, Instant::now(), TurnMetrics::default());
                }
                Input::Teach(TeachingMode::Normal) => debug!("Normal mode needs user input; nothing to do"),
                Input::Teach(mode) => {
                    self.start_reply(None, mode, String::new(), Instant::now(), TurnMetrics::default());
                }
            }
        }
    }

    fn apply_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::SetParams(params) => {
                info!(level = %params.level, difficulty = params.difficulty.get(), topic = %params.topic, "Tutor parameters updated");
                self.session.set_params(params);
            }
            ControlCommand::SetLanguageHint(hint) => self.language_hint = hint,
            ControlCommand::SetSpeechRate(rate) => self.speech_rate = rate,
            ControlCommand::ClearHistory => {
                info!("Conversation history cleared");
                self.session.clear();
            }
            ControlCommand::Teach(mode) => self.pending.push_front(Input::Teach(mode)),
            ControlCommand::StopSpeaking => {
                self.stop_speaking();
            }
        }
    }

    fn start_transcription(&mut self, turn_id: Option<u64>, samples: Vec<f32>, sample_rate: u32) {
        let client = self.transcriber.clone();
        let hint = self.language_hint.clone();
        let stage = async move { StageDone::Transcribed(client.transcribe(&samples, sample_rate, &hint).await) }.boxed();
        let now = Instant::now();
        self.run = Some(Run {
            turn_id,
            mode: TeachingMode::Normal,
            user_text: String::new(),
            started: now,
            stage_started: now,
            metrics: TurnMetrics {
                turn_id,
                ..TurnMetrics::default()
            },
            job: None,
            stage,
        });
        self.set_state(PipelineState::Transcribing);
    }

    fn start_reply(
        &mut self,
        turn_id: Option<u64>,
        mode: TeachingMode,
        user_text: String,
        started: Instant,
        metrics: TurnMetrics,
    ) {
        let client = self.replier.clone();
        let context: Vec<HistoryEntry> = self.session.context().to_vec();
        let last_reply = self.session.last_reply().map(str::to_string);
        let params = self.session.params().clone();
        let stage_mode = mode.clone();
        let text = user_text.clone();
        let stage = async move {
            StageDone::Replied(
                client
                    .reply(&context, last_reply.as_deref(), &params, &stage_mode, &text)
                    .await,
            )
        }
        .boxed();
        self.run = Some(Run {
            turn_id,
            mode,
            user_text,
            started,
            stage_started: Instant::now(),
            metrics,
            job: None,
            stage,
        });
        self.set_state(PipelineState::Generating);
    }

    fn on_stage_done(&mut self, done: StageDone) {
        let Some(run) = self.run.take() else {
            return;
        };
        match done {
            StageDone::Transcribed(result) => self.on_transcribed(run, result),
            StageDone::Replied(reply) => self.on_replied(run, reply),
            StageDone::Spoke(report) => self.on_spoke(run, report),
        }
    }

    fn on_transcribed(&mut self, mut run: Run, result: VoiceResult<Utterance>) {
        run.metrics.transcription = Some(run.stage_started.elapsed());
        match result {
            Err(e) => {
                warn!(turn_id = ?run.turn_id, "Transcription failed, resuming listening: {}", e);
                self.events.error(ErrorKind::Transcription, e.to_string());
            }
            Ok(utterance) if utterance.is_empty() => {
                debug!(turn_id = ?run.turn_id, "Empty transcript, no utterance");
            }
            Ok(utterance) => {
                info!(
                    target: "tutor::voice",
                    turn_id = ?run.turn_id,
                    language = %utterance.language,
                    "📝 {}",
                    utterance.text
                );
                self.events.emit(PipelineEvent::UserText {
                    turn_id: run.turn_id,
                    text: utterance.text.clone(),
                    language: utterance.language,
                });
                self.start_reply(run.turn_id, TeachingMode::Normal, utterance.text, run.started, run.metrics);
            }
        }
    }

    fn on_replied(&mut self, mut run: Run, reply: Reply) {
        run.metrics.reply = Some(run.stage_started.elapsed());
        reply.apply_to(&mut self.session, &run.mode, &run.user_text);

        if reply.source == ReplySource::Apology {
            self.events.error(ErrorKind::Reply, "reply engine unavailable; apologised");
        }

        let superseded = self.open_turn.is_some() || self.pending.iter().any(Input::is_user_input);
        let speak = reply.source != ReplySource::Notice && !superseded;
        self.events.emit(PipelineEvent::ReplyText {
            text: reply.text.clone(),
            mode: run.mode.clone(),
            source: reply.source,
            spoken: speak,
        });
        if !speak {
            if superseded {
                debug!(turn_id = ?run.turn_id, "Newer input waiting; reply shown without audio");
            }
            self.finish_run(run);
            return;
        }

        let job = SynthesisJob::new(self.next_job_id, reply.text, self.speech_rate);
        self.next_job_id += 1;
        let stage = speak_reply(
            self.synthesizer.clone(),
            self.sink.clone(),
            self.events.clone(),
            job.clone(),
            run.started,
        )
        .map(StageDone::Spoke)
        .boxed();

        self.events.emit(PipelineEvent::Speaking { job_id: job.id });
        self.run = Some(Run {
            stage_started: Instant::now(),
            job: Some(job),
            stage,
            ..run
        });
        self.set_state(PipelineState::Speaking);
    }

    fn on_spoke(&mut self, mut run: Run, report: SpeakReport) {
        run.metrics.first_audio = report.first_audio;
        run.metrics.chunks_played = report.chunks;
        match (&report.outcome, &report.failure) {
            (_, Some(failure)) => self.events.error(ErrorKind::Playback, failure.clone()),
            (Some(SynthesisOutcome::Exhausted { failures }), _) => {
                warn!(failures = failures.len(), "No synthesis backend produced audio; text only");
                self.events.error(
                    ErrorKind::Synthesis,
                    format!("no audio, reply shown as text ({})", failures.join("; ")),
                );
            }
            (Some(SynthesisOutcome::Truncated { backend, reason, .. }), _) => {
                self.events
                    .error(ErrorKind::Synthesis, format!("{} stopped mid-reply: {}", backend, reason));
            }
            _ => {}
        }
        if !report.played {
            debug!(job = ?run.job.as_ref().map(|j| j.id), "Playback did not drain");
        }
        self.finish_run(run);
    }

    fn finish_run(&mut self, run: Run) {
        let metrics = TurnMetrics {
            total: run.started.elapsed(),
            ..run.metrics
        };
        info!(
            target: "tutor::voice",
            turn_id = ?metrics.turn_id,
            stt_ms = ?metrics.transcription.map(|d| d.as_millis() as u64),
            reply_ms = ?metrics.reply.map(|d| d.as_millis() as u64),
            first_audio_ms = ?metrics.first_audio.map(|d| d.as_millis() as u64),
            total_ms = metrics.total.as_millis() as u64,
            "⏱️ Turn complete"
        );
        self.events.emit(PipelineEvent::TurnMetrics(metrics));
    }

    async fn shutdown(&mut self) {
        info!(target: "tutor::voice", "🛑 Turn pipeline stopping");
        if let Some(run) = self.run.take() {
            if let Some(job) = run.job {
                job.cancel.cancel();
            }
        }
        self.sink.cancel();
        self.pending.clear();
        self.open_turn = None;
        self.set_state(PipelineState::Idle);

        if let Some(listener) = self.listener.take() {
            listener.stop();
            let joined = tokio::time::timeout(
                Duration::from_millis(500),
                tokio::task::spawn_blocking(move || listener.join()),
            )
            .await;
            if joined.is_err() {
                debug!("Listener still waiting for a frame; detached");
            }
        }
    }
}

/// Stream one reply into the sink and wait for it to play out.
async fn speak_reply(
    synthesizer: StreamingSynthesisClient,
    sink: AudioFrameSink,
    events: EventBus,
    job: SynthesisJob,
    turn_started: Instant,
) -> SpeakReport {
    let ticket: PlaybackTicket = sink.begin();
    let mut stream = synthesizer.synthesize(&job);
    let mut report = SpeakReport::default();
    let mut interrupted = false;

    while let Some(chunk) = stream.next().await {
        if job.cancel.is_cancelled() {
            interrupted = true;
            break;
        }
        let index = chunk.index;
        match sink.enqueue(&ticket, chunk).await {
            Ok(()) => {
                report.chunks += 1;
                if report.first_audio.is_none() {
                    report.first_audio = Some(turn_started.elapsed());
                }
            }
            Err(e) if e.is_cancellation() => {
                job.cancel.cancel();
                interrupted = true;
                break;
            }
            Err(VoiceError::Decode(reason)) => {
                events.error(ErrorKind::Playback, format!("chunk {} dropped: {}", index, reason));
            }
            Err(e) => {
                job.cancel.cancel();
                report.failure = Some(e.to_string());
                return report;
            }
        }
    }

    if !interrupted {
        report.outcome = Some(stream.outcome().await);
    }
    drop(stream);
    sink.finish(&ticket);
    report.played = sink.drain(&ticket).await;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::PlaybackConfig;
    use crate::reply::{EchoReplyEngine, ReplyConfig};
    use crate::stt::{PlaceholderTranscriber, TranscriptionConfig};
    use crate::synthesis::{SilentBackend, SynthesisConfig};
    use crate::vad::{EnergyDetector, SpeechDetector};
    use std::sync::Arc;

    fn parts(transcript: &str) -> PipelineParts {
        PipelineParts {
            transcriber: TranscriptionClient::new(
                Arc::new(PlaceholderTranscriber::with_response(transcript)),
                TranscriptionConfig::default(),
            ),
            replier: ReplyClient::new(Arc::new(EchoReplyEngine), ReplyConfig::default()),
            synthesizer: StreamingSynthesisClient::new(vec![Arc::new(SilentBackend)], SynthesisConfig::default()),
            sink: AudioFrameSink::headless(PlaybackConfig::default(), None).unwrap(),
            detector: Box::new(|| Box::new(EnergyDetector::default()) as Box<dyn SpeechDetector>),
        }
    }

    #[tokio::test]
    async fn typed_text_is_answered_and_recorded() {
        let handle = TurnPipeline::spawn(PipelineConfig::default(), parts(""), AudioInput::Injected).unwrap();
        let mut events = handle.subscribe();

        handle.submit_text("Bonjour").unwrap();
        let reply = loop {
            match events.recv().await.unwrap() {
                PipelineEvent::ReplyText { text, .. } => break text,
                _ => continue,
            }
        };
        assert_eq!(reply, "Tu as dit : Bonjour");
        assert!(handle.wait_for_state(PipelineState::Idle, Duration::from_secs(2)).await);

        let session = handle.stop().await.unwrap();
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.last_reply(), Some("Tu as dit : Bonjour"));
    }

    #[tokio::test]
    async fn commands_apply_between_turns() {
        let handle = TurnPipeline::spawn(PipelineConfig::default(), parts(""), AudioInput::Injected).unwrap();
        handle.submit_text("Salut").unwrap();
        handle.command(ControlCommand::ClearHistory).unwrap();
        handle
            .command(ControlCommand::SetParams(TutorParams {
                topic: "voyage".to_string(),
                ..TutorParams::default()
            }))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let session = handle.stop().await.unwrap();
        assert!(session.history().is_empty());
        assert_eq!(session.params().topic, "voyage");
    }

    #[tokio::test]
    async fn device_pipeline_rejects_pushed_audio() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let handle = TurnPipeline::spawn(PipelineConfig::default(), parts(""), AudioInput::Frames(rx)).unwrap();
        assert!(matches!(handle.push_silence(1), Err(VoiceError::Config(_))));
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = PipelineConfig::default();
        config.turn.gate.onset_frames = 0;
        assert!(TurnPipeline::spawn(config, parts(""), AudioInput::Injected).is_err());
    }
}
