//! **AudioFrameSink**: jitter-buffered playback with an immediate cancel.
//!
//! Chunks are decoded to mono f32, cut into short blocks and queued. A
//! dedicated thread paces blocks out to the [`OutputDevice`] in real time.
//! Every utterance is played under a [`PlaybackTicket`]; `cancel()` bumps the
//! epoch so that every block and every enqueue carrying an older ticket is
//! dropped, even if it arrives after the cancel.

use crate::audio::{pcm16_le_to_f32, samples_duration, AudioChunk, ChunkEncoding};
use crate::error::{VoiceError, VoiceResult};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

/// Something that can render mono f32 samples.
///
/// Implementations are created on the playback thread and never leave it,
/// so they do not need to be `Send`.
pub trait OutputDevice {
    /// Queue samples for playback. May return before they are audible.
    fn write(&mut self, samples: &[f32], sample_rate: u32) -> VoiceResult<()>;

    /// Discard anything queued inside the device and fall silent.
    fn silence(&mut self);
}

/// Speaker output through rodio.
pub struct RodioOutput {
    _stream: OutputStream,
    handle: OutputStreamHandle,
    sink: Sink,
}

impl RodioOutput {
    /// Open the default output device.
    pub fn open_default() -> VoiceResult<Self> {
        let (stream, handle) =
            OutputStream::try_default().map_err(|e| VoiceError::Device(e.to_string()))?;
        let sink = Sink::try_new(&handle).map_err(|e| VoiceError::Device(e.to_string()))?;
        info!("🔊 Playback sink ready");
        Ok(Self {
            _stream: stream,
            handle,
            sink,
        })
    }
}

impl OutputDevice for RodioOutput {
    fn write(&mut self, samples: &[f32], sample_rate: u32) -> VoiceResult<()> {
        self.sink
            .append(rodio::buffer::SamplesBuffer::new(1, sample_rate, samples.to_vec()));
        Ok(())
    }

    fn silence(&mut self) {
        self.sink.stop();
        match Sink::try_new(&self.handle) {
            Ok(sink) => self.sink = sink,
            Err(e) => warn!("Failed to recreate playback sink: {}", e),
        }
    }
}

/// Discards everything. Used for headless runs.
#[derive(Debug, Default)]
pub struct NullOutput;

impl OutputDevice for NullOutput {
    fn write(&mut self, _samples: &[f32], _sample_rate: u32) -> VoiceResult<()> {
        Ok(())
    }

    fn silence(&mut self) {}
}

/// Notifications emitted by the playback thread.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// The first block of chunk `index` reached the device.
    ChunkStarted { index: usize },
    /// A chunk could not be decoded and was skipped.
    DecodeFailed { index: usize, error: String },
    /// The utterance played under `epoch` finished.
    Drained { epoch: u64 },
    /// The output device rejected samples.
    DeviceFailed { error: String },
}

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Device sample rate; chunks at other rates are resampled.
    pub sample_rate: u32,
    /// Buffered audio at which `enqueue` applies backpressure (default: 200ms)
    pub target_buffer: Duration,
    /// Audio buffered before playback of an utterance starts (default: 60ms).
    /// Must not exceed `target_buffer`.
    pub prebuffer: Duration,
    /// Granularity of pacing and cancellation (default: 20ms)
    pub block: Duration,
}

impl PlaybackConfig {
    pub fn validate(&self) -> VoiceResult<()> {
        if self.sample_rate == 0 || self.block.is_zero() {
            return Err(VoiceError::Config("sink sample rate and block must be non-zero".to_string()));
        }
        if self.target_buffer.is_zero() {
            return Err(VoiceError::Config("jitter buffer target must be non-zero".to_string()));
        }
        if self.prebuffer > self.target_buffer {
            return Err(VoiceError::Config(format!(
                "prebuffer ({:?}) exceeds the jitter buffer target ({:?})",
                self.prebuffer, self.target_buffer
            )));
        }
        Ok(())
    }

    /// Buffered audio needed before an utterance starts playing.
    fn start_threshold(&self) -> Duration {
        self.prebuffer.min(self.target_buffer)
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            target_buffer: Duration::from_millis(200),
            prebuffer: Duration::from_millis(60),
            block: Duration::from_millis(20),
        }
    }
}

/// Permission to play one utterance. Invalidated by `cancel()` or the next `begin()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackTicket {
    epoch: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SinkProgress {
    drained_through: u64,
    cancelled_through: u64,
}

struct Block {
    epoch: u64,
    chunk_index: Option<usize>,
    samples: Vec<f32>,
}

#[derive(Default)]
struct QueueState {
    epoch: u64,
    blocks: VecDeque<Block>,
    buffered: Duration,
    finished: bool,
    started: bool,
    drained: bool,
    silence_requested: bool,
    shutdown: bool,
}

impl QueueState {
    fn clear(&mut self) {
        self.blocks.clear();
        self.buffered = Duration::ZERO;
        self.started = false;
        self.finished = false;
    }
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Condvar,
    space: Notify,
    progress: watch::Sender<SinkProgress>,
    speaking: AtomicBool,
    /// Copy of `QueueState::epoch` readable without the lock.
    current_epoch: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        let (progress, _) = watch::channel(SinkProgress::default());
        Self {
            state: Mutex::new(QueueState {
                drained: true,
                ..QueueState::default()
            }),
            wake: Condvar::new(),
            space: Notify::new(),
            progress,
            speaking: AtomicBool::new(false),
            current_epoch: AtomicU64::new(0),
        }
    }

    /// Bump the epoch. Caller holds the queue lock.
    fn advance_epoch(&self, state: &mut QueueState) -> u64 {
        state.epoch += 1;
        self.current_epoch.store(state.epoch, Ordering::SeqCst);
        state.epoch
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Queue state stays consistent across a panic in the device callback.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct SinkThread {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SinkThread {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wake.notify_all();
        self.shared.space.notify_waiters();
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("playback thread panicked");
            }
        }
    }
}

/// Cloneable handle to the playback thread. The thread stops when the last
/// handle is dropped.
#[derive(Clone)]
pub struct AudioFrameSink {
    config: PlaybackConfig,
    shared: Arc<Shared>,
    events: Option<mpsc::UnboundedSender<SinkEvent>>,
    _thread: Arc<SinkThread>,
}

impl AudioFrameSink {
    /// Start the playback thread. `open` runs on that thread and builds the device.
    pub fn spawn<F>(
        config: PlaybackConfig,
        open: F,
        events: Option<mpsc::UnboundedSender<SinkEvent>>,
    ) -> VoiceResult<Self>
    where
        F: FnOnce() -> VoiceResult<Box<dyn OutputDevice>> + Send + 'static,
    {
        config.validate()?;
        let shared = Arc::new(Shared::new());

        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
        let thread_shared = Arc::clone(&shared);
        let thread_config = config.clone();
        let thread_events = events.clone();
        let handle = std::thread::Builder::new()
            .name("tutor-playback".to_string())
            .spawn(move || {
                let device = match open() {
                    Ok(device) => {
                        let _ = ready_tx.send(Ok(()));
                        device
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                playback_loop(thread_shared, thread_config, device, thread_events);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(VoiceError::Device("playback thread exited during startup".to_string()));
            }
        }

        let thread = Arc::new(SinkThread {
            shared: Arc::clone(&shared),
            handle: Mutex::new(Some(handle)),
        });
        Ok(Self {
            config,
            shared,
            events,
            _thread: thread,
        })
    }

    /// Sink on the default speaker.
    pub fn with_default_output(
        config: PlaybackConfig,
        events: Option<mpsc::UnboundedSender<SinkEvent>>,
    ) -> VoiceResult<Self> {
        Self::spawn(
            config,
            || RodioOutput::open_default().map(|d| Box::new(d) as Box<dyn OutputDevice>),
            events,
        )
    }

    /// Sink that paces audio in real time but renders nothing.
    pub fn headless(config: PlaybackConfig, events: Option<mpsc::UnboundedSender<SinkEvent>>) -> VoiceResult<Self> {
        Self::spawn(config, || Ok(Box::new(NullOutput) as Box<dyn OutputDevice>), events)
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// Start a new utterance. Anything still queued from a previous one is dropped.
    pub fn begin(&self) -> PlaybackTicket {
        let mut state = self.shared.lock();
        let previous = state.epoch;
        let had_audio = !state.blocks.is_empty() || !state.drained;
        let epoch = self.shared.advance_epoch(&mut state);
        state.clear();
        state.drained = false;
        if had_audio {
            state.silence_requested = true;
        }
        drop(state);

        if had_audio && previous > 0 {
            self.shared.progress.send_modify(|p| {
                if p.drained_through < previous {
                    p.cancelled_through = p.cancelled_through.max(previous);
                }
            });
        }
        self.shared.wake.notify_all();
        self.shared.space.notify_waiters();
        PlaybackTicket { epoch }
    }

    /// Decode and queue a chunk, waiting while the jitter buffer is full.
    ///
    /// Returns `Cancelled` when the ticket has been invalidated and
    /// `Decode` when the chunk is unplayable (the utterance continues).
    pub async fn enqueue(&self, ticket: &PlaybackTicket, chunk: AudioChunk) -> VoiceResult<()> {
        let index = chunk.index;
        let samples = match decode_chunk(&chunk, self.config.sample_rate) {
            Ok(samples) => samples,
            Err(e) => {
                warn!(index, "Skipping undecodable chunk: {}", e);
                self.emit(SinkEvent::DecodeFailed {
                    index,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };
        if samples.is_empty() {
            return Ok(());
        }

        let block_len = block_samples(&self.config);
        loop {
            let notified = self.shared.space.notified();
            {
                let mut state = self.shared.lock();
                if state.shutdown {
                    return Err(VoiceError::ChannelClosed("playback stopped".to_string()));
                }
                if state.epoch != ticket.epoch {
                    debug!(index, "Dropping chunk for stale playback ticket");
                    return Err(VoiceError::Cancelled);
                }
                if state.buffered < self.config.target_buffer {
                    for (i, block) in samples.chunks(block_len).enumerate() {
                        state.buffered += samples_duration(block.len(), self.config.sample_rate);
                        state.blocks.push_back(Block {
                            epoch: ticket.epoch,
                            chunk_index: (i == 0).then_some(index),
                            samples: block.to_vec(),
                        });
                    }
                    drop(state);
                    self.shared.wake.notify_all();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// No more chunks will be enqueued for this ticket.
    pub fn finish(&self, ticket: &PlaybackTicket) {
        let mut state = self.shared.lock();
        if state.epoch == ticket.epoch {
            state.finished = true;
            drop(state);
            self.shared.wake.notify_all();
        }
    }

    /// Wait until the utterance has been fully played (`true`) or cancelled (`false`).
    pub async fn drain(&self, ticket: &PlaybackTicket) -> bool {
        let mut rx = self.shared.progress.subscribe();
        loop {
            let progress = *rx.borrow_and_update();
            if progress.cancelled_through >= ticket.epoch {
                return false;
            }
            if progress.drained_through >= ticket.epoch {
                return true;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Stop playback immediately and invalidate every outstanding ticket.
    pub fn cancel(&self) {
        let mut state = self.shared.lock();
        let cancelled = state.epoch;
        self.shared.advance_epoch(&mut state);
        state.clear();
        state.drained = true;
        state.silence_requested = true;
        drop(state);

        self.shared.speaking.store(false, Ordering::SeqCst);
        self.shared
            .progress
            .send_modify(|p| {
                if p.drained_through < cancelled {
                    p.cancelled_through = p.cancelled_through.max(cancelled);
                }
            });
        self.shared.wake.notify_all();
        self.shared.space.notify_waiters();
        debug!(epoch = cancelled, "Playback cancelled");
    }

    /// Whether audio is currently being rendered.
    pub fn is_speaking(&self) -> bool {
        self.shared.speaking.load(Ordering::SeqCst)
    }

    /// Audio queued but not yet handed to the device.
    pub fn buffered(&self) -> Duration {
        self.shared.lock().buffered
    }

    fn emit(&self, event: SinkEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

fn block_samples(config: &PlaybackConfig) -> usize {
    ((u128::from(config.sample_rate) * config.block.as_micros()) / 1_000_000).max(1) as usize
}

fn playback_loop(
    shared: Arc<Shared>,
    config: PlaybackConfig,
    mut device: Box<dyn OutputDevice>,
    events: Option<mpsc::UnboundedSender<SinkEvent>>,
) {
    let emit = |event: SinkEvent| {
        if let Some(tx) = &events {
            let _ = tx.send(event);
        }
    };
    // Point in time at which everything handed to the device has been heard.
    let mut audible_until = Instant::now();
    let lead = config.block;

    let mut state = shared.lock();
    loop {
        if state.shutdown {
            break;
        }

        if state.silence_requested {
            state.silence_requested = false;
            drop(state);
            device.silence();
            audible_until = Instant::now();
            shared.speaking.store(false, Ordering::SeqCst);
            state = shared.lock();
            continue;
        }

        let now = Instant::now();
        let epoch = state.epoch;
        while state.blocks.front().map(|b| b.epoch != epoch).unwrap_or(false) {
            if let Some(stale) = state.blocks.pop_front() {
                let len = samples_duration(stale.samples.len(), config.sample_rate);
                state.buffered = state.buffered.saturating_sub(len);
            }
        }

        let ready = !state.blocks.is_empty()
            && (state.started || state.finished || state.buffered >= config.start_threshold());

        if ready {
            // Keep at most one block ahead of what is audible so a cancel cuts quickly.
            if audible_until > now + lead {
                let wait = audible_until - now - lead;
                state = wait_timeout(&shared, state, wait);
                continue;
            }

            let Some(block) = state.blocks.pop_front() else {
                continue;
            };
            let len = samples_duration(block.samples.len(), config.sample_rate);
            state.buffered = state.buffered.saturating_sub(len);
            state.started = true;
            drop(state);
            shared.space.notify_waiters();

            if let Some(index) = block.chunk_index {
                emit(SinkEvent::ChunkStarted { index });
            }
            match write_current(&shared, device.as_mut(), &block, config.sample_rate) {
                Ok(true) => audible_until = audible_until.max(Instant::now()) + len,
                Ok(false) => debug!(epoch = block.epoch, "Skipped block cancelled before write"),
                Err(e) => {
                    warn!("Playback device error: {}", e);
                    emit(SinkEvent::DeviceFailed { error: e.to_string() });
                }
            }
            state = shared.lock();
            continue;
        }

        if state.blocks.is_empty() && state.finished && !state.drained {
            if audible_until > now {
                let wait = audible_until - now;
                state = wait_timeout(&shared, state, wait);
                continue;
            }
            state.drained = true;
            state.started = false;
            let epoch = state.epoch;
            drop(state);
            shared.speaking.store(false, Ordering::SeqCst);
            shared
                .progress
                .send_modify(|p| p.drained_through = p.drained_through.max(epoch));
            emit(SinkEvent::Drained { epoch });
            debug!(epoch, "Playback drained");
            state = shared.lock();
            continue;
        }

        state = match shared.wake.wait(state) {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
    }
    drop(state);
    device.silence();
    shared.speaking.store(false, Ordering::SeqCst);
}

/// Hand a block to the device unless a cancel has made it stale since it was popped.
fn write_current(shared: &Shared, device: &mut dyn OutputDevice, block: &Block, sample_rate: u32) -> VoiceResult<bool> {
    if shared.current_epoch.load(Ordering::SeqCst) != block.epoch {
        return Ok(false);
    }
    shared.speaking.store(true, Ordering::SeqCst);
    device.write(&block.samples, sample_rate)?;
    Ok(true)
}

fn wait_timeout<'a>(shared: &'a Shared, state: MutexGuard<'a, QueueState>, wait: Duration) -> MutexGuard<'a, QueueState> {
    match shared.wake.wait_timeout(state, wait) {
        Ok((guard, _)) => guard,
        Err(poisoned) => poisoned.into_inner().0,
    }
}

/// Decode a chunk into mono f32 at `target_rate`.
pub fn decode_chunk(chunk: &AudioChunk, target_rate: u32) -> VoiceResult<Vec<f32>> {
    match chunk.encoding {
        ChunkEncoding::Pcm16 { sample_rate } => {
            let samples = pcm16_le_to_f32(&chunk.data)?;
            Ok(resample_linear(&samples, sample_rate, target_rate))
        }
        ChunkEncoding::Container => {
            if chunk.data.is_empty() {
                return Ok(Vec::new());
            }
            let decoder = rodio::Decoder::new(Cursor::new(chunk.data.clone()))
                .map_err(|e| VoiceError::Decode(format!("chunk {}: {}", chunk.index, e)))?;
            let channels = usize::from(decoder.channels().max(1));
            let source_rate = decoder.sample_rate();
            let interleaved: Vec<f32> = decoder.convert_samples::<f32>().collect();
            let mono: Vec<f32> = interleaved
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                .collect();
            Ok(resample_linear(&mono, source_rate, target_rate))
        }
    }
}

/// Linear-interpolation resampler; adequate for speech.
pub fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || to == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(from) / f64::from(to);
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}
