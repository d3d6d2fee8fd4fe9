//! Audio capture, frame slicing and the audio data model
//!
//! Microphone audio is cut into fixed-size frames (20ms at 16kHz by default)
//! tagged with a monotonic sequence number. Frames come either from a cpal
//! input stream or, in headless mode, from a [`FrameInjector`].

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, Stream, StreamConfig};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Audio configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels delivered to the pipeline (always mono after downmix)
    pub channels: u16,

    /// Frame size in samples (default: 320 for 20ms at 16kHz)
    pub frame_size: usize,

    /// Smoothing constant for the volume meter EMA (default: 0.3)
    pub volume_smoothing: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_size: 320, // 20ms at 16kHz
            volume_smoothing: 0.3,
        }
    }
}

impl AudioConfig {
    pub fn frame_duration(&self) -> Duration {
        samples_duration(self.frame_size, self.sample_rate)
    }
}

/// A fixed-length block of mono PCM samples, immutable once produced.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Monotonic sequence number assigned at capture
    pub seq: u64,

    /// Samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,

    /// When the frame was completed
    pub captured_at: Instant,
}

/// How the bytes of an [`AudioChunk`] are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEncoding {
    /// Raw 16-bit little-endian mono PCM
    Pcm16 { sample_rate: u32 },
    /// A self-describing container (MP3, WAV, ...) decoded by rodio
    Container,
}

/// A block of synthesized audio plus its position within a synthesis job.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub index: usize,
    pub data: Vec<u8>,
    pub encoding: ChunkEncoding,
}

impl AudioChunk {
    pub fn pcm16(index: usize, sample_rate: u32, data: Vec<u8>) -> Self {
        Self {
            index,
            data,
            encoding: ChunkEncoding::Pcm16 { sample_rate },
        }
    }
}

/// Exponential moving average of frame RMS, shared between the capture
/// callback and readers on other threads.
#[derive(Debug, Clone)]
pub struct VolumeMeter {
    smoothing: f32,
    level: Arc<AtomicU32>,
}

impl VolumeMeter {
    pub fn new(smoothing: f32) -> Self {
        Self {
            smoothing: smoothing.clamp(0.0, 1.0),
            level: Arc::new(AtomicU32::new(0f32.to_bits())),
        }
    }

    /// Fold one frame into the meter and return the new level.
    pub fn update(&self, samples: &[f32]) -> f32 {
        let previous = self.level();
        let next = (self.smoothing * rms(samples) + (1.0 - self.smoothing) * previous).clamp(0.0, 1.0);
        self.level.store(next.to_bits(), Ordering::Relaxed);
        next
    }

    /// Current smoothed level in `[0, 1]`.
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }
}

/// Cuts arbitrary sample blocks into fixed-size frames.
struct FrameSlicer {
    frame_size: usize,
    pending: Vec<f32>,
    next_seq: u64,
    meter: VolumeMeter,
}

impl FrameSlicer {
    fn new(frame_size: usize, meter: VolumeMeter) -> Self {
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
            next_seq: 0,
            meter,
        }
    }

    fn push(&mut self, samples: &[f32], mut emit: impl FnMut(AudioFrame)) {
        for &sample in samples {
            self.pending.push(sample.clamp(-1.0, 1.0));
            if self.pending.len() >= self.frame_size {
                let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                self.meter.update(&samples);
                let frame = AudioFrame {
                    seq: self.next_seq,
                    samples,
                    captured_at: Instant::now(),
                };
                self.next_seq += 1;
                emit(frame);
            }
        }
    }

    /// Zero-pad and emit a partial trailing frame.
    fn flush(&mut self, emit: impl FnMut(AudioFrame)) {
        if self.pending.is_empty() {
            return;
        }
        let missing = self.frame_size - self.pending.len();
        self.push(&vec![0.0; missing], emit);
    }
}

/// Microphone frame source backed by cpal.
pub struct AudioFrameSource {
    config: AudioConfig,
    meter: VolumeMeter,
    stream: Option<Stream>,
}

impl AudioFrameSource {
    pub fn new(config: AudioConfig) -> Self {
        let meter = VolumeMeter::new(config.volume_smoothing);
        Self {
            config,
            meter,
            stream: None,
        }
    }

    /// Open the named input device (or the default one) and start producing
    /// frames. The returned receiver closes when the source is stopped.
    pub fn start(&mut self, device_id: Option<&str>) -> VoiceResult<mpsc::UnboundedReceiver<AudioFrame>> {
        if self.stream.is_some() {
            return Err(VoiceError::Device("capture already started".to_string()));
        }

        let device = find_input_device(device_id)?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let (stream_config, sample_format) = self.input_config(&device)?;
        let device_channels = usize::from(stream_config.channels);

        info!(
            device = %device_name,
            sample_rate = self.config.sample_rate,
            channels = device_channels,
            format = ?sample_format,
            frame_size = self.config.frame_size,
            "🎤 Starting audio capture"
        );

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let meter = self.meter.clone();
        let frame_size = self.config.frame_size;
        let stream = match sample_format {
            SampleFormat::F32 => build_capture::<f32>(&device, &stream_config, frame_size, meter, frame_tx, |s| s)?,
            SampleFormat::I16 => build_capture::<i16>(&device, &stream_config, frame_size, meter, frame_tx, i16_to_f32)?,
            SampleFormat::U16 => build_capture::<u16>(&device, &stream_config, frame_size, meter, frame_tx, u16_to_f32)?,
            other => {
                return Err(VoiceError::Device(format!("unsupported input sample format {:?}", other)));
            }
        };

        stream.play()?;
        self.stream = Some(stream);

        Ok(frame_rx)
    }

    /// Release the capture device. Pending frames already sent stay readable.
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            info!("⏹️ Audio capture stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    /// Smoothed input level in `[0, 1]`.
    pub fn volume_level(&self) -> f32 {
        self.meter.level()
    }

    pub fn meter(&self) -> VolumeMeter {
        self.meter.clone()
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn input_config(&self, device: &Device) -> VoiceResult<(StreamConfig, SampleFormat)> {
        let rate = SampleRate(self.config.sample_rate);
        let supported = device
            .supported_input_configs()
            .map_err(|e| VoiceError::Device(e.to_string()))?
            .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
            .filter(|c| CAPTURE_FORMATS.contains(&c.sample_format()))
            .min_by_key(|c| (format_rank(c.sample_format()), c.channels()))
            .ok_or_else(|| {
                VoiceError::Device(format!(
                    "no input configuration supports {} Hz",
                    self.config.sample_rate
                ))
            })?;
        let format = supported.sample_format();
        Ok((supported.with_sample_rate(rate).config(), format))
    }
}

impl Drop for AudioFrameSource {
    fn drop(&mut self) {
        self.stream = None;
    }
}

fn find_input_device(device_id: Option<&str>) -> VoiceResult<Device> {
    let host = cpal::default_host();
    match device_id {
        None => host
            .default_input_device()
            .ok_or_else(|| VoiceError::Device("No input device available".to_string())),
        Some(wanted) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| VoiceError::Device(format!("input device '{}' not found", wanted))),
    }
}

/// Input sample formats the capture callback can convert, best first.
const CAPTURE_FORMATS: [SampleFormat; 3] = [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16];

fn format_rank(format: SampleFormat) -> usize {
    CAPTURE_FORMATS
        .iter()
        .position(|f| *f == format)
        .unwrap_or(CAPTURE_FORMATS.len())
}

fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

fn u16_to_f32(sample: u16) -> f32 {
    (f32::from(sample) - 32768.0) / 32768.0
}

/// Input stream for sample type `T`; samples are converted to mono f32 before slicing.
fn build_capture<T>(
    device: &Device,
    config: &StreamConfig,
    frame_size: usize,
    meter: VolumeMeter,
    frame_tx: mpsc::UnboundedSender<AudioFrame>,
    convert: fn(T) -> f32,
) -> VoiceResult<Stream>
where
    T: cpal::SizedSample + 'static,
{
    let channels = usize::from(config.channels);
    let mut slicer = FrameSlicer::new(frame_size, meter);
    let mut mono = Vec::new();

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            to_mono_f32(data, channels, convert, &mut mono);
            slicer.push(&mono, |frame| {
                if frame_tx.send(frame).is_err() {
                    debug!("frame receiver dropped");
                }
            });
        },
        move |err| {
            warn!("Audio capture stream error: {}", err);
        },
        None,
    )?;
    Ok(stream)
}

/// Convert interleaved samples to f32 and average the channels.
fn to_mono_f32<T: Copy>(interleaved: &[T], channels: usize, convert: fn(T) -> f32, out: &mut Vec<f32>) {
    out.clear();
    let channels = channels.max(1);
    out.extend(
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().map(|&s| convert(s)).sum::<f32>() / frame.len() as f32),
    );
}

/// Programmatic frame source for headless operation and tests.
///
/// Shares the slicing and metering logic of the microphone path, so frames
/// pushed here are indistinguishable from captured ones.
#[derive(Clone)]
pub struct FrameInjector {
    slicer: Arc<Mutex<FrameSlicer>>,
    tx: mpsc::UnboundedSender<AudioFrame>,
    meter: VolumeMeter,
    frame_size: usize,
}

impl FrameInjector {
    pub fn new(config: &AudioConfig) -> (Self, mpsc::UnboundedReceiver<AudioFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let meter = VolumeMeter::new(config.volume_smoothing);
        let injector = Self {
            slicer: Arc::new(Mutex::new(FrameSlicer::new(config.frame_size, meter.clone()))),
            tx,
            meter,
            frame_size: config.frame_size,
        };
        (injector, rx)
    }

    /// Push samples; returns the number of complete frames emitted.
    pub fn push_samples(&self, samples: &[f32]) -> VoiceResult<usize> {
        let mut slicer = self
            .slicer
            .lock()
            .map_err(|_| VoiceError::ChannelClosed("frame slicer poisoned".to_string()))?;
        let mut emitted = 0;
        let mut closed = false;
        slicer.push(samples, |frame| {
            if self.tx.send(frame).is_err() {
                closed = true;
            } else {
                emitted += 1;
            }
        });
        if closed {
            return Err(VoiceError::ChannelClosed("frame receiver dropped".to_string()));
        }
        Ok(emitted)
    }

    /// Push 16-bit little-endian PCM bytes.
    pub fn push_pcm16(&self, bytes: &[u8]) -> VoiceResult<usize> {
        let samples = pcm16_le_to_f32(bytes)?;
        self.push_samples(&samples)
    }

    /// Push `frames` frames of digital silence.
    pub fn push_silence(&self, frames: usize) -> VoiceResult<usize> {
        self.push_samples(&vec![0.0; frames * self.frame_size])
    }

    /// Emit any buffered partial frame, zero-padded.
    pub fn flush(&self) -> VoiceResult<()> {
        let mut slicer = self
            .slicer
            .lock()
            .map_err(|_| VoiceError::ChannelClosed("frame slicer poisoned".to_string()))?;
        let tx = &self.tx;
        slicer.flush(|frame| {
            let _ = tx.send(frame);
        });
        Ok(())
    }

    pub fn volume_level(&self) -> f32 {
        self.meter.level()
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }
}

/// Headless frame source: an injector and the receiver it feeds.
pub fn frame_channel(config: &AudioConfig) -> (FrameInjector, mpsc::UnboundedReceiver<AudioFrame>) {
    FrameInjector::new(config)
}

/// Root mean square of a block of samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

pub fn samples_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(samples as u64 * 1_000_000 / u64::from(sample_rate))
}

pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i16)
        .collect()
}

pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

pub fn pcm16_le_to_f32(bytes: &[u8]) -> VoiceResult<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Decode(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
        .collect())
}
