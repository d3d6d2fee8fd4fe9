//! Per-frame speech classifiers
//!
//! A [`SpeechDetector`] turns one audio frame into a speech probability.
//! WebRTC VAD is the default; the energy detector is the fallback when no
//! model is usable and the deterministic choice for tests.

use crate::audio::{f32_to_pcm16, rms};
use crate::error::{VoiceError, VoiceResult};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Classifies a single frame.
pub trait SpeechDetector {
    /// Probability in `[0, 1]` that the frame contains speech.
    fn speech_probability(&mut self, frame: &[f32]) -> VoiceResult<f32>;

    /// Clear any internal state carried between frames.
    fn reset(&mut self) -> VoiceResult<()>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    WebRtc,
    Energy,
}

/// Configuration for speech detection
#[derive(Debug, Clone)]
pub struct VadConfig {
    pub kind: DetectorKind,

    /// Sample rate (must be 8000, 16000, 32000, or 48000 Hz for WebRTC VAD)
    pub sample_rate: u32,

    /// WebRTC aggressiveness (0-3, where 3 is most aggressive)
    pub mode: u8,

    /// RMS at which the energy detector reports probability 0.5 (default: 0.01)
    pub energy_reference: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            kind: DetectorKind::WebRtc,
            sample_rate: 16000,
            mode: 2,
            energy_reference: 0.01,
        }
    }
}

/// Build the configured detector, falling back to energy when WebRTC
/// rejects the configuration.
pub fn create_detector(config: &VadConfig) -> Box<dyn SpeechDetector> {
    match config.kind {
        DetectorKind::Energy => Box::new(EnergyDetector::new(config.energy_reference)),
        DetectorKind::WebRtc => match WebRtcDetector::new(config) {
            Ok(detector) => Box::new(detector),
            Err(e) => {
                info!("WebRTC VAD unavailable ({}), using energy detector", e);
                Box::new(EnergyDetector::new(config.energy_reference))
            }
        },
    }
}

/// Voice Activity Detector using WebRTC VAD
pub struct WebRtcDetector {
    vad: Vad,
    mode: VadMode,
    rate: SampleRate,
    sample_rate: u32,
}

impl WebRtcDetector {
    pub fn new(config: &VadConfig) -> VoiceResult<Self> {
        let rate = match config.sample_rate {
            8000 => SampleRate::Rate8kHz,
            16000 => SampleRate::Rate16kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            other => {
                return Err(VoiceError::Config(format!(
                    "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                    other
                )))
            }
        };
        let mode = match config.mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            3 => VadMode::VeryAggressive,
            other => return Err(VoiceError::Config(format!("VAD mode must be 0-3, got {}", other))),
        };

        info!(
            "🎙️ Initializing WebRTC VAD (sample_rate: {}Hz, mode: {})",
            config.sample_rate, config.mode
        );
        Ok(Self {
            vad: build_vad(mode_copy(&mode), rate_copy(&rate)),
            mode,
            rate,
            sample_rate: config.sample_rate,
        })
    }

    fn accepts(&self, len: usize) -> bool {
        let per_ms = self.sample_rate as usize / 1000;
        [10, 20, 30].iter().any(|ms| ms * per_ms == len)
    }
}

impl SpeechDetector for WebRtcDetector {
    fn speech_probability(&mut self, frame: &[f32]) -> VoiceResult<f32> {
        if !self.accepts(frame.len()) {
            return Err(VoiceError::Vad(format!(
                "WebRTC VAD needs 10, 20 or 30ms frames, got {} samples",
                frame.len()
            )));
        }
        let pcm = f32_to_pcm16(frame);
        let is_speech = self
            .vad
            .is_voice_segment(&pcm)
            .map_err(|_| VoiceError::Vad("VAD rejected frame".to_string()))?;
        Ok(if is_speech { 1.0 } else { 0.0 })
    }

    fn reset(&mut self) -> VoiceResult<()> {
        // No explicit reset in webrtc-vad; rebuild the instance.
        self.vad = build_vad(mode_copy(&self.mode), rate_copy(&self.rate));
        debug!("WebRTC VAD reset");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "webrtc"
    }
}

fn build_vad(mode: VadMode, rate: SampleRate) -> Vad {
    let mut vad = Vad::new();
    vad.set_mode(mode);
    vad.set_sample_rate(rate);
    vad
}

// webrtc-vad's enums are not Clone.
fn mode_copy(mode: &VadMode) -> VadMode {
    match mode {
        VadMode::Quality => VadMode::Quality,
        VadMode::LowBitrate => VadMode::LowBitrate,
        VadMode::Aggressive => VadMode::Aggressive,
        VadMode::VeryAggressive => VadMode::VeryAggressive,
    }
}

fn rate_copy(rate: &SampleRate) -> SampleRate {
    match rate {
        SampleRate::Rate8kHz => SampleRate::Rate8kHz,
        SampleRate::Rate16kHz => SampleRate::Rate16kHz,
        SampleRate::Rate32kHz => SampleRate::Rate32kHz,
        SampleRate::Rate48kHz => SampleRate::Rate48kHz,
    }
}

/// RMS-based detector: probability is `rms / (2 * reference)`, clamped.
#[derive(Debug, Clone)]
pub struct EnergyDetector {
    reference: f32,
}

impl EnergyDetector {
    pub fn new(reference: f32) -> Self {
        Self {
            reference: reference.max(f32::EPSILON),
        }
    }
}

impl Default for EnergyDetector {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl SpeechDetector for EnergyDetector {
    fn speech_probability(&mut self, frame: &[f32]) -> VoiceResult<f32> {
        Ok((rms(frame) / (2.0 * self.reference)).clamp(0.0, 1.0))
    }

    fn reset(&mut self) -> VoiceResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "energy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_sample_rate() {
        let config = VadConfig {
            sample_rate: 44100,
            ..Default::default()
        };
        assert!(WebRtcDetector::new(&config).is_err());
        assert_eq!(create_detector(&config).name(), "energy");
    }

    #[test]
    fn test_frame_length_validation() {
        let mut detector = WebRtcDetector::new(&VadConfig::default()).unwrap();
        assert!(detector.speech_probability(&vec![0.0f32; 100]).is_err());
        assert!(detector.speech_probability(&vec![0.0f32; 320]).is_ok());
    }

    #[test]
    fn test_silence_detection() {
        let mut detector = WebRtcDetector::new(&VadConfig::default()).unwrap();
        assert_eq!(detector.speech_probability(&vec![0.0f32; 480]).unwrap(), 0.0);
        detector.reset().unwrap();
    }

    #[test]
    fn energy_detector_scales_with_rms() {
        let mut detector = EnergyDetector::new(0.01);
        assert_eq!(detector.speech_probability(&vec![0.0; 320]).unwrap(), 0.0);
        let at_reference = detector.speech_probability(&vec![0.01; 320]).unwrap();
        assert!((at_reference - 0.5).abs() < 1e-4);
        assert_eq!(detector.speech_probability(&vec![0.3; 320]).unwrap(), 1.0);
    }
}
