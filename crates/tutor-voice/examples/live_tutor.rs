//! Live tutor demo: microphone → STT → reply → streaming TTS → speaker.
//!
//! Backends are picked from the environment (see `.env`):
//! - **STT**: Whisper (feature `whisper` + `WHISPER_MODEL_PATH`), else an
//!   OpenAI-compatible API (`STT_API_KEY`), else a placeholder.
//! - **Reply**: Ollama (`OLLAMA_BASE_URL`, `LLM_MODEL`), else an echo engine
//!   with `--echo`.
//! - **TTS**: ElevenLabs, then `TTS_API_KEY`, then Piper, then silent.
//!
//! Type a line to send text instead of speaking. `/repeat`, `/slower`,
//! `/faster`, `/explain`, `/translate <lang>`, `/stop`, `/clear` and
//! `/devices` are also accepted.

use anyhow::Context;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tutor_voice::{
    create_detector, create_synthesis_chain, create_transcription_engine, AudioFrameSink, AudioFrameSource,
    AudioInput, ControlCommand, EchoReplyEngine, OllamaReplyEngine, PipelineConfig, PipelineEvent, PipelineParts,
    ReplyClient, ReplyEngine, StreamingSynthesisClient, TeachingMode, TranscriptionClient, TurnPipeline,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = PipelineConfig::from_env();
    config.validate().context("invalid TUTOR_* configuration")?;

    let echo = std::env::args().any(|a| a == "--echo");
    let reply_engine: Arc<dyn ReplyEngine> = if echo {
        Arc::new(EchoReplyEngine)
    } else {
        Arc::new(OllamaReplyEngine::from_env()?)
    };

    let mut source = AudioFrameSource::new(config.audio.clone());
    let device = std::env::var("TUTOR_INPUT_DEVICE").ok();
    let frames = source.start(device.as_deref()).context("could not open the microphone")?;

    let vad_config = config.vad.clone();
    let parts = PipelineParts {
        transcriber: TranscriptionClient::new(create_transcription_engine(), config.transcription.clone()),
        replier: ReplyClient::new(reply_engine, config.reply.clone()),
        synthesizer: StreamingSynthesisClient::new(create_synthesis_chain(), config.synthesis.clone()),
        sink: AudioFrameSink::with_default_output(config.playback.clone(), None)?,
        detector: Box::new(move || create_detector(&vad_config)),
    };

    let handle = TurnPipeline::spawn(config, parts, AudioInput::Frames(frames))?;
    let mut events = handle.subscribe();
    info!("🎓 Tutor ready. Speak, or type a line. Ctrl+C to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => handle_line(&handle, line.trim())?,
                None => break,
            },
            event = events.recv() => match event {
                Ok(PipelineEvent::UserText { text, language, .. }) => info!("🧑 [{}] {}", language, text),
                Ok(PipelineEvent::ReplyText { text, spoken, .. }) => {
                    info!("🤖 {}{}", text, if spoken { "" } else { " (not spoken)" })
                }
                Ok(PipelineEvent::BargeIn { .. }) => info!("✋ interrupted"),
                Ok(PipelineEvent::TurnMetrics(m)) => info!(
                    "⏱️ stt {:?} / reply {:?} / first audio {:?}",
                    m.transcription, m.reply, m.first_audio
                ),
                Ok(PipelineEvent::Error { kind, message }) => warn!("{:?}: {}", kind, message),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => warn!("missed {} events", n),
                Err(_) => break,
            },
        }
    }

    let session = handle.stop().await?;
    source.stop();
    info!("👋 {} history entries this session", session.history().len());
    Ok(())
}

fn handle_line(handle: &tutor_voice::PipelineHandle, line: &str) -> anyhow::Result<()> {
    let command = match line.split_once(' ').map_or((line, ""), |(c, rest)| (c, rest.trim())) {
        ("", _) => return Ok(()),
        ("/repeat", _) => ControlCommand::Teach(TeachingMode::Repeat),
        ("/slower", _) => ControlCommand::Teach(TeachingMode::Slower),
        ("/faster", _) => ControlCommand::Teach(TeachingMode::Faster),
        ("/explain", _) => ControlCommand::Teach(TeachingMode::Explain),
        ("/translate", to) => ControlCommand::Teach(TeachingMode::Translate {
            to: if to.is_empty() { "en".to_string() } else { to.to_string() },
        }),
        ("/stop", _) => ControlCommand::StopSpeaking,
        ("/clear", _) => ControlCommand::ClearHistory,
        ("/devices", _) => {
            for name in AudioFrameSource::list_input_devices()? {
                info!("🎤 {}", name);
            }
            return Ok(());
        }
        _ => {
            handle.submit_text(line)?;
            return Ok(());
        }
    };
    handle.command(command)?;
    Ok(())
}
