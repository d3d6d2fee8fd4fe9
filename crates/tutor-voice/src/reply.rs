//! Tutor replies
//!
//! [`ReplyClient`] builds the tutor prompt from [`TutorParams`], applies the
//! teaching directive and a deadline, and never fails: backend errors become
//! a canned apology in the target language.

use crate::error::{VoiceError, VoiceResult};
use crate::session::{ConversationSession, HistoryEntry, Speaker, TeachingMode, TutorParams};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shown when a mode needs a previous reply and there is none.
pub const NOTHING_TO_REPEAT: &str = "(Nothing to repeat yet)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Backend producing one completion for an ordered message list.
#[async_trait]
pub trait ReplyEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, messages: &[ChatMessage]) -> VoiceResult<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    /// Fresh text from the engine
    Engine,
    /// The cached last reply (repeat)
    Cache,
    /// No previous reply to operate on
    Notice,
    /// The engine failed or timed out
    Apology,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub source: ReplySource,
}

impl Reply {
    /// Fold this reply into the session.
    ///
    /// `normal` appends the user entry, plus the tutor entry when the engine
    /// answered. Other modes only refresh the last-reply cache. Repeats,
    /// notices and failed restatements leave the session untouched.
    pub fn apply_to(&self, session: &mut ConversationSession, mode: &TeachingMode, user_text: &str) {
        match (mode, self.source) {
            (TeachingMode::Normal, ReplySource::Engine) => {
                session.push_user(user_text);
                session.push_tutor(self.text.clone());
                session.cache_reply(self.text.clone());
            }
            (TeachingMode::Normal, ReplySource::Apology) => session.push_user(user_text),
            (_, ReplySource::Engine) => session.cache_reply(self.text.clone()),
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplyConfig {
    /// Per-call deadline (default: 20s)
    pub deadline: Duration,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(20),
        }
    }
}

#[derive(Clone)]
pub struct ReplyClient {
    engine: Arc<dyn ReplyEngine>,
    config: ReplyConfig,
}

impl ReplyClient {
    pub fn new(engine: Arc<dyn ReplyEngine>, config: ReplyConfig) -> Self {
        Self { engine, config }
    }

    /// Produce the tutor's reply. `history` is the context window, oldest first.
    pub async fn reply(
        &self,
        history: &[HistoryEntry],
        last_reply: Option<&str>,
        params: &TutorParams,
        mode: &TeachingMode,
        user_text: &str,
    ) -> Reply {
        let instruction = match (mode, last_reply) {
            (TeachingMode::Normal, _) => user_text.to_string(),
            (TeachingMode::Repeat, Some(last)) => {
                return Reply {
                    text: last.to_string(),
                    source: ReplySource::Cache,
                }
            }
            (_, None) => {
                return Reply {
                    text: NOTHING_TO_REPEAT.to_string(),
                    source: ReplySource::Notice,
                }
            }
            (TeachingMode::Slower, Some(last)) => {
                format!("Say this again more slowly, with shorter and simpler sentences: {}", last)
            }
            (TeachingMode::Faster, Some(last)) => {
                format!("Say this again at a natural pace, with richer vocabulary: {}", last)
            }
            (TeachingMode::Explain, Some(last)) => format!("Explain this in simple English: {}", last),
            (TeachingMode::Translate { to }, Some(last)) => format!("Translate this to {}: {}", to, last),
        };

        let messages = build_messages(history, params, &instruction);
        let started = Instant::now();
        let result = tokio::time::timeout(self.config.deadline, self.engine.complete(&messages))
            .await
            .unwrap_or_else(|_| Err(VoiceError::timeout(self.engine.name(), self.config.deadline)));

        match result {
            Ok(text) if !text.trim().is_empty() => {
                info!(
                    target: "tutor::voice",
                    backend = self.engine.name(),
                    mode = mode.label(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "💬 Reply ready"
                );
                Reply {
                    text: text.trim().to_string(),
                    source: ReplySource::Engine,
                }
            }
            Ok(_) => {
                warn!(backend = self.engine.name(), "Reply engine returned empty text");
                apology(params)
            }
            Err(e) => {
                warn!(backend = self.engine.name(), "Reply failed, apologising: {}", e);
                apology(params)
            }
        }
    }

    /// Reply using the session's context, cache and parameters.
    pub async fn reply_in(&self, session: &ConversationSession, mode: &TeachingMode, user_text: &str) -> Reply {
        self.reply(session.context(), session.last_reply(), session.params(), mode, user_text)
            .await
    }
}

fn apology(params: &TutorParams) -> Reply {
    let text = if params.target_language.to_lowercase().starts_with("fr") {
        "Désolé, je ne peux pas répondre pour le moment. Réessaie dans un instant."
    } else {
        "Sorry, I can't reach the language model right now. Please try again in a moment."
    };
    Reply {
        text: text.to_string(),
        source: ReplySource::Apology,
    }
}

/// System prompt, context window, then the instruction as the final user message.
pub fn build_messages(history: &[HistoryEntry], params: &TutorParams, instruction: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::new(ChatRole::System, build_system_prompt(params)));
    messages.extend(history.iter().map(|entry| {
        let role = match entry.speaker {
            Speaker::User => ChatRole::User,
            Speaker::Tutor => ChatRole::Assistant,
        };
        ChatMessage::new(role, entry.text.clone())
    }));
    messages.push(ChatMessage::new(ChatRole::User, instruction));
    messages
}

pub fn build_system_prompt(params: &TutorParams) -> String {
    let lang = params.target_language.to_lowercase();
    let language_line = match lang.as_str() {
        "fr" => "Respond in French. Use 'tu' at A2 and 'vous' at B1 when appropriate.".to_string(),
        "en" => "Respond in English. Use clear, simple language.".to_string(),
        "es" => "Responde en español. Usa lenguaje claro y sencillo.".to_string(),
        "de" => "Antworte auf Deutsch. Verwende klare, einfache Sprache.".to_string(),
        "it" => "Rispondi in italiano. Usa un linguaggio chiaro e semplice.".to_string(),
        other => format!("Respond in {}.", other),
    };
    let topic_line = match params.topic.as_str() {
        "travel" => "Focus on travel situations: airport, hotel, directions.",
        "cafe" => "Focus on ordering at a café and small talk.",
        "shopping" => "Focus on shopping: sizes, colours, prices.",
        "work" => "Focus on workplace vocabulary.",
        "doctor" => "Focus on health and medical situations.",
        "directions" => "Focus on asking for and giving directions.",
        "restaurant" => "Focus on dining out and food.",
        "smalltalk" => "Focus on casual social conversation.",
        _ => "Adapt to whatever the learner wants to talk about.",
    };
    let difficulty_line = match params.difficulty.get() {
        1 => "Use very simple sentences of 3-5 words. Avoid idioms.",
        2 => "Use simple sentences of 5-8 words. Keep idioms to a minimum.",
        3 => "Use sentences of 8-12 words. Common idioms are fine.",
        4 => "Vary sentence structure and include idiomatic expressions.",
        _ => "Use complex sentences and challenge the learner with advanced vocabulary.",
    };

    format!(
        "You are a patient, encouraging language tutor teaching {lang_upper} to a {level} learner.\n\
         - {language_line}\n\
         - Keep every reply to 1-3 short sentences.\n\
         - {difficulty_line}\n\
         - {topic_line}\n\
         - When the learner makes a mistake, acknowledge what they said, give the correct form and one short reason.\n\
         - Give IPA only for new or difficult words.\n\
         - End with a small follow-up question in the target language.\n\
         Level guidance: A2 covers familiar topics with present and past tense; B1 adds opinions, plans and the conditional.\n\
         Session: level {level}, difficulty {difficulty}/5, topic {topic}, target language {lang}.",
        lang_upper = lang.to_uppercase(),
        level = params.level,
        difficulty = params.difficulty.get(),
        topic = params.topic,
    )
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: Option<ChatMessage>,
    #[serde(default)]
    error: Option<String>,
}

/// Local Ollama server (`/api/chat`, non-streaming) with an optional fallback model.
/// Uses `OLLAMA_BASE_URL` (default http://localhost:11434), `LLM_MODEL` and `LLM_FALLBACK`.
#[derive(Debug, Clone)]
pub struct OllamaReplyEngine {
    pub base_url: String,
    pub model: String,
    pub fallback_model: Option<String>,
    pub temperature: f32,
    client: reqwest::Client,
}

impl OllamaReplyEngine {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, fallback_model: Option<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            fallback_model,
            temperature: 0.7,
            client,
        })
    }

    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| "http://localhost:11434".to_string());
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "llama3.1:8b-instruct-q4_K_M".to_string());
        let fallback = std::env::var("LLM_FALLBACK").ok().filter(|m| !m.trim().is_empty());
        Self::new(base_url, model, fallback)
    }

    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> VoiceResult<String> {
        let url = format!("{}/api/chat", self.base_url);
        let body = OllamaChatRequest {
            model,
            messages,
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
            },
        };
        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::unavailable(format!("ollama:{}", model), e))?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(VoiceError::unavailable(
                format!("ollama:{}", model),
                format!("HTTP {}: {}", status, text),
            ));
        }
        let parsed: OllamaChatResponse = res.json().await?;
        if let Some(error) = parsed.error {
            return Err(VoiceError::unavailable(format!("ollama:{}", model), error));
        }
        parsed
            .message
            .map(|m| m.content)
            .ok_or_else(|| VoiceError::unavailable(format!("ollama:{}", model), "response without message"))
    }
}

#[async_trait]
impl ReplyEngine for OllamaReplyEngine {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> VoiceResult<String> {
        match self.chat(&self.model, messages).await {
            Ok(text) => Ok(text),
            Err(primary) => match &self.fallback_model {
                Some(fallback) => {
                    warn!(model = %self.model, fallback = %fallback, "Primary model failed: {}", primary);
                    self.chat(fallback, messages).await
                }
                None => Err(primary),
            },
        }
    }
}

/// Fixed-response engine for offline runs.
#[derive(Debug, Clone)]
pub struct EchoReplyEngine;

#[async_trait]
impl ReplyEngine for EchoReplyEngine {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> VoiceResult<String> {
        let last = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        debug!("echo engine replying to {} messages", messages.len());
        Ok(format!("Tu as dit : {}", last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedEngine {
        replies: Mutex<Vec<VoiceResult<String>>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
        delay: Duration,
    }

    impl ScriptedEngine {
        fn answering(text: &str) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(vec![Ok(text.to_string())]),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl ReplyEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, messages: &[ChatMessage]) -> VoiceResult<String> {
            self.seen.lock().unwrap().push(messages.to_vec());
            tokio::time::sleep(self.delay).await;
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(VoiceError::unavailable("scripted", "out of replies")))
        }
    }

    #[tokio::test]
    async fn normal_reply_updates_history_and_cache() {
        let engine = ScriptedEngine::answering("Bonjour ! Comment vas-tu ?");
        let client = ReplyClient::new(engine.clone(), ReplyConfig::default());
        let mut session = ConversationSession::default();

        let reply = client.reply_in(&session, &TeachingMode::Normal, "Bonjour").await;
        assert_eq!(reply.source, ReplySource::Engine);
        reply.apply_to(&mut session, &TeachingMode::Normal, "Bonjour");

        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[0].speaker, Speaker::User);
        assert_eq!(session.last_reply(), Some("Bonjour ! Comment vas-tu ?"));

        let seen = engine.seen.lock().unwrap();
        let sent = &seen[0];
        assert_eq!(sent[0].role, ChatRole::System);
        assert_eq!(sent.last().map(|m| m.content.as_str()), Some("Bonjour"));
    }

    #[tokio::test]
    async fn repeat_is_idempotent_and_skips_engine() {
        let engine = ScriptedEngine::answering("unused");
        let client = ReplyClient::new(engine.clone(), ReplyConfig::default());
        let mut session = ConversationSession::default();
        session.push_user("Salut");
        session.push_tutor("Salut ! Ça va ?");
        session.cache_reply("Salut ! Ça va ?");
        let before = session.history().to_vec();

        let first = client.reply_in(&session, &TeachingMode::Repeat, "").await;
        first.apply_to(&mut session, &TeachingMode::Repeat, "");
        let second = client.reply_in(&session, &TeachingMode::Repeat, "").await;
        second.apply_to(&mut session, &TeachingMode::Repeat, "");

        assert_eq!(first, second);
        assert_eq!(first.text, "Salut ! Ça va ?");
        assert_eq!(session.history(), before.as_slice());
        assert!(engine.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeat_without_reply_is_a_notice() {
        let client = ReplyClient::new(ScriptedEngine::answering("unused"), ReplyConfig::default());
        let session = ConversationSession::default();
        let reply = client.reply_in(&session, &TeachingMode::Repeat, "").await;
        assert_eq!(reply.text, NOTHING_TO_REPEAT);
        assert_eq!(reply.source, ReplySource::Notice);
    }

    #[tokio::test]
    async fn timeout_yields_apology_and_records_user_only() {
        let engine = Arc::new(ScriptedEngine {
            replies: Mutex::new(vec![Ok("too late".to_string())]),
            delay: Duration::from_secs(5),
            ..ScriptedEngine::default()
        });
        let client = ReplyClient::new(
            engine,
            ReplyConfig {
                deadline: Duration::from_millis(20),
            },
        );
        let mut session = ConversationSession::default();
        let reply = client.reply_in(&session, &TeachingMode::Normal, "Bonjour").await;
        assert_eq!(reply.source, ReplySource::Apology);
        assert!(reply.text.starts_with("Désolé"));

        reply.apply_to(&mut session, &TeachingMode::Normal, "Bonjour");
        assert_eq!(session.history().len(), 1);
        assert_eq!(session.history()[0].speaker, Speaker::User);
        assert!(session.last_reply().is_none());
    }

    #[tokio::test]
    async fn translate_operates_on_last_reply_without_touching_history() {
        let engine = ScriptedEngine::answering("Hi! How are you?");
        let client = ReplyClient::new(engine.clone(), ReplyConfig::default());
        let mut session = ConversationSession::default();
        session.cache_reply("Salut ! Ça va ?");
        let mode = TeachingMode::Translate { to: "en".to_string() };

        let reply = client.reply_in(&session, &mode, "").await;
        reply.apply_to(&mut session, &mode, "");

        assert!(session.history().is_empty());
        assert_eq!(session.last_reply(), Some("Hi! How are you?"));
        let seen = engine.seen.lock().unwrap();
        let sent = &seen[0];
        assert_eq!(
            sent.last().map(|m| m.content.as_str()),
            Some("Translate this to en: Salut ! Ça va ?")
        );
    }

    #[test]
    fn system_prompt_reflects_params() {
        let params = TutorParams {
            topic: "cafe".to_string(),
            ..TutorParams::default()
        };
        let prompt = build_system_prompt(&params);
        assert!(prompt.contains("FR"));
        assert!(prompt.contains("A2"));
        assert!(prompt.contains("café"));
        assert!(prompt.contains("difficulty 2/5"));
    }

    #[test]
    fn english_sessions_get_english_apology() {
        let params = TutorParams {
            target_language: "en".to_string(),
            ..TutorParams::default()
        };
        assert!(apology(&params).text.starts_with("Sorry"));
    }
}
