//! Conversation state owned by the pipeline
//!
//! History, pedagogical parameters and the last-reply cache. Only the
//! orchestrator task mutates a session, and only between turns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Tutor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// CEFR level the tutor pitches its replies at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CefrLevel {
    #[default]
    A2,
    B1,
}

impl CefrLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "A2" => Some(CefrLevel::A2),
            "B1" => Some(CefrLevel::B1),
            _ => None,
        }
    }
}

impl fmt::Display for CefrLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CefrLevel::A2 => write!(f, "A2"),
            CefrLevel::B1 => write!(f, "B1"),
        }
    }
}

/// Difficulty on a 1..=5 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Difficulty(u8);

impl Difficulty {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn new(value: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&value).then_some(Self(value))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Difficulty {
    fn default() -> Self {
        Self(2)
    }
}

impl TryFrom<u8> for Difficulty {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Difficulty::new(value).ok_or_else(|| format!("difficulty must be 1-5, got {}", value))
    }
}

impl From<Difficulty> for u8 {
    fn from(d: Difficulty) -> Self {
        d.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TutorParams {
    pub level: CefrLevel,
    pub difficulty: Difficulty,
    pub topic: String,
    /// ISO 639-1 code of the language being learned
    pub target_language: String,
}

impl Default for TutorParams {
    fn default() -> Self {
        Self {
            level: CefrLevel::A2,
            difficulty: Difficulty::default(),
            topic: "free".to_string(),
            target_language: "fr".to_string(),
        }
    }
}

/// Teaching directive applied to one reply.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TeachingMode {
    /// Continue the conversation from fresh user input
    #[default]
    Normal,
    /// Re-emit the last reply verbatim
    Repeat,
    /// Simpler, slower restatement of the last reply
    Slower,
    /// Richer, faster restatement of the last reply
    Faster,
    /// Meta-explanation of the last reply
    Explain,
    /// Translation of the last reply
    Translate { to: String },
}

impl TeachingMode {
    /// Modes that operate on the cached last reply rather than user input.
    pub fn uses_last_reply(&self) -> bool {
        !matches!(self, TeachingMode::Normal)
    }

    pub fn label(&self) -> &'static str {
        match self {
            TeachingMode::Normal => "normal",
            TeachingMode::Repeat => "repeat",
            TeachingMode::Slower => "slower",
            TeachingMode::Faster => "faster",
            TeachingMode::Explain => "explain",
            TeachingMode::Translate { .. } => "translate",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationSession {
    history: Vec<HistoryEntry>,
    params: TutorParams,
    last_reply: Option<String>,
    context_window: usize,
}

impl Default for ConversationSession {
    fn default() -> Self {
        Self::new(TutorParams::default(), 10)
    }
}

impl ConversationSession {
    pub fn new(params: TutorParams, context_window: usize) -> Self {
        Self {
            history: Vec::new(),
            params,
            last_reply: None,
            context_window,
        }
    }

    pub fn params(&self) -> &TutorParams {
        &self.params
    }

    pub fn set_params(&mut self, params: TutorParams) {
        self.params = params;
    }

    /// Full history in insertion order.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// The last `context_window` entries, handed to the reply engine.
    pub fn context(&self) -> &[HistoryEntry] {
        let start = self.history.len().saturating_sub(self.context_window);
        &self.history[start..]
    }

    pub fn last_reply(&self) -> Option<&str> {
        self.last_reply.as_deref()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(Speaker::User, text.into());
    }

    pub fn push_tutor(&mut self, text: impl Into<String>) {
        self.push(Speaker::Tutor, text.into());
    }

    pub fn cache_reply(&mut self, text: impl Into<String>) {
        self.last_reply = Some(text.into());
    }

    /// Forget history and the cached reply; parameters are kept.
    pub fn clear(&mut self) {
        self.history.clear();
        self.last_reply = None;
    }

    fn push(&mut self, speaker: Speaker, text: String) {
        self.history.push(HistoryEntry {
            speaker,
            text,
            at: Utc::now(),
        });
    }
}
