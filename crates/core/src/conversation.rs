//! Conversation turns and history
//!
//! Turns are append-only within a session. User turns are tagged with a
//! keyword-derived intent and sentiment; the history keeps a sliding context
//! window for the language model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role in a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::System => "system",
        }
    }
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse intent of a user utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Question,
    Command,
    Greeting,
    Farewell,
    Statement,
}

impl Intent {
    /// Keyword heuristic over the lowercased text
    pub fn detect(text: &str) -> Self {
        let lower = text.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

        if has(&["how", "what", "why", "when", "where", "?"]) {
            Intent::Question
        } else if has(&["do ", "make ", "create ", "call ", "send "]) {
            Intent::Command
        } else if has(&["hello", "hi ", "hey"]) || lower.starts_with("hi") {
            Intent::Greeting
        } else if has(&["bye", "goodbye", "see you"]) {
            Intent::Farewell
        } else {
            Intent::Statement
        }
    }
}

/// Coarse sentiment of a user utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
    #[default]
    Neutral,
}

impl Sentiment {
    const POSITIVE: &'static [&'static str] =
        &["good", "great", "excellent", "happy", "thank", "perfect", "love"];
    const NEGATIVE: &'static [&'static str] =
        &["bad", "terrible", "awful", "sad", "angry", "frustrated", "annoyed"];

    /// Keyword heuristic over the lowercased text
    pub fn detect(text: &str) -> Self {
        let lower = text.to_lowercase();
        if Self::POSITIVE.iter().any(|w| lower.contains(w)) {
            Sentiment::Positive
        } else if Self::NEGATIVE.iter().any(|w| lower.contains(w)) {
            Sentiment::Negative
        } else {
            Sentiment::Neutral
        }
    }
}

/// A single turn in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// STT confidence for user turns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Sentiment>,
    /// True when an assistant turn was cut short by barge-in or cancellation.
    /// The text is then the prefix the caller actually heard.
    #[serde(default)]
    pub cancelled: bool,
}

impl Turn {
    pub fn new(role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
            confidence: None,
            intent: None,
            sentiment: None,
            cancelled: false,
        }
    }

    /// Create a user turn, tagging intent and sentiment
    pub fn user(text: impl Into<String>) -> Self {
        let text = text.into();
        let intent = Intent::detect(&text);
        let sentiment = Sentiment::detect(&text);
        Self {
            intent: Some(intent),
            sentiment: Some(sentiment),
            ..Self::new(TurnRole::User, text)
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(TurnRole::System, text)
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn cancelled(mut self) -> Self {
        self.cancelled = true;
        self
    }
}

/// Message handed to the language model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: TurnRole,
    pub content: String,
}

/// Append-only conversation history for one call
#[derive(Debug, Default)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn. Turns are never mutated or removed.
    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Sliding window of the last `max_turns` turns for the LLM. Only user
    /// and assistant turns with non-empty text are forwarded; the system
    /// prompt travels out-of-band.
    pub fn context_window(&self, max_turns: usize) -> Vec<ChatMessage> {
        let start = self.turns.len().saturating_sub(max_turns);
        self.turns[start..]
            .iter()
            .filter(|t| {
                matches!(t.role, TurnRole::User | TurnRole::Assistant)
                    && !t.text.trim().is_empty()
            })
            .map(|t| ChatMessage {
                role: t.role,
                content: t.text.clone(),
            })
            .collect()
    }

    /// Sentiment of the most recent user turn, used for the TTS tone profile
    pub fn last_user_sentiment(&self) -> Sentiment {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == TurnRole::User)
            .and_then(|t| t.sentiment)
            .unwrap_or_default()
    }
}
