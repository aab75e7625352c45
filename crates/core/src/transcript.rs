//! Transcript and upstream VAD events from the STT stream

use serde::{Deserialize, Serialize};

/// One transcript emission from the STT stream.
///
/// Only `is_final = true` events advance the conversation; partials may be
/// surfaced for UX but are never fed to the language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
    pub confidence: f32,
    /// Groups partials belonging to the same utterance
    pub utterance_id: String,
}

impl TranscriptEvent {
    pub fn partial(text: impl Into<String>, confidence: f32, utterance_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            confidence,
            utterance_id: utterance_id.into(),
        }
    }

    pub fn final_(text: impl Into<String>, confidence: f32, utterance_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            confidence,
            utterance_id: utterance_id.into(),
        }
    }
}

/// Event emitted by an open STT stream: transcripts plus the upstream
/// voice-activity signals used as the primary VAD source.
#[derive(Debug, Clone)]
pub enum SttEvent {
    Transcript(TranscriptEvent),
    SpeechStarted,
    UtteranceEnd,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let p = TranscriptEvent::partial("hel", 0.5, "u1");
        assert!(!p.is_final);
        let f = TranscriptEvent::final_("hello", 0.95, "u1");
        assert!(f.is_final);
        assert_eq!(f.utterance_id, "u1");
    }
}
