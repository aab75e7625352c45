//! Streaming text-to-speech capability

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::audio::{AudioCodec, AudioFrame};
use crate::conversation::Sentiment;
use crate::error::Result;

/// Voice tuning bundle keyed by the most recent user sentiment.
/// Alters delivery, never textual content.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToneProfile {
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
}

impl Default for ToneProfile {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.75,
            style: 0.0,
        }
    }
}

impl ToneProfile {
    /// Map the caller's sentiment to a delivery profile: steadier and
    /// warmer for a frustrated caller, livelier for a happy one.
    pub fn for_sentiment(sentiment: Sentiment) -> Self {
        match sentiment {
            Sentiment::Positive => Self {
                stability: 0.4,
                similarity_boost: 0.75,
                style: 0.3,
            },
            Sentiment::Negative => Self {
                stability: 0.8,
                similarity_boost: 0.85,
                style: 0.0,
            },
            Sentiment::Neutral => Self::default(),
        }
    }
}

/// Text chunk pushed into an open TTS stream
#[derive(Debug, Clone)]
pub struct TtsTextChunk {
    pub text: String,
    /// Force the vendor to synthesise buffered text now
    pub flush: bool,
}

impl TtsTextChunk {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            flush: false,
        }
    }

    pub fn flushed(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            flush: true,
        }
    }
}

/// One open chunked-push TTS stream.
///
/// Dropping `text_tx` closes the input half; the vendor synthesises any
/// remaining text and then closes `frames`.
pub struct TtsStream {
    pub text_tx: mpsc::Sender<TtsTextChunk>,
    pub frames: mpsc::Receiver<AudioFrame>,
}

/// Text-to-speech vendor capability
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Open a chunked-push streaming session in the session's outbound
    /// codec. Mandatory for the streaming path.
    async fn open_stream(
        &self,
        voice: &str,
        codec: AudioCodec,
        tone: Option<ToneProfile>,
    ) -> Result<TtsStream>;

    /// One-shot synthesis, the sequential fallback
    async fn synthesise(&self, voice: &str, codec: AudioCodec, text: &str)
        -> Result<Vec<AudioFrame>>;
}
