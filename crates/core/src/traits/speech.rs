//! Streaming speech-to-text capability

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::audio::{AudioCodec, AudioFrame};
use crate::error::Result;
use crate::transcript::SttEvent;

/// Options for opening one STT stream
#[derive(Debug, Clone)]
pub struct SttSessionConfig {
    pub language: String,
    pub model: String,
    pub encoding: AudioCodec,
    pub sample_rate: u32,
    pub interim_results: bool,
    /// Silence (ms) after which the vendor finalises the current phrase
    pub endpointing_ms: u32,
    /// Silence (ms) after which the vendor emits an utterance-end event
    pub utterance_end_ms: u32,
}

impl Default for SttSessionConfig {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            model: "general".to_string(),
            encoding: AudioCodec::MulawPstn,
            sample_rate: AudioCodec::MulawPstn.sample_rate(),
            interim_results: true,
            endpointing_ms: 300,
            utterance_end_ms: 1000,
        }
    }
}

impl SttSessionConfig {
    pub fn for_codec(codec: AudioCodec) -> Self {
        Self {
            encoding: codec,
            sample_rate: codec.sample_rate(),
            ..Self::default()
        }
    }
}

/// One open STT stream, split into a push half and an event half so audio
/// forwarding and event consumption can run on separate tasks.
///
/// Dropping `audio_tx` closes the stream's input. The `events` receiver
/// ending without an explicit close signals a transport drop; the caller
/// decides whether to reconnect.
pub struct SttSession {
    pub audio_tx: mpsc::Sender<AudioFrame>,
    pub events: mpsc::Receiver<SttEvent>,
}

/// Streaming speech-to-text vendor capability
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Open a streaming session. Implementations own their transport and
    /// emit transcripts plus upstream VAD events on `events`.
    async fn open(&self, config: SttSessionConfig) -> Result<SttSession>;
}
