//! TTS adapter: chunked-push synthesis with a one-shot fallback
//!
//! Thin wrapper over the vendor capability that pins the configured voice
//! and derives the tone profile from the caller's sentiment. The streaming
//! handshake failing is not fatal; the orchestrator falls back to one-shot
//! synthesis for the turn.

use std::sync::Arc;
use std::time::Duration;

use voice_bridge_core::{
    AudioCodec, AudioFrame, Error, Result, Sentiment, TextToSpeech, ToneProfile, TtsStream,
    UpstreamStage,
};

/// Synthesizer tuning
#[derive(Debug, Clone)]
pub struct SynthesizerConfig {
    pub voice: String,
    /// Budget for one-shot synthesis of a full reply
    pub one_shot_timeout: Duration,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            voice: "alloy".to_string(),
            one_shot_timeout: Duration::from_secs(15),
        }
    }
}

/// Voice synthesis front-end shared process-wide
pub struct Synthesizer {
    tts: Arc<dyn TextToSpeech>,
    config: SynthesizerConfig,
}

impl Synthesizer {
    pub fn new(tts: Arc<dyn TextToSpeech>, config: SynthesizerConfig) -> Self {
        Self { tts, config }
    }

    /// Open a chunked-push stream with the tone derived from `sentiment`.
    pub async fn open_stream(&self, codec: AudioCodec, sentiment: Sentiment) -> Result<TtsStream> {
        let tone = ToneProfile::for_sentiment(sentiment);
        self.tts
            .open_stream(&self.config.voice, codec, Some(tone))
            .await
    }

    /// One-shot synthesis of a complete reply, the sequential fallback.
    pub async fn synthesise(&self, codec: AudioCodec, text: &str) -> Result<Vec<AudioFrame>> {
        match tokio::time::timeout(
            self.config.one_shot_timeout,
            self.tts.synthesise(&self.config.voice, codec, text),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::TurnTimeout(UpstreamStage::Tts)),
        }
    }

    pub fn voice(&self) -> &str {
        &self.config.voice
    }
}
