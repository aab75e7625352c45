//! Core traits and types for the call-bridge voice agent
//!
//! This crate provides the foundational pieces used across all other crates:
//! - Audio frames and telephony codecs (μ-law PSTN, PCM WebRTC)
//! - Call identity and lifecycle metadata
//! - Conversation turns and history
//! - Transcript events
//! - Session-scoped cooperative cancellation
//! - Capability traits for pluggable STT/LLM/TTS vendors
//! - Semantic error kinds

pub mod audio;
pub mod call;
pub mod cancel;
pub mod conversation;
pub mod error;
pub mod traits;
pub mod transcript;

pub use audio::{linear_to_mulaw, mulaw_to_linear, AudioCodec, AudioFrame};
pub use call::{CallDirection, CallInfo, CallStatus, CallTimestamps, HangupReason};
pub use cancel::{CancellationSource, CancellationToken};
pub use conversation::{ChatMessage, ConversationHistory, Intent, Sentiment, Turn, TurnRole};
pub use error::{Error, Result, UpstreamStage};
pub use traits::{
    LanguageModel, SpeechToText, SttSession, SttSessionConfig, TextToSpeech, TokenStream,
    ToneProfile, TtsStream, TtsTextChunk,
};
pub use transcript::{SttEvent, TranscriptEvent};
