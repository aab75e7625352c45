//! Capability traits for pluggable upstream vendors
//!
//! The core never names a vendor. Concrete STT/LLM/TTS clients implement
//! these traits and are injected as shared process-wide handles.

mod llm;
mod speech;
mod tts;

pub use llm::{LanguageModel, TokenStream};
pub use speech::{SpeechToText, SttSession, SttSessionConfig};
pub use tts::{TextToSpeech, ToneProfile, TtsStream, TtsTextChunk};
