//! Per-call streaming pipeline
//!
//! This crate provides the concurrent machinery of one call:
//! - Jitter/playback buffering with instant interrupt
//! - Dual-source voice activity detection
//! - Priority speech queue
//! - Barge-in state machine
//! - STT/TTS adapters over the vendor capability traits
//! - Ambiguity screening with templated clarification questions
//! - Token-to-chunk stream coordination
//! - The pipeline orchestrator driving one user turn end to end
//! - Per-stage latency tracking

pub mod clarify;
pub mod coordinator;
pub mod interruption;
pub mod latency;
pub mod orchestrator;
pub mod playback;
pub mod speech_queue;
pub mod stt;
pub mod tts;
pub mod vad;

// Clarification exports
pub use clarify::{Ambiguity, AmbiguityDetector, AmbiguityReason, Clarifier, ClarifyConfig};

// Playback exports
pub use playback::{
    BufferStats, PlaybackBuffer, PlaybackBufferConfig, PlaybackController, PlaybackOutcome,
    PlaybackState,
};

// VAD exports
pub use vad::{DualVad, VadConfig, VadEvent, VadStats};

// Speech queue exports
pub use speech_queue::{SpeechItem, SpeechQueue};

// Interruption exports
pub use interruption::{
    BargeInReport, InterruptionConfig, InterruptionHandler, InterruptionStats, TurnState,
};

// Coordinator exports
pub use coordinator::StreamCoordinator;

// Latency exports
pub use latency::{percentile_summary, LatencySummary, LatencyTracker, Stage};

// Adapter exports
pub use stt::{run_stt_feed, SttFeedConfig};
pub use tts::{Synthesizer, SynthesizerConfig};

// Orchestrator exports
pub use orchestrator::{
    OrchestratorConfig, PipelineOrchestrator, StreamingMode, TurnOutcome,
};

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("illegal turn transition {from} -> {to}")]
    IllegalTransition {
        from: interruption::TurnState,
        to: interruption::TurnState,
    },

    #[error("playback error: {0}")]
    Playback(String),

    #[error("channel closed")]
    ChannelClosed,
}

impl From<PipelineError> for voice_bridge_core::Error {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::IllegalTransition { from, to } => voice_bridge_core::Error::SessionFatal(
                format!("illegal turn transition {} -> {}", from, to),
            ),
            PipelineError::Playback(msg) => voice_bridge_core::Error::Adapter(msg),
            PipelineError::ChannelClosed => voice_bridge_core::Error::ChannelClosed,
        }
    }
}
