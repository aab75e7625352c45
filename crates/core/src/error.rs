//! Semantic error kinds shared across the pipeline

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which upstream capability failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamStage {
    Stt,
    Llm,
    Tts,
}

impl UpstreamStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamStage::Stt => "stt",
            UpstreamStage::Llm => "llm",
            UpstreamStage::Tts => "tts",
        }
    }
}

impl std::fmt::Display for UpstreamStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Core errors. Adapter failures never cross session boundaries; the
/// orchestrator routes every task error to one sink that decides the
/// turn-level action.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Upstream capability unreachable after retries were exhausted.
    /// Aborts the current turn; the session stays alive and listening.
    #[error("upstream {0} down after retries")]
    UpstreamDown(UpstreamStage),

    /// A stage exceeded its turn-level deadline
    #[error("turn timed out waiting on {0}")]
    TurnTimeout(UpstreamStage),

    /// Expected cancellation path: the caller spoke over the agent
    #[error("turn cancelled by barge-in")]
    CancelledByBargeIn,

    /// Cancellation for any other reason (hangup, shutdown)
    #[error("cancelled")]
    Cancelled,

    /// Malformed inbound frame; dropped and counted
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Unrecoverable invariant breach; forces session teardown
    #[error("session fatal: {0}")]
    SessionFatal(String),

    /// Adapter-level failure that is still retryable
    #[error("adapter error: {0}")]
    Adapter(String),

    /// An internal channel closed before its producer finished
    #[error("channel closed")]
    ChannelClosed,
}

impl Error {
    /// True for the cancellation family of errors
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::CancelledByBargeIn)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
