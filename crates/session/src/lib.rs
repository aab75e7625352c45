//! Call sessions and the process-wide registry
//!
//! One `CallSession` per active call owns the playback buffer, VAD, speech
//! queue, barge-in state machine, conversation history, and the pipeline
//! orchestrator. The `SessionRegistry` is the only component that creates
//! or destroys sessions and enforces the concurrent-call limit.

pub mod registry;
pub mod session;

pub use registry::{SessionRegistry, SharedServices};
pub use session::{CallSession, SessionSnapshot};

use thiserror::Error;

/// Session-layer errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// The registry is at capacity; the carrier glue should reject the call
    #[error("admission rejected: {active} active calls (limit {limit})")]
    AdmissionRejected { active: usize, limit: usize },

    /// A session with this call id already exists
    #[error("duplicate call id: {0}")]
    DuplicateCall(String),

    /// No session for this call id
    #[error("unknown call id: {0}")]
    UnknownCall(String),

    #[error(transparent)]
    Core(#[from] voice_bridge_core::Error),
}
