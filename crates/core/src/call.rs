//! Call identity and lifecycle metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Direction of a call relative to the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Carrier-level call status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Dialing,
    Ringing,
    Active,
    Transferred,
    Ended,
}

impl CallStatus {
    /// Terminal statuses release all per-call resources
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Transferred | CallStatus::Ended)
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallStatus::Dialing => "dialing",
            CallStatus::Ringing => "ringing",
            CallStatus::Active => "active",
            CallStatus::Transferred => "transferred",
            CallStatus::Ended => "ended",
        };
        write!(f, "{}", s)
    }
}

/// Why a call ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupReason {
    /// Remote party hung up
    Remote,
    /// The agent side requested the hangup
    Local,
    /// Call exceeded its configured maximum duration
    MaxDuration,
    /// Session idle past the registry sweep timeout
    IdleTimeout,
    /// Process-level shutdown
    Shutdown,
    /// Unrecoverable internal failure
    Fatal(String),
}

/// Monotonic + wall-clock timestamps for lifecycle points
#[derive(Debug, Clone)]
pub struct CallTimestamps {
    pub created_mono: Instant,
    pub created: DateTime<Utc>,
    pub answered_mono: Option<Instant>,
    pub answered: Option<DateTime<Utc>>,
    pub ended_mono: Option<Instant>,
    pub ended: Option<DateTime<Utc>>,
}

impl CallTimestamps {
    pub fn now() -> Self {
        Self {
            created_mono: Instant::now(),
            created: Utc::now(),
            answered_mono: None,
            answered: None,
            ended_mono: None,
            ended: None,
        }
    }

    pub fn mark_answered(&mut self) {
        if self.answered_mono.is_none() {
            self.answered_mono = Some(Instant::now());
            self.answered = Some(Utc::now());
        }
    }

    pub fn mark_ended(&mut self) {
        if self.ended_mono.is_none() {
            self.ended_mono = Some(Instant::now());
            self.ended = Some(Utc::now());
        }
    }
}

/// Static identity of one call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInfo {
    /// Opaque carrier call id
    pub call_id: String,
    pub direction: CallDirection,
    /// E.164 caller number
    pub caller: String,
    /// E.164 callee number
    pub callee: String,
}

impl CallInfo {
    pub fn inbound(call_id: impl Into<String>, caller: impl Into<String>, callee: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            direction: CallDirection::Inbound,
            caller: caller.into(),
            callee: callee.into(),
        }
    }

    pub fn outbound(call_id: impl Into<String>, caller: impl Into<String>, callee: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            direction: CallDirection::Outbound,
            caller: caller.into(),
            callee: callee.into(),
        }
    }
}
