//! Barge-in state machine
//!
//! Coordinates the VAD and playback controller so the caller can speak over
//! the agent and be heard immediately. One handler per session; there is no
//! terminal state, termination happens by session destruction.
//!
//! Legal transitions:
//!
//! | From → To | Trigger |
//! |---|---|
//! | Listening → Processing | STT final received, orchestrator started |
//! | Processing → Speaking | first TTS frame enqueued |
//! | Speaking → Interrupted | speech started while speaking (barge-in) |
//! | Speaking → Listening | all TTS frames played |
//! | Interrupted → Listening | playback drained, queue cleared |
//! | Processing → Listening | orchestrator failed or cancelled early |

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use voice_bridge_core::CancellationSource;

use crate::latency::percentile_summary;
use crate::playback::PlaybackController;
use crate::speech_queue::SpeechQueue;
use crate::PipelineError;

/// Conversation turn state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Agent listening; the caller may speak
    #[default]
    Listening,
    /// Generating a response
    Processing,
    /// Agent speaking; interruptible
    Speaking,
    /// Caller barged in; playback winding down
    Interrupted,
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TurnState::Listening => "listening",
            TurnState::Processing => "processing",
            TurnState::Speaking => "speaking",
            TurnState::Interrupted => "interrupted",
        };
        write!(f, "{}", s)
    }
}

static LEGAL_TRANSITIONS: Lazy<HashMap<TurnState, &'static [TurnState]>> = Lazy::new(|| {
    use TurnState::*;
    let mut map = HashMap::new();
    map.insert(Listening, &[Processing] as &[_]);
    map.insert(Processing, &[Speaking, Listening] as &[_]);
    map.insert(Speaking, &[Interrupted, Listening] as &[_]);
    map.insert(Interrupted, &[Listening] as &[_]);
    map
});

impl TurnState {
    pub fn can_transition_to(&self, target: TurnState) -> bool {
        LEGAL_TRANSITIONS
            .get(self)
            .map(|targets| targets.contains(&target))
            .unwrap_or(false)
    }
}

/// Handler tuning
#[derive(Debug, Clone)]
pub struct InterruptionConfig {
    pub enabled: bool,
    /// Speech shorter than this counts as a false positive
    pub min_speech_duration: Duration,
    /// SLO for stopping playback after speech is detected
    pub stop_latency_target: Duration,
    pub require_confident_speech: bool,
}

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_speech_duration: Duration::from_millis(200),
            stop_latency_target: Duration::from_millis(150),
            require_confident_speech: true,
        }
    }
}

/// Measurements from one executed barge-in
#[derive(Debug, Clone, Copy)]
pub struct BargeInReport {
    pub stop_latency_ms: u64,
    pub total_latency_ms: u64,
    pub cleared_speech_items: usize,
    pub met_target: bool,
}

/// Aggregate counters for observability
#[derive(Debug, Clone, Serialize)]
pub struct InterruptionStats {
    pub enabled: bool,
    pub state: TurnState,
    pub total_interruptions: u64,
    pub false_positives: u64,
    pub queue_size: usize,
    pub latency: Option<LatencySummary>,
}

pub use crate::latency::LatencySummary;

#[derive(Debug, Default)]
struct HandlerInner {
    state: TurnState,
    speech_start: Option<Instant>,
    total_interruptions: u64,
    false_positives: u64,
    latencies_ms: VecDeque<f64>,
}

const LATENCY_WINDOW: usize = 100;

/// Barge-in coordinator between VAD events and playback
pub struct InterruptionHandler {
    config: InterruptionConfig,
    playback: Arc<PlaybackController>,
    queue: Arc<SpeechQueue>,
    inner: Mutex<HandlerInner>,
    /// Cancellation for the in-flight orchestrator run
    turn_cancel: Mutex<Option<CancellationSource>>,
}

impl InterruptionHandler {
    pub fn new(
        config: InterruptionConfig,
        playback: Arc<PlaybackController>,
        queue: Arc<SpeechQueue>,
    ) -> Self {
        tracing::info!(
            enabled = config.enabled,
            min_speech_ms = config.min_speech_duration.as_millis() as u64,
            target_ms = config.stop_latency_target.as_millis() as u64,
            "Interruption handler initialized"
        );
        Self {
            config,
            playback,
            queue,
            inner: Mutex::new(HandlerInner::default()),
            turn_cancel: Mutex::new(None),
        }
    }

    pub fn state(&self) -> TurnState {
        self.inner.lock().state
    }

    /// Move to a new state, enforcing the transition table.
    pub fn transition(&self, to: TurnState) -> Result<TurnState, PipelineError> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        if from == to {
            return Ok(from);
        }
        if !from.can_transition_to(to) {
            return Err(PipelineError::IllegalTransition { from, to });
        }
        inner.state = to;
        drop(inner);

        tracing::info!(from = %from, to = %to, "Turn state change");
        Ok(from)
    }

    /// Register the cancellation source for the orchestrator run that is
    /// about to start. Barge-in and hangup cancel through it.
    pub fn begin_turn(&self, cancel: CancellationSource) {
        *self.turn_cancel.lock() = Some(cancel);
    }

    /// Cancel the in-flight run, if any. Idempotent.
    pub fn cancel_turn(&self) {
        if let Some(cancel) = self.turn_cancel.lock().as_ref() {
            cancel.cancel();
        }
    }

    pub fn end_turn(&self) {
        self.turn_cancel.lock().take();
    }

    /// Speech started. In `Speaking` this is the barge-in critical path:
    /// stop playback, clear the queue, cancel the run, go `Interrupted`.
    pub fn on_speech_started(&self) -> Option<BargeInReport> {
        if !self.config.enabled {
            return None;
        }

        {
            let mut inner = self.inner.lock();
            inner.speech_start = Some(Instant::now());
            if inner.state != TurnState::Speaking {
                return None;
            }
        }

        let barge_in_start = Instant::now();
        tracing::info!("Barge-in detected");

        // 1. Stop playback immediately
        let stop_latency_ms = self.playback.interrupt();
        // 2. Nothing queued may speak over the caller
        let cleared = self.queue.clear();
        // 3. Cancel the in-flight pipeline run
        self.cancel_turn();
        // 4. Transition
        let transitioned = {
            let mut inner = self.inner.lock();
            if inner.state == TurnState::Speaking {
                inner.state = TurnState::Interrupted;
                true
            } else {
                false
            }
        };
        if !transitioned {
            return None;
        }

        let total_latency_ms = barge_in_start.elapsed().as_millis() as u64;
        let met_target = total_latency_ms < self.config.stop_latency_target.as_millis() as u64;

        {
            let mut inner = self.inner.lock();
            inner.total_interruptions += 1;
            inner.latencies_ms.push_back(total_latency_ms as f64);
            while inner.latencies_ms.len() > LATENCY_WINDOW {
                inner.latencies_ms.pop_front();
            }
        }
        metrics::counter!("barge_ins").increment(1);

        tracing::info!(
            total_latency_ms,
            stop_latency_ms,
            cleared_speech_items = cleared,
            met_target,
            "Barge-in complete"
        );

        Some(BargeInReport {
            stop_latency_ms,
            total_latency_ms,
            cleared_speech_items: cleared,
            met_target,
        })
    }

    /// Speech ended. Short bursts under the confidence bar count as false
    /// positives rather than meaningful interruptions.
    pub fn on_speech_ended(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.speech_start = None;
        if self.config.require_confident_speech && duration < self.config.min_speech_duration {
            inner.false_positives += 1;
            tracing::debug!(
                duration_ms = duration.as_millis() as u64,
                "Speech too short, counted as false positive"
            );
        }
    }

    /// Playback confirmed stopped after a barge-in; back to listening.
    pub fn confirm_stopped(&self) -> Result<(), PipelineError> {
        if self.state() == TurnState::Interrupted {
            self.transition(TurnState::Listening)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> InterruptionStats {
        let inner = self.inner.lock();
        let latency = if inner.latencies_ms.is_empty() {
            None
        } else {
            let samples: Vec<f64> = inner.latencies_ms.iter().copied().collect();
            Some(percentile_summary(&samples))
        };
        InterruptionStats {
            enabled: self.config.enabled,
            state: inner.state,
            total_interruptions: inner.total_interruptions,
            false_positives: inner.false_positives,
            queue_size: self.queue.len(),
            latency,
        }
    }
}
