//! Process-wide session registry
//!
//! The single mutable process-wide structure besides the latency tracker.
//! Admission and removal serialise on one lock; iteration works on
//! snapshots so `/calls`-style listing and shutdown never race inserts.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use voice_bridge_config::Settings;
use voice_bridge_core::{
    AudioCodec, AudioFrame, CallInfo, HangupReason, SpeechToText,
};
use voice_bridge_llm::ChatAdapter;
use voice_bridge_pipeline::{LatencySummary, LatencyTracker, Stage, Synthesizer};

use crate::session::{CallSession, SessionSnapshot};
use crate::SessionError;

/// Shared process-wide services injected into every session. Vendor
/// adapters keep their own connection pools; sessions only borrow them for
/// the duration of a pipeline run.
#[derive(Clone)]
pub struct SharedServices {
    pub stt: Arc<dyn SpeechToText>,
    pub chat: Arc<ChatAdapter>,
    pub synth: Arc<Synthesizer>,
    pub latency: Arc<LatencyTracker>,
}

/// Process-wide map of active calls
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<CallSession>>>,
    settings: Settings,
    services: SharedServices,
    max_concurrent_calls: usize,
}

impl SessionRegistry {
    pub fn new(settings: Settings, services: SharedServices) -> Arc<Self> {
        let max_concurrent_calls = settings.limits.max_concurrent_calls;
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            settings,
            services,
            max_concurrent_calls,
        })
    }

    /// Admit a new call: constructs and inserts the session, or rejects
    /// fast when the registry is at capacity. The capacity check and the
    /// insert happen under one lock.
    pub fn admit(
        self: &Arc<Self>,
        info: CallInfo,
        codec: AudioCodec,
    ) -> Result<Arc<CallSession>, SessionError> {
        let mut sessions = self.sessions.write();

        if sessions.len() >= self.max_concurrent_calls {
            metrics::counter!("admission_rejections").increment(1);
            tracing::warn!(
                call_id = %info.call_id,
                active = sessions.len(),
                limit = self.max_concurrent_calls,
                "Admission rejected"
            );
            return Err(SessionError::AdmissionRejected {
                active: sessions.len(),
                limit: self.max_concurrent_calls,
            });
        }
        if sessions.contains_key(&info.call_id) {
            return Err(SessionError::DuplicateCall(info.call_id));
        }

        let call_id = info.call_id.clone();
        let session = CallSession::start(
            info,
            codec,
            &self.settings,
            self.services.clone(),
            Arc::downgrade(self),
        );
        sessions.insert(call_id, session.clone());
        Ok(session)
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<CallSession>> {
        self.sessions.read().get(call_id).cloned()
    }

    /// Remove a session from the map. Idempotent; removing an unknown id
    /// is a no-op.
    pub fn remove(&self, call_id: &str) {
        if self.sessions.write().remove(call_id).is_some() {
            tracing::info!(call_id, "Session removed from registry");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Snapshot of live sessions, safe against concurrent admit/remove
    pub fn snapshot(&self) -> Vec<Arc<CallSession>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    // ---- carrier-glue conveniences ----

    pub fn push_inbound(&self, call_id: &str, frame: AudioFrame) -> Result<(), SessionError> {
        let session = self
            .get(call_id)
            .ok_or_else(|| SessionError::UnknownCall(call_id.to_string()))?;
        session.feed_inbound(frame);
        Ok(())
    }

    pub fn subscribe_outbound(
        &self,
        call_id: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<AudioFrame>, SessionError> {
        let session = self
            .get(call_id)
            .ok_or_else(|| SessionError::UnknownCall(call_id.to_string()))?;
        session
            .subscribe_outbound()
            .ok_or_else(|| SessionError::UnknownCall(format!("{} (outbound taken)", call_id)))
    }

    // ---- observability ----

    pub fn session_state(&self, call_id: &str) -> Option<SessionSnapshot> {
        self.get(call_id).map(|s| s.snapshot())
    }

    pub fn latency_stats(&self) -> HashMap<Stage, LatencySummary> {
        self.services.latency.all_stats()
    }

    // ---- lifecycle ----

    /// Hang up everything, used at process shutdown.
    pub async fn shutdown(&self) {
        let sessions = self.snapshot();
        tracing::info!(count = sessions.len(), "Registry shutdown");
        for session in sessions {
            session.hangup(HangupReason::Shutdown).await;
        }
    }

    /// Start a background sweep that hangs up sessions idle past the
    /// configured timeout. Returns the shutdown sender for the task.
    pub fn start_sweep_task(self: &Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let registry = Arc::clone(self);
        let idle_timeout = Duration::from_secs(registry.settings.limits.idle_timeout_secs);
        let sweep_every = Duration::from_secs(30).min(idle_timeout);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for session in registry.snapshot() {
                            if session.idle_for() > idle_timeout {
                                tracing::warn!(
                                    call_id = %session.call_id(),
                                    idle_secs = session.idle_for().as_secs(),
                                    "Idle session swept"
                                );
                                tokio::spawn(async move {
                                    session.hangup(HangupReason::IdleTimeout).await;
                                });
                            }
                        }
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("Session sweep task shutting down");
                            break;
                        }
                    },
                }
            }
        });

        shutdown_tx
    }
}
