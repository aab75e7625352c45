//! Call session
//!
//! One isolated coordination unit per call. Owns the per-call pipeline
//! components and runs four tasks for the life of the call:
//! - STT feed: inbound frames to the vendor stream, events back
//! - Event loop: transcripts and upstream VAD events dispatched
//! - Turn loop: finals processed one at a time, speech queue drained
//! - Watchdog: hangs up when the call exceeds its duration ceiling
//!
//! The barge-in path is synchronous inside `feed_inbound`/the event loop:
//! speech during playback interrupts the buffer, clears the queue, and
//! cancels the in-flight turn before anything yields.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use voice_bridge_config::Settings;
use voice_bridge_core::{
    AudioCodec, AudioFrame, CallInfo, CallStatus, CallTimestamps, CancellationSource,
    CancellationToken, ConversationHistory, Error, HangupReason, SttEvent, SttSessionConfig,
    TranscriptEvent, Turn,
};
use voice_bridge_pipeline::{
    run_stt_feed, AmbiguityDetector, BufferStats, Clarifier, ClarifyConfig, DualVad,
    InterruptionConfig, InterruptionHandler, InterruptionStats, OrchestratorConfig,
    PipelineOrchestrator, PlaybackBuffer, PlaybackBufferConfig, PlaybackController, SpeechQueue,
    SttFeedConfig, TurnOutcome, TurnState, VadConfig, VadEvent, VadStats,
};

use crate::registry::{SessionRegistry, SharedServices};

/// Read-only view of one session for `/calls`-style introspection
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub call_id: String,
    pub status: CallStatus,
    pub state: TurnState,
    pub queue_size: usize,
    pub buffer_depth_ms: u64,
    pub turn_count: usize,
    pub invalid_frames: u64,
    pub clarifications: u64,
    pub vad: VadStats,
    pub interruption: InterruptionStats,
    pub playback: BufferStats,
}

/// One active call
pub struct CallSession {
    info: CallInfo,
    codec: AudioCodec,

    status: Mutex<CallStatus>,
    timestamps: Mutex<CallTimestamps>,
    history: Mutex<ConversationHistory>,

    buffer: Arc<PlaybackBuffer>,
    playback: Arc<PlaybackController>,
    vad: Arc<DualVad>,
    queue: Arc<SpeechQueue>,
    handler: Arc<InterruptionHandler>,
    orchestrator: Arc<PipelineOrchestrator>,
    detector: AmbiguityDetector,
    clarifier: Clarifier,

    /// Session-wide cancellation: hangup and shutdown
    cancel: CancellationSource,

    outbound_tx: mpsc::Sender<AudioFrame>,
    outbound_rx: Mutex<Option<mpsc::Receiver<AudioFrame>>>,
    stt_audio_tx: mpsc::Sender<AudioFrame>,
    queue_notify: Notify,

    greeting: String,
    apology: String,
    cleanup_deadline: Duration,
    max_call_duration: Duration,

    last_activity: Mutex<Instant>,
    invalid_frames: AtomicU64,
    clarifications: AtomicU64,
    stt_backlog_drops: AtomicU64,
    hangup_started: AtomicBool,

    tasks: Mutex<Vec<JoinHandle<()>>>,
    registry: Mutex<Option<Weak<SessionRegistry>>>,
}

impl CallSession {
    /// Build the session and spawn its tasks. Only the registry calls this.
    pub(crate) fn start(
        info: CallInfo,
        codec: AudioCodec,
        settings: &Settings,
        services: SharedServices,
        registry: Weak<SessionRegistry>,
    ) -> Arc<Self> {
        let buffer = Arc::new(PlaybackBuffer::new(PlaybackBufferConfig {
            chunk_size_ms: settings.audio.chunk_size_ms,
            jitter_buffer_ms: settings.audio.jitter_buffer_ms,
            max_buffer_ms: settings.audio.max_buffer_ms,
            fadeout_ms: settings.audio.fadeout_ms,
            jitter_fill_timeout: Duration::from_millis(settings.timeouts.jitter_fill_ms),
        }));
        let playback = Arc::new(PlaybackController::new(buffer.clone()));
        let vad = Arc::new(DualVad::new(VadConfig {
            min_speech_duration: Duration::from_millis(settings.vad.min_speech_duration_ms),
            debounce: Duration::from_millis(settings.vad.debounce_ms),
            energy_threshold: settings.vad.energy_threshold,
            energy_window: settings.vad.energy_window,
        }));
        let queue = Arc::new(SpeechQueue::new());
        let handler = Arc::new(InterruptionHandler::new(
            InterruptionConfig {
                enabled: settings.interruption.enabled,
                min_speech_duration: Duration::from_millis(settings.vad.min_speech_duration_ms),
                stop_latency_target: Duration::from_millis(
                    settings.interruption.stop_latency_target_ms,
                ),
                require_confident_speech: settings.interruption.require_confident_speech,
            },
            playback.clone(),
            queue.clone(),
        ));
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            services.chat.clone(),
            services.synth.clone(),
            playback.clone(),
            handler.clone(),
            services.latency.clone(),
            OrchestratorConfig {
                system_prompt: settings.conversation.system_prompt.clone(),
                codec,
                stream_chunk_size: settings.streaming.stream_chunk_size,
                llm_first_token_timeout: Duration::from_millis(
                    settings.timeouts.llm_first_token_ms,
                ),
                llm_turn_timeout: Duration::from_millis(settings.timeouts.llm_turn_ms),
                tts_first_frame_timeout: Duration::from_millis(
                    settings.timeouts.tts_first_frame_ms,
                ),
                tts_turn_timeout: Duration::from_millis(settings.timeouts.tts_turn_ms),
            },
        ));

        // Outbound holds ~5s of 20ms frames; the pump blocks rather than
        // drop once the carrier stops reading
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (stt_audio_tx, stt_audio_rx) = mpsc::channel(64);
        let (stt_events_tx, stt_events_rx) = mpsc::channel(64);
        let (finals_tx, finals_rx) = mpsc::channel(8);

        let initial_status = match info.direction {
            voice_bridge_core::CallDirection::Inbound => CallStatus::Ringing,
            voice_bridge_core::CallDirection::Outbound => CallStatus::Dialing,
        };

        let session = Arc::new(Self {
            info,
            codec,
            status: Mutex::new(initial_status),
            timestamps: Mutex::new(CallTimestamps::now()),
            history: Mutex::new(ConversationHistory::new()),
            buffer,
            playback,
            vad,
            queue,
            handler,
            orchestrator,
            detector: AmbiguityDetector::new(ClarifyConfig {
                enabled: settings.clarification.enabled,
                short_word_threshold: settings.clarification.short_word_threshold,
                min_confidence: settings.clarification.min_confidence,
                ..ClarifyConfig::default()
            }),
            clarifier: Clarifier::new(),
            cancel: CancellationSource::new(),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            stt_audio_tx,
            queue_notify: Notify::new(),
            greeting: settings.conversation.greeting.clone(),
            apology: settings.conversation.apology.clone(),
            cleanup_deadline: Duration::from_millis(settings.limits.cleanup_deadline_ms),
            max_call_duration: Duration::from_secs(settings.limits.max_call_duration_secs),
            last_activity: Mutex::new(Instant::now()),
            invalid_frames: AtomicU64::new(0),
            clarifications: AtomicU64::new(0),
            stt_backlog_drops: AtomicU64::new(0),
            hangup_started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            registry: Mutex::new(Some(registry)),
        });

        let stt_feed_config = SttFeedConfig {
            session: SttSessionConfig::for_codec(codec),
            open_timeout: Duration::from_millis(settings.timeouts.stt_open_ms),
            max_reconnects: settings.retry.max_attempts,
            initial_backoff: Duration::from_millis(settings.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.retry.max_backoff_ms),
        };

        let mut tasks = Vec::new();
        tasks.push(session.spawn_stt_feed(
            services,
            stt_feed_config,
            stt_audio_rx,
            stt_events_tx,
        ));
        tasks.push(session.spawn_event_loop(stt_events_rx, finals_tx));
        tasks.push(session.spawn_turn_loop(finals_rx));
        tasks.push(session.spawn_watchdog());
        *session.tasks.lock() = tasks;

        tracing::info!(
            call_id = %session.info.call_id,
            direction = ?session.info.direction,
            codec = %codec,
            "Call session started"
        );
        session
    }

    // ---- carrier-facing surface ----

    /// Route one inbound media frame to STT and the local VAD. Malformed
    /// frames are dropped and counted; the session keeps going.
    pub fn feed_inbound(&self, frame: AudioFrame) {
        if self.is_ended() {
            return;
        }
        if frame.codec != self.codec || !frame.is_well_formed() {
            self.invalid_frames.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("invalid_frames").increment(1);
            tracing::debug!(
                call_id = %self.info.call_id,
                frame_codec = %frame.codec,
                frame_len = frame.len(),
                "Dropped invalid inbound frame"
            );
            return;
        }
        *self.last_activity.lock() = Instant::now();

        // Local energy VAD runs on every inbound frame
        self.dispatch_vad(self.vad.process_frame(&frame));

        // STT push must not block the carrier; drop on backlog
        if self.stt_audio_tx.try_send(frame).is_err() {
            self.stt_backlog_drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take the realtime outbound stream. Yields frames at playback pace;
    /// can be taken exactly once.
    pub fn subscribe_outbound(&self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.outbound_rx.lock().take()
    }

    /// Carrier reports the call answered: mark timestamps and greet.
    pub fn on_answered(&self) {
        {
            let mut status = self.status.lock();
            if status.is_terminal() {
                return;
            }
            *status = CallStatus::Active;
        }
        self.timestamps.lock().mark_answered();
        tracing::info!(call_id = %self.info.call_id, "Call answered");

        if !self.greeting.is_empty() {
            let greeting = self.greeting.clone();
            self.speak(greeting, 10);
        }
    }

    /// Queue text for the agent to speak. If the session is listening, the
    /// turn loop picks it up immediately via a direct-TTS run.
    pub fn speak(&self, text: impl Into<String>, priority: i32) -> Option<u64> {
        let text = text.into();
        if text.trim().is_empty() || self.is_ended() {
            return None;
        }
        let id = self.queue.add(text, priority);
        self.queue_notify.notify_one();
        Some(id)
    }

    /// Terminal: cancel everything, drain, record end state, leave the
    /// registry. Idempotent; `hangup(); hangup()` is one hangup.
    pub async fn hangup(&self, reason: HangupReason) {
        if self.hangup_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(call_id = %self.info.call_id, reason = ?reason, "Hangup");

        {
            let mut status = self.status.lock();
            if !status.is_terminal() {
                *status = CallStatus::Ended;
            }
        }
        self.timestamps.lock().mark_ended();

        self.handler.cancel_turn();
        self.cancel.cancel();
        self.playback.interrupt();
        self.queue.clear();

        // Everything must be released within the cleanup deadline
        let deadline = Instant::now() + self.cleanup_deadline;
        let handles = std::mem::take(&mut *self.tasks.lock());
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        let registry = self.registry.lock().take();
        if let Some(registry) = registry.and_then(|weak| weak.upgrade()) {
            registry.remove(&self.info.call_id);
        }
        tracing::info!(call_id = %self.info.call_id, "Session torn down");
    }

    // ---- observability ----

    pub fn call_id(&self) -> &str {
        &self.info.call_id
    }

    pub fn info(&self) -> &CallInfo {
        &self.info
    }

    pub fn status(&self) -> CallStatus {
        *self.status.lock()
    }

    pub fn state(&self) -> TurnState {
        self.handler.state()
    }

    pub fn is_ended(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn turn_count(&self) -> usize {
        self.history.lock().len()
    }

    /// Clone of the full conversation so far
    pub fn history(&self) -> Vec<Turn> {
        self.history.lock().turns().to_vec()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            call_id: self.info.call_id.clone(),
            status: self.status(),
            state: self.handler.state(),
            queue_size: self.queue.len(),
            buffer_depth_ms: self.buffer.buffered_ms(),
            turn_count: self.turn_count(),
            invalid_frames: self.invalid_frames.load(Ordering::Relaxed),
            clarifications: self.clarifications.load(Ordering::Relaxed),
            vad: self.vad.stats(),
            interruption: self.handler.stats(),
            playback: self.buffer.stats(),
        }
    }

    // ---- internal tasks ----

    fn spawn_stt_feed(
        self: &Arc<Self>,
        services: SharedServices,
        config: SttFeedConfig,
        audio_rx: mpsc::Receiver<AudioFrame>,
        events_tx: mpsc::Sender<SttEvent>,
    ) -> JoinHandle<()> {
        let session = self.clone();
        let token = self.cancel.token();
        tokio::spawn(async move {
            match run_stt_feed(services.stt.clone(), config, audio_rx, events_tx, token).await {
                Ok(()) => {},
                Err(e) => {
                    // STT is gone for this call: no further turns start, but
                    // the session itself stays valid and listening
                    tracing::error!(
                        call_id = %session.info.call_id,
                        error = %e,
                        "STT feed down, session stays in listening"
                    );
                },
            }
        })
    }

    fn spawn_event_loop(
        self: &Arc<Self>,
        mut events_rx: mpsc::Receiver<SttEvent>,
        finals_tx: mpsc::Sender<TranscriptEvent>,
    ) -> JoinHandle<()> {
        let session = self.clone();
        let token = self.cancel.token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events_rx.recv() => match event {
                        None => break,
                        Some(SttEvent::Transcript(t)) => {
                            if t.is_final {
                                if t.text.trim().is_empty() {
                                    continue;
                                }
                                if finals_tx.send(t).await.is_err() {
                                    break;
                                }
                            } else {
                                tracing::trace!(
                                    call_id = %session.info.call_id,
                                    partial = %t.text,
                                    "Partial transcript"
                                );
                            }
                        },
                        Some(other) => {
                            let event = session.vad.on_upstream_event(&other);
                            session.dispatch_vad(event);
                        },
                    },
                }
            }
        })
    }

    fn spawn_turn_loop(
        self: &Arc<Self>,
        mut finals_rx: mpsc::Receiver<TranscriptEvent>,
    ) -> JoinHandle<()> {
        let session = self.clone();
        let token = self.cancel.token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = session.queue_notify.notified() => {
                        session.drain_speech_queue(&token).await;
                    },
                    transcript = finals_rx.recv() => match transcript {
                        None => break,
                        Some(t) => {
                            // A final landing mid-interruption waits for the
                            // state machine to come back to listening
                            if !session.wait_for_listening(&token).await {
                                break;
                            }
                            session.run_user_turn(t).await;
                            session.drain_speech_queue(&token).await;
                        },
                    },
                }
            }
        })
    }

    fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let token = self.cancel.token();
        let max_duration = self.max_call_duration;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {},
                _ = tokio::time::sleep(max_duration) => {
                    if let Some(session) = weak.upgrade() {
                        tracing::warn!(
                            call_id = %session.info.call_id,
                            max_secs = max_duration.as_secs(),
                            "Maximum call duration reached"
                        );
                        tokio::spawn(async move {
                            session.hangup(HangupReason::MaxDuration).await;
                        });
                    }
                },
            }
        })
    }

    // ---- turn machinery ----

    fn dispatch_vad(&self, event: Option<VadEvent>) {
        match event {
            Some(VadEvent::SpeechStarted) => {
                if let Some(report) = self.handler.on_speech_started() {
                    tracing::info!(
                        call_id = %self.info.call_id,
                        total_latency_ms = report.total_latency_ms,
                        met_target = report.met_target,
                        "Caller barged in"
                    );
                }
            },
            Some(VadEvent::SpeechEnded { duration }) => {
                self.handler.on_speech_ended(duration);
            },
            None => {},
        }
    }

    async fn wait_for_listening(&self, token: &CancellationToken) -> bool {
        loop {
            if token.is_cancelled() {
                return false;
            }
            if self.handler.state() == TurnState::Listening {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn run_user_turn(&self, transcript: TranscriptEvent) {
        if self.handler.transition(TurnState::Processing).is_err() {
            return;
        }

        // History snapshot from before this user turn; the user turn itself
        // commits now that STT finalised it
        let context = self.history.lock().turns().to_vec();
        let user_turn = Turn::user(&transcript.text).with_confidence(transcript.confidence);
        let sentiment = user_turn.sentiment.unwrap_or_default();
        self.history.lock().push(user_turn);
        *self.last_activity.lock() = Instant::now();

        // Ambiguous input short-circuits to a clarification question over
        // the direct-TTS path; the LLM never sees it
        if let Some(ambiguity) = self
            .detector
            .detect(&transcript.text, Some(transcript.confidence))
        {
            tracing::info!(
                call_id = %self.info.call_id,
                reason = %ambiguity.reason,
                "Ambiguous user turn, asking for clarification"
            );
            self.clarifications.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("clarifications").increment(1);

            let question = self.clarifier.generate(&ambiguity, &transcript.text);
            self.direct_speech(&question).await;
            return;
        }

        let source = CancellationSource::new();
        let turn_token = source.token();
        self.handler.begin_turn(source);

        let result = self
            .orchestrator
            .run_turn(
                &self.info.call_id,
                &transcript.text,
                &context,
                sentiment,
                self.outbound_tx.clone(),
                turn_token,
            )
            .await;
        self.handler.end_turn();

        match result {
            Ok(outcome) => self.record_assistant_turn(&outcome),
            Err(Error::TurnTimeout(stage)) => {
                tracing::warn!(call_id = %self.info.call_id, stage = %stage, "Turn timed out");
                self.speak_apology().await;
            },
            Err(Error::UpstreamDown(stage)) => {
                tracing::warn!(
                    call_id = %self.info.call_id,
                    stage = %stage,
                    "Upstream down, turn aborted"
                );
            },
            Err(e) if e.is_cancellation() => {},
            Err(e) => {
                tracing::error!(call_id = %self.info.call_id, error = %e, "Turn failed");
            },
        }
    }

    fn record_assistant_turn(&self, outcome: &TurnOutcome) {
        let mut turn = Turn::assistant(outcome.text.clone());
        if outcome.cancelled {
            turn = turn.cancelled();
        }
        self.history.lock().push(turn);
    }

    async fn drain_speech_queue(&self, token: &CancellationToken) {
        loop {
            if token.is_cancelled() || self.handler.state() != TurnState::Listening {
                return;
            }
            let Some(item) = self.queue.get_next() else {
                return;
            };
            tracing::debug!(
                call_id = %self.info.call_id,
                speech_id = item.id,
                priority = item.priority,
                "Speaking queued item"
            );
            self.direct_speech(&item.text).await;
        }
    }

    /// Speak text through the direct-TTS path and record it.
    async fn direct_speech(&self, text: &str) -> Option<TurnOutcome> {
        if self.handler.transition(TurnState::Processing).is_err() {
            return None;
        }
        let source = CancellationSource::new();
        let turn_token = source.token();
        self.handler.begin_turn(source);

        let sentiment = self.history.lock().last_user_sentiment();
        let result = self
            .orchestrator
            .run_direct_speech(
                &self.info.call_id,
                text,
                sentiment,
                self.outbound_tx.clone(),
                turn_token,
            )
            .await;
        self.handler.end_turn();

        match result {
            Ok(outcome) => {
                self.record_assistant_turn(&outcome);
                Some(outcome)
            },
            Err(e) => {
                tracing::warn!(call_id = %self.info.call_id, error = %e, "Direct speech failed");
                None
            },
        }
    }

    /// Short pre-canned apology after a turn timeout; silence when even
    /// that fails.
    async fn speak_apology(&self) {
        if self.apology.is_empty() {
            return;
        }
        let apology = self.apology.clone();
        let _ = self.direct_speech(&apology).await;
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", &self.info.call_id)
            .field("status", &self.status())
            .field("state", &self.handler.state())
            .finish()
    }
}
