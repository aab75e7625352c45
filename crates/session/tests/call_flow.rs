//! End-to-end call flow tests with scripted vendor adapters

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use voice_bridge_config::Settings;
use voice_bridge_core::{
    AudioCodec, AudioFrame, CallInfo, CallStatus, CancellationSource, ChatMessage, Error,
    HangupReason, LanguageModel, Result as CoreResult, SpeechToText, SttEvent, SttSession,
    SttSessionConfig, TextToSpeech, TokenStream, ToneProfile, TranscriptEvent, TtsStream,
    TurnRole,
};
use voice_bridge_llm::{ChatAdapter, ChatAdapterConfig};
use voice_bridge_pipeline::{
    InterruptionConfig, InterruptionHandler, LatencyTracker, OrchestratorConfig,
    PipelineOrchestrator, PlaybackBuffer, PlaybackBufferConfig, PlaybackController, SpeechQueue,
    StreamingMode, Synthesizer, SynthesizerConfig, TurnState,
};
use voice_bridge_session::{SessionError, SessionRegistry, SharedServices};

// ---- scripted vendors ----

/// STT whose event stream is driven by the test through a channel
struct ScriptedStt {
    feed: Mutex<Option<mpsc::Receiver<SttEvent>>>,
}

impl ScriptedStt {
    fn new() -> (Arc<Self>, mpsc::Sender<SttEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                feed: Mutex::new(Some(rx)),
            }),
            tx,
        )
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn open(&self, _config: SttSessionConfig) -> CoreResult<SttSession> {
        let mut script = self
            .feed
            .lock()
            .take()
            .ok_or_else(|| Error::Adapter("stream already taken".into()))?;

        let (audio_tx, mut audio_rx) = mpsc::channel::<AudioFrame>(64);
        let (event_tx, events) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = audio_rx.recv() => {
                        if frame.is_none() {
                            break;
                        }
                    },
                    event = script.recv() => match event {
                        Some(event) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        },
                        None => break,
                    },
                }
            }
        });
        Ok(SttSession { audio_tx, events })
    }
}

/// STT that is simply unreachable
struct DownStt;

#[async_trait]
impl SpeechToText for DownStt {
    async fn open(&self, _config: SttSessionConfig) -> CoreResult<SttSession> {
        Err(Error::Adapter("connection refused".into()))
    }
}

/// LLM replaying scripted token lists, one per call; pends forever when
/// the script runs out
struct ScriptedLlm {
    replies: Mutex<VecDeque<Vec<String>>>,
}

impl ScriptedLlm {
    fn new(replies: Vec<Vec<&str>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|r| r.into_iter().map(String::from).collect())
                    .collect(),
            ),
        })
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    fn generate_stream(&self, _system: &str, _history: &[ChatMessage]) -> TokenStream {
        match self.replies.lock().pop_front() {
            Some(tokens) => Box::pin(futures::stream::iter(tokens.into_iter().map(Ok))),
            None => Box::pin(futures::stream::pending()),
        }
    }

    async fn generate(&self, system: &str, history: &[ChatMessage]) -> CoreResult<String> {
        let mut stream = self.generate_stream(system, history);
        let mut text = String::new();
        while let Some(token) = stream.next().await {
            text.push_str(&token?);
        }
        Ok(text)
    }
}

/// TTS emitting a fixed number of 20ms μ-law frames per character
struct FrameTts {
    frames_per_char: usize,
    streaming: bool,
}

impl FrameTts {
    fn frames_for(&self, text: &str) -> Vec<AudioFrame> {
        let count = text.chars().count() * self.frames_per_char;
        (0..count)
            .map(|_| AudioFrame::silence_20ms(AudioCodec::MulawPstn))
            .collect()
    }
}

#[async_trait]
impl TextToSpeech for FrameTts {
    async fn open_stream(
        &self,
        _voice: &str,
        _codec: AudioCodec,
        _tone: Option<ToneProfile>,
    ) -> CoreResult<TtsStream> {
        if !self.streaming {
            return Err(Error::Adapter("streaming unavailable".into()));
        }
        let (text_tx, mut text_rx) = mpsc::channel(16);
        let (frame_tx, frames) = mpsc::channel(16);
        let frames_per_char = self.frames_per_char;

        tokio::spawn(async move {
            while let Some(chunk) = text_rx.recv().await {
                let chunk: voice_bridge_core::TtsTextChunk = chunk;
                let count = chunk.text.chars().count() * frames_per_char;
                for _ in 0..count {
                    let frame = AudioFrame::silence_20ms(AudioCodec::MulawPstn);
                    if frame_tx.send(frame).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(TtsStream { text_tx, frames })
    }

    async fn synthesise(
        &self,
        _voice: &str,
        _codec: AudioCodec,
        text: &str,
    ) -> CoreResult<Vec<AudioFrame>> {
        Ok(self.frames_for(text))
    }
}

// ---- harness ----

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    // No greeting by default so turn histories stay minimal
    settings.conversation.greeting = String::new();
    settings.retry.initial_backoff_ms = 1;
    settings.retry.max_backoff_ms = 5;
    settings.timeouts.stt_open_ms = 100;
    settings
}

fn registry_with(
    settings: Settings,
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
) -> Arc<SessionRegistry> {
    let chat = Arc::new(ChatAdapter::new(
        llm,
        ChatAdapterConfig {
            max_history_turns: settings.streaming.max_history_turns,
            rate_limit_per_minute: settings.streaming.rate_limit_per_minute,
            max_attempts: settings.retry.max_attempts,
            initial_backoff: Duration::from_millis(settings.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.retry.max_backoff_ms),
        },
    ));
    let synth = Arc::new(Synthesizer::new(
        tts,
        SynthesizerConfig {
            voice: settings.streaming.voice.clone(),
            one_shot_timeout: Duration::from_millis(settings.timeouts.tts_turn_ms),
        },
    ));
    let services = SharedServices {
        stt,
        chat,
        synth,
        latency: Arc::new(LatencyTracker::new()),
    };
    SessionRegistry::new(settings, services)
}

fn inbound_call(id: &str) -> CallInfo {
    CallInfo::inbound(id, "+15550100", "+15550200")
}

fn silence() -> AudioFrame {
    AudioFrame::silence_20ms(AudioCodec::MulawPstn)
}

async fn final_transcript(script: &mpsc::Sender<SttEvent>, text: &str) {
    script
        .send(SttEvent::Transcript(TranscriptEvent::final_(
            text, 0.92, "u1",
        )))
        .await
        .unwrap();
}

/// Wait until the session history holds `turns` turns and the state machine
/// is back at listening.
async fn wait_for_turns(
    session: &Arc<voice_bridge_session::CallSession>,
    turns: usize,
    budget: Duration,
) {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if session.turn_count() >= turns && session.state() == TurnState::Listening {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {} turns (have {}, state {:?})",
            turns,
            session.turn_count(),
            session.state()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn drain(rx: &mut mpsc::Receiver<AudioFrame>) -> usize {
    let mut count = 0;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    count
}

// ---- scenarios ----

#[tokio::test]
async fn happy_turn_streams_reply() {
    let (stt, script) = ScriptedStt::new();
    let llm = ScriptedLlm::new(vec![vec!["Hi", " there."]]);
    let tts = Arc::new(FrameTts {
        frames_per_char: 4,
        streaming: true,
    });

    let registry = registry_with(test_settings(), stt, llm, tts);
    let session = registry
        .admit(inbound_call("call-1"), AudioCodec::MulawPstn)
        .unwrap();
    session.on_answered();
    let mut outbound = session.subscribe_outbound().unwrap();

    for _ in 0..20 {
        session.feed_inbound(silence());
    }
    final_transcript(&script, "hello").await;

    wait_for_turns(&session, 2, Duration::from_secs(5)).await;

    let history = session.history();
    assert_eq!(history[0].role, TurnRole::User);
    assert_eq!(history[0].text, "hello");
    assert_eq!(history[1].role, TurnRole::Assistant);
    assert_eq!(history[1].text, "Hi there.");
    assert!(!history[1].cancelled);

    // All synthesized audio reached the outbound stream
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(drain(&mut outbound).await, "Hi there.".len() * 4);

    session.hangup(HangupReason::Local).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn barge_in_truncates_reply_and_defers_next_final() {
    let (stt, script) = ScriptedStt::new();
    let llm = ScriptedLlm::new(vec![vec!["Hi", " there."], vec!["Sure."]]);
    let tts = Arc::new(FrameTts {
        frames_per_char: 5,
        streaming: true,
    });

    let registry = registry_with(test_settings(), stt, llm, tts);
    let session = registry
        .admit(inbound_call("call-2"), AudioCodec::MulawPstn)
        .unwrap();
    session.on_answered();
    let mut outbound = session.subscribe_outbound().unwrap();

    final_transcript(&script, "hello").await;

    // Let ten frames play, then the caller speaks over the agent
    for _ in 0..10 {
        outbound.recv().await.expect("playback frame");
    }
    script.send(SttEvent::SpeechStarted).await.unwrap();
    // The next final lands while the machine is still interrupted (B1)
    final_transcript(&script, "actually wait").await;

    wait_for_turns(&session, 4, Duration::from_secs(5)).await;

    let history = session.history();
    assert_eq!(history[0].text, "hello");
    // Truncated assistant turn: a strict prefix of the generated reply
    assert!(history[1].cancelled, "assistant turn should be cancelled");
    assert!(
        "Hi there.".starts_with(&history[1].text),
        "recorded text {:?} is not a prefix",
        history[1].text
    );
    assert!(history[1].text.len() < "Hi there.".len());
    // The deferred final was processed after listening resumed
    assert_eq!(history[2].text, "actually wait");
    assert_eq!(history[3].text, "Sure.");
    assert!(!history[3].cancelled);

    assert_eq!(session.snapshot().interruption.total_interruptions, 1);
    assert_eq!(session.snapshot().queue_size, 0);

    session.hangup(HangupReason::Local).await;
}

#[tokio::test]
async fn playback_stops_within_target_after_barge_in() {
    let (stt, script) = ScriptedStt::new();
    let llm = ScriptedLlm::new(vec![vec!["One two three four five six seven."]]);
    let tts = Arc::new(FrameTts {
        frames_per_char: 5,
        streaming: true,
    });

    let registry = registry_with(test_settings(), stt, llm, tts);
    let session = registry
        .admit(inbound_call("call-3"), AudioCodec::MulawPstn)
        .unwrap();
    session.on_answered();
    let mut outbound = session.subscribe_outbound().unwrap();

    final_transcript(&script, "hello").await;
    for _ in 0..5 {
        outbound.recv().await.expect("playback frame");
    }
    script.send(SttEvent::SpeechStarted).await.unwrap();

    // Give the stop latency target to settle, then ensure silence
    tokio::time::sleep(Duration::from_millis(200)).await;
    drain(&mut outbound).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(drain(&mut outbound).await, 0, "sink emitted after stop");

    session.hangup(HangupReason::Local).await;
}

#[tokio::test]
async fn stt_outage_leaves_session_listening() {
    let llm = ScriptedLlm::new(vec![]);
    let tts = Arc::new(FrameTts {
        frames_per_char: 2,
        streaming: true,
    });

    let registry = registry_with(test_settings(), Arc::new(DownStt), llm, tts);
    let session = registry
        .admit(inbound_call("call-4"), AudioCodec::MulawPstn)
        .unwrap();
    session.on_answered();

    // Give the feed time to exhaust its reconnect budget
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(session.state(), TurnState::Listening);
    assert_eq!(session.status(), CallStatus::Active);
    assert_eq!(session.turn_count(), 0);
    assert!(registry.get("call-4").is_some());

    // Frames are still accepted without panicking
    session.feed_inbound(silence());

    session.hangup(HangupReason::Local).await;
}

#[tokio::test]
async fn tts_overrun_drops_oldest_and_survives() {
    let (stt, script) = ScriptedStt::new();
    // 60 chars * 5 frames = 6s of audio arriving instantly against a 500ms cap
    let long_reply = "a".repeat(59) + ".";
    let llm = ScriptedLlm::new(vec![vec![long_reply.as_str()]]);
    let tts = Arc::new(FrameTts {
        frames_per_char: 5,
        streaming: true,
    });

    let registry = registry_with(test_settings(), stt, llm, tts);
    let session = registry
        .admit(inbound_call("call-5"), AudioCodec::MulawPstn)
        .unwrap();
    session.on_answered();
    let mut outbound = session.subscribe_outbound().unwrap();

    final_transcript(&script, "talk a lot").await;

    // Drain at real-time pace while the buffer floods
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while session.turn_count() < 2 || session.state() != TurnState::Listening {
        let _ = drain(&mut outbound).await;
        assert!(session.snapshot().buffer_depth_ms <= 500);
        assert!(tokio::time::Instant::now() < deadline, "turn never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let snapshot = session.snapshot();
    assert!(snapshot.playback.overruns > 0, "expected overruns");
    assert_eq!(session.state(), TurnState::Listening);

    session.hangup(HangupReason::Local).await;
}

#[tokio::test]
async fn admission_rejected_at_capacity() {
    let (stt, _script) = ScriptedStt::new();
    let llm = ScriptedLlm::new(vec![]);
    let tts = Arc::new(FrameTts {
        frames_per_char: 2,
        streaming: true,
    });

    let mut settings = test_settings();
    settings.limits.max_concurrent_calls = 1;
    let registry = registry_with(settings, stt, llm, tts);

    let first = registry
        .admit(inbound_call("call-6"), AudioCodec::MulawPstn)
        .unwrap();

    let rejected = registry.admit(inbound_call("call-7"), AudioCodec::MulawPstn);
    assert!(matches!(
        rejected,
        Err(SessionError::AdmissionRejected { active: 1, limit: 1 })
    ));
    assert_eq!(registry.len(), 1);
    assert!(registry.get("call-7").is_none());

    // Capacity frees up once the live call ends
    first.hangup(HangupReason::Local).await;
    assert!(registry
        .admit(inbound_call("call-7"), AudioCodec::MulawPstn)
        .is_ok());
}

#[tokio::test]
async fn streaming_handshake_failure_falls_back_to_sequential() {
    let (stt, script) = ScriptedStt::new();
    let llm = ScriptedLlm::new(vec![vec!["Hi", " there."]]);
    let tts = Arc::new(FrameTts {
        frames_per_char: 3,
        streaming: false,
    });

    let registry = registry_with(test_settings(), stt, llm, tts);
    let session = registry
        .admit(inbound_call("call-8"), AudioCodec::MulawPstn)
        .unwrap();
    session.on_answered();
    let mut outbound = session.subscribe_outbound().unwrap();

    final_transcript(&script, "hello").await;
    wait_for_turns(&session, 2, Duration::from_secs(5)).await;

    let history = session.history();
    assert_eq!(history[1].text, "Hi there.");
    assert!(!history[1].cancelled);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(drain(&mut outbound).await, "Hi there.".len() * 3);

    session.hangup(HangupReason::Local).await;
}

#[tokio::test]
async fn hangup_is_idempotent() {
    let (stt, _script) = ScriptedStt::new();
    let llm = ScriptedLlm::new(vec![]);
    let tts = Arc::new(FrameTts {
        frames_per_char: 2,
        streaming: true,
    });

    let registry = registry_with(test_settings(), stt, llm, tts);
    let session = registry
        .admit(inbound_call("call-9"), AudioCodec::MulawPstn)
        .unwrap();

    session.hangup(HangupReason::Remote).await;
    session.hangup(HangupReason::Remote).await;

    assert_eq!(session.status(), CallStatus::Ended);
    assert!(registry.is_empty());

    // A dead session ignores further input without panicking
    session.feed_inbound(silence());
    assert!(session.speak("late", 0).is_none());
}

#[tokio::test]
async fn identical_finals_are_not_deduplicated() {
    let (stt, script) = ScriptedStt::new();
    let llm = ScriptedLlm::new(vec![vec!["First."], vec!["Second."]]);
    let tts = Arc::new(FrameTts {
        frames_per_char: 1,
        streaming: true,
    });

    let registry = registry_with(test_settings(), stt, llm, tts);
    let session = registry
        .admit(inbound_call("call-10"), AudioCodec::MulawPstn)
        .unwrap();
    session.on_answered();
    let mut outbound = session.subscribe_outbound().unwrap();
    tokio::spawn(async move { while outbound.recv().await.is_some() {} });

    final_transcript(&script, "same words").await;
    final_transcript(&script, "same words").await;

    wait_for_turns(&session, 4, Duration::from_secs(5)).await;

    let history = session.history();
    assert_eq!(history[0].text, "same words");
    assert_eq!(history[2].text, "same words");
    assert_eq!(history[1].text, "First.");
    assert_eq!(history[3].text, "Second.");

    session.hangup(HangupReason::Local).await;
}

#[tokio::test]
async fn empty_reply_records_empty_turn_without_audio() {
    let (stt, script) = ScriptedStt::new();
    let llm = ScriptedLlm::new(vec![vec![]]);
    let tts = Arc::new(FrameTts {
        frames_per_char: 4,
        streaming: true,
    });

    let registry = registry_with(test_settings(), stt, llm, tts);
    let session = registry
        .admit(inbound_call("call-11"), AudioCodec::MulawPstn)
        .unwrap();
    session.on_answered();
    let mut outbound = session.subscribe_outbound().unwrap();

    final_transcript(&script, "hello").await;
    wait_for_turns(&session, 2, Duration::from_secs(5)).await;

    let history = session.history();
    assert_eq!(history[1].role, TurnRole::Assistant);
    assert_eq!(history[1].text, "");
    assert!(!history[1].cancelled);
    assert_eq!(drain(&mut outbound).await, 0, "no TTS frames expected");
    assert_eq!(session.state(), TurnState::Listening);

    session.hangup(HangupReason::Local).await;
}

#[tokio::test]
async fn llm_timeout_speaks_apology() {
    let (stt, script) = ScriptedStt::new();
    // No scripted reply: the stream pends forever
    let llm = ScriptedLlm::new(vec![]);
    let tts = Arc::new(FrameTts {
        frames_per_char: 1,
        streaming: true,
    });

    let mut settings = test_settings();
    settings.timeouts.llm_first_token_ms = 100;
    settings.timeouts.llm_turn_ms = 300;
    let apology = settings.conversation.apology.clone();

    let registry = registry_with(settings, stt, llm, tts);
    let session = registry
        .admit(inbound_call("call-12"), AudioCodec::MulawPstn)
        .unwrap();
    session.on_answered();
    let mut outbound = session.subscribe_outbound().unwrap();
    tokio::spawn(async move { while outbound.recv().await.is_some() {} });

    final_transcript(&script, "hello").await;
    wait_for_turns(&session, 2, Duration::from_secs(10)).await;

    let history = session.history();
    assert_eq!(history[0].text, "hello");
    assert_eq!(history[1].text, apology);

    session.hangup(HangupReason::Local).await;
}

#[tokio::test]
async fn ambiguous_final_gets_clarification_not_llm() {
    let (stt, script) = ScriptedStt::new();
    // No scripted replies: if the LLM were consulted the turn would hang
    let llm = ScriptedLlm::new(vec![]);
    let tts = Arc::new(FrameTts {
        frames_per_char: 1,
        streaming: true,
    });

    let mut settings = test_settings();
    settings.clarification.enabled = true;

    let registry = registry_with(settings, stt, llm, tts);
    let session = registry
        .admit(inbound_call("call-14"), AudioCodec::MulawPstn)
        .unwrap();
    session.on_answered();
    let mut outbound = session.subscribe_outbound().unwrap();
    tokio::spawn(async move { while outbound.recv().await.is_some() {} });

    // Hedged, confidently transcribed: flagged on the uncertainty keyword
    final_transcript(&script, "maybe the second option I suppose").await;
    wait_for_turns(&session, 2, Duration::from_secs(5)).await;

    let history = session.history();
    assert_eq!(history[0].text, "maybe the second option I suppose");
    assert_eq!(history[1].role, TurnRole::Assistant);
    assert!(history[1].text.contains("another way"));
    assert!(!history[1].cancelled);
    assert_eq!(session.snapshot().clarifications, 1);

    // A low-confidence final echoes back what was heard
    script
        .send(SttEvent::Transcript(TranscriptEvent::final_(
            "transfer me to billing",
            0.4,
            "u2",
        )))
        .await
        .unwrap();
    wait_for_turns(&session, 4, Duration::from_secs(5)).await;

    let history = session.history();
    assert!(history[3].text.contains("transfer me to billing"));
    assert_eq!(session.snapshot().clarifications, 2);

    session.hangup(HangupReason::Local).await;
}

#[tokio::test]
async fn clear_final_still_reaches_llm_with_screening_on() {
    let (stt, script) = ScriptedStt::new();
    let llm = ScriptedLlm::new(vec![vec!["On", " its way."]]);
    let tts = Arc::new(FrameTts {
        frames_per_char: 1,
        streaming: true,
    });

    let mut settings = test_settings();
    settings.clarification.enabled = true;

    let registry = registry_with(settings, stt, llm, tts);
    let session = registry
        .admit(inbound_call("call-15"), AudioCodec::MulawPstn)
        .unwrap();
    session.on_answered();
    let mut outbound = session.subscribe_outbound().unwrap();
    tokio::spawn(async move { while outbound.recv().await.is_some() {} });

    final_transcript(&script, "send the weekly report to accounting").await;
    wait_for_turns(&session, 2, Duration::from_secs(5)).await;

    let history = session.history();
    assert_eq!(history[1].text, "On its way.");
    assert_eq!(session.snapshot().clarifications, 0);

    session.hangup(HangupReason::Local).await;
}

#[tokio::test]
async fn greeting_spoken_on_answer() {
    let (stt, _script) = ScriptedStt::new();
    let llm = ScriptedLlm::new(vec![]);
    let tts = Arc::new(FrameTts {
        frames_per_char: 1,
        streaming: true,
    });

    let mut settings = test_settings();
    settings.conversation.greeting = "Hello caller.".to_string();

    let registry = registry_with(settings, stt, llm, tts);
    let session = registry
        .admit(inbound_call("call-13"), AudioCodec::MulawPstn)
        .unwrap();
    let mut outbound = session.subscribe_outbound().unwrap();
    session.on_answered();

    wait_for_turns(&session, 1, Duration::from_secs(5)).await;
    let history = session.history();
    assert_eq!(history[0].role, TurnRole::Assistant);
    assert_eq!(history[0].text, "Hello caller.");

    // Greeting audio actually played
    let mut frames = 0;
    while tokio::time::timeout(Duration::from_millis(100), outbound.recv())
        .await
        .ok()
        .flatten()
        .is_some()
    {
        frames += 1;
    }
    assert_eq!(frames, "Hello caller.".len());

    session.hangup(HangupReason::Local).await;
}

// ---- orchestrator-level checks ----

fn orchestrator_under_test(
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
) -> (Arc<PipelineOrchestrator>, Arc<InterruptionHandler>) {
    let chat = Arc::new(ChatAdapter::new(llm, ChatAdapterConfig::default()));
    let synth = Arc::new(Synthesizer::new(tts, SynthesizerConfig::default()));
    let buffer = Arc::new(PlaybackBuffer::new(PlaybackBufferConfig::default()));
    let playback = Arc::new(PlaybackController::new(buffer));
    let queue = Arc::new(SpeechQueue::new());
    let handler = Arc::new(InterruptionHandler::new(
        InterruptionConfig::default(),
        playback.clone(),
        queue,
    ));
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        chat,
        synth,
        playback,
        handler.clone(),
        Arc::new(LatencyTracker::new()),
        OrchestratorConfig::default(),
    ));
    (orchestrator, handler)
}

#[tokio::test]
async fn orchestrator_reports_sequential_mode() {
    let llm = ScriptedLlm::new(vec![vec!["Fallback reply."]]);
    let tts = Arc::new(FrameTts {
        frames_per_char: 1,
        streaming: false,
    });
    let (orchestrator, handler) = orchestrator_under_test(llm, tts);
    handler.transition(TurnState::Processing).unwrap();

    let (sink, mut outbound) = mpsc::channel(512);
    tokio::spawn(async move { while outbound.recv().await.is_some() {} });

    let cancel = CancellationSource::new();
    let outcome = orchestrator
        .run_turn(
            "call-x",
            "hello",
            &[],
            Default::default(),
            sink,
            cancel.token(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.streaming_mode, StreamingMode::Sequential);
    assert_eq!(outcome.text, "Fallback reply.");
    assert!(!outcome.cancelled);
    assert_eq!(handler.state(), TurnState::Listening);
}

#[tokio::test]
async fn orchestrator_reports_concurrent_mode_and_latencies() {
    let llm = ScriptedLlm::new(vec![vec!["Hi", " there."]]);
    let tts = Arc::new(FrameTts {
        frames_per_char: 2,
        streaming: true,
    });
    let (orchestrator, handler) = orchestrator_under_test(llm, tts);
    handler.transition(TurnState::Processing).unwrap();

    let (sink, mut outbound) = mpsc::channel(512);
    tokio::spawn(async move { while outbound.recv().await.is_some() {} });

    let cancel = CancellationSource::new();
    let outcome = orchestrator
        .run_turn(
            "call-y",
            "hello",
            &[],
            Default::default(),
            sink,
            cancel.token(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.streaming_mode, StreamingMode::Concurrent);
    assert_eq!(outcome.text, "Hi there.");
    assert!(outcome.first_token_ms.is_some());
    assert!(outcome.first_audio_ms.is_some());
    assert!(outcome.played_ms > 0);
}

#[tokio::test]
async fn cancelling_cancelled_turn_is_noop() {
    let source = CancellationSource::new();
    source.cancel();
    source.cancel();
    assert!(source.is_cancelled());
}
