//! Pipeline orchestrator
//!
//! Drives one user turn through STT-final → LLM → TTS → playback
//! concurrently: tokens stream into the coordinator, flushed chunks stream
//! into the TTS push half, synthesized frames land in the playback buffer,
//! and the playback pump drains them into the outbound sink in real time.
//!
//! The whole run listens on one cancellation token. On cancel the LLM
//! stream is dropped, the TTS input half is closed, playback is
//! interrupted, and the assistant turn is recorded with the prefix the
//! caller actually heard.
//!
//! If the TTS streaming handshake fails, the run degrades to sequential
//! mode: full LLM response, one-shot synthesis, paced playback.

use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use voice_bridge_core::{
    AudioCodec, AudioFrame, CancellationToken, Error, Result, Sentiment, Turn, TtsStream,
    TtsTextChunk, UpstreamStage,
};
use voice_bridge_llm::ChatAdapter;

use crate::coordinator::StreamCoordinator;
use crate::interruption::{InterruptionHandler, TurnState};
use crate::latency::{LatencyTracker, Stage};
use crate::playback::{PlaybackController, PlaybackOutcome};
use crate::tts::Synthesizer;

/// How the turn's audio was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    /// Chunked-push TTS fed from the live token stream
    Concurrent,
    /// Full response, one-shot synthesis
    Sequential,
}

impl StreamingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamingMode::Concurrent => "concurrent",
            StreamingMode::Sequential => "sequential",
        }
    }
}

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub system_prompt: String,
    pub codec: AudioCodec,
    pub stream_chunk_size: usize,
    pub llm_first_token_timeout: Duration,
    pub llm_turn_timeout: Duration,
    pub tts_first_frame_timeout: Duration,
    pub tts_turn_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            codec: AudioCodec::MulawPstn,
            stream_chunk_size: 512,
            llm_first_token_timeout: Duration::from_secs(8),
            llm_turn_timeout: Duration::from_secs(20),
            tts_first_frame_timeout: Duration::from_secs(3),
            tts_turn_timeout: Duration::from_secs(15),
        }
    }
}

/// Result of one orchestrator run
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub request_id: String,
    /// Recorded assistant text: the played prefix when cancelled,
    /// everything generated otherwise
    pub text: String,
    /// Everything the model generated on this turn
    pub full_text: String,
    pub cancelled: bool,
    pub streaming_mode: StreamingMode,
    pub first_token_ms: Option<u64>,
    pub first_audio_ms: Option<u64>,
    pub played_ms: u64,
}

/// One pipeline orchestrator per session; at most one run active at a time.
pub struct PipelineOrchestrator {
    chat: Arc<ChatAdapter>,
    synth: Arc<Synthesizer>,
    playback: Arc<PlaybackController>,
    handler: Arc<InterruptionHandler>,
    latency: Arc<LatencyTracker>,
    config: OrchestratorConfig,
    /// Serialises runs within the session
    run_lock: tokio::sync::Mutex<()>,
}

/// Audio half of a run: playback pump plus the TTS frame receiver
struct AudioRun {
    pump: JoinHandle<PlaybackOutcome>,
    recv: JoinHandle<Result<()>>,
    synth_us: Arc<AtomicU64>,
    first_audio_ms: Arc<Mutex<Option<u64>>>,
    played_before_ms: u64,
}

/// What the audio half reported once it wound down
struct AudioFinish {
    pump_outcome: PlaybackOutcome,
    recv_result: Result<()>,
    played_ms: u64,
    synth_us_total: u64,
    first_audio_ms: Option<u64>,
    timed_out: bool,
}

impl PipelineOrchestrator {
    pub fn new(
        chat: Arc<ChatAdapter>,
        synth: Arc<Synthesizer>,
        playback: Arc<PlaybackController>,
        handler: Arc<InterruptionHandler>,
        latency: Arc<LatencyTracker>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            chat,
            synth,
            playback,
            handler,
            latency,
            config,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Run one user turn. `context` is the history snapshot from before
    /// this user turn was appended.
    pub async fn run_turn(
        &self,
        call_id: &str,
        transcript: &str,
        context: &[Turn],
        sentiment: Sentiment,
        sink: mpsc::Sender<AudioFrame>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let _guard = self.run_lock.lock().await;
        let request_id = format!("{}-{}", call_id, uuid::Uuid::new_v4().simple());
        let turn_start = Instant::now();

        tracing::info!(
            request_id = %request_id,
            transcript_len = transcript.len(),
            "Turn pipeline starting"
        );

        let result = match tokio::time::timeout(
            self.config.tts_first_frame_timeout,
            self.synth.open_stream(self.config.codec, sentiment),
        )
        .await
        {
            Ok(Ok(stream)) => {
                self.streaming_turn(&request_id, transcript, context, stream, sink, &cancel, turn_start)
                    .await
            },
            Ok(Err(e)) => {
                tracing::warn!(request_id = %request_id, error = %e, "TTS streaming handshake failed");
                self.sequential_turn(&request_id, transcript, context, sink, &cancel, turn_start)
                    .await
            },
            Err(_) => {
                tracing::warn!(request_id = %request_id, "TTS streaming handshake timed out");
                self.sequential_turn(&request_id, transcript, context, sink, &cancel, turn_start)
                    .await
            },
        };

        self.conclude(&request_id, turn_start, result)
    }

    /// Speak `text` directly, bypassing the LLM. Used for queued speech
    /// items: greetings, apologies, operator prompts.
    pub async fn run_direct_speech(
        &self,
        call_id: &str,
        text: &str,
        sentiment: Sentiment,
        sink: mpsc::Sender<AudioFrame>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let _guard = self.run_lock.lock().await;
        let request_id = format!("{}-{}", call_id, uuid::Uuid::new_v4().simple());
        let turn_start = Instant::now();

        tracing::info!(request_id = %request_id, text_len = text.len(), "Direct speech starting");

        let result = match tokio::time::timeout(
            self.config.tts_first_frame_timeout,
            self.synth.open_stream(self.config.codec, sentiment),
        )
        .await
        {
            Ok(Ok(stream)) => {
                self.speak_over_stream(&request_id, text, stream, sink, &cancel, turn_start)
                    .await
            },
            _ => {
                self.speak_one_shot(&request_id, text, sink, &cancel, turn_start)
                    .await
            },
        };

        self.conclude(&request_id, turn_start, result)
    }

    /// Shared epilogue: total latency, error metrics, state settling.
    fn conclude(
        &self,
        request_id: &str,
        turn_start: Instant,
        result: Result<TurnOutcome>,
    ) -> Result<TurnOutcome> {
        match &result {
            Ok(outcome) => {
                self.latency.record(
                    request_id,
                    Stage::Total,
                    turn_start.elapsed().as_millis() as f64,
                );
                tracing::info!(
                    request_id,
                    cancelled = outcome.cancelled,
                    streaming_mode = outcome.streaming_mode.as_str(),
                    first_token_ms = outcome.first_token_ms,
                    first_audio_ms = outcome.first_audio_ms,
                    total_ms = turn_start.elapsed().as_millis() as u64,
                    "Turn pipeline complete"
                );
            },
            Err(e) => {
                match e {
                    Error::UpstreamDown(stage) => {
                        metrics::counter!("upstream_errors", "stage" => stage.as_str())
                            .increment(1);
                    },
                    Error::TurnTimeout(stage) => {
                        metrics::counter!("turn_timeouts", "stage" => stage.as_str()).increment(1);
                    },
                    _ => {},
                }
                tracing::warn!(request_id, error = %e, "Turn pipeline failed");
            },
        }

        // Whatever happened, the state machine must come to rest
        match self.handler.state() {
            TurnState::Interrupted => {
                let _ = self.handler.confirm_stopped();
            },
            TurnState::Speaking | TurnState::Processing => {
                let _ = self.handler.transition(TurnState::Listening);
            },
            TurnState::Listening => {},
        }

        result
    }

    /// Concurrent path: token stream → coordinator → TTS push → playback.
    #[allow(clippy::too_many_arguments)]
    async fn streaming_turn(
        &self,
        request_id: &str,
        transcript: &str,
        context: &[Turn],
        stream: TtsStream,
        sink: mpsc::Sender<AudioFrame>,
        cancel: &CancellationToken,
        turn_start: Instant,
    ) -> Result<TurnOutcome> {
        let TtsStream { text_tx, frames } = stream;
        let first_frame_budget =
            self.config.llm_first_token_timeout + self.config.tts_first_frame_timeout;
        let run = self.start_audio_run(request_id, sink, frames, turn_start, first_frame_budget);

        let mut coordinator = StreamCoordinator::new(self.config.stream_chunk_size);
        let mut llm_stream =
            self.chat
                .generate_stream(&self.config.system_prompt, context, transcript);

        let mut full_text = String::new();
        let mut sent_chars = 0usize;
        let mut first_token_ms: Option<u64> = None;
        let mut cancelled = false;
        let mut turn_error: Option<Error> = None;
        let llm_deadline = turn_start + self.config.llm_turn_timeout;

        'llm: loop {
            let remaining = llm_deadline.saturating_duration_since(Instant::now());
            let item_budget = if first_token_ms.is_none() {
                self.config.llm_first_token_timeout.min(remaining)
            } else {
                remaining
            };

            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break 'llm;
                },
                item = tokio::time::timeout(item_budget, llm_stream.next()) => item,
            };

            match item {
                Err(_) => {
                    turn_error = Some(Error::TurnTimeout(UpstreamStage::Llm));
                    break 'llm;
                },
                Ok(None) => break 'llm,
                Ok(Some(Err(e))) => {
                    turn_error = Some(e);
                    break 'llm;
                },
                Ok(Some(Ok(token))) => {
                    if first_token_ms.is_none() {
                        let ms = turn_start.elapsed().as_millis() as u64;
                        first_token_ms = Some(ms);
                        self.latency.record(request_id, Stage::Llm, ms as f64);
                        tracing::debug!(request_id, first_token_ms = ms, "First token");
                    }
                    full_text.push_str(&token);

                    if let Some(chunk) = coordinator.push(&token) {
                        sent_chars += chunk.chars().count();
                        let send = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                cancelled = true;
                                break 'llm;
                            },
                            // Awaited send: a slow synthesizer backpressures
                            // the token loop instead of growing a buffer
                            sent = text_tx.send(TtsTextChunk::new(chunk)) => sent,
                        };
                        if send.is_err() {
                            turn_error = Some(Error::ChannelClosed);
                            break 'llm;
                        }
                    }
                },
            }
        }

        if turn_error.is_none() && !cancelled {
            if let Some(chunk) = coordinator.finish() {
                sent_chars += chunk.chars().count();
                let _ = text_tx.send(TtsTextChunk::flushed(chunk)).await;
            }
        }

        // Close the LLM stream and the TTS input half
        drop(llm_stream);
        drop(text_tx);

        let abort = cancelled || turn_error.is_some();
        let finish = self.finish_audio_run(run, cancel, abort).await;
        cancelled = cancelled
            || cancel.is_cancelled()
            || finish.pump_outcome == PlaybackOutcome::Interrupted;

        if let Some(e) = turn_error {
            return Err(e);
        }
        let synth_ms = self.synth_ms(&finish);
        if !cancelled {
            finish.recv_result?;
            if finish.timed_out {
                return Err(Error::TurnTimeout(UpstreamStage::Tts));
            }
        }

        let text = if cancelled {
            played_prefix(&full_text, sent_chars, finish.played_ms, synth_ms)
        } else {
            full_text.clone()
        };

        Ok(TurnOutcome {
            request_id: request_id.to_string(),
            text,
            full_text,
            cancelled,
            streaming_mode: StreamingMode::Concurrent,
            first_token_ms,
            first_audio_ms: finish.first_audio_ms,
            played_ms: finish.played_ms,
        })
    }

    /// Sequential fallback: full response, one-shot synthesis, paced play.
    async fn sequential_turn(
        &self,
        request_id: &str,
        transcript: &str,
        context: &[Turn],
        sink: mpsc::Sender<AudioFrame>,
        cancel: &CancellationToken,
        turn_start: Instant,
    ) -> Result<TurnOutcome> {
        tracing::info!(request_id, streaming_mode = "sequential", "Sequential turn");

        let generated = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(self.empty_outcome(request_id, true, StreamingMode::Sequential));
            },
            r = tokio::time::timeout(
                self.config.llm_turn_timeout,
                self.chat.generate(&self.config.system_prompt, context, transcript),
            ) => r,
        };
        let full_text = match generated {
            Err(_) => return Err(Error::TurnTimeout(UpstreamStage::Llm)),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(text)) => text,
        };
        let first_token_ms = turn_start.elapsed().as_millis() as u64;
        self.latency
            .record(request_id, Stage::Llm, first_token_ms as f64);

        if full_text.trim().is_empty() {
            let mut outcome = self.empty_outcome(request_id, false, StreamingMode::Sequential);
            outcome.first_token_ms = Some(first_token_ms);
            return Ok(outcome);
        }

        let mut outcome = self
            .speak_one_shot(request_id, &full_text, sink, cancel, turn_start)
            .await?;
        outcome.first_token_ms = Some(first_token_ms);
        Ok(outcome)
    }

    /// Push one text over an open TTS stream and play it out.
    async fn speak_over_stream(
        &self,
        request_id: &str,
        text: &str,
        stream: TtsStream,
        sink: mpsc::Sender<AudioFrame>,
        cancel: &CancellationToken,
        turn_start: Instant,
    ) -> Result<TurnOutcome> {
        let TtsStream { text_tx, frames } = stream;
        let run = self.start_audio_run(
            request_id,
            sink,
            frames,
            turn_start,
            self.config.tts_first_frame_timeout,
        );

        let mut cancelled = false;
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancelled = true;
                Ok(())
            },
            sent = text_tx.send(TtsTextChunk::flushed(text.to_string())) => sent,
        };
        drop(text_tx);
        if sent.is_err() {
            tracing::warn!(request_id, "TTS stream rejected text");
        }

        let finish = self.finish_audio_run(run, cancel, cancelled).await;
        cancelled = cancelled
            || cancel.is_cancelled()
            || finish.pump_outcome == PlaybackOutcome::Interrupted;
        let synth_ms = self.synth_ms(&finish);
        if !cancelled {
            finish.recv_result?;
            if finish.timed_out {
                return Err(Error::TurnTimeout(UpstreamStage::Tts));
            }
        }

        let chars = text.chars().count();
        let recorded = if cancelled {
            played_prefix(text, chars, finish.played_ms, synth_ms)
        } else {
            text.to_string()
        };

        Ok(TurnOutcome {
            request_id: request_id.to_string(),
            text: recorded,
            full_text: text.to_string(),
            cancelled,
            streaming_mode: StreamingMode::Concurrent,
            first_token_ms: None,
            first_audio_ms: finish.first_audio_ms,
            played_ms: finish.played_ms,
        })
    }

    /// One-shot synthesis of `text`, then paced playback.
    async fn speak_one_shot(
        &self,
        request_id: &str,
        text: &str,
        sink: mpsc::Sender<AudioFrame>,
        cancel: &CancellationToken,
        turn_start: Instant,
    ) -> Result<TurnOutcome> {
        let frames = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(self.empty_outcome(request_id, true, StreamingMode::Sequential));
            },
            r = self.synth.synthesise(self.config.codec, text) => r?,
        };
        let first_audio_ms = turn_start.elapsed().as_millis() as u64;
        self.latency
            .record(request_id, Stage::Tts, first_audio_ms as f64);

        let synth_us: u64 = frames.iter().map(|f| f.duration.as_micros() as u64).sum();

        let buffer = self.playback.buffer().clone();
        buffer.reset();
        let played_before_ms = buffer.stats().ms_played;

        // First frame is about to be enqueued
        let _ = self.handler.transition(TurnState::Speaking);

        let pump = {
            let playback = self.playback.clone();
            let rid = request_id.to_string();
            tokio::spawn(async move { playback.play(rid, sink).await })
        };
        let feeder = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                buffer.feed_paced(frames).await;
                buffer.close_input();
                Ok::<_, Error>(())
            })
        };

        let run = AudioRun {
            pump,
            recv: feeder,
            synth_us: Arc::new(AtomicU64::new(synth_us)),
            first_audio_ms: Arc::new(Mutex::new(Some(first_audio_ms))),
            played_before_ms,
        };

        let finish = self.finish_audio_run(run, cancel, false).await;
        let cancelled =
            cancel.is_cancelled() || finish.pump_outcome == PlaybackOutcome::Interrupted;
        if !cancelled && finish.timed_out {
            return Err(Error::TurnTimeout(UpstreamStage::Tts));
        }

        let chars = text.chars().count();
        let recorded = if cancelled {
            played_prefix(text, chars, finish.played_ms, self.synth_ms(&finish))
        } else {
            text.to_string()
        };

        Ok(TurnOutcome {
            request_id: request_id.to_string(),
            text: recorded,
            full_text: text.to_string(),
            cancelled,
            streaming_mode: StreamingMode::Sequential,
            first_token_ms: None,
            first_audio_ms: finish.first_audio_ms,
            played_ms: finish.played_ms,
        })
    }

    /// Spawn the playback pump and the TTS frame receiver.
    fn start_audio_run(
        &self,
        request_id: &str,
        sink: mpsc::Sender<AudioFrame>,
        mut frames: mpsc::Receiver<AudioFrame>,
        turn_start: Instant,
        first_frame_budget: Duration,
    ) -> AudioRun {
        let buffer = self.playback.buffer().clone();
        buffer.reset();
        let played_before_ms = buffer.stats().ms_played;

        let pump = {
            let playback = self.playback.clone();
            let rid = request_id.to_string();
            tokio::spawn(async move { playback.play(rid, sink).await })
        };

        let synth_us = Arc::new(AtomicU64::new(0));
        let first_audio_ms: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));

        let recv = {
            let buffer = buffer.clone();
            let handler = self.handler.clone();
            let latency = self.latency.clone();
            let synth_us = synth_us.clone();
            let first_audio_ms = first_audio_ms.clone();
            let rid = request_id.to_string();

            tokio::spawn(async move {
                let mut first = true;
                loop {
                    let next = if first {
                        match tokio::time::timeout(first_frame_budget, frames.recv()).await {
                            Ok(next) => next,
                            Err(_) => {
                                buffer.close_input();
                                return Err(Error::TurnTimeout(UpstreamStage::Tts));
                            },
                        }
                    } else {
                        frames.recv().await
                    };

                    match next {
                        Some(frame) => {
                            if first {
                                first = false;
                                let ms = turn_start.elapsed().as_millis() as u64;
                                *first_audio_ms.lock() = Some(ms);
                                latency.record(&rid, Stage::Tts, ms as f64);
                                tracing::debug!(request_id = %rid, first_audio_ms = ms, "First audio frame");
                                // First frame enqueued: the agent is speaking
                                let _ = handler.transition(TurnState::Speaking);
                            }
                            synth_us
                                .fetch_add(frame.duration.as_micros() as u64, Ordering::Relaxed);
                            buffer.add(frame);
                        },
                        None => {
                            buffer.close_input();
                            return Ok(());
                        },
                    }
                }
            })
        };

        AudioRun {
            pump,
            recv,
            synth_us,
            first_audio_ms,
            played_before_ms,
        }
    }

    /// Wait for the audio half to wind down, enforcing the TTS turn budget
    /// and propagating cancellation into the pump.
    async fn finish_audio_run(
        &self,
        mut run: AudioRun,
        cancel: &CancellationToken,
        abort: bool,
    ) -> AudioFinish {
        if abort {
            self.playback.interrupt();
        }

        let deadline = tokio::time::sleep(self.config.tts_turn_timeout);
        tokio::pin!(deadline);
        let mut cancel_seen = abort || cancel.is_cancelled();
        let mut timed_out = false;

        let pump_outcome = loop {
            tokio::select! {
                res = &mut run.pump => {
                    break res.unwrap_or(PlaybackOutcome::Stopped);
                },
                _ = cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    self.playback.interrupt();
                },
                _ = &mut deadline, if !timed_out => {
                    timed_out = true;
                    tracing::warn!("TTS turn budget exhausted, interrupting playback");
                    self.playback.interrupt();
                },
            }
        };

        let recv_result = match tokio::time::timeout(Duration::from_secs(1), &mut run.recv).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                run.recv.abort();
                Ok(())
            },
        };

        let played_ms = self
            .playback
            .buffer()
            .stats()
            .ms_played
            .saturating_sub(run.played_before_ms);

        AudioFinish {
            pump_outcome,
            recv_result,
            played_ms,
            synth_us_total: run.synth_us.load(Ordering::Relaxed),
            first_audio_ms: *run.first_audio_ms.lock(),
            timed_out,
        }
    }

    fn synth_ms(&self, finish: &AudioFinish) -> u64 {
        finish.synth_us_total / 1000
    }

    fn empty_outcome(
        &self,
        request_id: &str,
        cancelled: bool,
        streaming_mode: StreamingMode,
    ) -> TurnOutcome {
        TurnOutcome {
            request_id: request_id.to_string(),
            text: String::new(),
            full_text: String::new(),
            cancelled,
            streaming_mode,
            first_token_ms: None,
            first_audio_ms: None,
            played_ms: 0,
        }
    }
}

/// Map played audio back to a text prefix.
///
/// `sent_chars` is the number of characters actually pushed to the
/// synthesizer, always a prefix of the generated text. Under the uniform
/// speech-rate assumption the played prefix is the sent text scaled by the
/// played-to-synthesized duration ratio, floored to a char boundary.
fn played_prefix(full_text: &str, sent_chars: usize, played_ms: u64, synth_ms: u64) -> String {
    if synth_ms == 0 || played_ms == 0 {
        return String::new();
    }
    let played_chars =
        ((sent_chars as u128 * played_ms as u128) / synth_ms as u128).min(sent_chars as u128);
    full_text.chars().take(played_chars as usize).collect()
}
