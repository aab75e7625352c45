//! Outbound playback buffering
//!
//! `PlaybackBuffer` smooths TTS audio into a real-time paced outbound
//! stream: a jitter pre-fill absorbs bursty upstream arrival, a hard cap
//! drops oldest frames under overrun, and `interrupt()` clears everything
//! synchronously for barge-in. `PlaybackController` layers playback-id and
//! stop-latency bookkeeping on top.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

use voice_bridge_core::AudioFrame;

/// Buffer tuning
#[derive(Debug, Clone)]
pub struct PlaybackBufferConfig {
    /// Playback chunk duration; pacing granularity
    pub chunk_size_ms: u64,
    /// Pre-fill before the first frame is emitted
    pub jitter_buffer_ms: u64,
    /// Hard cap; oldest frames drop past this
    pub max_buffer_ms: u64,
    /// Fadeout applied on smooth stop
    pub fadeout_ms: u64,
    /// Cap on waiting for the jitter pre-fill
    pub jitter_fill_timeout: Duration,
}

impl Default for PlaybackBufferConfig {
    fn default() -> Self {
        Self {
            chunk_size_ms: 20,
            jitter_buffer_ms: 100,
            max_buffer_ms: 500,
            fadeout_ms: 50,
            jitter_fill_timeout: Duration::from_secs(1),
        }
    }
}

/// Counters exposed for observability
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BufferStats {
    pub buffered_ms: u64,
    pub buffered_frames: usize,
    pub frames_played: u64,
    pub ms_played: u64,
    pub overruns: u64,
    pub underruns: u64,
    pub is_playing: bool,
    pub interrupted: bool,
}

/// How a playback run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Buffer drained after the input half closed
    Completed,
    /// `interrupt()` cleared the buffer mid-run
    Interrupted,
    /// `stop()` was requested
    Stopped,
    /// The outbound sink went away
    SinkClosed,
}

#[derive(Debug, Default)]
struct BufferInner {
    queue: VecDeque<AudioFrame>,
    buffered_us: u64,
    input_closed: bool,
    interrupted: bool,
    stop_requested: bool,
    playing: bool,
    frames_played: u64,
    us_played: u64,
    overruns: u64,
    underruns: u64,
}

/// Bounded FIFO of outbound audio with real-time paced drain
pub struct PlaybackBuffer {
    config: PlaybackBufferConfig,
    inner: Mutex<BufferInner>,
    /// Woken on add/close/interrupt/stop
    wake: Notify,
    /// Woken when the playback loop exits
    stopped: Notify,
}

impl PlaybackBuffer {
    pub fn new(config: PlaybackBufferConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BufferInner::default()),
            wake: Notify::new(),
            stopped: Notify::new(),
        }
    }

    /// Append a frame. Past `max_buffer_ms` the oldest frames are dropped
    /// and counted as overruns. Frames arriving after an interrupt are
    /// discarded.
    pub fn add(&self, frame: AudioFrame) {
        let mut inner = self.inner.lock();
        if inner.interrupted {
            return;
        }

        inner.buffered_us += frame.duration.as_micros() as u64;
        inner.queue.push_back(frame);

        let max_us = self.config.max_buffer_ms * 1000;
        while inner.buffered_us > max_us {
            let Some(dropped) = inner.queue.pop_front() else {
                break;
            };
            inner.buffered_us = inner
                .buffered_us
                .saturating_sub(dropped.duration.as_micros() as u64);
            inner.overruns += 1;
            metrics::counter!("playback_buffer_overruns").increment(1);
            tracing::warn!(
                buffered_ms = inner.buffered_us / 1000,
                dropped_ms = dropped.duration_ms(),
                "Playback buffer overrun, dropped oldest frame"
            );
        }

        drop(inner);
        self.wake.notify_waiters();
    }

    /// Feed a pre-synthesised frame set without tripping the overrun cap:
    /// waits for drain room before each add instead of dropping oldest.
    /// Used by the sequential fallback, where all audio exists up front.
    pub async fn feed_paced(&self, frames: Vec<AudioFrame>) {
        let max_us = self.config.max_buffer_ms * 1000;
        for frame in frames {
            let frame_us = frame.duration.as_micros() as u64;
            loop {
                {
                    let inner = self.inner.lock();
                    if inner.interrupted || inner.stop_requested {
                        return;
                    }
                    if inner.buffered_us + frame_us <= max_us {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.add(frame);
        }
    }

    /// Producer is done; the playback loop drains what is left and exits.
    pub fn close_input(&self) {
        self.inner.lock().input_closed = true;
        self.wake.notify_waiters();
    }

    /// Clear the buffer and signal the playback loop to exit on its next
    /// tick. Synchronous; the caller does not wait for the loop.
    pub fn interrupt(&self) {
        let mut inner = self.inner.lock();
        let cleared = inner.queue.len();
        inner.queue.clear();
        inner.buffered_us = 0;
        inner.interrupted = true;
        drop(inner);
        self.wake.notify_waiters();

        tracing::info!(cleared_frames = cleared, "Playback buffer interrupted");
    }

    /// Request a stop. With `smooth`, the tail of the last buffered frame
    /// gets a linear fadeout so playback does not end on a click. Waits for
    /// the playback loop to release, at most one second.
    pub async fn stop(&self, smooth: bool) {
        let was_playing = {
            let mut inner = self.inner.lock();
            if smooth {
                if let Some(last) = inner.queue.back_mut() {
                    *last = last.with_fadeout(self.config.fadeout_ms);
                }
            }
            inner.stop_requested = true;
            inner.playing
        };
        self.wake.notify_waiters();

        if was_playing {
            let _ = tokio::time::timeout(Duration::from_secs(1), self.stopped.notified()).await;
        }
    }

    /// Clear all state for the next utterance
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.buffered_us = 0;
        inner.input_closed = false;
        inner.interrupted = false;
        inner.stop_requested = false;
    }

    pub fn buffered_ms(&self) -> u64 {
        self.inner.lock().buffered_us / 1000
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.lock();
        BufferStats {
            buffered_ms: inner.buffered_us / 1000,
            buffered_frames: inner.queue.len(),
            frames_played: inner.frames_played,
            ms_played: inner.us_played / 1000,
            overruns: inner.overruns,
            underruns: inner.underruns,
            is_playing: inner.playing,
            interrupted: inner.interrupted,
        }
    }

    /// Drain buffered audio into `sink` at real-time pace.
    ///
    /// Blocks until the jitter pre-fill is reached (or its timeout passes),
    /// then emits one frame per chunk interval. On underrun the loop waits
    /// up to 10 ms for a frame before counting one. Returns when the input
    /// half is closed and the queue is drained, or on interrupt/stop.
    pub async fn run_playback(&self, sink: mpsc::Sender<AudioFrame>) -> PlaybackOutcome {
        {
            let mut inner = self.inner.lock();
            if inner.playing {
                tracing::warn!("Playback already running");
                return PlaybackOutcome::Stopped;
            }
            inner.playing = true;
        }

        let outcome = self.playback_loop(&sink).await;

        self.inner.lock().playing = false;
        self.stopped.notify_waiters();

        let stats = self.stats();
        tracing::info!(
            outcome = ?outcome,
            frames_played = stats.frames_played,
            underruns = stats.underruns,
            overruns = stats.overruns,
            "Playback stopped"
        );
        outcome
    }

    async fn playback_loop(&self, sink: &mpsc::Sender<AudioFrame>) -> PlaybackOutcome {
        // Jitter pre-fill: absorb upstream arrival jitter before emitting
        let fill_deadline = Instant::now() + self.config.jitter_fill_timeout;
        let target_us = self.config.jitter_buffer_ms * 1000;
        loop {
            {
                let inner = self.inner.lock();
                if inner.interrupted {
                    return PlaybackOutcome::Interrupted;
                }
                if inner.stop_requested {
                    return PlaybackOutcome::Stopped;
                }
                if inner.buffered_us >= target_us || inner.input_closed {
                    break;
                }
            }
            if Instant::now() >= fill_deadline {
                tracing::warn!(
                    buffered_ms = self.buffered_ms(),
                    target_ms = self.config.jitter_buffer_ms,
                    "Jitter pre-fill timeout, playing what is buffered"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tracing::debug!(buffered_ms = self.buffered_ms(), "Playback started");

        loop {
            let frame = {
                let mut inner = self.inner.lock();
                if inner.interrupted {
                    return PlaybackOutcome::Interrupted;
                }
                if inner.stop_requested {
                    return PlaybackOutcome::Stopped;
                }
                match inner.queue.pop_front() {
                    Some(frame) => {
                        inner.buffered_us = inner
                            .buffered_us
                            .saturating_sub(frame.duration.as_micros() as u64);
                        Some(frame)
                    },
                    None if inner.input_closed => return PlaybackOutcome::Completed,
                    None => None,
                }
            };

            let Some(frame) = frame else {
                // Underrun: wait briefly for a frame before counting one
                tokio::time::sleep(Duration::from_millis(10)).await;
                let mut inner = self.inner.lock();
                if inner.queue.is_empty() && !inner.input_closed && !inner.interrupted {
                    inner.underruns += 1;
                    metrics::counter!("playback_buffer_underruns").increment(1);
                }
                continue;
            };

            let duration = frame.duration;
            if sink.send(frame).await.is_err() {
                tracing::warn!("Outbound sink closed during playback");
                return PlaybackOutcome::SinkClosed;
            }

            {
                let mut inner = self.inner.lock();
                inner.frames_played += 1;
                inner.us_played += duration.as_micros() as u64;
            }

            // Real-time pacing: one frame per frame-duration
            tokio::time::sleep(duration).await;
        }
    }
}

/// Snapshot of the controller's view of playback
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub playback_id: Option<String>,
    pub playback_duration_ms: u64,
}

#[derive(Debug, Default)]
struct ControllerInner {
    is_playing: bool,
    playback_id: Option<String>,
    playback_start: Option<Instant>,
}

/// Drives the playback buffer on behalf of the orchestrator and reports
/// stop latency for the barge-in SLO.
pub struct PlaybackController {
    buffer: Arc<PlaybackBuffer>,
    inner: Mutex<ControllerInner>,
}

impl PlaybackController {
    pub fn new(buffer: Arc<PlaybackBuffer>) -> Self {
        Self {
            buffer,
            inner: Mutex::new(ControllerInner::default()),
        }
    }

    pub fn buffer(&self) -> &Arc<PlaybackBuffer> {
        &self.buffer
    }

    /// Run one playback: drives the buffer into `sink` until completion
    /// or interruption.
    pub async fn play(
        &self,
        playback_id: impl Into<String>,
        sink: mpsc::Sender<AudioFrame>,
    ) -> PlaybackOutcome {
        let playback_id = playback_id.into();
        {
            let mut inner = self.inner.lock();
            inner.is_playing = true;
            inner.playback_id = Some(playback_id.clone());
            inner.playback_start = Some(Instant::now());
        }
        tracing::info!(playback_id = %playback_id, "Playback run starting");

        let outcome = self.buffer.run_playback(sink).await;

        let mut inner = self.inner.lock();
        inner.is_playing = false;
        inner.playback_id = None;
        inner.playback_start = None;
        outcome
    }

    /// Graceful stop; returns the measured stop latency when playback was
    /// actually running.
    pub async fn stop(&self, smooth: bool) -> Option<u64> {
        if !self.inner.lock().is_playing {
            return None;
        }
        let start = Instant::now();
        self.buffer.stop(smooth).await;
        let stop_latency_ms = start.elapsed().as_millis() as u64;

        tracing::info!(stop_latency_ms, smooth, "Playback stopped");
        Some(stop_latency_ms)
    }

    /// Immediate interrupt for barge-in. Synchronous; returns the measured
    /// interrupt latency in milliseconds.
    pub fn interrupt(&self) -> u64 {
        let start = Instant::now();
        self.buffer.interrupt();

        let mut inner = self.inner.lock();
        let played_ms = inner
            .playback_start
            .map(|s| s.elapsed().as_millis() as u64)
            .unwrap_or(0);
        inner.is_playing = false;
        let playback_id = inner.playback_id.take();
        inner.playback_start = None;
        drop(inner);

        let latency_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            playback_id = playback_id.as_deref().unwrap_or("-"),
            played_ms,
            interrupt_latency_ms = latency_ms,
            "Playback interrupted"
        );
        latency_ms
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().is_playing
    }

    pub fn snapshot(&self) -> PlaybackState {
        let inner = self.inner.lock();
        PlaybackState {
            is_playing: inner.is_playing,
            playback_id: inner.playback_id.clone(),
            playback_duration_ms: inner
                .playback_start
                .map(|s| s.elapsed().as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voice_bridge_core::AudioCodec;

    fn frame() -> AudioFrame {
        AudioFrame::silence_20ms(AudioCodec::MulawPstn)
    }

    fn small_config() -> PlaybackBufferConfig {
        PlaybackBufferConfig {
            jitter_buffer_ms: 40,
            max_buffer_ms: 100,
            jitter_fill_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_overrun_drops_oldest() {
        let buffer = PlaybackBuffer::new(small_config());
        // 100ms cap = 5 frames of 20ms; add 8
        for _ in 0..8 {
            buffer.add(frame());
        }
        let stats = buffer.stats();
        assert_eq!(stats.overruns, 3);
        assert!(stats.buffered_ms <= 100);
    }

    #[tokio::test]
    async fn test_playback_drains_and_completes() {
        let buffer = Arc::new(PlaybackBuffer::new(small_config()));
        let (tx, mut rx) = mpsc::channel(64);

        for _ in 0..4 {
            buffer.add(frame());
        }
        buffer.close_input();

        let outcome = buffer.run_playback(tx).await;
        assert_eq!(outcome, PlaybackOutcome::Completed);

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 4);
        assert_eq!(buffer.stats().frames_played, 4);
    }

    #[tokio::test]
    async fn test_empty_closed_buffer_completes_immediately() {
        let buffer = PlaybackBuffer::new(small_config());
        let (tx, _rx) = mpsc::channel(8);
        buffer.close_input();

        let start = Instant::now();
        let outcome = buffer.run_playback(tx).await;
        assert_eq!(outcome, PlaybackOutcome::Completed);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_interrupt_clears_and_stops_quickly() {
        let buffer = Arc::new(PlaybackBuffer::new(PlaybackBufferConfig {
            jitter_buffer_ms: 0,
            ..small_config()
        }));
        let (tx, mut rx) = mpsc::channel(64);

        for _ in 0..5 {
            buffer.add(frame());
        }
        let pump = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.run_playback(tx).await })
        };

        // Let one frame out, then interrupt
        let _ = rx.recv().await;
        let start = Instant::now();
        buffer.interrupt();
        let outcome = pump.await.unwrap();

        assert_eq!(outcome, PlaybackOutcome::Interrupted);
        assert!(start.elapsed() < Duration::from_millis(150));
        assert_eq!(buffer.buffered_ms(), 0);

        // Frames after interrupt are discarded
        buffer.add(frame());
        assert_eq!(buffer.buffered_ms(), 0);
    }

    #[tokio::test]
    async fn test_smooth_stop_fades_tail_and_releases() {
        let buffer = Arc::new(PlaybackBuffer::new(PlaybackBufferConfig {
            jitter_buffer_ms: 0,
            ..small_config()
        }));
        let (tx, mut rx) = mpsc::channel(64);

        let byte = voice_bridge_core::linear_to_mulaw(20000);
        for _ in 0..4 {
            buffer.add(AudioFrame::new(vec![byte; 160], AudioCodec::MulawPstn));
        }
        let pump = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.run_playback(tx).await })
        };
        let _ = rx.recv().await;

        let start = Instant::now();
        buffer.stop(true).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(pump.await.unwrap(), PlaybackOutcome::Stopped);

        // Last queued frame carries the fadeout
        let last = buffer.inner.lock().queue.back().cloned();
        if let Some(frame) = last {
            let tail = voice_bridge_core::mulaw_to_linear(*frame.payload.last().unwrap()).abs();
            assert!(tail < 2000, "tail sample still {}", tail);
        }
    }

    #[tokio::test]
    async fn test_controller_interrupt_reports_latency() {
        let buffer = Arc::new(PlaybackBuffer::new(small_config()));
        let controller = PlaybackController::new(buffer);

        let latency = controller.interrupt();
        assert!(latency < 10);
        assert!(!controller.is_playing());
    }

    #[tokio::test]
    async fn test_depth_never_exceeds_cap_under_flood() {
        let buffer = PlaybackBuffer::new(small_config());
        for _ in 0..200 {
            buffer.add(frame());
            assert!(buffer.buffered_ms() <= 100);
        }
        assert!(buffer.stats().overruns > 0);
    }
}
