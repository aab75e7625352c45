//! Dual-source voice activity detection
//!
//! Primary source: upstream VAD events from the STT stream (speech started
//! / utterance end). Fallback: a local energy detector over a sliding
//! window of inbound frames. Both feed one shared episode state so the two
//! sources never double-report.
//!
//! Debouncing happens here and only here; the interruption handler trusts
//! these events as-is. The raised edge fires immediately so barge-in
//! latency is not paid twice; the falling edge is held to the
//! minimum-duration check, and too-short episodes are counted as filtered.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use voice_bridge_core::{AudioFrame, SttEvent};

/// Detector tuning
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Episodes shorter than this are noise
    pub min_speech_duration: Duration,
    /// Events closer together than this are ignored
    pub debounce: Duration,
    /// Normalised energy threshold for the local detector
    pub energy_threshold: f32,
    /// Frames averaged by the local detector
    pub energy_window: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            min_speech_duration: Duration::from_millis(200),
            debounce: Duration::from_millis(50),
            energy_threshold: 0.02,
            energy_window: 10,
        }
    }
}

/// Events emitted towards the interruption handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStarted,
    SpeechEnded { duration: Duration },
}

/// Counters exposed for observability
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct VadStats {
    pub total_episodes: u64,
    pub upstream_events: u64,
    pub local_events: u64,
    pub filtered: u64,
    pub debounced: u64,
    pub is_speech_active: bool,
}

#[derive(Debug, Default)]
struct VadInner {
    speech_active: bool,
    speech_start: Option<Instant>,
    last_event: Option<Instant>,
    energies: VecDeque<f32>,
    energy_above: bool,
    stats: VadStats,
}

/// Dual-source detector with shared episode state
pub struct DualVad {
    config: VadConfig,
    inner: Mutex<VadInner>,
}

impl DualVad {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(VadInner::default()),
        }
    }

    /// Feed an upstream STT event; transcript events are ignored here.
    pub fn on_upstream_event(&self, event: &SttEvent) -> Option<VadEvent> {
        let mut inner = self.inner.lock();
        match event {
            SttEvent::SpeechStarted => {
                inner.stats.upstream_events += 1;
                self.trigger_started(&mut inner)
            },
            SttEvent::UtteranceEnd => {
                inner.stats.upstream_events += 1;
                self.trigger_ended(&mut inner)
            },
            SttEvent::Transcript(_) => None,
        }
    }

    /// Feed an inbound frame through the local energy fallback.
    ///
    /// Transitions on the running average over the configured window, so a
    /// sub-window noise burst never raises the edge on its own.
    pub fn process_frame(&self, frame: &AudioFrame) -> Option<VadEvent> {
        let energy = frame.energy();
        let mut inner = self.inner.lock();

        if inner.energies.len() >= self.config.energy_window {
            inner.energies.pop_front();
        }
        inner.energies.push_back(energy);
        if inner.energies.len() < self.config.energy_window {
            return None;
        }

        let avg: f32 = inner.energies.iter().sum::<f32>() / inner.energies.len() as f32;
        let is_speech = avg > self.config.energy_threshold;

        if is_speech && !inner.energy_above {
            inner.energy_above = true;
            inner.stats.local_events += 1;
            tracing::debug!(avg_energy = avg, "Local VAD raised edge");
            self.trigger_started(&mut inner)
        } else if !is_speech && inner.energy_above {
            inner.energy_above = false;
            inner.stats.local_events += 1;
            self.trigger_ended(&mut inner)
        } else {
            None
        }
    }

    fn debounced(&self, inner: &mut VadInner, now: Instant) -> bool {
        if let Some(last) = inner.last_event {
            if now.duration_since(last) < self.config.debounce {
                inner.stats.debounced += 1;
                return true;
            }
        }
        false
    }

    /// Raised edge: fires immediately
    fn trigger_started(&self, inner: &mut VadInner) -> Option<VadEvent> {
        if inner.speech_active {
            return None;
        }
        let now = Instant::now();
        if self.debounced(inner, now) {
            return None;
        }
        inner.last_event = Some(now);
        inner.speech_active = true;
        inner.speech_start = Some(now);
        inner.stats.total_episodes += 1;
        inner.stats.is_speech_active = true;
        Some(VadEvent::SpeechStarted)
    }

    /// Falling edge: held to the minimum-duration check. Too-short episodes
    /// are discarded and counted as filtered.
    fn trigger_ended(&self, inner: &mut VadInner) -> Option<VadEvent> {
        if !inner.speech_active {
            return None;
        }
        let now = Instant::now();
        if self.debounced(inner, now) {
            return None;
        }

        let duration = inner
            .speech_start
            .map(|s| now.duration_since(s))
            .unwrap_or_default();

        inner.speech_active = false;
        inner.speech_start = None;
        inner.stats.is_speech_active = false;

        if duration < self.config.min_speech_duration {
            inner.stats.filtered += 1;
            tracing::debug!(duration_ms = duration.as_millis() as u64, "Filtered short speech episode");
            return None;
        }

        inner.last_event = Some(now);
        Some(VadEvent::SpeechEnded { duration })
    }

    pub fn is_speech_active(&self) -> bool {
        self.inner.lock().speech_active
    }

    /// Duration of the currently active episode, if any
    pub fn active_speech_duration(&self) -> Option<Duration> {
        self.inner.lock().speech_start.map(|s| s.elapsed())
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let stats = inner.stats;
        *inner = VadInner {
            stats: VadStats {
                is_speech_active: false,
                ..stats
            },
            ..VadInner::default()
        };
    }

    pub fn stats(&self) -> VadStats {
        self.inner.lock().stats
    }
}
