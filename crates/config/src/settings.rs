//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::ConfigError;

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Audio buffering configuration
    #[serde(default)]
    pub audio: AudioSettings,

    /// Voice activity detection
    #[serde(default)]
    pub vad: VadSettings,

    /// Barge-in / interruption handling
    #[serde(default)]
    pub interruption: InterruptionSettings,

    /// Streaming pipeline tuning
    #[serde(default)]
    pub streaming: StreamingSettings,

    /// Stage timeouts
    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// Upstream retry policy
    #[serde(default)]
    pub retry: RetrySettings,

    /// Process-wide limits
    #[serde(default)]
    pub limits: LimitSettings,

    /// Conversation defaults (system prompt, canned lines)
    #[serde(default)]
    pub conversation: ConversationSettings,

    /// Ambiguity screening of final transcripts
    #[serde(default)]
    pub clarification: ClarificationSettings,
}

/// Playback buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Playback chunk duration in milliseconds
    #[serde(default = "default_chunk_size_ms")]
    pub chunk_size_ms: u64,
    /// Initial pre-fill absorbing upstream jitter
    #[serde(default = "default_jitter_buffer_ms")]
    pub jitter_buffer_ms: u64,
    /// Hard cap on buffered audio; oldest frames drop past this
    #[serde(default = "default_max_buffer_ms")]
    pub max_buffer_ms: u64,
    /// Fadeout applied to the tail frame on smooth stop
    #[serde(default = "default_fadeout_ms")]
    pub fadeout_ms: u64,
}

fn default_chunk_size_ms() -> u64 {
    20
}
fn default_jitter_buffer_ms() -> u64 {
    100
}
fn default_max_buffer_ms() -> u64 {
    500
}
fn default_fadeout_ms() -> u64 {
    50
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            chunk_size_ms: default_chunk_size_ms(),
            jitter_buffer_ms: default_jitter_buffer_ms(),
            max_buffer_ms: default_max_buffer_ms(),
            fadeout_ms: default_fadeout_ms(),
        }
    }
}

/// Voice activity detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadSettings {
    /// Speech shorter than this is discarded as noise
    #[serde(default = "default_min_speech_duration_ms")]
    pub min_speech_duration_ms: u64,
    /// Events closer together than this are ignored
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Normalised energy threshold for the local fallback detector
    #[serde(default = "default_energy_threshold")]
    pub energy_threshold: f32,
    /// Frames averaged by the local fallback detector
    #[serde(default = "default_energy_window")]
    pub energy_window: usize,
}

fn default_min_speech_duration_ms() -> u64 {
    200
}
fn default_debounce_ms() -> u64 {
    50
}
fn default_energy_threshold() -> f32 {
    0.02
}
fn default_energy_window() -> usize {
    10
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            min_speech_duration_ms: default_min_speech_duration_ms(),
            debounce_ms: default_debounce_ms(),
            energy_threshold: default_energy_threshold(),
            energy_window: default_energy_window(),
        }
    }
}

/// Barge-in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptionSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SLO for playback stop after speech is detected mid-utterance
    #[serde(default = "default_stop_latency_target_ms")]
    pub stop_latency_target_ms: u64,
    /// Count sub-minimum speech bursts as false positives instead of
    /// entering the barge-in path
    #[serde(default = "default_true")]
    pub require_confident_speech: bool,
}

fn default_true() -> bool {
    true
}
fn default_stop_latency_target_ms() -> u64 {
    150
}

impl Default for InterruptionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            stop_latency_target_ms: default_stop_latency_target_ms(),
            require_confident_speech: true,
        }
    }
}

/// Streaming pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingSettings {
    /// Token buffer size that forces a TTS flush
    #[serde(default = "default_stream_chunk_size")]
    pub stream_chunk_size: usize,
    /// Sliding window of turns forwarded to the LLM
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
    /// Process-wide LLM call floor per minute
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    /// TTS voice identifier
    #[serde(default = "default_voice")]
    pub voice: String,
}

fn default_stream_chunk_size() -> usize {
    512
}
fn default_max_history_turns() -> usize {
    20
}
fn default_rate_limit_per_minute() -> u32 {
    60
}
fn default_voice() -> String {
    "alloy".to_string()
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            stream_chunk_size: default_stream_chunk_size(),
            max_history_turns: default_max_history_turns(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            voice: default_voice(),
        }
    }
}

/// Stage timeouts in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_stt_open_ms")]
    pub stt_open_ms: u64,
    #[serde(default = "default_llm_first_token_ms")]
    pub llm_first_token_ms: u64,
    #[serde(default = "default_llm_turn_ms")]
    pub llm_turn_ms: u64,
    #[serde(default = "default_tts_first_frame_ms")]
    pub tts_first_frame_ms: u64,
    #[serde(default = "default_tts_turn_ms")]
    pub tts_turn_ms: u64,
    #[serde(default = "default_jitter_fill_ms")]
    pub jitter_fill_ms: u64,
}

fn default_stt_open_ms() -> u64 {
    5_000
}
fn default_llm_first_token_ms() -> u64 {
    8_000
}
fn default_llm_turn_ms() -> u64 {
    20_000
}
fn default_tts_first_frame_ms() -> u64 {
    3_000
}
fn default_tts_turn_ms() -> u64 {
    15_000
}
fn default_jitter_fill_ms() -> u64 {
    1_000
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            stt_open_ms: default_stt_open_ms(),
            llm_first_token_ms: default_llm_first_token_ms(),
            llm_turn_ms: default_llm_turn_ms(),
            tts_first_frame_ms: default_tts_first_frame_ms(),
            tts_turn_ms: default_tts_turn_ms(),
            jitter_fill_ms: default_jitter_fill_ms(),
        }
    }
}

/// Upstream retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    2_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Process-wide limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    /// Wall-clock ceiling per call in seconds
    #[serde(default = "default_max_call_duration_secs")]
    pub max_call_duration_secs: u64,
    /// Idle timeout before the registry sweep hangs a session up
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Deadline for releasing per-session resources on teardown
    #[serde(default = "default_cleanup_deadline_ms")]
    pub cleanup_deadline_ms: u64,
}

fn default_max_concurrent_calls() -> usize {
    5
}
fn default_max_call_duration_secs() -> u64 {
    600
}
fn default_idle_timeout_secs() -> u64 {
    120
}
fn default_cleanup_deadline_ms() -> u64 {
    2_000
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_concurrent_calls: default_max_concurrent_calls(),
            max_call_duration_secs: default_max_call_duration_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            cleanup_deadline_ms: default_cleanup_deadline_ms(),
        }
    }
}

/// Conversation defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSettings {
    /// Static per-session system prompt, passed out-of-band
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Spoken when the carrier reports the call answered
    #[serde(default = "default_greeting")]
    pub greeting: String,
    /// Spoken when a turn times out and TTS is still reachable
    #[serde(default = "default_apology")]
    pub apology: String,
}

fn default_system_prompt() -> String {
    "You are a helpful voice assistant on a phone call. Speak naturally and \
     briefly; short sentences, no lists. Answer directly."
        .to_string()
}
fn default_greeting() -> String {
    "Hi! You're speaking with an AI assistant. How can I help?".to_string()
}
fn default_apology() -> String {
    "Sorry, I'm having trouble right now. Could you say that again?".to_string()
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            greeting: default_greeting(),
            apology: default_apology(),
        }
    }
}

/// Ambiguity screening configuration.
///
/// Off by default: with screening on, a one-word answer is asked to repeat
/// instead of being sent to the LLM, which is a product decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Responses under this many words are treated as ambiguous
    #[serde(default = "default_short_word_threshold")]
    pub short_word_threshold: usize,
    /// Transcripts under this STT confidence are treated as misheard
    #[serde(default = "default_min_transcript_confidence")]
    pub min_confidence: f32,
}

fn default_short_word_threshold() -> usize {
    3
}
fn default_min_transcript_confidence() -> f32 {
    0.7
}

impl Default for ClarificationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            short_word_threshold: default_short_word_threshold(),
            min_confidence: default_min_transcript_confidence(),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audio.chunk_size_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "audio.chunk_size_ms".to_string(),
                message: "chunk size must be non-zero".to_string(),
            });
        }
        if self.audio.jitter_buffer_ms > self.audio.max_buffer_ms {
            return Err(ConfigError::InvalidValue {
                field: "audio.jitter_buffer_ms".to_string(),
                message: "jitter pre-fill cannot exceed max buffer".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.vad.energy_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "vad.energy_threshold".to_string(),
                message: "energy threshold must be within [0, 1]".to_string(),
            });
        }
        if self.vad.energy_window == 0 {
            return Err(ConfigError::InvalidValue {
                field: "vad.energy_window".to_string(),
                message: "energy window must be non-zero".to_string(),
            });
        }
        if self.limits.max_concurrent_calls == 0 {
            return Err(ConfigError::InvalidValue {
                field: "limits.max_concurrent_calls".to_string(),
                message: "at least one concurrent call must be allowed".to_string(),
            });
        }
        if self.streaming.max_history_turns == 0 {
            return Err(ConfigError::InvalidValue {
                field: "streaming.max_history_turns".to_string(),
                message: "history window must be non-zero".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.clarification.min_confidence) {
            return Err(ConfigError::InvalidValue {
                field: "clarification.min_confidence".to_string(),
                message: "confidence floor must be within [0, 1]".to_string(),
            });
        }
        Ok(())
    }
}

/// Load settings from an optional TOML file plus `VOICE_BRIDGE_` environment
/// overrides (`VOICE_BRIDGE_AUDIO__MAX_BUFFER_MS=400`).
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        builder = builder.add_source(File::from(path));
    }

    let config = builder
        .add_source(Environment::with_prefix("VOICE_BRIDGE").separator("__"))
        .build()?;

    let settings: Settings = config.try_deserialize()?;
    settings.validate()?;

    tracing::info!(
        max_concurrent_calls = settings.limits.max_concurrent_calls,
        chunk_ms = settings.audio.chunk_size_ms,
        "Settings loaded"
    );

    Ok(settings)
}
