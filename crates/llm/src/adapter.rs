//! Chat adapter over a pluggable language model
//!
//! Wraps a `LanguageModel` with the conversational plumbing every turn
//! needs: sliding-window context building, a process-wide per-minute rate
//! floor, and retries with exponential backoff. The wrapped model never
//! sees raw turns, only the filtered message window.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use voice_bridge_core::{
    ChatMessage, Error, LanguageModel, Result, TokenStream, Turn, TurnRole, UpstreamStage,
};

/// Adapter tuning knobs
#[derive(Debug, Clone)]
pub struct ChatAdapterConfig {
    /// Sliding window of turns forwarded as context
    pub max_history_turns: usize,
    /// Calls per minute before excess callers wait for the minute boundary
    pub rate_limit_per_minute: u32,
    /// Retry attempts against a failing model
    pub max_attempts: u32,
    /// Initial backoff, doubled each retry
    pub initial_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
}

impl Default for ChatAdapterConfig {
    fn default() -> Self {
        Self {
            max_history_turns: 20,
            rate_limit_per_minute: 60,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Minute-window request counter, shared by all sessions in the process
#[derive(Clone)]
struct RateLimiter {
    limit: u32,
    window: Arc<Mutex<RateWindow>>,
}

struct RateWindow {
    minute_start: Instant,
    count: u32,
}

impl RateLimiter {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            window: Arc::new(Mutex::new(RateWindow {
                minute_start: Instant::now(),
                count: 0,
            })),
        }
    }

    /// Reserve one call slot, sleeping until the minute boundary when the
    /// window is exhausted.
    async fn acquire(&self) {
        let wait = {
            let mut window = self.window.lock();
            if window.minute_start.elapsed() >= Duration::from_secs(60) {
                window.minute_start = Instant::now();
                window.count = 0;
            }
            if window.count >= self.limit {
                Some(Duration::from_secs(60).saturating_sub(window.minute_start.elapsed()))
            } else {
                window.count += 1;
                None
            }
        };

        if let Some(wait) = wait {
            tracing::warn!(wait_ms = wait.as_millis() as u64, "LLM rate limited");
            tokio::time::sleep(wait).await;
            let mut window = self.window.lock();
            window.minute_start = Instant::now();
            window.count = 1;
        }
    }
}

/// Language-model adapter shared process-wide; sessions hold it only for
/// the duration of one pipeline run.
pub struct ChatAdapter {
    model: Arc<dyn LanguageModel>,
    config: ChatAdapterConfig,
    rate: RateLimiter,
}

impl ChatAdapter {
    pub fn new(model: Arc<dyn LanguageModel>, config: ChatAdapterConfig) -> Self {
        let rate = RateLimiter::new(config.rate_limit_per_minute);
        Self {
            model,
            config,
            rate,
        }
    }

    /// Build the message window: last `max_history_turns` turns, user and
    /// assistant roles with non-empty text only, then the current user
    /// message. The system prompt travels out-of-band.
    fn build_messages(&self, context: &[Turn], user_message: &str) -> Vec<ChatMessage> {
        let start = context.len().saturating_sub(self.config.max_history_turns);
        let mut messages: Vec<ChatMessage> = context[start..]
            .iter()
            .filter(|t| {
                matches!(t.role, TurnRole::User | TurnRole::Assistant)
                    && !t.text.trim().is_empty()
            })
            .map(|t| ChatMessage {
                role: t.role,
                content: t.text.clone(),
            })
            .collect();

        messages.push(ChatMessage {
            role: TurnRole::User,
            content: user_message.to_string(),
        });
        messages
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let backoff = self
            .config
            .initial_backoff
            .saturating_mul(1u32 << attempt.min(16));
        backoff.min(self.config.max_backoff)
    }

    /// Stream a reply for the current user message.
    ///
    /// Retries cover failures before the first token; once tokens have been
    /// yielded they are part of the record, so an upstream error then ends
    /// the stream with `UpstreamDown(llm)` instead of restarting it.
    /// Dropping the stream cancels generation.
    pub fn generate_stream(
        &self,
        system: &str,
        context: &[Turn],
        user_message: &str,
    ) -> TokenStream {
        use futures::StreamExt;

        let messages = self.build_messages(context, user_message);
        let system = system.to_string();
        let model = self.model.clone();
        let rate = self.rate.clone();
        let max_attempts = self.config.max_attempts;
        let backoffs: Vec<Duration> = (0..max_attempts).map(|a| self.backoff_for(a)).collect();

        Box::pin(async_stream::stream! {
            rate.acquire().await;

            let mut yielded_any = false;
            for attempt in 0..max_attempts {
                let mut stream = model.generate_stream(&system, &messages);
                let mut failed = false;

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(token) => {
                            yielded_any = true;
                            yield Ok(token);
                        },
                        Err(e) => {
                            tracing::warn!(
                                attempt = attempt + 1,
                                error = %e,
                                "LLM stream error"
                            );
                            failed = true;
                            break;
                        },
                    }
                }

                if !failed {
                    return;
                }
                if yielded_any || attempt + 1 >= max_attempts {
                    yield Err(Error::UpstreamDown(UpstreamStage::Llm));
                    return;
                }
                tokio::time::sleep(backoffs[attempt as usize]).await;
            }
        })
    }

    /// Non-streaming fallback with the same retry policy
    pub async fn generate(
        &self,
        system: &str,
        context: &[Turn],
        user_message: &str,
    ) -> Result<String> {
        self.rate.acquire().await;
        let messages = self.build_messages(context, user_message);

        for attempt in 0..self.config.max_attempts {
            match self.model.generate(system, &messages).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "LLM generate failed");
                    if attempt + 1 >= self.config.max_attempts {
                        return Err(Error::UpstreamDown(UpstreamStage::Llm));
                    }
                    tokio::time::sleep(self.backoff_for(attempt)).await;
                },
            }
        }
        Err(Error::UpstreamDown(UpstreamStage::Llm))
    }
}
