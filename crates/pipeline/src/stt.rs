//! STT adapter: inbound frames to transcript and VAD events
//!
//! Bridges the session's inbound audio to a vendor STT stream. On
//! transport drop the feed reconnects with exponential backoff; once the
//! reconnect budget is spent the feed surfaces `UpstreamDown(stt)` and the
//! session aborts the current turn while staying alive.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use voice_bridge_core::{
    AudioFrame, CancellationToken, Error, Result, SpeechToText, SttEvent, SttSessionConfig,
    UpstreamStage,
};

/// Feed tuning
#[derive(Debug, Clone)]
pub struct SttFeedConfig {
    pub session: SttSessionConfig,
    /// Budget for one stream open
    pub open_timeout: Duration,
    /// Reconnect attempts after a transport drop
    pub max_reconnects: u32,
    /// First backoff, doubled per attempt
    pub initial_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
}

impl Default for SttFeedConfig {
    fn default() -> Self {
        Self {
            session: SttSessionConfig::default(),
            open_timeout: Duration::from_secs(5),
            max_reconnects: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

fn backoff_for(config: &SttFeedConfig, attempt: u32) -> Duration {
    let base = config
        .initial_backoff
        .saturating_mul(1u32 << attempt.min(16))
        .min(config.max_backoff);
    // Small jitter so parallel sessions do not reconnect in lockstep
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    base.mul_f64(jitter)
}

/// Run the STT feed until the inbound channel closes, cancellation fires,
/// or the reconnect budget is exhausted.
///
/// Frames arrive on `audio_rx`; transcripts and upstream VAD events are
/// forwarded on `events_tx`.
pub async fn run_stt_feed(
    stt: Arc<dyn SpeechToText>,
    config: SttFeedConfig,
    mut audio_rx: mpsc::Receiver<AudioFrame>,
    events_tx: mpsc::Sender<SttEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let mut session =
            match tokio::time::timeout(config.open_timeout, stt.open(config.session.clone())).await
            {
                Ok(Ok(session)) => session,
                Ok(Err(e)) => {
                    tracing::warn!(attempt = attempts + 1, error = %e, "STT open failed");
                    attempts += 1;
                    if attempts > config.max_reconnects {
                        metrics::counter!("upstream_errors", "stage" => UpstreamStage::Stt.as_str())
                            .increment(1);
                        return Err(Error::UpstreamDown(UpstreamStage::Stt));
                    }
                    tokio::time::sleep(backoff_for(&config, attempts - 1)).await;
                    continue;
                },
                Err(_) => {
                    tracing::warn!(attempt = attempts + 1, "STT open timed out");
                    attempts += 1;
                    if attempts > config.max_reconnects {
                        metrics::counter!("upstream_errors", "stage" => UpstreamStage::Stt.as_str())
                            .increment(1);
                        return Err(Error::UpstreamDown(UpstreamStage::Stt));
                    }
                    tokio::time::sleep(backoff_for(&config, attempts - 1)).await;
                    continue;
                },
            };

        tracing::info!("STT stream open");
        attempts = 0;

        // Pump until the transport drops or the session winds down
        let dropped = loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),

                frame = audio_rx.recv() => match frame {
                    Some(frame) => {
                        if session.audio_tx.send(frame).await.is_err() {
                            break true;
                        }
                    },
                    // Session closed its inbound side; we are done
                    None => return Ok(()),
                },

                event = session.events.recv() => match event {
                    Some(event) => {
                        if events_tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    },
                    None => break true,
                },
            }
        };

        if dropped {
            attempts += 1;
            tracing::warn!(attempt = attempts, "STT transport dropped");
            if attempts > config.max_reconnects {
                metrics::counter!("upstream_errors", "stage" => UpstreamStage::Stt.as_str())
                    .increment(1);
                return Err(Error::UpstreamDown(UpstreamStage::Stt));
            }
            tokio::time::sleep(backoff_for(&config, attempts - 1)).await;
        }
    }
}
