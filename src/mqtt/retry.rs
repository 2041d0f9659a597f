//! Connect-with-retry loop as a statum state machine
//!
//! ```text
//! Attempting ──ok──► Established
//!     ▲   │
//!     │   └─err──► BackingOff ──(wait, not cancelled)──┐
//!     └────────────────────────────────────────────────┘
//! ```
//!
//! The backoff after the n-th consecutive failure is `min(2^n, 60)` seconds.
//! The cancellation token is checked before every attempt, before sleeping and
//! after waking, and the sleep itself is abandoned as soon as it fires.

use super::transport::Transport;
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timeout for one connect attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Ceiling for the backoff between attempts
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Backoff after `retry_count` consecutive failures
pub fn backoff_delay(retry_count: u32) -> Duration {
    let ceiling = MAX_BACKOFF.as_secs();
    let secs = 2u64
        .checked_pow(retry_count)
        .map_or(ceiling, |secs| secs.min(ceiling));
    Duration::from_secs(secs)
}

/// Progress reported back to the session task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    Connected { retries: u32 },
    AttemptFailed { retry_count: u32, delay: Duration },
}

#[derive(Debug, Clone)]
pub struct Backoff {
    pub delay: Duration,
    pub cause: String,
}

#[state]
#[derive(Debug, Clone)]
pub enum RetryState {
    Attempting,
    BackingOff(Backoff),
    Established,
}

#[machine]
pub struct RetryLoop<S: RetryState> {
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    retry_count: u32,
}

pub enum AttemptOutcome {
    Established(RetryLoop<Established>),
    Failed(RetryLoop<BackingOff>),
    Cancelled,
}

impl<S: RetryState> RetryLoop<S> {
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

impl RetryLoop<Attempting> {
    /// Starts a fresh loop, the retry counter is never shared between loops
    pub fn start(transport: Arc<dyn Transport>, cancel: CancellationToken) -> Self {
        Self::new(transport, cancel, 0)
    }

    pub async fn attempt(mut self) -> AttemptOutcome {
        if self.cancel.is_cancelled() {
            return AttemptOutcome::Cancelled;
        }

        let result = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!("Connect attempt abandoned, loop cancelled");
                return AttemptOutcome::Cancelled;
            }
            result = self.transport.connect(CONNECT_TIMEOUT) => result,
        };

        match result {
            Ok(()) => AttemptOutcome::Established(self.transition()),
            Err(e) => {
                self.retry_count += 1;
                let backoff = Backoff {
                    delay: backoff_delay(self.retry_count),
                    cause: e.to_string(),
                };
                AttemptOutcome::Failed(self.transition_with(backoff))
            }
        }
    }
}

impl RetryLoop<BackingOff> {
    pub fn delay(&self) -> Duration {
        self.get_state_data()
            .map_or_else(|| backoff_delay(self.retry_count), |backoff| backoff.delay)
    }

    pub fn cause(&self) -> &str {
        self.get_state_data()
            .map_or("unknown", |backoff| backoff.cause.as_str())
    }

    /// Sleeps for the backoff, `None` once the loop has been cancelled
    pub async fn wait(self) -> Option<RetryLoop<Attempting>> {
        if self.cancel.is_cancelled() {
            return None;
        }

        let delay = self.delay();
        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!("Backoff wait cancelled");
                return None;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        if self.cancel.is_cancelled() {
            return None;
        }
        Some(self.transition())
    }
}

/// Runs the loop in its own task until it connects or `cancel` fires
///
/// Progress is sent to `events`; the loop holds no session state.
pub fn spawn_retry_loop(
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    events: mpsc::Sender<RetryEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut attempting = RetryLoop::start(transport, cancel);
        loop {
            match attempting.attempt().await {
                AttemptOutcome::Established(established) => {
                    let retries = established.retry_count();
                    info!("Connected to broker after {} failed attempts", retries);
                    if events.send(RetryEvent::Connected { retries }).await.is_err() {
                        warn!("Session task is gone, dropping connect result");
                    }
                    return;
                }
                AttemptOutcome::Failed(backing_off) => {
                    let retry_count = backing_off.retry_count();
                    let delay = backing_off.delay();
                    info!(
                        "Connection failed: {}. Retrying in {}s...",
                        backing_off.cause(),
                        delay.as_secs()
                    );
                    let _ = events
                        .send(RetryEvent::AttemptFailed { retry_count, delay })
                        .await;

                    match backing_off.wait().await {
                        Some(next) => attempting = next,
                        None => {
                            info!("Retry loop cancelled after {} attempts", retry_count);
                            return;
                        }
                    }
                }
                AttemptOutcome::Cancelled => {
                    info!("Retry loop cancelled");
                    return;
                }
            }
        }
    })
}
