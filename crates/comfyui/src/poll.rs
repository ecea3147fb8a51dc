//! History polling for a submitted prompt.
//!
//! After a workflow is queued, [`wait_for_completion`] queries the
//! history endpoint until the prompt reaches a terminal [`PollState`].
//! The delay between attempts grows by [`PollConfig::multiplier`] up to
//! [`PollConfig::max_interval`]; an attempt limit, an overall timeout and
//! a [`CancellationToken`] bound how long the caller can be blocked.
//!
//! ```text
//! Submitted -> Pending{n} -> Complete | Failed | TimedOut | Cancelled
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{AffinityCookie, ComfyUIApi, ComfyUIApiError};
use crate::history::{HistoryRecord, HistoryResponse};

/// Shortest pause between two history queries.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Message used when a failed record carries no exception details.
const UNKNOWN_FAILURE: &str = "execution failed without an error message";

/// Tunable parameters for history polling.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay after the first unsuccessful attempt.
    pub interval: Duration,
    /// Upper bound on the delay between attempts.
    pub max_interval: Duration,
    /// Factor by which the delay grows after each attempt (`1.0` = fixed).
    pub multiplier: f64,
    /// Give up after this many attempts.
    pub max_attempts: Option<u32>,
    /// Give up once this much time has passed since polling started.
    pub timeout: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            multiplier: 1.0,
            max_attempts: None,
            timeout: Some(Duration::from_secs(30 * 60)),
        }
    }
}

/// Where a submitted prompt stands.
#[derive(Debug, Clone)]
pub enum PollState {
    /// Queued; history not queried yet.
    Submitted,
    /// Queried `attempts` times without a finished record.
    Pending { attempts: u32 },
    /// The finished record is available.
    Complete {
        attempts: u32,
        record: Box<HistoryRecord>,
    },
    /// The server reported the execution as failed.
    Failed { attempts: u32, message: String },
    /// The attempt limit or timeout was reached first.
    TimedOut { attempts: u32, elapsed: Duration },
    /// The caller cancelled the wait.
    Cancelled { attempts: u32 },
}

/// Errors returned by [`wait_for_completion`].
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Prompt {prompt_id} failed: {message}")]
    Failed { prompt_id: String, message: String },

    #[error("Prompt {prompt_id} did not finish after {attempts} attempts ({elapsed:?})")]
    TimedOut {
        prompt_id: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("Waiting for prompt {prompt_id} was cancelled after {attempts} attempts")]
    Cancelled { prompt_id: String, attempts: u32 },

    #[error("Polling for prompt {prompt_id} stopped before a terminal state")]
    Incomplete { prompt_id: String },

    #[error(transparent)]
    Api(#[from] ComfyUIApiError),
}

/// Anything that can answer history queries.
///
/// Implemented by [`ComfyUIApi`]; tests substitute scripted sources.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn history(
        &self,
        prompt_id: &str,
        affinity: Option<&AffinityCookie>,
    ) -> Result<HistoryResponse, ComfyUIApiError>;
}

#[async_trait]
impl HistorySource for ComfyUIApi {
    async fn history(
        &self,
        prompt_id: &str,
        affinity: Option<&AffinityCookie>,
    ) -> Result<HistoryResponse, ComfyUIApiError> {
        self.get_history(prompt_id, affinity).await
    }
}

impl PollState {
    /// Number of history queries issued so far.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Submitted => 0,
            Self::Pending { attempts }
            | Self::Complete { attempts, .. }
            | Self::Failed { attempts, .. }
            | Self::TimedOut { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Submitted | Self::Pending { .. })
    }

    /// Advance with the response of one more history query.
    ///
    /// Terminal states are returned unchanged.
    pub fn observe(self, prompt_id: &str, mut response: HistoryResponse) -> Self {
        if self.is_terminal() {
            return self;
        }
        let attempts = self.attempts() + 1;

        let Some(record) = response.remove(prompt_id) else {
            if !response.is_empty() {
                tracing::warn!(prompt_id, "History response does not contain the prompt");
            }
            return Self::Pending { attempts };
        };

        if record.is_failed() {
            let message = record
                .status
                .as_ref()
                .and_then(|status| status.error_message())
                .unwrap_or_else(|| UNKNOWN_FAILURE.to_string());
            return Self::Failed { attempts, message };
        }
        if record.is_incomplete() {
            return Self::Pending { attempts };
        }

        Self::Complete {
            attempts,
            record: Box::new(record),
        }
    }

    /// Move a non-terminal state to [`PollState::TimedOut`] when a limit
    /// in `config` has been reached.
    pub fn enforce_limits(self, config: &PollConfig, elapsed: Duration) -> Self {
        if self.is_terminal() {
            return self;
        }
        let attempts = self.attempts();
        let over_attempts = config.max_attempts.is_some_and(|max| attempts >= max);
        let over_time = config.timeout.is_some_and(|timeout| elapsed >= timeout);
        if over_attempts || over_time {
            Self::TimedOut { attempts, elapsed }
        } else {
            self
        }
    }

    /// Move a non-terminal state to [`PollState::Cancelled`].
    pub fn cancel(self) -> Self {
        if self.is_terminal() {
            return self;
        }
        Self::Cancelled {
            attempts: self.attempts(),
        }
    }

    fn into_result(self, prompt_id: &str) -> Result<HistoryRecord, PollError> {
        let prompt_id = prompt_id.to_string();
        match self {
            Self::Complete { record, .. } => Ok(*record),
            Self::Failed { message, .. } => Err(PollError::Failed { prompt_id, message }),
            Self::TimedOut { attempts, elapsed } => Err(PollError::TimedOut {
                prompt_id,
                attempts,
                elapsed,
            }),
            Self::Cancelled { attempts } => Err(PollError::Cancelled {
                prompt_id,
                attempts,
            }),
            Self::Submitted | Self::Pending { .. } => Err(PollError::Incomplete { prompt_id }),
        }
    }
}

/// Calculate the next delay from the current delay and config.
///
/// The result is clamped to [`PollConfig::max_interval`] and never drops
/// below [`PollConfig::interval`] or [`MIN_POLL_INTERVAL`].
pub fn next_delay(current: Duration, config: &PollConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms)
        .min(config.max_interval)
        .max(config.interval)
        .max(MIN_POLL_INTERVAL)
}

/// Poll the history of `prompt_id` until it completes, fails, times out
/// or `cancel` is triggered.
///
/// The first query is issued immediately. Errors from the history source
/// abort the wait; there is no retry.
pub async fn wait_for_completion<S: HistorySource + ?Sized>(
    source: &S,
    prompt_id: &str,
    affinity: Option<&AffinityCookie>,
    config: &PollConfig,
    cancel: &CancellationToken,
) -> Result<HistoryRecord, PollError> {
    let started = Instant::now();
    let mut state = PollState::Submitted;
    let mut delay = config.interval.max(MIN_POLL_INTERVAL);

    loop {
        state = tokio::select! {
            biased;
            _ = cancel.cancelled() => state.cancel(),
            response = source.history(prompt_id, affinity) => state.observe(prompt_id, response?),
        };
        state = state.enforce_limits(config, started.elapsed());
        if state.is_terminal() {
            break;
        }

        let wait = match config.timeout {
            Some(timeout) => delay.min(timeout.saturating_sub(started.elapsed())),
            None => delay,
        };
        tracing::debug!(
            prompt_id,
            attempt = state.attempts(),
            delay_ms = wait.as_millis() as u64,
            "Generation not ready",
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                state = state.cancel();
                break;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        delay = next_delay(delay, config);
    }

    match &state {
        PollState::Complete { attempts, .. } => {
            tracing::info!(prompt_id, attempts, "Generation finished");
        }
        PollState::Failed { message, .. } => {
            tracing::error!(prompt_id, error = %message, "Generation failed");
        }
        PollState::TimedOut { attempts, elapsed } => {
            tracing::warn!(
                prompt_id,
                attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                "Gave up waiting for generation",
            );
        }
        PollState::Cancelled { attempts } => {
            tracing::info!(prompt_id, attempts, "Waiting for generation cancelled");
        }
        PollState::Submitted | PollState::Pending { .. } => {}
    }

    state.into_result(prompt_id)
}
