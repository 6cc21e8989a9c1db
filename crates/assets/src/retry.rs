use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio_util::sync::CancellationToken;

use crate::{AssetItem, Fetcher, ItemProgress};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AttemptOutcome {
    Success,
    Retryable(String),
    Fatal(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAttempt {
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
}

/// Final outcome of one item plus every attempt that led to it.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryResult {
    /// Never `Retryable`.
    pub outcome: AttemptOutcome,
    pub attempts: Vec<TransferAttempt>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Longest single wait between attempts.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

impl RetryPolicy {
    /// `base × 2^n` for each of the `max_retries` waits, capped at [`MAX_RETRY_DELAY`].
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let base = self.base_delay.min(MAX_RETRY_DELAY);
        let max = base
            .checked_mul(2u32.saturating_pow(self.max_retries))
            .unwrap_or(Duration::MAX)
            .min(MAX_RETRY_DELAY);

        ExponentialBuilder::default()
            .with_min_delay(base)
            .with_max_delay(max)
            .with_factor(2.0)
            .with_max_times(self.max_retries as usize)
            .build()
    }
}

/// Maps a transport error onto the retry taxonomy.
pub fn classify(error: &acq_file::Error) -> AttemptOutcome {
    use acq_file::Error;

    match error {
        Error::Cancelled => AttemptOutcome::Cancelled,
        Error::ReqwestError(e) if e.is_builder() => AttemptOutcome::Fatal(error.to_string()),
        Error::ReqwestError(_)
        | Error::Timeout(_)
        | Error::UnexpectedStatus { .. }
        | Error::RangeIgnored { .. }
        | Error::SizeMismatch { .. } => AttemptOutcome::Retryable(error.to_string()),
        Error::FileIOError(_) | Error::InvalidRange(_) => AttemptOutcome::Fatal(error.to_string()),
    }
}

/// Runs `fetcher` until it succeeds, fails fatally, is cancelled, or runs
/// out of retries. Exhausted retries turn the last retryable reason fatal.
pub async fn download_with_retry(
    fetcher: &dyn Fetcher,
    item: &AssetItem,
    policy: &RetryPolicy,
    progress: &ItemProgress,
    cancellation_token: &CancellationToken,
) -> RetryResult {
    let mut delays = policy.delays();
    let mut attempts = Vec::new();
    let mut attempt_number = 0;

    loop {
        attempt_number += 1;
        let outcome = fetcher.fetch(item, progress, cancellation_token).await;
        attempts.push(TransferAttempt {
            attempt_number,
            outcome: outcome.clone(),
        });

        let reason = match outcome {
            AttemptOutcome::Retryable(reason) => reason,
            outcome => {
                if let AttemptOutcome::Fatal(reason) = &outcome {
                    tracing::error!("download_failed: {} {}", item.id(), reason);
                }
                return RetryResult { outcome, attempts };
            }
        };

        let Some(delay) = delays.next() else {
            tracing::error!(
                "Failed to download {} after {} attempts: {}",
                item.file_name,
                attempt_number,
                reason
            );
            return RetryResult {
                outcome: AttemptOutcome::Fatal(format!(
                    "gave up after {} attempts: {}",
                    attempt_number, reason
                )),
                attempts,
            };
        };

        tracing::warn!(
            "Download attempt {} failed for {}: {}. Retrying in {:?}",
            attempt_number,
            item.file_name,
            reason,
            delay
        );
        progress.message(&format!(
            "Retrying {} in {}s...",
            item.file_name,
            delay.as_secs_f64().round()
        ));

        tokio::select! {
            _ = cancellation_token.cancelled() => {
                return RetryResult {
                    outcome: AttemptOutcome::Cancelled,
                    attempts,
                };
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
