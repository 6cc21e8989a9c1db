use std::{future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures_util::FutureExt;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome<R> {
    Finished(R),
    /// The job panicked; siblings kept running.
    Panicked(String),
    /// Cancellation arrived before a slot was free.
    NotStarted,
}

/// Runs `job` for every item with at most `limit` in flight.
///
/// Results arrive in completion order. A panicking job is reported as
/// [`JobOutcome::Panicked`] without disturbing the others.
pub async fn run_bounded<T, R, F, Fut>(
    items: Vec<T>,
    limit: usize,
    cancellation_token: &CancellationToken,
    job: F,
) -> Vec<(T, JobOutcome<R>)>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = JoinSet::new();
    let mut results = Vec::with_capacity(items.len());

    for item in items {
        let permit = tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => None,
            permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
        };

        let Some(permit) = permit else {
            results.push((item, JobOutcome::NotStarted));
            continue;
        };

        let future = job(item.clone());
        tasks.spawn(async move {
            let outcome = AssertUnwindSafe(future).catch_unwind().await;
            drop(permit);

            match outcome {
                Ok(result) => (item, JobOutcome::Finished(result)),
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!("job_panicked: {}", message);
                    (item, JobOutcome::Panicked(message))
                }
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => tracing::error!("job_join_failed: {}", e),
        }
    }

    results
}
