use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::{
    download_with_retry, AssetItem, AttemptOutcome, Fetcher, ItemProgress, RetryPolicy,
    RetryResult, TransferAttempt,
};

/// Produces a JPEG preview for a model file.
#[async_trait::async_trait]
pub trait ThumbnailGenerator: Send + Sync {
    /// Path of a temporary JPEG, or `None` if generation failed.
    async fn generate_thumbnail(&self, model_path: &Path) -> Option<PathBuf>;
}

/// Copies `generated` to `dest` through a staging file and removes the original.
async fn place_thumbnail(generated: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let staging = acq_file::tmp_path(dest);
    tokio::fs::copy(generated, &staging).await?;
    tokio::fs::rename(&staging, dest).await?;

    if let Err(e) = tokio::fs::remove_file(generated).await {
        tracing::debug!("Could not remove temporary thumbnail {:?}: {}", generated, e);
    }
    Ok(())
}

/// Generates the thumbnail for `item`, falling back to a download when an
/// image URL is configured.
pub(crate) async fn produce_thumbnail(
    generator: Option<&dyn ThumbnailGenerator>,
    fetcher: &dyn Fetcher,
    policy: &RetryPolicy,
    item: &AssetItem,
    progress: &ItemProgress,
    cancellation_token: &CancellationToken,
) -> RetryResult {
    let mut attempts = Vec::new();

    let source = item.source_model.as_deref().filter(|model| model.exists());

    match (generator, source) {
        (Some(generator), Some(model)) => {
            progress.update(&format!("Generating thumbnail {}...", item.file_name), 0.1);

            let generated = tokio::select! {
                _ = cancellation_token.cancelled() => {
                    return RetryResult {
                        outcome: AttemptOutcome::Cancelled,
                        attempts,
                    };
                }
                generated = generator.generate_thumbnail(model) => generated,
            };

            let outcome = match generated {
                Some(generated) => match place_thumbnail(&generated, &item.path).await {
                    Ok(()) => {
                        tracing::info!("Saved thumbnail to {:?}", item.path);
                        AttemptOutcome::Success
                    }
                    Err(e) => AttemptOutcome::Fatal(format!("could not save thumbnail: {}", e)),
                },
                None => AttemptOutcome::Fatal(format!(
                    "thumbnail generation failed for {}",
                    model.display()
                )),
            };

            attempts.push(TransferAttempt {
                attempt_number: 1,
                outcome: outcome.clone(),
            });
            if outcome == AttemptOutcome::Success {
                return RetryResult { outcome, attempts };
            }
            tracing::warn!("thumbnail_generation_failed: {}", item.id());
        }
        (_, None) => {
            let reason = match &item.source_model {
                Some(model) => format!("source model missing: {}", model.display()),
                None => format!("no source model for {}", item.file_name),
            };
            attempts.push(TransferAttempt {
                attempt_number: 1,
                outcome: AttemptOutcome::Fatal(reason),
            });
        }
        (None, Some(_)) => {}
    }

    if item.url.is_none() {
        let outcome = attempts
            .last()
            .map(|a| a.outcome.clone())
            .unwrap_or_else(|| {
                AttemptOutcome::Fatal(format!(
                    "no thumbnail generator or image URL for {}",
                    item.file_name
                ))
            });
        return RetryResult { outcome, attempts };
    }

    let offset = attempts.len() as u32;
    let mut downloaded =
        download_with_retry(fetcher, item, policy, progress, cancellation_token).await;
    for attempt in &mut downloaded.attempts {
        attempt.attempt_number += offset;
    }
    attempts.append(&mut downloaded.attempts);

    RetryResult {
        outcome: downloaded.outcome,
        attempts,
    }
}
