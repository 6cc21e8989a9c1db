mod multipart;
mod options;
mod plan;
mod stream;
mod transport;
mod types;

#[cfg(test)]
mod test_support;

pub use options::*;
pub use plan::*;
pub use stream::*;
pub use transport::*;
pub use types::*;

use {
    acq_download_interface::DownloadProgress,
    std::{
        ffi::OsString,
        io::SeekFrom,
        path::{Path, PathBuf},
    },
    tokio::io::{AsyncReadExt, AsyncSeekExt},
    tokio_util::sync::CancellationToken,
};

/// `<file>.tmp`, the sibling a single-stream transfer writes into.
pub fn tmp_path(dest: impl AsRef<Path>) -> PathBuf {
    with_suffix(dest.as_ref(), ".tmp")
}

/// `<file>.tmp.part<N>`, the sibling holding one byte range of a multi-part transfer.
pub fn part_path(dest: impl AsRef<Path>, index: u64) -> PathBuf {
    with_suffix(dest.as_ref(), &format!(".tmp.part{}", index))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn file_size(path: impl AsRef<Path>) -> Result<u64, Error> {
    let metadata = std::fs::metadata(path.as_ref())?;
    Ok(metadata.len())
}

/// Length of a partial file that is safe to resume from.
///
/// The tail of the file must be readable; otherwise the partial is deleted
/// and the transfer starts over.
pub async fn resume_offset(partial: impl AsRef<Path>) -> Result<u64, Error> {
    let partial = partial.as_ref();

    let size = match tokio::fs::metadata(partial).await {
        Ok(metadata) => metadata.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    if size == 0 {
        return Ok(0);
    }

    if validate_partial_file(partial, size).await {
        Ok(size)
    } else {
        tracing::warn!("Partial file {:?} appears corrupted, starting fresh", partial);
        tokio::fs::remove_file(partial).await?;
        Ok(0)
    }
}

async fn validate_partial_file(path: &Path, size: u64) -> bool {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return false;
    };

    let test_size = size.min(512);
    if file
        .seek(SeekFrom::Start(size - test_size))
        .await
        .is_err()
    {
        return false;
    }

    let mut buffer = vec![0u8; test_size as usize];
    file.read_exact(&mut buffer).await.is_ok()
}

/// Removes `<file>.tmp.part<N>` siblings with `N >= keep`.
pub async fn clear_stale_parts(dest: impl AsRef<Path>, keep: u64) -> Result<(), Error> {
    let dest = dest.as_ref();
    let (Some(parent), Some(name)) = (dest.parent(), dest.file_name()) else {
        return Ok(());
    };
    let prefix = format!("{}.tmp.part", name.to_string_lossy());

    let mut entries = match tokio::fs::read_dir(parent).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let Some(index) = file_name.strip_prefix(&prefix) else {
            continue;
        };

        let stale = index.parse::<u64>().map_or(true, |i| i >= keep);
        if stale {
            tracing::debug!("Removing stale part file {:?}", entry.path());
            tokio::fs::remove_file(entry.path()).await?;
        }
    }

    Ok(())
}

impl Transport {
    /// Downloads `url` to `dest` through `<dest>.tmp`.
    ///
    /// Probes the source, picks single-stream or multi-part, and renames onto
    /// `dest` only once the byte count is verified. A leftover `.tmp` is
    /// resumed; a size mismatch discards it so the next attempt starts fresh.
    pub async fn download_file<F: Fn(DownloadProgress) + Send + Sync>(
        &self,
        url: impl reqwest::IntoUrl,
        dest: impl AsRef<Path>,
        progress_callback: F,
        cancellation_token: &CancellationToken,
    ) -> Result<TransferPlan, Error> {
        let url = url.into_url()?;
        let dest = dest.as_ref();
        let tmp = tmp_path(dest);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut offset = resume_offset(&tmp).await?;
        let probe = tokio::select! {
            _ = cancellation_token.cancelled() => return Err(Error::Cancelled),
            probe = self.probe(url.clone()) => probe,
        };
        let plan = TransferPlan::decide(probe, offset, self.options());

        tracing::info!(
            "transfer_plan: {:?} strategy={:?} size={:?} resume_from={}",
            dest,
            plan.strategy,
            plan.total_size,
            offset
        );

        match plan.strategy {
            Strategy::MultiPart { part_count, .. } => {
                let total = plan
                    .total_size
                    .ok_or_else(|| Error::InvalidRange("multi-part without a known size".into()))?;
                self.download_multipart(
                    url,
                    dest,
                    total,
                    part_count,
                    progress_callback,
                    cancellation_token,
                )
                .await?;
            }
            Strategy::SingleStream => {
                if let Some(total) = plan.total_size {
                    if offset > total {
                        tracing::warn!("Partial file {:?} exceeds remote size, restarting", tmp);
                        tokio::fs::remove_file(&tmp).await?;
                        offset = 0;
                    }
                }

                let request = StreamRequest {
                    resume_offset: offset,
                    part: None,
                    expected_len: plan.total_size,
                };

                match self
                    .download(url, &tmp, request, progress_callback, cancellation_token)
                    .await
                {
                    Ok(_) => {}
                    Err(e @ Error::SizeMismatch { .. }) => {
                        tokio::fs::remove_file(&tmp).await.ok();
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }

                tokio::fs::rename(&tmp, dest).await?;
                clear_stale_parts(dest, 0).await?;
            }
        }

        Ok(plan)
    }
}

/// Manually parse content-length header from HTTP response
/// This is a workaround for cases where reqwest's content_length() method returns incorrect values
pub(crate) fn get_content_length_from_headers(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .or_else(|| response.content_length())
}
