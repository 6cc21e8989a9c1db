use std::{
    collections::VecDeque,
    path::Path,
    time::{Duration, Instant},
};

use futures_util::StreamExt;
use reqwest::{header, StatusCode};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
};
use tokio_util::sync::CancellationToken;

use acq_download_interface::DownloadProgress;

use crate::{get_content_length_from_headers, Error, Transport};

const RATE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamRequest {
    /// Bytes already present in the destination; the transfer appends after them.
    pub resume_offset: u64,
    /// Absolute inclusive byte range of the remote file, for part transfers.
    pub part: Option<(u64, u64)>,
    /// Length the destination must have once complete, if known up front.
    pub expected_len: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed { bytes_written: u64 },
    /// The destination already held every byte (416 on resume, or a finished part).
    AlreadyComplete,
}

/// Transfer rate over a trailing window of samples.
#[derive(Debug)]
pub(crate) struct RateWindow {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl RateWindow {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub(crate) fn record(&mut self, at: Instant, total_bytes: u64) {
        self.samples.push_back((at, total_bytes));
        while self.samples.len() > 1 {
            match self.samples.front() {
                Some((t, _)) if at.duration_since(*t) > self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    pub(crate) fn bytes_per_sec(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some((t0, b0)), Some((t1, b1))) => {
                let elapsed = t1.duration_since(*t0).as_secs_f64();
                if elapsed > 0.0 {
                    b1.saturating_sub(*b0) as f64 / elapsed
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }
}

async fn flush_buffer(file: &mut File, buffer: &mut Vec<u8>) -> Result<(), Error> {
    if !buffer.is_empty() {
        file.write_all(buffer).await?;
        buffer.clear();
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

fn total_from_content_range(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .and_then(|total| total.trim().parse::<u64>().ok())
}

impl Transport {
    /// Streams one response body into `dest`.
    ///
    /// With a non-zero `resume_offset` the file is opened in append mode and a
    /// `Range` request is sent; otherwise it is truncated. A 416 answer to a
    /// resume means the file is already complete. When the final length is
    /// known it is verified after the stream ends.
    pub async fn download<F: Fn(DownloadProgress)>(
        &self,
        url: impl reqwest::IntoUrl,
        dest: impl AsRef<Path>,
        request: StreamRequest,
        progress_callback: F,
        cancellation_token: &CancellationToken,
    ) -> Result<StreamOutcome, Error> {
        let url = url.into_url()?;
        let dest = dest.as_ref();

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut offset = request.resume_offset;
        if let Some(expected) = request.expected_len {
            if offset > expected {
                tracing::warn!(
                    "Partial file {:?} is larger than expected ({} > {}), starting fresh",
                    dest,
                    offset,
                    expected
                );
                offset = 0;
            } else if offset == expected && request.part.is_some() {
                progress_callback(DownloadProgress::Finished);
                return Ok(StreamOutcome::AlreadyComplete);
            }
        }

        let range = match request.part {
            Some((start, end)) => {
                if start > end {
                    return Err(Error::InvalidRange(format!("{}-{}", start, end)));
                }
                Some((start + offset, Some(end)))
            }
            None if offset > 0 => Some((offset, None)),
            None => None,
        };

        let response = tokio::select! {
            _ = cancellation_token.cancelled() => return Err(Error::Cancelled),
            response = self.request_with_range(url.clone(), range) => response?,
        };
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            tracing::info!("File already downloaded: {:?}", dest);
            progress_callback(DownloadProgress::Finished);
            return Ok(StreamOutcome::AlreadyComplete);
        }

        if !status.is_success() {
            return Err(Error::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        if request.part.is_some() && status != StatusCode::PARTIAL_CONTENT {
            return Err(Error::RangeIgnored {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            tracing::info!("Server doesn't support resume, starting fresh download");
            offset = 0;
        }

        let expected_len = request.expected_len.or_else(|| {
            if request.part.is_some() {
                return None;
            }
            if status == StatusCode::PARTIAL_CONTENT {
                total_from_content_range(&response)
            } else {
                get_content_length_from_headers(&response)
            }
        });

        let mut file = if offset > 0 {
            OpenOptions::new().append(true).open(dest).await?
        } else {
            File::create(dest).await?
        };

        let options = self.options();
        let chunk_size = options.adaptive_chunk_size(expected_len);
        let mut write_buffer = Vec::with_capacity(chunk_size);
        let mut written: u64 = 0;
        let mut rate = RateWindow::new(RATE_WINDOW);
        let mut last_emit = Instant::now();
        rate.record(last_emit, 0);

        let mut stream = response.bytes_stream();

        progress_callback(DownloadProgress::Started);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    flush_buffer(&mut file, &mut write_buffer).await?;
                    tracing::info!("Download cancelled, partial file saved at: {:?}", dest);
                    return Err(Error::Cancelled);
                }
                next = tokio::time::timeout(options.read_timeout, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    flush_buffer(&mut file, &mut write_buffer).await?;
                    return Err(Error::Timeout(options.read_timeout));
                }
                Ok(Some(Ok(chunk))) => {
                    write_buffer.extend_from_slice(&chunk);
                    if write_buffer.len() >= chunk_size {
                        file.write_all(&write_buffer).await?;
                        write_buffer.clear();
                    }

                    written += chunk.len() as u64;

                    let now = Instant::now();
                    rate.record(now, written);
                    if now.duration_since(last_emit) >= options.progress_interval {
                        progress_callback(DownloadProgress::Progress {
                            downloaded: offset + written,
                            total: expected_len,
                            bytes_per_sec: rate.bytes_per_sec(),
                        });
                        last_emit = now;
                    }
                }
                Ok(Some(Err(e))) => {
                    flush_buffer(&mut file, &mut write_buffer).await?;
                    return Err(e.into());
                }
                Ok(None) => break,
            }
        }

        flush_buffer(&mut file, &mut write_buffer).await?;

        let actual = offset + written;
        if let Some(expected) = expected_len {
            if actual != expected {
                return Err(Error::SizeMismatch {
                    expected,
                    actual,
                });
            }
        }

        progress_callback(DownloadProgress::Finished);

        Ok(StreamOutcome::Completed {
            bytes_written: written,
        })
    }
}
