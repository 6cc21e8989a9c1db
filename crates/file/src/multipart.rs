use std::{path::Path, sync::Mutex, time::Instant};

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use acq_download_interface::DownloadProgress;

use crate::{clear_stale_parts, split_parts, tmp_path, Error, StreamRequest, Transport};

struct PartProgress {
    parts: Vec<(u64, f64)>,
    last_emit: Option<Instant>,
}

impl PartProgress {
    fn totals(&self) -> (u64, f64) {
        self.parts
            .iter()
            .fold((0, 0.0), |(bytes, rate), (b, r)| (bytes + b, rate + r))
    }
}

impl Transport {
    /// Fetches `total_size` bytes as `part_count` concurrent ranged transfers
    /// into `<dest>.tmp.part<N>`, then reassembles them in index order into a
    /// staging file that is renamed onto `dest` once its length checks out.
    ///
    /// Every part is joined before the result is decided. Part files of a
    /// failed or cancelled run stay on disk and are resumed by the next run
    /// with the same part count.
    pub async fn download_multipart<F: Fn(DownloadProgress) + Send + Sync>(
        &self,
        url: impl reqwest::IntoUrl,
        dest: impl AsRef<Path>,
        total_size: u64,
        part_count: u64,
        progress_callback: F,
        cancellation_token: &CancellationToken,
    ) -> Result<(), Error> {
        let url = url.into_url()?;
        let dest = dest.as_ref();

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let parts = split_parts(total_size, part_count, dest)?;
        clear_stale_parts(dest, part_count).await?;

        let mut initial = Vec::with_capacity(parts.len());
        for part in &parts {
            let existing = match tokio::fs::metadata(&part.temp_part_path).await {
                Ok(metadata) if metadata.len() <= part.size() => metadata.len(),
                Ok(_) => {
                    tracing::warn!("Oversized part file {:?}, restarting it", part.temp_part_path);
                    tokio::fs::remove_file(&part.temp_part_path).await?;
                    0
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            };
            initial.push(existing);
        }

        let progress = Mutex::new(PartProgress {
            parts: initial.iter().map(|b| (*b, 0.0)).collect(),
            last_emit: None,
        });
        let interval = self.options().progress_interval;

        progress_callback(DownloadProgress::Started);

        let report = |index: usize, downloaded: u64, bytes_per_sec: f64| {
            let Ok(mut state) = progress.lock() else {
                return;
            };
            state.parts[index] = (downloaded, bytes_per_sec);

            let now = Instant::now();
            let due = state
                .last_emit
                .map_or(true, |last| now.duration_since(last) >= interval);
            if due {
                state.last_emit = Some(now);
                let (downloaded, bytes_per_sec) = state.totals();
                progress_callback(DownloadProgress::Progress {
                    downloaded,
                    total: Some(total_size),
                    bytes_per_sec,
                });
            }
        };

        let transfers = parts.iter().zip(initial.iter()).map(|(part, existing)| {
            let url = url.clone();
            let index = part.index as usize;
            let part_size = part.size();
            let report = &report;

            async move {
                let result = self
                    .download(
                        url,
                        &part.temp_part_path,
                        StreamRequest {
                            resume_offset: *existing,
                            part: Some((part.start_byte, part.end_byte)),
                            expected_len: Some(part_size),
                        },
                        |p| match p {
                            DownloadProgress::Progress {
                                downloaded,
                                bytes_per_sec,
                                ..
                            } => report(index, downloaded, bytes_per_sec),
                            DownloadProgress::Finished => report(index, part_size, 0.0),
                            DownloadProgress::Started => {}
                        },
                        cancellation_token,
                    )
                    .await;

                if let Err(e) = &result {
                    tracing::warn!("part_failed: index={} {}", index, e);
                }
                result
            }
        });

        let results = futures_util::future::join_all(transfers).await;

        if results.iter().any(|r| matches!(r, Err(Error::Cancelled))) {
            return Err(Error::Cancelled);
        }
        if let Some(e) = results.into_iter().find_map(Result::err) {
            return Err(e);
        }

        let staging = tmp_path(dest);
        let assembled = assemble(&parts, &staging).await?;

        if assembled != total_size {
            tracing::warn!(
                "reassembly_mismatch: {:?} expected={} actual={}",
                dest,
                total_size,
                assembled
            );
            for part in &parts {
                remove_if_exists(&part.temp_part_path).await?;
            }
            remove_if_exists(&staging).await?;
            return Err(Error::SizeMismatch {
                expected: total_size,
                actual: assembled,
            });
        }

        for part in &parts {
            remove_if_exists(&part.temp_part_path).await?;
        }
        tokio::fs::rename(&staging, dest).await?;

        progress_callback(DownloadProgress::Finished);

        Ok(())
    }
}

async fn assemble(parts: &[crate::PartJob], staging: &Path) -> Result<u64, Error> {
    let mut output = tokio::fs::File::create(staging).await?;
    let mut written = 0;

    for part in parts {
        let mut input = tokio::fs::File::open(&part.temp_part_path).await?;
        written += tokio::io::copy(&mut input, &mut output).await?;
    }

    output.flush().await?;
    output.sync_all().await?;

    Ok(written)
}

async fn remove_if_exists(path: &Path) -> Result<(), Error> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{part_path, test_support::RangeServer, TransferOptions};
    use std::time::Duration;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn test_reassembly_matches_source() {
        let body = content(100_003);
        let server = RangeServer::start(body.clone()).await;
        let transport = Transport::new(TransferOptions::default()).unwrap();

        for parts in [1u64, 2, 3, 8] {
            let dir = tempfile::tempdir().unwrap();
            let dest = dir.path().join("model.imx");

            transport
                .download_multipart(
                    server.url(),
                    &dest,
                    body.len() as u64,
                    parts,
                    |_| {},
                    &CancellationToken::new(),
                )
                .await
                .unwrap();

            assert_eq!(std::fs::read(&dest).unwrap(), body, "parts={}", parts);
            for index in 0..parts {
                assert!(!part_path(&dest, index).exists());
            }
            assert!(!tmp_path(&dest).exists());
        }
    }

    #[tokio::test]
    async fn test_parts_resume_from_their_own_length() {
        let body = content(30_000);
        let server = RangeServer::start(body.clone()).await;
        let transport = Transport::new(TransferOptions::default()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.imx");

        // Part 0 finished, part 1 half done, part 2 not started.
        std::fs::write(part_path(&dest, 0), &body[..10_000]).unwrap();
        std::fs::write(part_path(&dest, 1), &body[10_000..15_000]).unwrap();
        // Left over from an earlier run with more parts.
        std::fs::write(part_path(&dest, 5), b"stale").unwrap();

        transport
            .download_multipart(
                server.url(),
                &dest,
                body.len() as u64,
                3,
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(!part_path(&dest, 5).exists());
    }

    #[tokio::test]
    async fn test_cancelled_parts_survive_and_resume() {
        let body = content(3 * 1024 * 1024);
        let server = RangeServer::start(body.clone()).await;
        let transport = Transport::new(TransferOptions {
            progress_interval: Duration::ZERO,
            ..Default::default()
        })
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.imx");

        let token = CancellationToken::new();
        let cancel = token.clone();
        let err = transport
            .download_multipart(
                server.url(),
                &dest,
                body.len() as u64,
                3,
                move |p| {
                    if matches!(p, DownloadProgress::Progress { .. }) {
                        cancel.cancel();
                    }
                },
                &token,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(!dest.exists());
        let kept: Vec<u64> = (0..3)
            .filter_map(|index| std::fs::metadata(part_path(&dest, index)).ok())
            .map(|m| m.len())
            .collect();
        assert!(kept.iter().any(|len| *len > 0), "kept={:?}", kept);

        transport
            .download_multipart(
                server.url(),
                &dest,
                body.len() as u64,
                3,
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), body);
        for index in 0..3 {
            assert!(!part_path(&dest, index).exists());
        }
        assert!(!tmp_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_failed_part_fails_whole_file() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let transport = Transport::new(TransferOptions::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.imx");

        let err = transport
            .download_multipart(
                format!("{}/model.imx", mock_server.uri()),
                &dest,
                1000,
                2,
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnexpectedStatus { status: 500, .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_progress_covers_total() {
        let body = content(40_000);
        let server = RangeServer::start(body.clone()).await;
        let transport = Transport::new(TransferOptions {
            progress_interval: Duration::ZERO,
            ..Default::default()
        })
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let events = std::sync::Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();

        transport
            .download_multipart(
                server.url(),
                dir.path().join("voice.wav"),
                body.len() as u64,
                4,
                move |p| events_clone.lock().unwrap().push(p),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.last(), Some(&DownloadProgress::Finished));
        let max_downloaded = events
            .iter()
            .filter_map(|p| match p {
                DownloadProgress::Progress { downloaded, .. } => Some(*downloaded),
                _ => None,
            })
            .max()
            .unwrap();
        assert_eq!(max_downloaded, body.len() as u64);
    }
}
