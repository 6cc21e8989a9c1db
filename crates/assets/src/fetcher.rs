use std::time::Duration;

use acq_assets_config::DownloadConfig;
use acq_file::{TransferOptions, Transport};
use tokio_util::sync::CancellationToken;

use crate::{
    classify, AcceleratorChain, AcceleratorOutcome, AssetItem, AttemptOutcome, Error, ItemProgress,
};

/// One transfer attempt for one item.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        item: &AssetItem,
        progress: &ItemProgress,
        cancellation_token: &CancellationToken,
    ) -> AttemptOutcome;
}

pub fn transfer_options(download: &DownloadConfig) -> TransferOptions {
    TransferOptions {
        connect_timeout: Duration::from_secs(download.connect_timeout),
        read_timeout: Duration::from_secs(download.download_timeout),
        probe_timeout: Duration::from_secs(download.probe_timeout),
        chunk_size: download.chunk_size.max(1),
        max_chunk_size: download.max_chunk_size.max(1),
        max_connections_per_file: download.max_connections_per_file.max(1),
        large_file_threshold: download.large_file_threshold,
        min_part_size: download.min_part_size.max(1),
        use_multipart: download.use_multipart_download,
        progress_interval: Duration::from_millis(download.progress_interval_ms),
        ..Default::default()
    }
}

/// External accelerator first, then the internal transport.
pub struct HttpFetcher {
    transport: Transport,
    accelerators: AcceleratorChain,
}

impl HttpFetcher {
    pub fn new(transport: Transport, accelerators: AcceleratorChain) -> Self {
        Self {
            transport,
            accelerators,
        }
    }

    pub fn from_config(download: &DownloadConfig) -> Result<Self, Error> {
        let options = transfer_options(download);
        let progress_interval = options.progress_interval;
        let transport = Transport::new(options)?;
        let accelerators = if download.use_external_accelerators {
            AcceleratorChain::discover()
        } else {
            AcceleratorChain::disabled()
        }
        .with_progress_interval(progress_interval);

        Ok(Self::new(transport, accelerators))
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        item: &AssetItem,
        progress: &ItemProgress,
        cancellation_token: &CancellationToken,
    ) -> AttemptOutcome {
        let Some(url) = item.url.as_deref() else {
            return AttemptOutcome::Fatal(format!("no base URL configured for {}", item.category));
        };
        let what = item.file_name.as_str();

        if self.accelerators.has_available_tool() {
            let expected_len = tokio::select! {
                _ = cancellation_token.cancelled() => return AttemptOutcome::Cancelled,
                probe = self.transport.probe(url) => probe.total_size,
            };

            match self
                .accelerators
                .try_external(
                    url,
                    &item.path,
                    what,
                    expected_len,
                    progress,
                    cancellation_token,
                )
                .await
            {
                AcceleratorOutcome::Completed => return AttemptOutcome::Success,
                AcceleratorOutcome::Cancelled => return AttemptOutcome::Cancelled,
                AcceleratorOutcome::Unavailable => {}
            }
        }

        tracing::info!("Using internal downloader for {}", url);

        match self
            .transport
            .download_file(
                url,
                &item.path,
                |p| progress.transfer(what, &p),
                cancellation_token,
            )
            .await
        {
            Ok(_) => AttemptOutcome::Success,
            Err(e) => {
                let outcome = classify(&e);
                tracing::warn!("attempt_failed: {} {:?}", item.id(), outcome);
                outcome
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        accelerator::test_support::FakeAccelerator, download_with_retry,
        progress::test_support::RecordingSink, AssetCategory, DiskState, ProgressAggregator,
        RetryPolicy,
    };
    use std::sync::{atomic::AtomicUsize, Arc};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn item(dir: &std::path::Path, url: Option<String>) -> AssetItem {
        AssetItem {
            category: AssetCategory::Voice,
            file_name: "alloy.wav".into(),
            path: dir.join("voices").join("alloy.wav"),
            url,
            source_model: None,
            state: DiskState::Missing,
        }
    }

    fn progress(sink: Arc<RecordingSink>) -> ItemProgress {
        Arc::new(ProgressAggregator::new(2.0, sink)).item("voices/alloy.wav", 2.0)
    }

    fn internal_only() -> HttpFetcher {
        HttpFetcher::new(
            Transport::new(TransferOptions::default()).unwrap(),
            AcceleratorChain::disabled(),
        )
    }

    #[test]
    fn test_transfer_options_from_config() {
        let options = transfer_options(&DownloadConfig::default());
        assert_eq!(options.read_timeout, Duration::from_secs(120));
        assert_eq!(options.max_connections_per_file, 3);
        assert_eq!(options.progress_interval, Duration::from_secs(1));
        assert!(options.use_multipart);
    }

    #[tokio::test]
    async fn test_internal_download() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/voices/alloy.wav"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"RIFF-voice"))
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let item = item(
            dir.path(),
            Some(format!("{}/voices/alloy.wav", mock_server.uri())),
        );
        let sink = Arc::new(RecordingSink::default());

        let outcome = internal_only()
            .fetch(&item, &progress(sink.clone()), &CancellationToken::new())
            .await;

        assert_eq!(outcome, AttemptOutcome::Success);
        assert_eq!(std::fs::read(&item.path).unwrap(), b"RIFF-voice");
        assert!(sink
            .events()
            .iter()
            .any(|(m, _)| m == "PROGRESS: Downloaded alloy.wav"));
    }

    #[tokio::test]
    async fn test_accelerator_is_tried_first() {
        // Nothing mounted: the size lookup fails and the tool output is taken as is.
        let mock_server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let item = item(
            dir.path(),
            Some(format!("{}/voices/alloy.wav", mock_server.uri())),
        );
        let fetcher = HttpFetcher::new(
            Transport::new(TransferOptions::default()).unwrap(),
            AcceleratorChain::new(vec![Box::new(FakeAccelerator {
                body: Some(b"from-tool".to_vec()),
                calls: AtomicUsize::new(0),
            })]),
        );

        let outcome = fetcher
            .fetch(
                &item,
                &progress(Arc::new(RecordingSink::default())),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome, AttemptOutcome::Success);
        assert_eq!(std::fs::read(&item.path).unwrap(), b"from-tool");
    }

    #[tokio::test]
    async fn test_short_accelerator_output_falls_back_to_internal() {
        let body = b"RIFF-voice-full".to_vec();
        let mock_server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/voices/alloy.wav"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .expect(1..)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/voices/alloy.wav"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let item = item(
            dir.path(),
            Some(format!("{}/voices/alloy.wav", mock_server.uri())),
        );
        let fetcher = HttpFetcher::new(
            Transport::new(TransferOptions::default()).unwrap(),
            AcceleratorChain::new(vec![Box::new(FakeAccelerator {
                body: Some(b"RIFF".to_vec()),
                calls: AtomicUsize::new(0),
            })]),
        );

        let outcome = fetcher
            .fetch(
                &item,
                &progress(Arc::new(RecordingSink::default())),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome, AttemptOutcome::Success);
        assert_eq!(std::fs::read(&item.path).unwrap(), body);
        assert!(!acq_file::tmp_path(&item.path).exists());
    }

    #[tokio::test]
    async fn test_missing_url_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = internal_only()
            .fetch(
                &item(dir.path(), None),
                &progress(Arc::new(RecordingSink::default())),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(outcome, AttemptOutcome::Fatal(_)));
    }

    #[tokio::test]
    async fn test_always_503_is_attempted_max_retries_plus_one() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(4)
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let item = item(
            dir.path(),
            Some(format!("{}/voices/alloy.wav", mock_server.uri())),
        );
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
        };

        let result = download_with_retry(
            &internal_only(),
            &item,
            &policy,
            &progress(Arc::new(RecordingSink::default())),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result.outcome, AttemptOutcome::Fatal(_)));
        assert_eq!(result.attempts.len(), 4);
        assert!(!item.path.exists());
        mock_server.verify().await;
    }
}
