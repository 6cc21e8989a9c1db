use reqwest::{header, StatusCode};

use crate::{get_content_length_from_headers, Error, ProbeResult, TransferOptions};

/// HTTP transport shared by every transfer of one setup run.
#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
    options: TransferOptions,
}

impl Transport {
    pub fn new(options: TransferOptions) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .user_agent(options.user_agent.clone())
            .build()?;

        Ok(Self { client, options })
    }

    pub fn with_client(client: reqwest::Client, options: TransferOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Makes a GET request with an optional `Range: bytes=start-[end]` header.
    pub async fn request_with_range(
        &self,
        url: impl reqwest::IntoUrl,
        range: Option<(u64, Option<u64>)>,
    ) -> Result<reqwest::Response, Error> {
        let url = url.into_url()?;

        let mut request = self.client.get(url);
        if let Some((start, end)) = range {
            let value = match end {
                Some(end) => format!("bytes={}-{}", start, end),
                None => format!("bytes={}-", start),
            };
            request = request.header(header::RANGE, value);
        }

        Ok(request.send().await?)
    }

    /// Metadata-only probe. Never fails: any error degrades to an unknown
    /// size without range support, which forces a best-effort single stream.
    pub async fn probe(&self, url: impl reqwest::IntoUrl) -> ProbeResult {
        match self.try_probe(url).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("probe_failed: {}", e);
                ProbeResult::default()
            }
        }
    }

    async fn try_probe(&self, url: impl reqwest::IntoUrl) -> Result<ProbeResult, Error> {
        let url = url.into_url()?;
        let response = self
            .client
            .head(url.clone())
            .timeout(self.options.probe_timeout)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(Error::UnexpectedStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let total_size = get_content_length_from_headers(&response).filter(|size| *size > 0);
        let supports_range = response
            .headers()
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        tracing::debug!(
            "probe: {} size={:?} ranges={}",
            url,
            total_size,
            supports_range
        );

        Ok(ProbeResult {
            total_size,
            supports_range,
        })
    }
}
