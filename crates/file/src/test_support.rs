use wiremock::{matchers::path, Mock, MockServer, Request, Respond, ResponseTemplate};

const ASSET_PATH: &str = "/asset";

/// Serves one in-memory file and honours `Range` requests the way a static
/// file host does: 206 with `Content-Range`, 416 past the end.
pub(crate) struct RangeServer {
    server: MockServer,
}

struct RangeResponder {
    body: Vec<u8>,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len() as u64;
        let full = ResponseTemplate::new(200)
            .insert_header("Accept-Ranges", "bytes")
            .insert_header("Content-Length", total.to_string().as_str())
            .set_body_bytes(self.body.clone());

        if request.method.as_str() != "GET" {
            return full;
        }

        let Some(spec) = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
        else {
            return full;
        };

        let Some((start, end)) = spec.split_once('-') else {
            return ResponseTemplate::new(400);
        };
        let Ok(start) = start.parse::<u64>() else {
            return ResponseTemplate::new(400);
        };

        if start >= total {
            return ResponseTemplate::new(416)
                .insert_header("Content-Range", format!("bytes */{}", total).as_str());
        }

        let end = match end.parse::<u64>() {
            Ok(end) => end.min(total - 1),
            Err(_) => total - 1,
        };

        ResponseTemplate::new(206)
            .insert_header("Accept-Ranges", "bytes")
            .insert_header(
                "Content-Range",
                format!("bytes {}-{}/{}", start, end, total).as_str(),
            )
            .set_body_bytes(self.body[start as usize..=end as usize].to_vec())
    }
}

impl RangeServer {
    pub(crate) async fn start(body: Vec<u8>) -> Self {
        let server = MockServer::start().await;
        Mock::given(path(ASSET_PATH))
            .respond_with(RangeResponder { body })
            .mount(&server)
            .await;

        Self { server }
    }

    pub(crate) fn url(&self) -> String {
        format!("{}{}", self.server.uri(), ASSET_PATH)
    }

    /// `Range` headers of every GET received so far, in arrival order.
    pub(crate) async fn ranged_gets(&self) -> Vec<String> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.method.as_str() == "GET")
            .filter_map(|r| {
                r.headers
                    .get("range")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .collect()
    }
}
