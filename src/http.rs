// src/http.rs

use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::config::UpdateConfig;
use crate::downloader::DownloadError;
use crate::error::UpdateResult;

/// Linear retry policy for simple request/response calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay: Duration::from_millis(1000) }
    }
}

impl RetryPolicy {
    /// Delays before each retry: `attempt * base_delay`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let base = self.base_delay;
        (1..=self.max_retries).map(move |attempt| base * attempt)
    }
}

/// Whether a failed request is worth repeating.
pub fn is_transient(err: &DownloadError) -> bool {
    match err {
        DownloadError::Network(e) => e.is_connect() || e.is_timeout() || e.is_request() || e.is_body(),
        DownloadError::Status(status) => {
            status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
        }
        _ => false,
    }
}

/// Thin wrapper over a shared `reqwest::Client` with the engine's retry policy.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    retry: RetryPolicy,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(client: Client, retry: RetryPolicy, timeout: Duration) -> Self {
        Self { client, retry, timeout }
    }

    pub fn from_config(config: &UpdateConfig) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.request_timeout())
            .build()?;
        Ok(Self::new(
            client,
            RetryPolicy { max_retries: config.max_retries, base_delay: config.retry_base_delay() },
            config.request_timeout(),
        ))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// GET `url` as text, retrying transient failures with linearly increasing delay.
    pub async fn get_string(&self, url: &str) -> Result<String, DownloadError> {
        RetryIf::start(
            self.retry.delays(),
            || async move {
                let result = self.get_string_once(url).await;
                if let Err(e) = &result {
                    debug!(url, error = %e, "request failed");
                }
                result
            },
            |e: &DownloadError| {
                let retry = is_transient(e);
                if retry {
                    warn!(url, error = %e, "transient failure, retrying");
                }
                retry
            },
        )
        .await
    }

    async fn get_string_once(&self, url: &str) -> Result<String, DownloadError> {
        let resp = self.client.get(url).timeout(self.timeout).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status));
        }
        Ok(resp.text().await?)
    }

    /// GET `url` and decode it as JSON.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> UpdateResult<T> {
        let body = self.get_string(url).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Remote size of `url`, or `None` when the server will not tell.
    ///
    /// Tries a HEAD request first, then a `bytes=0-0` probe read from `Content-Range`.
    pub async fn get_file_size(&self, url: &str) -> Option<u64> {
        match self.client.head(url).timeout(self.timeout).send().await {
            Ok(resp) if resp.status().is_success() => {
                let size = resp
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .filter(|len| *len > 0);
                if size.is_some() {
                    return size;
                }
            }
            Ok(resp) => debug!(url, status = %resp.status(), "HEAD not answered"),
            Err(e) => debug!(url, error = %e, "HEAD request failed"),
        }

        let probe = self
            .client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .timeout(self.timeout)
            .send()
            .await;
        match probe {
            Ok(resp) => {
                let size = resp
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_total);
                if size.is_none() {
                    debug!(url, status = %resp.status(), "size unknown");
                }
                size
            }
            Err(e) => {
                debug!(url, error = %e, "range probe failed");
                None
            }
        }
    }

    /// Digest published next to `url` as `<url>.sha256`, lower-cased.
    pub async fn get_file_hash(&self, url: &str) -> Option<String> {
        let sidecar = format!("{url}.sha256");
        match self.get_string(&sidecar).await {
            Ok(content) => crate::integrity::parse_digest_sidecar(&content),
            Err(e) => {
                debug!(url = %sidecar, error = %e, "no digest sidecar");
                None
            }
        }
    }
}

/// Total length from a `Content-Range: bytes a-b/total` header value.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    value
        .rsplit_once('/')
        .and_then(|(_, total)| total.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn client() -> HttpClient {
        HttpClient::new(
            Client::new(),
            RetryPolicy { max_retries: 3, base_delay: Duration::from_millis(5) },
            Duration::from_secs(5),
        )
    }

    #[test]
    fn delays_grow_linearly() {
        let policy = RetryPolicy { max_retries: 3, base_delay: Duration::from_millis(1000) };
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(3000)
            ]
        );
    }

    #[test]
    fn content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/1234"), Some(1234));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn client_errors_are_not_transient() {
        assert!(!is_transient(&DownloadError::Status(StatusCode::NOT_FOUND)));
        assert!(is_transient(&DownloadError::Status(StatusCode::SERVICE_UNAVAILABLE)));
        assert!(is_transient(&DownloadError::Status(StatusCode::TOO_MANY_REQUESTS)));
    }

    #[tokio::test]
    async fn retries_server_errors_then_gives_up() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(503)
            .expect(4)
            .create_async()
            .await;

        let err = client()
            .get_string(&format!("{}/flaky", server.url()))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Status(StatusCode::SERVICE_UNAVAILABLE)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn does_not_retry_not_found() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        assert!(client()
            .get_string(&format!("{}/missing", server.url()))
            .await
            .is_err());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn size_falls_back_to_range_probe() {
        let mut server = Server::new_async().await;
        server
            .mock("HEAD", "/pkg")
            .with_status(405)
            .create_async()
            .await;
        server
            .mock("GET", "/pkg")
            .match_header("range", "bytes=0-0")
            .with_status(206)
            .with_header("content-range", "bytes 0-0/4096")
            .with_body("x")
            .create_async()
            .await;

        let size = client().get_file_size(&format!("{}/pkg", server.url())).await;
        assert_eq!(size, Some(4096));
    }

    #[tokio::test]
    async fn size_unknown_when_server_is_silent() {
        let server = Server::new_async().await;
        let size = client().get_file_size(&format!("{}/nothing", server.url())).await;
        assert_eq!(size, None);
    }

    #[tokio::test]
    async fn reads_sha256_sidecar() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/App_1.1.0.msix.sha256")
            .with_body("ABCDEF0123  App_1.1.0.msix\n")
            .create_async()
            .await;

        let http = client();
        let hash = http
            .get_file_hash(&format!("{}/App_1.1.0.msix", server.url()))
            .await;
        assert_eq!(hash.as_deref(), Some("abcdef0123"));
        assert_eq!(http.get_file_hash(&format!("{}/other", server.url())).await, None);
    }
}
