use std::path::Path;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Response, StatusCode};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::http::HttpClient;
use crate::models::DownloadProgress;
use crate::session::TransferControl;

/// Custom errors for download operations.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected http status: {0}")]
    Status(StatusCode),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("transfer ended early: {downloaded} of {expected} bytes")]
    Incomplete { expected: u64, downloaded: u64 },
}

/// Streams a remote resource to disk, resuming from a partial file when asked.
///
/// Downloads are never retried here; a failed transfer is resumed by the caller.
#[derive(Debug, Clone)]
pub struct Downloader {
    http: HttpClient,
    progress_interval: Duration,
}

impl Downloader {
    pub fn new(http: HttpClient, progress_interval: Duration) -> Self {
        Self { http, progress_interval }
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// Download `url` into `dest`.
    ///
    /// Returns `Ok(true)` once the whole body is on disk and `Ok(false)` when the transfer
    /// was cancelled. Transport and file errors are returned as `Err`. A body shorter than the
    /// known size is [`DownloadError::Incomplete`]; the partial file is kept for resuming.
    pub async fn download_file(
        &self,
        url: &str,
        dest: &Path,
        resume: bool,
        progress: Option<&UnboundedSender<DownloadProgress>>,
        control: &TransferControl,
    ) -> Result<bool, DownloadError> {
        if reqwest::Url::parse(url).is_err() {
            return Err(DownloadError::InvalidUrl(url.to_string()));
        }
        if control.is_cancelled() {
            info!(url, "download cancelled before start");
            return Ok(false);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let existing = if resume {
            match tokio::fs::metadata(dest).await {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            }
        } else {
            0
        };

        let mut total = self.http.get_file_size(url).await;

        if existing > 0 {
            if let Some(size) = total.filter(|size| existing >= *size) {
                debug!(path = %dest.display(), size, "local file already complete");
                publish(
                    progress,
                    DownloadProgress { total_bytes: Some(size), downloaded_bytes: size, bytes_per_second: 0 },
                );
                return Ok(true);
            }
        }

        let (resp, offset) = self.open_stream(url, existing).await?;
        if total.is_none() {
            total = resp.content_length().map(|len| offset + len);
        }

        let mut file = if offset > 0 {
            OpenOptions::new().append(true).open(dest).await?
        } else {
            File::create(dest).await?
        };

        let mut stream = resp.bytes_stream();
        let mut downloaded = offset;
        let mut bytes_per_second = 0u64;
        let mut window_start = Instant::now();
        let mut window_bytes = 0u64;

        publish(
            progress,
            DownloadProgress { total_bytes: total, downloaded_bytes: downloaded, bytes_per_second },
        );

        loop {
            if control.is_paused() {
                debug!(url, "download paused");
                file.flush().await?;
                if !control.wait_while_paused().await {
                    info!(url, downloaded, "download cancelled while paused");
                    return Ok(false);
                }
                window_start = Instant::now();
                window_bytes = 0;
            }

            let next = tokio::select! {
                biased;
                _ = control.cancellation_token().cancelled() => {
                    file.flush().await?;
                    info!(url, downloaded, "download cancelled");
                    return Ok(false);
                }
                chunk = stream.next() => chunk,
            };

            let Some(chunk) = next else { break };
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(_) if control.is_cancelled() => {
                    info!(url, downloaded, "download cancelled");
                    return Ok(false);
                }
                Err(e) => {
                    file.flush().await?;
                    return Err(e.into());
                }
            };

            file.write_all(&bytes).await?;
            downloaded += bytes.len() as u64;
            window_bytes += bytes.len() as u64;

            let elapsed = window_start.elapsed();
            if elapsed >= self.progress_interval {
                bytes_per_second = (window_bytes as f64 / elapsed.as_secs_f64()) as u64;
                publish(
                    progress,
                    DownloadProgress { total_bytes: total, downloaded_bytes: downloaded, bytes_per_second },
                );
                window_start = Instant::now();
                window_bytes = 0;
            }
        }

        file.flush().await?;
        match total {
            Some(expected) if downloaded < expected => {
                warn!(url, expected, downloaded, "stream ended before the whole file arrived");
                return Err(DownloadError::Incomplete { expected, downloaded });
            }
            Some(expected) if downloaded > expected => {
                warn!(url, expected, downloaded, "stream ended past the announced length");
            }
            _ => {}
        }
        publish(
            progress,
            DownloadProgress { total_bytes: total, downloaded_bytes: downloaded, bytes_per_second },
        );
        info!(url, path = %dest.display(), downloaded, "download finished");
        Ok(true)
    }

    /// Opens the body stream, returning the response and the offset it starts at.
    async fn open_stream(&self, url: &str, existing: u64) -> Result<(Response, u64), DownloadError> {
        let client = self.http.client();
        if existing > 0 {
            let resp = client
                .get(url)
                .header(RANGE, format!("bytes={}-", existing))
                .send()
                .await?;
            if resp.status() == StatusCode::PARTIAL_CONTENT {
                debug!(url, offset = existing, "resuming with range request");
                return Ok((resp, existing));
            }
            if resp.status().is_success() {
                info!(url, status = %resp.status(), "range not honored, downloading from scratch");
                return Ok((resp, 0));
            }
            info!(url, status = %resp.status(), "range request rejected, downloading from scratch");
        }

        let resp = client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status));
        }
        Ok((resp, 0))
    }
}

fn publish(progress: Option<&UnboundedSender<DownloadProgress>>, snapshot: DownloadProgress) {
    if let Some(tx) = progress {
        let _ = tx.send(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RetryPolicy;
    use tempfile::TempDir;

    fn downloader() -> Downloader {
        let http = HttpClient::new(
            reqwest::Client::new(),
            RetryPolicy::default(),
            Duration::from_secs(5),
        );
        Downloader::new(http, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn rejects_malformed_url() {
        let dir = TempDir::new().unwrap();
        let err = downloader()
            .download_file("not a url", &dir.path().join("f"), false, None, &TransferControl::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn cancelled_before_start_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("nested").join("pkg.msix");
        let control = TransferControl::new();
        control.cancel();
        let done = downloader()
            .download_file("http://127.0.0.1:9/pkg.msix", &dest, true, None, &control)
            .await
            .unwrap();
        assert!(!done);
        assert!(!dest.exists());
    }
}
