use std::time::Duration;

use mockito::{Matcher, Server, ServerGuard};
use reqwest::StatusCode;
use tempfile::TempDir;
use tokio::sync::mpsc;

use update_engine::downloader::{DownloadError, Downloader};
use update_engine::http::{HttpClient, RetryPolicy};
use update_engine::models::DownloadProgress;
use update_engine::session::TransferControl;

const PATH: &str = "/download/Celerate_1.1.0.msix";

fn payload() -> Vec<u8> {
    (0..256 * 1024u32).map(|i| (i % 251) as u8).collect()
}

fn downloader() -> Downloader {
    let http = HttpClient::new(
        reqwest::Client::new(),
        RetryPolicy { max_retries: 1, base_delay: Duration::from_millis(1) },
        Duration::from_secs(10),
    );
    Downloader::new(http, Duration::from_millis(1))
}

/// Answers the zero-length size probe.
async fn size_probe(server: &mut ServerGuard, len: usize) -> mockito::Mock {
    server
        .mock("GET", PATH)
        .match_header("range", "bytes=0-0")
        .with_status(206)
        .with_header("content-range", &format!("bytes 0-0/{len}"))
        .with_body("x")
        .create_async()
        .await
}

fn drain(rx: &mut mpsc::UnboundedReceiver<DownloadProgress>) -> Vec<DownloadProgress> {
    let mut seen = Vec::new();
    while let Ok(p) = rx.try_recv() {
        seen.push(p);
    }
    seen
}

#[tokio::test]
async fn full_download_writes_every_byte_and_reports_progress() {
    let data = payload();
    let mut server = Server::new_async().await;
    size_probe(&mut server, data.len()).await;
    let full = server
        .mock("GET", PATH)
        .match_header("range", Matcher::Missing)
        .with_body(data.clone())
        .expect(1)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("Update").join("Celerate_1.1.0.msix");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let done = downloader()
        .download_file(&format!("{}{PATH}", server.url()), &dest, false, Some(&tx), &TransferControl::new())
        .await
        .unwrap();

    assert!(done);
    full.assert_async().await;
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), data);

    let snapshots = drain(&mut rx);
    assert!(!snapshots.is_empty());
    assert!(snapshots
        .windows(2)
        .all(|w| w[0].downloaded_bytes <= w[1].downloaded_bytes));
    let last = snapshots.last().unwrap();
    assert_eq!(last.total_bytes, Some(data.len() as u64));
    assert_eq!(last.downloaded_bytes, data.len() as u64);
    assert_eq!(last.percentage(), 100.0);
}

#[tokio::test]
async fn resume_appends_the_missing_range() {
    let data = payload();
    let k = 100_000;
    let mut server = Server::new_async().await;
    size_probe(&mut server, data.len()).await;
    let range = server
        .mock("GET", PATH)
        .match_header("range", format!("bytes={k}-").as_str())
        .with_status(206)
        .with_header("content-range", &format!("bytes {k}-{}/{}", data.len() - 1, data.len()))
        .with_body(data[k..].to_vec())
        .expect(1)
        .create_async()
        .await;
    let full = server
        .mock("GET", PATH)
        .match_header("range", Matcher::Missing)
        .expect(0)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("Celerate_1.1.0.msix");
    tokio::fs::write(&dest, &data[..k]).await.unwrap();

    let done = downloader()
        .download_file(&format!("{}{PATH}", server.url()), &dest, true, None, &TransferControl::new())
        .await
        .unwrap();

    assert!(done);
    range.assert_async().await;
    full.assert_async().await;
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), data);
}

#[tokio::test]
async fn range_answered_with_full_body_restarts_from_scratch() {
    let data = payload();
    let k = 50_000;
    let mut server = Server::new_async().await;
    size_probe(&mut server, data.len()).await;
    server
        .mock("GET", PATH)
        .match_header("range", format!("bytes={k}-").as_str())
        .with_status(200)
        .with_body(data.clone())
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("Celerate_1.1.0.msix");
    tokio::fs::write(&dest, &data[..k]).await.unwrap();

    let done = downloader()
        .download_file(&format!("{}{PATH}", server.url()), &dest, true, None, &TransferControl::new())
        .await
        .unwrap();

    assert!(done);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), data);
}

#[tokio::test]
async fn rejected_range_falls_back_to_full_download() {
    let data = payload();
    let k = 10;
    let mut server = Server::new_async().await;
    size_probe(&mut server, data.len()).await;
    server
        .mock("GET", PATH)
        .match_header("range", format!("bytes={k}-").as_str())
        .with_status(416)
        .create_async()
        .await;
    let full = server
        .mock("GET", PATH)
        .match_header("range", Matcher::Missing)
        .with_body(data.clone())
        .expect(1)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("Celerate_1.1.0.msix");
    tokio::fs::write(&dest, &data[..k]).await.unwrap();

    assert!(downloader()
        .download_file(&format!("{}{PATH}", server.url()), &dest, true, None, &TransferControl::new())
        .await
        .unwrap());
    full.assert_async().await;
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), data);
}

#[tokio::test]
async fn complete_local_file_is_not_transferred_again() {
    let data = payload();
    let mut server = Server::new_async().await;
    size_probe(&mut server, data.len()).await;
    let body = server
        .mock("GET", PATH)
        .match_header("range", Matcher::Regex("^bytes=[1-9]".to_string()))
        .expect(0)
        .create_async()
        .await;
    let full = server
        .mock("GET", PATH)
        .match_header("range", Matcher::Missing)
        .expect(0)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("Celerate_1.1.0.msix");
    tokio::fs::write(&dest, &data).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let done = downloader()
        .download_file(&format!("{}{PATH}", server.url()), &dest, true, Some(&tx), &TransferControl::new())
        .await
        .unwrap();

    assert!(done);
    body.assert_async().await;
    full.assert_async().await;
    let last = *drain(&mut rx).last().unwrap();
    assert_eq!(last.downloaded_bytes, data.len() as u64);
}

#[tokio::test]
async fn cancelling_a_paused_transfer_reports_not_done() {
    let data = payload();
    let mut server = Server::new_async().await;
    size_probe(&mut server, data.len()).await;
    server
        .mock("GET", PATH)
        .match_header("range", Matcher::Missing)
        .with_body(data)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("Celerate_1.1.0.msix");
    let control = TransferControl::new();
    control.pause();

    let url = format!("{}{PATH}", server.url());
    let task = {
        let control = control.clone();
        let dest = dest.clone();
        tokio::spawn(async move { downloader().download_file(&url, &dest, false, None, &control).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!task.is_finished());
    control.cancel();

    let done = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!done);
}

#[tokio::test]
async fn missing_resource_is_an_error() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", PATH)
        .match_header("range", Matcher::Missing)
        .with_status(404)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let err = downloader()
        .download_file(
            &format!("{}{PATH}", server.url()),
            &dir.path().join("x.msix"),
            false,
            None,
            &TransferControl::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::Status(StatusCode::NOT_FOUND)));
}

#[tokio::test]
async fn short_body_is_incomplete_and_keeps_the_partial_file() {
    let data = payload();
    let mut server = Server::new_async().await;
    size_probe(&mut server, 1000).await;
    server
        .mock("GET", PATH)
        .match_header("range", Matcher::Missing)
        .with_body(data[..400].to_vec())
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("Celerate_1.1.0.msix");
    let err = downloader()
        .download_file(&format!("{}{PATH}", server.url()), &dest, false, None, &TransferControl::new())
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::Incomplete { expected: 1000, downloaded: 400 }));
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), &data[..400]);
}
