// src/session.rs

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::models::{DownloadProgress, UpdateState};

/// Cancellation and pause signals for a single transfer.
///
/// Cloning yields a handle to the same signals.
#[derive(Debug, Clone)]
pub struct TransferControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self { cancel: CancellationToken::new(), paused: Arc::new(paused) }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Blocks while paused. Returns `false` if cancelled in the meantime.
    pub async fn wait_while_paused(&self) -> bool {
        let mut rx = self.paused.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            res = rx.wait_for(|paused| !*paused) => res.is_ok() && !self.cancel.is_cancelled(),
        }
    }
}

/// Snapshot published to observers of an update attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateProgress {
    pub state: UpdateState,
    pub percentage: f64,
    pub status: String,
    pub total_bytes: Option<u64>,
    pub downloaded_bytes: u64,
    pub error: Option<String>,
    pub is_paused: bool,
}

/// Share of the overall percentage taken by the download phase.
pub const DOWNLOAD_SHARE: f64 = 0.7;

/// Per-attempt state: the transfer control plus an observable progress snapshot.
///
/// One session per update attempt. It replaces any process-wide mutable state.
#[derive(Debug)]
pub struct UpdateSession {
    control: TransferControl,
    progress: watch::Sender<UpdateProgress>,
}

impl Default for UpdateSession {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateSession {
    pub fn new() -> Self {
        let (progress, _) = watch::channel(UpdateProgress::default());
        Self { control: TransferControl::new(), progress }
    }

    pub fn control(&self) -> &TransferControl {
        &self.control
    }

    pub fn subscribe(&self) -> watch::Receiver<UpdateProgress> {
        self.progress.subscribe()
    }

    pub fn snapshot(&self) -> UpdateProgress {
        self.progress.borrow().clone()
    }

    pub fn state(&self) -> UpdateState {
        self.progress.borrow().state
    }

    pub fn cancel(&self) {
        info!("update cancelled by user");
        self.control.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    pub fn pause(&self) {
        self.control.pause();
        self.progress.send_modify(|p| {
            p.is_paused = true;
            p.status = "Download paused".to_string();
        });
    }

    pub fn resume(&self) {
        self.control.resume();
        self.progress.send_modify(|p| {
            p.is_paused = false;
            p.status = "Resuming download...".to_string();
        });
    }

    pub fn set_state(&self, state: UpdateState, status: impl Into<String>) {
        let status = status.into();
        self.progress.send_modify(|p| {
            p.state = state;
            p.status = status;
        });
    }

    pub fn set_percentage(&self, state: UpdateState, percentage: f64, status: impl Into<String>) {
        let status = status.into();
        self.progress.send_modify(|p| {
            p.state = state;
            p.percentage = percentage.clamp(0.0, 100.0);
            p.status = status;
        });
    }

    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.progress.send_modify(|p| {
            p.state = UpdateState::Error;
            p.status = format!("Update failed: {message}");
            p.error = Some(message);
        });
    }

    /// Maps download progress onto the first 70% of the overall percentage.
    pub fn report_download(&self, progress: &DownloadProgress) {
        let paused = self.control.is_paused();
        self.progress.send_modify(|p| {
            p.state = UpdateState::Downloading;
            p.percentage = (progress.percentage() * DOWNLOAD_SHARE).clamp(0.0, 100.0 * DOWNLOAD_SHARE);
            p.total_bytes = progress.total_bytes;
            p.downloaded_bytes = progress.downloaded_bytes;
            p.is_paused = paused;
            p.status = if paused {
                "Download paused".to_string()
            } else {
                download_status_text(progress)
            };
        });
    }
}

/// `Downloading (<done>/<total>) - <eta> remaining`
pub fn download_status_text(progress: &DownloadProgress) -> String {
    match progress.total_bytes {
        Some(total) => format!(
            "Downloading ({}/{}) - {} remaining",
            format_bytes(progress.downloaded_bytes),
            format_bytes(total),
            format_duration(progress.estimated_remaining_seconds())
        ),
        None => format!("Downloading ({})", format_bytes(progress.downloaded_bytes)),
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h {m}m")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn formats_sizes_and_durations() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GB");
        assert_eq!(format_duration(42.0), "42s");
        assert_eq!(format_duration(125.0), "2m 5s");
        assert_eq!(format_duration(3.0 * 3600.0 + 61.0), "3h 1m");
    }

    #[test]
    fn download_takes_seventy_percent() {
        let session = UpdateSession::new();
        session.report_download(&DownloadProgress {
            total_bytes: Some(200),
            downloaded_bytes: 100,
            bytes_per_second: 10,
        });
        let snap = session.snapshot();
        assert_eq!(snap.state, UpdateState::Downloading);
        assert!((snap.percentage - 35.0).abs() < 1e-9);
        assert_eq!(snap.status, "Downloading (100.00 B/200.00 B) - 10s remaining");
    }

    #[test]
    fn pause_changes_status_text() {
        let session = UpdateSession::new();
        session.pause();
        assert!(session.control().is_paused());
        assert_eq!(session.snapshot().status, "Download paused");
        session.resume();
        assert!(!session.snapshot().is_paused);
    }

    #[tokio::test]
    async fn wait_while_paused_blocks_until_resumed() {
        let control = TransferControl::new();
        control.pause();
        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.wait_while_paused().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        control.resume();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn cancel_wakes_paused_waiter() {
        let control = TransferControl::new();
        control.pause();
        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.wait_while_paused().await });
        control.cancel();
        assert!(!handle.await.unwrap());
    }
}
