// src/models.rs

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::version::ReleaseVersion;

/// A snapshot of an in-flight transfer.
///
/// `total_bytes` is `None` when the remote did not disclose its size; percentage and
/// ETA are then reported as 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub total_bytes: Option<u64>,
    pub downloaded_bytes: u64,
    pub bytes_per_second: u64,
}

impl DownloadProgress {
    /// Progress as a percentage in range 0.0..=100.0, or 0 if the total is unknown.
    pub fn percentage(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => self.downloaded_bytes as f64 / total as f64 * 100.0,
            _ => 0.0,
        }
    }

    /// Seconds left at the current rate, or 0 if either the rate or the total is unknown.
    pub fn estimated_remaining_seconds(&self) -> f64 {
        match self.total_bytes {
            Some(total) if self.bytes_per_second > 0 => {
                total.saturating_sub(self.downloaded_bytes) as f64 / self.bytes_per_second as f64
            }
            _ => 0.0,
        }
    }
}

/// A downloadable file attached to a release.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseAsset {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

/// Release metadata as published by the release-hosting API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseInfo {
    #[serde(default)]
    pub tag_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl ReleaseInfo {
    /// Version advertised by this release, falling back to the default version.
    pub fn version(&self) -> ReleaseVersion {
        ReleaseVersion::resolve(self.tag_name.as_deref(), self.name.as_deref())
    }

    /// First asset whose name ends with the package extension.
    pub fn package_asset(&self, extension: &str) -> Option<&ReleaseAsset> {
        let suffix = format!(".{}", extension.trim_start_matches('.'));
        self.assets
            .iter()
            .find(|asset| asset.name.ends_with(&suffix) && !asset.browser_download_url.is_empty())
    }
}

/// Physical class of the active network link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    #[default]
    Unknown,
    Ethernet,
    WiFi,
    Mobile,
    Other,
}

/// Result of a network suitability check. Recomputed on every call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub connected: bool,
    pub connection_type: ConnectionType,
    pub metered: bool,
    pub estimated_speed_mbps: f64,
    pub suitable_for_download: bool,
    pub unsuitability_reason: Option<String>,
}

/// Outcome of comparing the installed version against the latest release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCheck {
    pub update_available: bool,
    pub current_version: ReleaseVersion,
    pub latest_version: ReleaseVersion,
}

/// Workflow state of one update attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateState {
    #[default]
    Idle,
    CheckingVersion,
    NoUpdate,
    NetworkUnsuitable,
    CheckingDiskSpace,
    Preparing,
    Downloading,
    Verifying,
    Installing,
    Completed,
    Error,
    Cancelled,
}

impl UpdateState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdateState::NoUpdate
                | UpdateState::NetworkUnsuitable
                | UpdateState::Completed
                | UpdateState::Error
                | UpdateState::Cancelled
        )
    }
}

/// What an orchestrator workflow ended with. Never carries a panic or a propagated error.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    UpToDate { current: ReleaseVersion },
    Installed { version: Option<ReleaseVersion>, package: PathBuf },
    Cancelled,
    Failed { kind: ErrorKind, message: String },
}

impl UpdateOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UpdateOutcome::UpToDate { .. } | UpdateOutcome::Installed { .. })
    }
}

/// Outcome of a deferred-install request.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    NoUpdate,
    Scheduled { package: PathBuf, at: DateTime<chrono::Local> },
}

/// A package file chosen by the user for a manual update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickedFile {
    pub path: PathBuf,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_with_unknown_total_reports_zero() {
        let progress = DownloadProgress {
            total_bytes: None,
            downloaded_bytes: 500,
            bytes_per_second: 100,
        };
        assert_eq!(progress.percentage(), 0.0);
        assert_eq!(progress.estimated_remaining_seconds(), 0.0);
    }

    #[test]
    fn progress_derives_percentage_and_eta() {
        let progress = DownloadProgress {
            total_bytes: Some(1000),
            downloaded_bytes: 250,
            bytes_per_second: 50,
        };
        assert_eq!(progress.percentage(), 25.0);
        assert_eq!(progress.estimated_remaining_seconds(), 15.0);

        let stalled = DownloadProgress { bytes_per_second: 0, ..progress };
        assert_eq!(stalled.estimated_remaining_seconds(), 0.0);
    }

    #[test]
    fn package_asset_matches_extension() {
        let release = ReleaseInfo {
            assets: vec![
                ReleaseAsset {
                    name: "notes.txt".into(),
                    browser_download_url: "https://example.com/notes.txt".into(),
                    size: 1,
                },
                ReleaseAsset {
                    name: "App_1.1.0.msix".into(),
                    browser_download_url: "https://example.com/App_1.1.0.msix".into(),
                    size: 2,
                },
            ],
            ..Default::default()
        };
        let asset = release.package_asset("msix").unwrap();
        assert_eq!(asset.name, "App_1.1.0.msix");
        assert!(release.package_asset(".msix").is_some());
        assert!(release.package_asset("zip").is_none());
    }

    #[test]
    fn release_json_tolerates_missing_fields() {
        let release: ReleaseInfo = serde_json::from_str(r#"{"tag_name":"v2.0.0"}"#).unwrap();
        assert!(release.assets.is_empty());
        assert_eq!(release.version().to_string(), "2.0.0");
    }
}
