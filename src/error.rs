// src/error.rs

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::downloader::DownloadError;
use crate::integrity::IntegrityError;
use crate::scheduler::SchedulerError;

/// Failure classes surfaced to callers of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    NetworkUnsuitable,
    InsufficientDiskSpace,
    IntegrityMismatch,
    TransportFailure,
    UserCancelled,
    InstallFailure,
    ParseFailure,
    Io,
    Config,
}

/// Errors produced while running an update workflow.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("download error: {0}")]
    Download(#[from] DownloadError),
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid release metadata: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("network is not suitable for downloading: {0}")]
    NetworkUnsuitable(String),
    #[error("insufficient disk space: {required} bytes required, {available} available")]
    InsufficientDiskSpace { required: u64, available: u64 },
    #[error("integrity check failed for {}", .0.display())]
    IntegrityMismatch(PathBuf),
    #[error("operation cancelled by user")]
    Cancelled,
    #[error("installation failed: {0}")]
    Install(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl UpdateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Download(DownloadError::Io(_)) => ErrorKind::Io,
            UpdateError::Download(_) => ErrorKind::TransportFailure,
            UpdateError::Integrity(IntegrityError::NotFound(_)) => ErrorKind::NotFound,
            UpdateError::Integrity(_) => ErrorKind::Io,
            UpdateError::Scheduler(SchedulerError::InvalidRequest(_)) => ErrorKind::Config,
            UpdateError::Scheduler(_) => ErrorKind::Io,
            UpdateError::Io(_) => ErrorKind::Io,
            UpdateError::Json(_) | UpdateError::Parse(_) => ErrorKind::ParseFailure,
            UpdateError::NotFound(_) => ErrorKind::NotFound,
            UpdateError::NetworkUnsuitable(_) => ErrorKind::NetworkUnsuitable,
            UpdateError::InsufficientDiskSpace { .. } => ErrorKind::InsufficientDiskSpace,
            UpdateError::IntegrityMismatch(_) => ErrorKind::IntegrityMismatch,
            UpdateError::Cancelled => ErrorKind::UserCancelled,
            UpdateError::Install(_) => ErrorKind::InstallFailure,
            UpdateError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::UserCancelled
    }

    /// Renders the error together with every underlying source.
    pub fn source_chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(inner) = source {
            out.push_str("\ncaused by: ");
            out.push_str(&inner.to_string());
            source = inner.source();
        }
        out
    }
}

pub type UpdateResult<T> = Result<T, UpdateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(UpdateError::Cancelled.kind(), ErrorKind::UserCancelled);
        assert_eq!(
            UpdateError::InsufficientDiskSpace { required: 2, available: 1 }.kind(),
            ErrorKind::InsufficientDiskSpace
        );
        assert_eq!(
            UpdateError::Download(DownloadError::Status(reqwest::StatusCode::BAD_GATEWAY)).kind(),
            ErrorKind::TransportFailure
        );
        assert_eq!(
            UpdateError::Download(DownloadError::Incomplete { expected: 10, downloaded: 4 }).kind(),
            ErrorKind::TransportFailure
        );
        assert_eq!(UpdateError::Parse("bad".into()).kind(), ErrorKind::ParseFailure);
        assert!(UpdateError::Cancelled.is_cancelled());
    }

    #[test]
    fn source_chain_includes_inner_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = UpdateError::Download(DownloadError::Io(io));
        let chain = err.source_chain();
        assert!(chain.starts_with("download error"));
        assert!(chain.contains("caused by: disk gone"));
    }
}
