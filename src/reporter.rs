// src/reporter.rs

use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, UpdateError};

pub const CODE_UPDATE_FAILED: &str = "UPDATE_FAILED";
pub const CODE_RESUME_FAILED: &str = "RESUME_FAILED";
pub const CODE_MANUAL_UPDATE_FAILED: &str = "MANUAL_UPDATE_FAILED";
pub const CODE_SCHEDULE_FAILED: &str = "SCHEDULE_FAILED";

/// One persisted failure. Written once, never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateErrorRecord {
    pub code: String,
    pub kind: ErrorKind,
    pub message: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
    pub app_version: String,
    pub target_version: Option<String>,
    pub system_info: BTreeMap<String, String>,
    pub stack_trace: String,
}

impl UpdateErrorRecord {
    pub fn from_error(
        code: &str,
        err: &UpdateError,
        app_version: &str,
        target_version: Option<&str>,
    ) -> Self {
        let backtrace = Backtrace::capture();
        let stack_trace = match backtrace.status() {
            BacktraceStatus::Captured => backtrace.to_string(),
            _ => String::new(),
        };
        Self {
            code: code.to_string(),
            kind: err.kind(),
            message: err.to_string(),
            details: err.source_chain(),
            timestamp: Utc::now(),
            app_version: app_version.to_string(),
            target_version: target_version.map(str::to_string),
            system_info: system_info(),
            stack_trace,
        }
    }
}

/// Host details attached to every error record.
pub fn system_info() -> BTreeMap<String, String> {
    let mut info = BTreeMap::new();
    let unknown = || "unknown".to_string();
    info.insert("os_name".into(), System::name().unwrap_or_else(unknown));
    info.insert("os_version".into(), System::long_os_version().unwrap_or_else(unknown));
    info.insert("kernel_version".into(), System::kernel_version().unwrap_or_else(unknown));
    info.insert("host_name".into(), System::host_name().unwrap_or_else(unknown));
    info.insert("architecture".into(), std::env::consts::ARCH.to_string());
    info.insert("is_64_bit".into(), cfg!(target_pointer_width = "64").to_string());

    let mut sys = System::new();
    sys.refresh_cpu();
    sys.refresh_memory();
    info.insert("processor_count".into(), sys.cpus().len().to_string());
    info.insert("total_memory_bytes".into(), sys.total_memory().to_string());
    info.insert("process_id".into(), std::process::id().to_string());
    info
}

/// Persists error records as JSON documents in a dedicated folder.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    dir: PathBuf,
}

impl ErrorReporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `record` to `error_<timestamp>_<random>.json` and returns its path.
    pub async fn report(&self, record: &UpdateErrorRecord) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let name = format!(
            "error_{}_{}.json",
            record.timestamp.format("%Y%m%d_%H%M%S"),
            Uuid::new_v4().simple()
        );
        let path = self.dir.join(name);
        let json = serde_json::to_string_pretty(record).map_err(io::Error::other)?;
        tokio::fs::write(&path, json).await?;
        error!(
            code = %record.code,
            kind = ?record.kind,
            message = %record.message,
            path = %path.display(),
            "update error recorded"
        );
        Ok(path)
    }

    /// All readable records, newest first.
    pub async fn list_reports(&self) -> io::Result<Vec<UpdateErrorRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<UpdateErrorRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable error record"),
            }
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        debug!(count = records.len(), "loaded error records");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    #[test]
    fn record_captures_error_and_environment() {
        let err = UpdateError::InsufficientDiskSpace { required: 10, available: 5 };
        let record = UpdateErrorRecord::from_error(CODE_UPDATE_FAILED, &err, "1.0.0", Some("1.1.0"));
        assert_eq!(record.kind, ErrorKind::InsufficientDiskSpace);
        assert!(record.message.contains("10 bytes required"));
        assert_eq!(record.target_version.as_deref(), Some("1.1.0"));
        assert!(record.system_info.contains_key("os_name"));
        assert!(record.system_info.contains_key("processor_count"));
    }

    #[tokio::test]
    async fn reports_are_written_and_listed_newest_first() {
        let dir = TempDir::new().unwrap();
        let reporter = ErrorReporter::new(dir.path().join("UpdateErrors"));

        let mut older = UpdateErrorRecord::from_error(
            CODE_RESUME_FAILED,
            &UpdateError::NotFound("package".into()),
            "1.0.0",
            None,
        );
        older.timestamp = older.timestamp - Duration::hours(1);
        let newer = UpdateErrorRecord::from_error(
            CODE_UPDATE_FAILED,
            &UpdateError::Install("installer exited".into()),
            "1.0.0",
            Some("1.1.0"),
        );

        let first = reporter.report(&older).await.unwrap();
        let second = reporter.report(&newer).await.unwrap();
        assert_ne!(first, second);
        let name = second.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("error_") && name.ends_with(".json"));

        let listed = reporter.list_reports().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].code, CODE_UPDATE_FAILED);
        assert_eq!(listed[1].code, CODE_RESUME_FAILED);
    }
}
