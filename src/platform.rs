// src/platform.rs

//! OS capabilities the engine depends on, behind traits so tests can fake them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sysinfo::Disks;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::models::PickedFile;

/// Applies a downloaded package.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self, package: &Path) -> Result<(), UpdateError>;

    /// Whether the package carries a valid publisher signature.
    async fn verify_signature(&self, package: &Path) -> Result<bool, UpdateError>;
}

/// Ends the running application once an install has been handed off.
pub trait AppLifecycle: Send + Sync {
    fn shutdown(&self);
}

/// Lets the user choose a package file for a manual update.
#[async_trait]
pub trait FilePicker: Send + Sync {
    async fn pick_package(&self) -> Option<PickedFile>;
}

pub trait DiskSpace: Send + Sync {
    /// Free bytes on the volume holding `path`.
    fn available_space(&self, path: &Path) -> Option<u64>;
}

/// Program and arguments that open `package` with the platform's installer.
pub fn install_command(package: &Path) -> (String, Vec<String>) {
    let path = package.display().to_string();
    if cfg!(windows) {
        (
            "powershell.exe".to_string(),
            vec![
                "-NoProfile".to_string(),
                "-ExecutionPolicy".to_string(),
                "Bypass".to_string(),
                "-Command".to_string(),
                format!("Start-Process -FilePath '{}'", path.replace('\'', "''")),
            ],
        )
    } else if cfg!(target_os = "macos") {
        ("open".to_string(), vec![path])
    } else {
        ("xdg-open".to_string(), vec![path])
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInstaller;

#[async_trait]
impl PackageInstaller for SystemInstaller {
    async fn install(&self, package: &Path) -> Result<(), UpdateError> {
        if !package.exists() {
            return Err(UpdateError::NotFound(package.display().to_string()));
        }
        let (program, args) = install_command(package);
        debug!(%program, ?args, "launching installer");
        let status = Command::new(&program)
            .args(&args)
            .status()
            .await
            .map_err(|e| UpdateError::Install(format!("failed to launch {program}: {e}")))?;
        if !status.success() {
            return Err(UpdateError::Install(format!("{program} exited with {status}")));
        }
        info!(package = %package.display(), "installer launched");
        Ok(())
    }

    async fn verify_signature(&self, package: &Path) -> Result<bool, UpdateError> {
        if !package.exists() {
            return Err(UpdateError::NotFound(package.display().to_string()));
        }
        if !cfg!(windows) {
            warn!(package = %package.display(), "signature verification unavailable on this platform");
            return Ok(false);
        }
        let script = format!(
            "(Get-AuthenticodeSignature -FilePath '{}').Status",
            package.display().to_string().replace('\'', "''")
        );
        let output = Command::new("powershell.exe")
            .args(["-NoProfile", "-Command", &script])
            .output()
            .await
            .map_err(|e| UpdateError::Install(format!("failed to run signature check: {e}")))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let valid = output.status.success() && stdout.trim() == "Valid";
        debug!(package = %package.display(), status = %stdout.trim(), valid, "signature checked");
        Ok(valid)
    }
}

/// Exits the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

impl AppLifecycle for ProcessExit {
    fn shutdown(&self) {
        info!("shutting down for update");
        std::process::exit(0);
    }
}

/// A picker that always answers with a path chosen up front, e.g. from the command line.
#[derive(Debug, Clone, Default)]
pub struct PathPicker(pub Option<PathBuf>);

#[async_trait]
impl FilePicker for PathPicker {
    async fn pick_package(&self) -> Option<PickedFile> {
        let path = self.0.clone()?;
        let name = path.file_name()?.to_string_lossy().into_owned();
        Some(PickedFile { path, name })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDiskSpace;

impl DiskSpace for SystemDiskSpace {
    fn available_space(&self, path: &Path) -> Option<u64> {
        let target = nearest_existing(path);
        let target = std::fs::canonicalize(&target).unwrap_or(target);
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

fn nearest_existing(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| path.to_path_buf())
}
