// src/storage.rs

use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Local;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::UpdateConfig;
use crate::session::TransferControl;

pub const BACKUP_EXTENSION: &str = "zip";
pub const ERROR_DIR: &str = "UpdateErrors";

/// The on-disk update folder: package files, backup archives and error records.
#[derive(Debug, Clone)]
pub struct UpdateFolder {
    root: PathBuf,
    product: String,
    extension: String,
}

impl UpdateFolder {
    pub fn new(root: impl Into<PathBuf>, product: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            product: product.into(),
            extension: extension.into().trim_start_matches('.').to_string(),
        }
    }

    pub fn from_config(config: &UpdateConfig) -> Self {
        Self::new(&config.update_folder, &config.product_name, config.package_extension())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn error_dir(&self) -> PathBuf {
        self.root.join(ERROR_DIR)
    }

    pub async fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn package_name(&self, version: &str) -> String {
        format!("{}_{}.{}", self.product, version, self.extension)
    }

    pub fn package_path(&self, version: &str) -> PathBuf {
        self.root.join(self.package_name(version))
    }

    /// Package files directly inside the folder. A missing folder has none.
    pub async fn list_packages(&self) -> io::Result<Vec<PathBuf>> {
        self.list_with_extension(&self.extension).await
    }

    pub async fn list_backups(&self) -> io::Result<Vec<PathBuf>> {
        self.list_with_extension(BACKUP_EXTENSION).await
    }

    async fn list_with_extension(&self, extension: &str) -> io::Result<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let matches = path
                .extension()
                .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case(extension));
            if matches && entry.file_type().await?.is_file() {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }

    /// Most recently modified package file, if any.
    pub async fn latest_package(&self) -> io::Result<Option<(PathBuf, Metadata)>> {
        let mut latest: Option<(PathBuf, Metadata, SystemTime)> = None;
        for path in self.list_packages().await? {
            let meta = fs::metadata(&path).await?;
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if latest.as_ref().map_or(true, |(_, _, best)| modified >= *best) {
                latest = Some((path, meta, modified));
            }
        }
        Ok(latest.map(|(path, meta, _)| (path, meta)))
    }

    /// Moves `package` into a timestamped zip archive and removes the original.
    pub async fn backup(&self, package: &Path, version: &str) -> io::Result<PathBuf> {
        let stamp = Local::now().format("%Y%m%d%H%M%S");
        let archive = self
            .root
            .join(format!("{}_{}_{}.{}", self.product, version, stamp, BACKUP_EXTENSION));
        let source = package.to_path_buf();
        let target = archive.clone();
        tokio::task::spawn_blocking(move || write_archive(&source, &target))
            .await
            .map_err(io::Error::other)??;
        fs::remove_file(package).await?;
        info!(package = %package.display(), archive = %archive.display(), "package backed up");
        Ok(archive)
    }

    /// Deletes every package file and backup archive. Individual failures are skipped.
    pub async fn clean_update_files(&self) -> usize {
        let mut removed = 0;
        let mut targets = self.list_packages().await.unwrap_or_else(|e| {
            warn!(folder = %self.root.display(), error = %e, "could not list packages");
            Vec::new()
        });
        targets.extend(self.list_backups().await.unwrap_or_default());
        for path in targets {
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "removed");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove update file"),
            }
        }
        if removed > 0 {
            info!(removed, "cleaned update folder");
        }
        removed
    }
}

fn write_archive(source: &Path, target: &Path) -> io::Result<()> {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "package".to_string());
    let mut input = std::fs::File::open(source)?;
    let mut zip = ZipWriter::new(std::fs::File::create(target)?);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);
    zip.start_file(name, options).map_err(io::Error::other)?;
    io::copy(&mut input, &mut zip)?;
    zip.finish().map_err(io::Error::other)?;
    Ok(())
}

/// Copies `src` to `dest` in chunks, reporting `(copied, total)` after each one.
///
/// Returns `Ok(false)` and removes the partial copy if cancelled.
pub async fn copy_with_progress<F>(
    src: &Path,
    dest: &Path,
    control: &TransferControl,
    mut on_progress: F,
) -> io::Result<bool>
where
    F: FnMut(u64, u64),
{
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut input = File::open(src).await?;
    let total = input.metadata().await?.len();
    let mut output = File::create(dest).await?;
    let mut buffer = vec![0u8; 64 * 1024];
    let mut copied = 0u64;
    loop {
        if control.is_cancelled() {
            drop(output);
            let _ = fs::remove_file(dest).await;
            return Ok(false);
        }
        let n = input.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        output.write_all(&buffer[..n]).await?;
        copied += n as u64;
        on_progress(copied, total);
    }
    output.flush().await?;
    Ok(true)
}
