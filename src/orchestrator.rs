// src/orchestrator.rs

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::changelog::{self, ChangelogInfo};
use crate::config::UpdateConfig;
use crate::downloader::Downloader;
use crate::error::{UpdateError, UpdateResult};
use crate::http::HttpClient;
use crate::integrity;
use crate::models::{NetworkStatus, ReleaseInfo, ScheduleOutcome, UpdateCheck, UpdateOutcome, UpdateState};
use crate::network::{NetworkAssessment, NetworkAssessor};
use crate::platform::{
    AppLifecycle, DiskSpace, FilePicker, PackageInstaller, ProcessExit, SystemDiskSpace, SystemInstaller,
};
use crate::reporter::{
    ErrorReporter, UpdateErrorRecord, CODE_MANUAL_UPDATE_FAILED, CODE_RESUME_FAILED, CODE_SCHEDULE_FAILED,
    CODE_UPDATE_FAILED,
};
use crate::scheduler::{SchedulerError, UpdateScheduler};
use crate::session::{UpdateSession, DOWNLOAD_SHARE};
use crate::storage::{copy_with_progress, UpdateFolder};
use crate::version::{is_update_available, ReleaseVersion};

const DOWNLOAD_END: f64 = 100.0 * DOWNLOAD_SHARE;

/// Drives update attempts from version check to installer hand-off.
///
/// Every workflow returns an [`UpdateOutcome`]; failures are recorded on disk and reported
/// through the session instead of being propagated.
pub struct UpdateOrchestrator {
    config: UpdateConfig,
    downloader: Downloader,
    folder: UpdateFolder,
    reporter: ErrorReporter,
    network: Box<dyn NetworkAssessment>,
    disk: Box<dyn DiskSpace>,
    installer: Box<dyn PackageInstaller>,
    lifecycle: Box<dyn AppLifecycle>,
}

impl UpdateOrchestrator {
    /// Builds an orchestrator wired to the real OS capabilities.
    ///
    /// Fails only on an invalid configuration.
    pub fn new(config: UpdateConfig) -> UpdateResult<Self> {
        config.validate()?;
        let http = HttpClient::from_config(&config)?;
        let network = NetworkAssessor::new(
            http.client().clone(),
            config.speed_test_url.clone(),
            config.low_speed_threshold_mbps,
        );
        let folder = UpdateFolder::from_config(&config);
        Ok(Self {
            downloader: Downloader::new(http, config.progress_interval()),
            reporter: ErrorReporter::new(folder.error_dir()),
            folder,
            network: Box::new(network),
            disk: Box::new(SystemDiskSpace),
            installer: Box::new(SystemInstaller),
            lifecycle: Box::new(ProcessExit),
            config,
        })
    }

    pub fn with_network(mut self, network: impl NetworkAssessment + 'static) -> Self {
        self.network = Box::new(network);
        self
    }

    pub fn with_disk_space(mut self, disk: impl DiskSpace + 'static) -> Self {
        self.disk = Box::new(disk);
        self
    }

    pub fn with_installer(mut self, installer: impl PackageInstaller + 'static) -> Self {
        self.installer = Box::new(installer);
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: impl AppLifecycle + 'static) -> Self {
        self.lifecycle = Box::new(lifecycle);
        self
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn folder(&self) -> &UpdateFolder {
        &self.folder
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    /// Compares the installed version with the latest release. Never fails: unreachable or
    /// malformed release metadata means "no update".
    pub async fn check_for_update_availability(&self) -> UpdateCheck {
        self.assess_release().await.0
    }

    /// The automatic flow: check, gate, download, verify, install.
    pub async fn check_for_updates(&self, session: &UpdateSession) -> UpdateOutcome {
        let mut target = None;
        let result = self.run_update(session, &mut target).await;
        self.finish(session, CODE_UPDATE_FAILED, result, target).await
    }

    /// Continues the most recently modified package download in the update folder.
    pub async fn resume_download(&self, session: &UpdateSession) -> UpdateOutcome {
        let mut target = None;
        let result = self.run_resume(session, &mut target).await;
        self.finish(session, CODE_RESUME_FAILED, result, target).await
    }

    /// Installs a package chosen by the user, skipping every remote step.
    pub async fn manual_update(&self, session: &UpdateSession, picker: &dyn FilePicker) -> UpdateOutcome {
        let result = self.run_manual(session, picker).await;
        self.finish(session, CODE_MANUAL_UPDATE_FAILED, result, None).await
    }

    /// Makes sure the latest package is on disk and verified, then schedules its install at `at`.
    pub async fn schedule_update(
        &self,
        scheduler: &UpdateScheduler,
        at: DateTime<Local>,
    ) -> Result<ScheduleOutcome, UpdateError> {
        let mut target = None;
        match self.run_schedule(scheduler, at, &mut target).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(error = %err, "scheduling the update failed");
                self.record(CODE_SCHEDULE_FAILED, &err, target.as_deref()).await;
                Err(err)
            }
        }
    }

    /// Release notes for `version`, or for the latest release when `None` or `"latest"`.
    pub async fn get_changelog(&self, version: Option<&str>) -> ChangelogInfo {
        let version = version.map(str::trim).filter(|v| !v.is_empty() && *v != "latest");
        let url = match version {
            Some(v) => self.config.release_by_tag_url(v),
            None => self.config.latest_release_url(),
        };
        match self.downloader.http().fetch_json::<ReleaseInfo>(&url).await {
            Ok(release) => {
                let tag = release.tag_name.as_deref().unwrap_or_default();
                changelog::parse_release_notes(
                    release.body.as_deref().unwrap_or_default(),
                    ReleaseVersion::normalize(tag),
                    release.published_at,
                )
            }
            Err(e) => {
                warn!(%url, error = %e, "could not fetch release notes");
                ChangelogInfo::empty(version)
            }
        }
    }

    /// Removes package files and backups. Returns how many files were deleted.
    pub async fn clean_update_files(&self) -> usize {
        self.folder.clean_update_files().await
    }

    /// Persists `record`. A failure to write it is logged and swallowed.
    pub async fn report_error(&self, record: &UpdateErrorRecord) -> Option<PathBuf> {
        match self.reporter.report(record).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, code = %record.code, "could not persist error record");
                None
            }
        }
    }

    pub async fn check_network_status(&self) -> NetworkStatus {
        self.network.assess().await
    }

    /// Checks `path` against `expected`; any error reading the file counts as a mismatch.
    pub async fn verify_file_integrity(&self, path: &Path, expected: &str) -> bool {
        integrity::verify_file_integrity(path, expected).await.unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "integrity check failed");
            false
        })
    }

    /// True iff free space on the update volume is strictly greater than `required`.
    pub fn has_enough_disk_space(&self, required: u64) -> bool {
        self.ensure_disk_space(required).is_ok()
    }

    fn ensure_disk_space(&self, required: u64) -> UpdateResult<()> {
        let available = self.disk.available_space(self.folder.root());
        debug!(?available, required, "checking disk space");
        match available {
            Some(free) if free > required => Ok(()),
            other => Err(UpdateError::InsufficientDiskSpace { required, available: other.unwrap_or(0) }),
        }
    }

    async fn latest_release(&self) -> UpdateResult<ReleaseInfo> {
        self.downloader
            .http()
            .fetch_json::<ReleaseInfo>(&self.config.latest_release_url())
            .await
    }

    /// The availability check plus the release it was based on, when one was fetched.
    async fn assess_release(&self) -> (UpdateCheck, Option<ReleaseInfo>) {
        let current = self.config.current_version();
        let release = match self.latest_release().await {
            Ok(release) => release,
            Err(e) => {
                warn!(error = %e, "could not fetch the latest release");
                let check = UpdateCheck {
                    update_available: false,
                    latest_version: current.clone(),
                    current_version: current,
                };
                return (check, None);
            }
        };
        let latest = release.version();
        let update_available = is_update_available(&current, &latest);
        info!(%current, %latest, update_available, "update check finished");
        if !update_available {
            self.folder.clean_update_files().await;
        }
        let check = UpdateCheck { update_available, current_version: current, latest_version: latest };
        (check, Some(release))
    }

    async fn run_update(
        &self,
        session: &UpdateSession,
        target: &mut Option<String>,
    ) -> UpdateResult<UpdateOutcome> {
        session.set_percentage(UpdateState::CheckingVersion, 0.0, "Checking for updates...");
        let (check, release) = self.assess_release().await;
        let Some(release) = release.filter(|_| check.update_available) else {
            return Ok(self.up_to_date(session, check.current_version));
        };
        let version = check.latest_version;
        *target = Some(version.to_string());

        if let Some(outcome) = self.network_gate(session).await {
            return Ok(outcome);
        }

        let url = self.package_url(&release)?;
        session.set_state(UpdateState::CheckingDiskSpace, "Checking disk space");
        let http = self.downloader.http();
        let remote_size = http.get_file_size(&url).await;
        let required = remote_size.unwrap_or(self.config.min_package_size) + self.config.disk_space_margin;
        self.ensure_disk_space(required)?;

        session.set_state(UpdateState::Preparing, "Preparing download");
        self.folder.ensure().await?;
        let package = self.folder.package_path(&version.to_string());
        let digest = http.get_file_hash(&url).await;

        if self.reuse_existing(&package, &version, digest.as_deref(), remote_size).await? {
            info!(package = %package.display(), "package already downloaded");
            session.set_percentage(UpdateState::Preparing, DOWNLOAD_END, "File already downloaded");
        } else {
            self.download(session, &url, &package, false).await?;
            self.verify_download(session, &package, digest.as_deref()).await?;
        }
        self.install(session, &package, Some(version)).await
    }

    async fn run_resume(
        &self,
        session: &UpdateSession,
        target: &mut Option<String>,
    ) -> UpdateResult<UpdateOutcome> {
        session.set_state(UpdateState::Preparing, "Looking for an interrupted download");
        let Some((partial, meta)) = self.folder.latest_package().await? else {
            return Err(UpdateError::NotFound("no interrupted download to resume".to_string()));
        };
        if meta.len() == 0 {
            tokio::fs::remove_file(&partial).await?;
            return Err(UpdateError::NotFound(format!(
                "corrupt download {} removed, start the update again",
                partial.display()
            )));
        }

        session.set_state(UpdateState::CheckingVersion, "Checking for updates...");
        let (check, release) = self.assess_release().await;
        let Some(release) = release.filter(|_| check.update_available) else {
            return Ok(self.up_to_date(session, check.current_version));
        };
        let version = check.latest_version;
        *target = Some(version.to_string());

        let url = self.package_url(&release)?;
        if let Some(outcome) = self.network_gate(session).await {
            return Ok(outcome);
        }

        // a partial file from another release cannot be continued
        let package = self.folder.package_path(&version.to_string());
        let resume = partial == package;
        if !resume {
            info!(stale = %partial.display(), "partial download belongs to another release");
            tokio::fs::remove_file(&partial).await?;
        }

        let digest = self.downloader.http().get_file_hash(&url).await;
        self.download(session, &url, &package, resume).await?;
        self.verify_download(session, &package, digest.as_deref()).await?;
        self.install(session, &package, Some(version)).await
    }

    async fn run_manual(&self, session: &UpdateSession, picker: &dyn FilePicker) -> UpdateResult<UpdateOutcome> {
        let Some(picked) = picker.pick_package().await else {
            info!("no package selected");
            session.set_state(UpdateState::Cancelled, "No file selected");
            return Ok(UpdateOutcome::Cancelled);
        };
        session.set_percentage(UpdateState::Preparing, 20.0, "Selected file");

        let size = tokio::fs::metadata(&picked.path).await?.len();
        self.ensure_disk_space(size + self.config.manual_disk_space_margin)?;
        self.folder.ensure().await?;

        let package = self.folder.root().join(&picked.name);
        if package != picked.path {
            session.set_percentage(UpdateState::Preparing, 20.0, "Copying package");
            let copied = copy_with_progress(&picked.path, &package, session.control(), |done, total| {
                let fraction = if total > 0 { done as f64 / total as f64 } else { 1.0 };
                session.set_percentage(UpdateState::Preparing, 20.0 + fraction * 50.0, "Copying package");
            })
            .await?;
            if !copied {
                return Err(UpdateError::Cancelled);
            }
        }
        session.set_percentage(UpdateState::Verifying, DOWNLOAD_END, "Verifying package signature");

        if !self.installer.verify_signature(&package).await? {
            return Err(UpdateError::Install(format!(
                "package signature verification failed for {}",
                package.display()
            )));
        }
        session.set_percentage(UpdateState::Verifying, 75.0, "Package signature verified");

        let version = Path::new(&picked.name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.rsplit('_').next())
            .and_then(|v| v.parse::<ReleaseVersion>().ok());
        self.install(session, &package, version).await
    }

    async fn run_schedule(
        &self,
        scheduler: &UpdateScheduler,
        at: DateTime<Local>,
        target: &mut Option<String>,
    ) -> UpdateResult<ScheduleOutcome> {
        if at <= Local::now() {
            return Err(SchedulerError::InvalidRequest(format!("{at} is not in the future")).into());
        }
        let (check, release) = self.assess_release().await;
        let Some(release) = release.filter(|_| check.update_available) else {
            info!("no update to schedule");
            return Ok(ScheduleOutcome::NoUpdate);
        };
        let version = check.latest_version.to_string();
        *target = Some(version.clone());

        let url = self.package_url(&release)?;
        self.folder.ensure().await?;
        let package = self.folder.package_path(&version);
        let http = self.downloader.http();
        let digest = http.get_file_hash(&url).await;

        let present = match digest.as_deref() {
            Some(expected) if package.exists() => integrity::verify_file_integrity(&package, expected).await?,
            _ => false,
        };
        if !present {
            let session = UpdateSession::new();
            if !self.downloader.download_file(&url, &package, false, None, session.control()).await? {
                return Err(UpdateError::Cancelled);
            }
            self.verify_download(&session, &package, digest.as_deref()).await?;
        }

        scheduler.schedule_install(at, &package).await?;
        Ok(ScheduleOutcome::Scheduled { package, at })
    }

    fn up_to_date(&self, session: &UpdateSession, current: ReleaseVersion) -> UpdateOutcome {
        session.set_percentage(UpdateState::NoUpdate, 100.0, "You are already using the latest version");
        UpdateOutcome::UpToDate { current }
    }

    fn package_url(&self, release: &ReleaseInfo) -> UpdateResult<String> {
        let ext = self.config.package_extension();
        release
            .package_asset(ext)
            .map(|asset| asset.browser_download_url.clone())
            .ok_or_else(|| UpdateError::NotFound(format!("no .{ext} package in the latest release")))
    }

    /// `Some` outcome when the network should not be used for the download.
    async fn network_gate(&self, session: &UpdateSession) -> Option<UpdateOutcome> {
        let status = self.network.assess().await;
        if status.suitable_for_download {
            return None;
        }
        let reason = status.unsuitability_reason.unwrap_or_else(|| "unknown".to_string());
        let err = UpdateError::NetworkUnsuitable(reason);
        warn!(error = %err, "update postponed");
        session.set_state(UpdateState::NetworkUnsuitable, err.to_string());
        Some(UpdateOutcome::Failed { kind: err.kind(), message: err.to_string() })
    }

    /// Whether an existing package for `version` can be installed as-is. An unusable one is
    /// moved into a backup archive.
    async fn reuse_existing(
        &self,
        package: &Path,
        version: &ReleaseVersion,
        digest: Option<&str>,
        remote_size: Option<u64>,
    ) -> UpdateResult<bool> {
        let meta = match tokio::fs::metadata(package).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let valid = match digest {
            Some(expected) => integrity::verify_file_integrity(package, expected).await?,
            None => remote_size.is_some_and(|size| size > 0 && size == meta.len()),
        };
        if !valid {
            self.folder.backup(package, &version.to_string()).await?;
        }
        Ok(valid)
    }

    /// Downloads into `dest`, mirroring progress onto the session.
    async fn download(&self, session: &UpdateSession, url: &str, dest: &Path, resume: bool) -> UpdateResult<()> {
        session.set_percentage(UpdateState::Downloading, session.snapshot().percentage, "Starting download");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transfer = async move {
            let result = self
                .downloader
                .download_file(url, dest, resume, Some(&tx), session.control())
                .await;
            drop(tx);
            result
        };
        let forward = async {
            while let Some(progress) = rx.recv().await {
                session.report_download(&progress);
            }
        };
        let (result, ()) = tokio::join!(transfer, forward);

        if result? {
            Ok(())
        } else {
            if let Err(e) = tokio::fs::remove_file(dest).await {
                debug!(path = %dest.display(), error = %e, "no partial file to remove");
            }
            Err(UpdateError::Cancelled)
        }
    }

    /// A published digest must match. Without one the package is installed unverified.
    async fn verify_download(&self, session: &UpdateSession, package: &Path, digest: Option<&str>) -> UpdateResult<()> {
        session.set_percentage(UpdateState::Verifying, DOWNLOAD_END, "Verifying download");
        let Some(expected) = digest else {
            warn!(package = %package.display(), "no digest published, installing unverified package");
            return Ok(());
        };
        if integrity::verify_file_integrity(package, expected).await? {
            return Ok(());
        }
        if let Err(e) = tokio::fs::remove_file(package).await {
            warn!(package = %package.display(), error = %e, "could not remove corrupt package");
        }
        Err(UpdateError::IntegrityMismatch(package.to_path_buf()))
    }

    async fn install(
        &self,
        session: &UpdateSession,
        package: &Path,
        version: Option<ReleaseVersion>,
    ) -> UpdateResult<UpdateOutcome> {
        if session.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        let delays = self.config.install_step_delays();
        let delay = |step: usize| delays.get(step).copied().unwrap_or_default();

        session.set_percentage(UpdateState::Installing, 80.0, "Installing package");
        tokio::time::sleep(delay(0)).await;
        self.installer.install(package).await?;

        // from here on the installer owns the process; cancellation is ignored
        session.set_percentage(UpdateState::Installing, 90.0, "Installer started");
        tokio::time::sleep(delay(1)).await;
        session.set_percentage(UpdateState::Installing, 95.0, "Closing application");
        tokio::time::sleep(delay(2)).await;

        session.set_percentage(UpdateState::Completed, 100.0, "Update completed");
        info!(package = %package.display(), ?version, "update handed to installer");
        self.lifecycle.shutdown();
        Ok(UpdateOutcome::Installed { version, package: package.to_path_buf() })
    }

    /// Converts a workflow result into an outcome, recording real failures.
    async fn finish(
        &self,
        session: &UpdateSession,
        code: &str,
        result: UpdateResult<UpdateOutcome>,
        target: Option<String>,
    ) -> UpdateOutcome {
        match result {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => {
                info!("update cancelled");
                session.set_state(UpdateState::Cancelled, "Operation cancelled");
                UpdateOutcome::Cancelled
            }
            Err(err) => {
                error!(code, error = %err, "update failed");
                self.record(code, &err, target.as_deref()).await;
                session.set_error(err.to_string());
                UpdateOutcome::Failed { kind: err.kind(), message: err.to_string() }
            }
        }
    }

    async fn record(&self, code: &str, err: &UpdateError, target: Option<&str>) {
        let record =
            UpdateErrorRecord::from_error(code, err, &self.config.current_version().to_string(), target);
        self.report_error(&record).await;
    }
}
