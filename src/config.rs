// src/config.rs

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::UpdateError;
use crate::version::ReleaseVersion;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl From<ConfigError> for UpdateError {
    fn from(err: ConfigError) -> Self {
        UpdateError::Config(err.to_string())
    }
}

/// Engine configuration. Every field has a default, so a partial TOML file is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub repo_owner: String,
    pub repo_name: String,
    pub api_base_url: String,
    pub product_name: String,
    pub package_extension: String,
    pub update_folder: PathBuf,
    pub current_version: String,
    pub user_agent: String,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Size assumed for the package when the server does not report one.
    pub min_package_size: u64,
    pub disk_space_margin: u64,
    pub manual_disk_space_margin: u64,
    pub low_speed_threshold_mbps: f64,
    pub speed_test_url: String,
    pub progress_interval_ms: u64,
    /// Waits before the 80%, 90% and 95% install checkpoints.
    pub install_step_delays_ms: Vec<u64>,
    pub task_folder: String,
    pub install_task_name: String,
    pub check_task_name: String,
    pub daily_check_hour: u32,
    pub check_argument: String,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        let product_name = "Celerate".to_string();
        let update_folder = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(&product_name)
            .join("Update");
        Self {
            repo_owner: "celerate".to_string(),
            repo_name: "celerate".to_string(),
            api_base_url: "https://api.github.com".to_string(),
            user_agent: format!("{product_name}-Updater/{}", env!("CARGO_PKG_VERSION")),
            product_name,
            package_extension: "msix".to_string(),
            update_folder,
            current_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout_ms: 5 * 60 * 1000,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            min_package_size: 500 * MIB,
            disk_space_margin: 100 * MIB,
            manual_disk_space_margin: 50 * MIB,
            low_speed_threshold_mbps: 1.0,
            speed_test_url: "https://www.google.com/images/branding/googlelogo/1x/googlelogo_color_272x92dp.png"
                .to_string(),
            progress_interval_ms: 100,
            install_step_delays_ms: vec![1000, 2000, 1000],
            task_folder: "\\Celerate".to_string(),
            install_task_name: "CelerateAutoUpdate".to_string(),
            check_task_name: "CelerateUpdateCheck".to_string(),
            daily_check_hour: 9,
            check_argument: "--check-updates".to_string(),
        }
    }
}

impl UpdateConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let config: Self = toml::from_str(&content)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid { field, reason: reason.into() }
        }

        if self.repo_owner.trim().is_empty() {
            return Err(invalid("repo_owner", "must not be empty"));
        }
        if self.repo_name.trim().is_empty() {
            return Err(invalid("repo_name", "must not be empty"));
        }
        if reqwest::Url::parse(&self.api_base_url).is_err() {
            return Err(invalid("api_base_url", format!("not a url: {}", self.api_base_url)));
        }
        if self.product_name.trim().is_empty() {
            return Err(invalid("product_name", "must not be empty"));
        }
        if self.package_extension.trim_start_matches('.').is_empty() {
            return Err(invalid("package_extension", "must not be empty"));
        }
        if self.update_folder.as_os_str().is_empty() {
            return Err(invalid("update_folder", "must not be empty"));
        }
        if self.current_version.parse::<ReleaseVersion>().is_err() {
            return Err(invalid("current_version", format!("not a version: {}", self.current_version)));
        }
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms", "must be positive"));
        }
        if self.progress_interval_ms == 0 {
            return Err(invalid("progress_interval_ms", "must be positive"));
        }
        if !self.low_speed_threshold_mbps.is_finite() || self.low_speed_threshold_mbps < 0.0 {
            return Err(invalid("low_speed_threshold_mbps", "must be a non-negative number"));
        }
        if self.daily_check_hour > 23 {
            return Err(invalid("daily_check_hour", "must be between 0 and 23"));
        }
        Ok(())
    }

    pub fn current_version(&self) -> ReleaseVersion {
        ReleaseVersion::parse_or_default(&self.current_version)
    }

    pub fn package_extension(&self) -> &str {
        self.package_extension.trim_start_matches('.')
    }

    pub fn releases_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/releases",
            self.api_base_url.trim_end_matches('/'),
            self.repo_owner,
            self.repo_name
        )
    }

    pub fn latest_release_url(&self) -> String {
        format!("{}/latest", self.releases_url())
    }

    pub fn release_by_tag_url(&self, version: &str) -> String {
        format!("{}/tags/v{}", self.releases_url(), ReleaseVersion::normalize(version))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn install_step_delays(&self) -> Vec<Duration> {
        self.install_step_delays_ms.iter().copied().map(Duration::from_millis).collect()
    }
}
