pub mod changelog;
pub mod config;
pub mod downloader;
pub mod error;
pub mod http;
pub mod integrity;
pub mod models;
pub mod network;
pub mod orchestrator;
pub mod platform;
pub mod reporter;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod version;

/// Convenient re-exports of the types most callers need.
pub mod prelude {
    pub use crate::changelog::ChangelogInfo;
    pub use crate::config::UpdateConfig;
    pub use crate::downloader::{DownloadError, Downloader};
    pub use crate::error::{ErrorKind, UpdateError, UpdateResult};
    pub use crate::models::{
        DownloadProgress, NetworkStatus, ScheduleOutcome, UpdateCheck, UpdateOutcome, UpdateState,
    };
    pub use crate::orchestrator::UpdateOrchestrator;
    pub use crate::platform::{AppLifecycle, DiskSpace, FilePicker, PackageInstaller};
    pub use crate::scheduler::{SchtasksScheduler, UpdateScheduler};
    pub use crate::session::{TransferControl, UpdateProgress, UpdateSession};
    pub use crate::version::ReleaseVersion;
}
