// src/scheduler.rs

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Local, NaiveDateTime, NaiveTime, TimeZone, Weekday};
use regex::Regex;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::UpdateConfig;
use crate::platform::install_command;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid schedule request: {0}")]
    InvalidRequest(String),
    #[error("task scheduler command failed: {0}")]
    Command(String),
}

/// When a task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Once(NaiveDateTime),
    Daily(NaiveTime),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAction {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    /// Full task path, e.g. `\Celerate\CelerateAutoUpdate`.
    pub name: String,
    pub description: String,
    pub trigger: Trigger,
    pub action: TaskAction,
}

/// The OS facility that fires tasks later.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Registers `task`, replacing any task of the same name.
    async fn register(&self, task: &ScheduledTask) -> Result<(), SchedulerError>;

    /// Removes the task. Returns `false` if it did not exist.
    async fn delete(&self, name: &str) -> Result<bool, SchedulerError>;

    async fn find(&self, name: &str) -> Result<Option<Trigger>, SchedulerError>;
}

/// Deferred-install and daily-check triggers on top of a [`TaskScheduler`].
pub struct UpdateScheduler {
    backend: Box<dyn TaskScheduler>,
    folder: String,
    install_task: String,
    check_task: String,
    check_time: NaiveTime,
    check_argument: String,
}

impl UpdateScheduler {
    pub fn new(backend: impl TaskScheduler + 'static, config: &UpdateConfig) -> Self {
        Self {
            backend: Box::new(backend),
            folder: config.task_folder.trim_end_matches('\\').to_string(),
            install_task: config.install_task_name.clone(),
            check_task: config.check_task_name.clone(),
            check_time: NaiveTime::from_hms_opt(config.daily_check_hour, 0, 0).unwrap_or_default(),
            check_argument: config.check_argument.clone(),
        }
    }

    fn task_path(&self, name: &str) -> String {
        format!("{}\\{}", self.folder, name)
    }

    /// Registers a one-shot trigger that installs `package` at `at`.
    pub async fn schedule_install(&self, at: DateTime<Local>, package: &Path) -> Result<(), SchedulerError> {
        if !package.is_file() {
            return Err(SchedulerError::InvalidRequest(format!(
                "package does not exist: {}",
                package.display()
            )));
        }
        if at <= Local::now() {
            return Err(SchedulerError::InvalidRequest(format!("{at} is not in the future")));
        }
        let package = tokio::fs::canonicalize(package).await?;
        let (program, args) = install_command(&package);
        let name = self.task_path(&self.install_task);
        self.backend.delete(&name).await?;
        self.backend
            .register(&ScheduledTask {
                name,
                description: "Install a downloaded update".to_string(),
                trigger: Trigger::Once(at.naive_local()),
                action: TaskAction { program, args },
            })
            .await?;
        info!(at = %at, package = %package.display(), "update install scheduled");
        Ok(())
    }

    /// Returns `true` if a scheduled install was removed.
    pub async fn cancel_install(&self) -> Result<bool, SchedulerError> {
        let removed = self.backend.delete(&self.task_path(&self.install_task)).await?;
        if removed {
            info!("scheduled update cancelled");
        }
        Ok(removed)
    }

    /// When the scheduled install will fire, if one is registered.
    pub async fn install_status(&self) -> Result<Option<DateTime<Local>>, SchedulerError> {
        match self.backend.find(&self.task_path(&self.install_task)).await? {
            Some(Trigger::Once(at)) => Ok(Local.from_local_datetime(&at).earliest()),
            _ => Ok(None),
        }
    }

    /// Enables or disables the daily update check.
    pub async fn set_auto_check(&self, enabled: bool, app_path: &Path) -> Result<(), SchedulerError> {
        let name = self.task_path(&self.check_task);
        self.backend.delete(&name).await?;
        if !enabled {
            info!("automatic update check disabled");
            return Ok(());
        }
        self.backend
            .register(&ScheduledTask {
                name,
                description: "Check for application updates".to_string(),
                trigger: Trigger::Daily(self.check_time),
                action: TaskAction {
                    program: app_path.display().to_string(),
                    args: vec![self.check_argument.clone()],
                },
            })
            .await?;
        info!(time = %self.check_time, "automatic update check enabled");
        Ok(())
    }

    pub async fn auto_check_enabled(&self) -> Result<bool, SchedulerError> {
        Ok(self.backend.find(&self.task_path(&self.check_task)).await?.is_some())
    }
}

/// Tomorrow at 01:00, moved to Monday when that falls on a weekend.
pub fn suggest_update_time(now: NaiveDateTime) -> NaiveDateTime {
    let one_am = NaiveTime::from_hms_opt(1, 0, 0).unwrap_or_default();
    let mut day = now.date() + Duration::days(1);
    match day.weekday() {
        Weekday::Sat => day += Duration::days(2),
        Weekday::Sun => day += Duration::days(1),
        _ => {}
    }
    day.and_time(one_am)
}

pub fn suggest_update_time_local() -> DateTime<Local> {
    let now = Local::now();
    let suggestion = suggest_update_time(now.naive_local());
    Local
        .from_local_datetime(&suggestion)
        .earliest()
        .unwrap_or_else(|| now + Duration::days(1))
}

/// `schtasks.exe` backed scheduler.
#[derive(Debug, Clone)]
pub struct SchtasksScheduler {
    work_dir: PathBuf,
}

impl SchtasksScheduler {
    /// `work_dir` holds the temporary task definitions handed to `schtasks /XML`.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self { work_dir: work_dir.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, SchedulerError> {
        debug!(?args, "schtasks");
        Ok(Command::new("schtasks.exe").args(args).output().await?)
    }
}

#[async_trait]
impl TaskScheduler for SchtasksScheduler {
    async fn register(&self, task: &ScheduledTask) -> Result<(), SchedulerError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let xml_path = self.work_dir.join(format!("task_{}.xml", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&xml_path, utf16_with_bom(&task_xml(task))).await?;
        let xml_arg = xml_path.display().to_string();
        let output = self.run(&["/Create", "/TN", &task.name, "/XML", &xml_arg, "/F"]).await;
        let _ = tokio::fs::remove_file(&xml_path).await;
        let output = output?;
        if !output.status.success() {
            return Err(SchedulerError::Command(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool, SchedulerError> {
        if self.find(name).await?.is_none() {
            return Ok(false);
        }
        let output = self.run(&["/Delete", "/TN", name, "/F"]).await?;
        if !output.status.success() {
            return Err(SchedulerError::Command(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }
        Ok(true)
    }

    async fn find(&self, name: &str) -> Result<Option<Trigger>, SchedulerError> {
        let output = self.run(&["/Query", "/TN", name, "/XML"]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_trigger(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn start_boundary_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"<StartBoundary>(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})").expect("valid start boundary regex")
    })
}

/// Reads the trigger back from an exported task definition.
pub fn parse_trigger(xml: &str) -> Option<Trigger> {
    let start = start_boundary_regex()
        .captures(xml)
        .and_then(|c| c.get(1))
        .and_then(|m| NaiveDateTime::parse_from_str(m.as_str(), "%Y-%m-%dT%H:%M:%S").ok())?;
    if xml.contains("<ScheduleByDay>") {
        Some(Trigger::Daily(start.time()))
    } else {
        Some(Trigger::Once(start))
    }
}

fn escape_xml(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn quote_arg(arg: &str) -> String {
    if arg.contains(' ') && !arg.starts_with('"') {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Task Scheduler 1.2 definition for `task`.
pub fn task_xml(task: &ScheduledTask) -> String {
    let trigger = match task.trigger {
        Trigger::Once(at) => format!(
            "    <TimeTrigger>\n      <StartBoundary>{}</StartBoundary>\n      <Enabled>true</Enabled>\n    </TimeTrigger>",
            at.format("%Y-%m-%dT%H:%M:%S")
        ),
        Trigger::Daily(time) => {
            let start = Local::now().date_naive().and_time(time);
            format!(
                "    <CalendarTrigger>\n      <StartBoundary>{}</StartBoundary>\n      <Enabled>true</Enabled>\n      <ScheduleByDay>\n        <DaysInterval>1</DaysInterval>\n      </ScheduleByDay>\n    </CalendarTrigger>",
                start.format("%Y-%m-%dT%H:%M:%S")
            )
        }
    };
    let args = task.action.args.iter().map(|a| quote_arg(a)).collect::<Vec<_>>().join(" ");
    format!(
        r#"<?xml version="1.0" encoding="UTF-16"?>
<Task version="1.2" xmlns="http://schemas.microsoft.com/windows/2004/02/mit/task">
  <RegistrationInfo>
    <Description>{description}</Description>
  </RegistrationInfo>
  <Triggers>
{trigger}
  </Triggers>
  <Settings>
    <DisallowStartIfOnBatteries>false</DisallowStartIfOnBatteries>
    <RunOnlyIfNetworkAvailable>true</RunOnlyIfNetworkAvailable>
    <ExecutionTimeLimit>PT0S</ExecutionTimeLimit>
  </Settings>
  <Actions Context="Author">
    <Exec>
      <Command>{program}</Command>
      <Arguments>{args}</Arguments>
    </Exec>
  </Actions>
</Task>
"#,
        description = escape_xml(&task.description),
        program = escape_xml(&task.action.program),
        args = escape_xml(&args),
    )
}

fn utf16_with_bom(text: &str) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xFE];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}
