// src/main.rs

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use update_engine::changelog;
use update_engine::platform::PathPicker;
use update_engine::prelude::*;
use update_engine::scheduler::suggest_update_time_local;

#[derive(Parser, Debug)]
#[command(name = "update-engine", version, about = "Checks for, downloads and installs application updates")]
struct Cli {
    /// TOML configuration file. Missing files fall back to the defaults.
    #[arg(long, short, global = true, env = "UPDATE_ENGINE_CONFIG", default_value = "update-engine.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Argument passed by the daily check task; runs `update`.
    #[arg(long, hide = true)]
    check_updates: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report whether a newer release is available.
    Check,
    /// Download and install the latest release.
    Update,
    /// Continue an interrupted download.
    Resume,
    /// Install a package file from disk.
    Install { path: PathBuf },
    /// Show release notes.
    Changelog {
        /// Release version, latest when omitted.
        #[arg(long)]
        release: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Download the latest package now and install it later.
    Schedule {
        /// Local time as `YYYY-MM-DD HH:MM`. Defaults to the next weekday at 01:00.
        #[arg(long)]
        at: Option<String>,
    },
    /// Remove the scheduled install.
    Unschedule,
    /// Show when the scheduled install will run.
    ScheduleStatus,
    /// Enable or disable the daily update check.
    AutoCheck {
        #[arg(long)]
        disable: bool,
    },
    /// Assess the current network connection.
    Network,
    /// Verify a file against a digest, or against `<file>.sha256` when none is given.
    Verify { path: PathBuf, digest: Option<String> },
    /// Delete downloaded packages and backups.
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let config = UpdateConfig::load(&cli.config)
        .await
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let scheduler = UpdateScheduler::new(SchtasksScheduler::new(config.update_folder.join("tasks")), &config);
    let orchestrator = UpdateOrchestrator::new(config)?;

    let command = match (cli.command, cli.check_updates) {
        (Some(command), _) => command,
        (None, true) => Command::Update,
        (None, false) => Command::Check,
    };

    match command {
        Command::Check => {
            let check = orchestrator.check_for_update_availability().await;
            if check.update_available {
                println!("Update available: {} -> {}", check.current_version, check.latest_version);
            } else {
                println!("Up to date ({})", check.current_version);
            }
        }
        Command::Update => {
            let session = Arc::new(UpdateSession::new());
            let outcome = run_with_progress(&session, orchestrator.check_for_updates(&session)).await;
            report(outcome)?;
        }
        Command::Resume => {
            let session = Arc::new(UpdateSession::new());
            let outcome = run_with_progress(&session, orchestrator.resume_download(&session)).await;
            report(outcome)?;
        }
        Command::Install { path } => {
            let session = Arc::new(UpdateSession::new());
            let picker = PathPicker(Some(path));
            let outcome = run_with_progress(&session, orchestrator.manual_update(&session, &picker)).await;
            report(outcome)?;
        }
        Command::Changelog { release, json } => {
            let info = orchestrator.get_changelog(release.as_deref()).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else if info.is_empty() && info.raw_text.is_empty() {
                println!("No release notes found");
            } else {
                print!("{}", changelog::to_markdown(&info));
            }
        }
        Command::Schedule { at } => {
            let at = match at {
                Some(text) => parse_local_time(&text)?,
                None => suggest_update_time_local(),
            };
            match orchestrator.schedule_update(&scheduler, at).await? {
                ScheduleOutcome::NoUpdate => println!("No update to schedule"),
                ScheduleOutcome::Scheduled { package, at } => {
                    println!("{} will be installed at {}", package.display(), at.format("%Y-%m-%d %H:%M"));
                }
            }
        }
        Command::Unschedule => {
            if scheduler.cancel_install().await? {
                println!("Scheduled update removed");
            } else {
                println!("No update was scheduled");
            }
        }
        Command::ScheduleStatus => match scheduler.install_status().await? {
            Some(at) => println!("Update scheduled for {}", at.format("%Y-%m-%d %H:%M")),
            None => println!("No update scheduled"),
        },
        Command::AutoCheck { disable } => {
            let exe = std::env::current_exe().context("locating the running executable")?;
            scheduler.set_auto_check(!disable, &exe).await?;
            println!("Daily update check {}", if disable { "disabled" } else { "enabled" });
        }
        Command::Network => {
            let status = orchestrator.check_network_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Verify { path, digest } => {
            let ok = match digest {
                Some(digest) => orchestrator.verify_file_integrity(&path, &digest).await,
                None => {
                    let mut sidecar = path.clone().into_os_string();
                    sidecar.push(".sha256");
                    update_engine::integrity::verify_with_hash_file(&path, &PathBuf::from(sidecar)).await?
                }
            };
            if !ok {
                bail!("{} does not match the expected digest", path.display());
            }
            println!("{} verified", path.display());
        }
        Command::Clean => {
            let removed = orchestrator.clean_update_files().await;
            println!("Removed {removed} file(s)");
        }
    }
    Ok(())
}

/// Runs a workflow while echoing its progress and cancelling it on Ctrl-C.
async fn run_with_progress<F>(session: &Arc<UpdateSession>, workflow: F) -> UpdateOutcome
where
    F: std::future::Future<Output = UpdateOutcome>,
{
    let mut progress = session.subscribe();
    let printer = tokio::spawn(async move {
        let mut last = String::new();
        while progress.changed().await.is_ok() {
            let snapshot = progress.borrow_and_update().clone();
            if snapshot.status != last {
                eprintln!("{:>5.1}%  {}", snapshot.percentage, snapshot.status);
                last = snapshot.status;
            }
        }
    });

    let cancel = Arc::clone(session);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            cancel.cancel();
        }
    });

    let outcome = workflow.await;
    interrupt.abort();
    printer.abort();
    outcome
}

fn report(outcome: UpdateOutcome) -> Result<()> {
    match outcome {
        UpdateOutcome::UpToDate { current } => println!("Up to date ({current})"),
        UpdateOutcome::Installed { package, .. } => println!("Installer started for {}", package.display()),
        UpdateOutcome::Cancelled => info!("update cancelled"),
        UpdateOutcome::Failed { kind, message } => bail!("{kind:?}: {message}"),
    }
    Ok(())
}

fn parse_local_time(text: &str) -> Result<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%d %H:%M")
        .with_context(|| format!("expected YYYY-MM-DD HH:MM, got {text:?}"))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .with_context(|| format!("{text} does not exist in the local time zone"))
}
