//! CLI command definitions and dispatch.

pub mod cleanup_locks;
pub mod create;
pub mod detach_images;
pub mod eject_drive;
pub mod mount;
pub mod resize;
pub mod status;
pub mod unmount;
pub mod unmount_all;
pub mod watch_install;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use appvault_common::config::AppVaultConfig;
use appvault_common::guard::CriticalOperations;
use appvault_common::types::{Container, ContainerLayout};
use appvault_core::lock::LockCoordinator;
use appvault_core::process::{CommandRunner, SystemRunner};
use appvault_core::volume::VolumeManager;
use appvault_runtime::autounmount::AutoUnmountTasks;
use appvault_runtime::clock::{Clock, SystemClock};
use appvault_runtime::escalator::UnmountEscalator;
use appvault_runtime::lifecycle::ProcessLifecycle;
use clap::{Parser, Subcommand, ValueEnum};

/// AppVault — per-application data containers on their own disk images.
#[derive(Parser, Debug)]
#[command(name = "avlt", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Path to the JSON configuration file.
    #[arg(long, global = true, env = "APPVAULT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the disk images (overrides the config file).
    #[arg(long, global = true)]
    pub storage_root: Option<PathBuf>,

    /// Directory holding the mount points (overrides the config file).
    #[arg(long, global = true)]
    pub containers_root: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Answer yes to every confirmation prompt.
    #[arg(short, long, global = true)]
    pub yes: bool,
}

/// Log output format.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the disk image for a container.
    Create(create::CreateArgs),
    /// Mount a container's disk image at its mount point.
    Mount(mount::MountArgs),
    /// Unmount one container, escalating with confirmation if it is busy.
    Unmount(unmount::UnmountArgs),
    /// Eject the external drive holding the disk images.
    EjectDrive(eject_drive::EjectDriveArgs),
    /// Show the mount state of containers.
    Status(status::StatusArgs),
    /// Unmount every container, optionally ejecting the storage drive.
    UnmountAll(unmount_all::UnmountAllArgs),
    /// Wait for an application install to finish writing its settings.
    WatchInstall(watch_install::WatchInstallArgs),
    /// Remove lock sentinels left behind by crashed processes.
    CleanupLocks(cleanup_locks::CleanupLocksArgs),
    /// Resize an unmounted disk image.
    Resize(resize::ResizeArgs),
    /// Detach every attached disk image.
    DetachImages(detach_images::DetachImagesArgs),
}

/// Collaborators shared by every command, built once from the configuration.
pub struct Context {
    pub config: AppVaultConfig,
    pub layout: ContainerLayout,
    pub runner: Arc<dyn CommandRunner>,
    pub clock: Arc<dyn Clock>,
    pub volumes: Arc<VolumeManager>,
    pub locks: Arc<LockCoordinator>,
    pub escalator: Arc<UnmountEscalator>,
    pub critical: CriticalOperations,
    pub assume_yes: bool,
}

impl Context {
    fn build(cli: &Cli) -> anyhow::Result<Self> {
        let path = cli
            .config
            .clone()
            .unwrap_or_else(appvault_common::constants::default_config_file);
        let mut config = AppVaultConfig::load(&path)
            .with_context(|| format!("loading configuration from {}", path.display()))?;
        if let Some(root) = &cli.storage_root {
            config.storage_root.clone_from(root);
        }
        if let Some(root) = &cli.containers_root {
            config.containers_root.clone_from(root);
        }
        config.validate()?;
        tracing::debug!(config = %path.display(), storage_root = %config.storage_root.display(), "configuration loaded");

        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let volumes = Arc::new(VolumeManager::new(Arc::clone(&runner), config.clone()));
        let locks = Arc::new(LockCoordinator::new());
        let lifecycle = Arc::new(ProcessLifecycle::new(
            Arc::clone(&runner),
            config.tools.clone(),
            config.watcher.applications_dir.clone(),
        ));
        let escalator = Arc::new(UnmountEscalator::new(
            Arc::clone(&volumes),
            Arc::clone(&locks),
            lifecycle,
            Arc::clone(&clock),
            AutoUnmountTasks::new(),
        ));

        Ok(Self {
            layout: config.layout(),
            config,
            runner,
            clock,
            volumes,
            locks,
            escalator,
            critical: CriticalOperations::new(),
            assume_yes: cli.yes,
        })
    }

    /// Resolves a container key given on the command line.
    pub fn container(&self, key: &str) -> anyhow::Result<Container> {
        Ok(self.layout.resolve(key)?)
    }

    /// Resolves `keys`, or every container with an image when empty.
    pub fn containers(&self, keys: &[String]) -> anyhow::Result<Vec<Container>> {
        if keys.is_empty() {
            return Ok(self.layout.discover()?);
        }
        keys.iter().map(|k| self.container(k)).collect()
    }
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the command
/// fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let ctx = Context::build(&cli)?;
    let runtime = tokio::runtime::Runtime::new().context("starting the async runtime")?;
    runtime.block_on(async {
        match cli.command {
            Command::Create(args) => create::execute(args, &ctx).await,
            Command::Mount(args) => mount::execute(args, &ctx).await,
            Command::Unmount(args) => unmount::execute(args, &ctx).await,
            Command::EjectDrive(args) => eject_drive::execute(args, &ctx).await,
            Command::Status(args) => status::execute(args, &ctx).await,
            Command::UnmountAll(args) => unmount_all::execute(args, &ctx).await,
            Command::WatchInstall(args) => watch_install::execute(args, &ctx).await,
            Command::CleanupLocks(args) => cleanup_locks::execute(args, &ctx),
            Command::Resize(args) => resize::execute(args, &ctx).await,
            Command::DetachImages(args) => detach_images::execute(args, &ctx).await,
        }
    })
}
