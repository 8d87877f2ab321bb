//! Process liveness, termination, and preference flushing for the
//! applications that own containers.

use std::path::PathBuf;
use std::sync::Arc;

use appvault_common::config::ToolPaths;
use appvault_common::error::Result;
use appvault_common::types::ContainerKey;
use appvault_core::process::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::bundle;

/// How hard to ask an application to quit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationMode {
    /// `SIGTERM`: the application may save state and exit.
    Graceful,
    /// `SIGKILL`.
    Forceful,
}

impl TerminationMode {
    const fn signal(self) -> Signal {
        match self {
            Self::Graceful => Signal::SIGTERM,
            Self::Forceful => Signal::SIGKILL,
        }
    }
}

/// Process control for container-owning applications.
#[async_trait]
pub trait AppLifecycle: Send + Sync {
    /// Whether any process of the application is running.
    ///
    /// # Errors
    ///
    /// Returns an error if liveness cannot be established, e.g. the process
    /// table cannot be read. Callers must not treat that as "not running".
    async fn is_running(&self, key: &ContainerKey) -> Result<bool>;

    /// Signals every process of the application, returning how many were
    /// signalled.
    ///
    /// # Errors
    ///
    /// Returns an error if the process table cannot be read.
    async fn terminate(&self, key: &ContainerKey, mode: TerminationMode) -> Result<usize>;

    /// Flushes the application's cached preferences to disk. Failures are
    /// ignored.
    async fn sync_preferences(&self, key: &ContainerKey);
}

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    /// Process id.
    pub pid: i32,
    /// Full command line.
    pub command: String,
}

/// Parses `ps -axo pid=,command=` output.
#[must_use]
pub fn parse_process_table(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, command) = line.split_once(char::is_whitespace)?;
            Some(ProcessEntry {
                pid: pid.parse().ok()?,
                command: command.trim().to_string(),
            })
        })
        .collect()
}

/// Reads the process table.
///
/// # Errors
///
/// Returns an error if `ps` cannot be run.
pub async fn process_table(runner: &dyn CommandRunner, ps: &std::path::Path) -> Result<Vec<ProcessEntry>> {
    let spec = CommandSpec::new(ps).args(["-axo", "pid=,command="]);
    Ok(parse_process_table(&runner.run(&spec).await?))
}

/// [`AppLifecycle`] over the process table, POSIX signals, and the
/// preferences utility. An application's processes are those executing from
/// its installed bundle.
pub struct ProcessLifecycle {
    runner: Arc<dyn CommandRunner>,
    tools: ToolPaths,
    applications_dir: PathBuf,
}

impl std::fmt::Debug for ProcessLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLifecycle")
            .field("applications_dir", &self.applications_dir)
            .finish_non_exhaustive()
    }
}

impl ProcessLifecycle {
    /// Creates a lifecycle looking up bundles in `applications_dir`.
    pub fn new(runner: Arc<dyn CommandRunner>, tools: ToolPaths, applications_dir: PathBuf) -> Self {
        Self {
            runner,
            tools,
            applications_dir,
        }
    }

    async fn pids(&self, key: &ContainerKey) -> Result<Vec<i32>> {
        let Some(bundle) = bundle::find_installed_bundle(
            self.runner.as_ref(),
            &self.tools.defaults,
            &self.applications_dir,
            key,
        )
        .await
        else {
            return Ok(Vec::new());
        };
        let prefix = format!("{}/", bundle.display());
        let table = process_table(self.runner.as_ref(), &self.tools.ps).await?;
        Ok(table
            .into_iter()
            .filter(|p| p.command.starts_with(&prefix))
            .map(|p| p.pid)
            .collect())
    }
}

#[async_trait]
impl AppLifecycle for ProcessLifecycle {
    async fn is_running(&self, key: &ContainerKey) -> Result<bool> {
        let pids = self.pids(key).await.inspect_err(|e| {
            tracing::warn!(key = %key, error = %e, "process table unavailable");
        })?;
        Ok(!pids.is_empty())
    }

    async fn terminate(&self, key: &ContainerKey, mode: TerminationMode) -> Result<usize> {
        let pids = self.pids(key).await?;
        let mut signalled = 0;
        for pid in pids {
            match kill(Pid::from_raw(pid), mode.signal()) {
                Ok(()) => signalled += 1,
                Err(nix::errno::Errno::ESRCH) => {}
                Err(errno) => tracing::warn!(key = %key, pid, %errno, "signal failed"),
            }
        }
        tracing::info!(key = %key, ?mode, signalled, "terminate requested");
        Ok(signalled)
    }

    async fn sync_preferences(&self, key: &ContainerKey) {
        let spec = CommandSpec::new(&self.tools.defaults).args(["read", key.as_str()]);
        if let Err(e) = self.runner.run(&spec).await {
            tracing::debug!(key = %key, error = %e, "preference sync skipped");
        }
    }
}
