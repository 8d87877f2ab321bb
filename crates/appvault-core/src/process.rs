//! Asynchronous execution of external utilities.
//!
//! Every invocation goes through a [`CommandRunner`] so that the volume,
//! escalation, and watcher logic can be driven by a scripted runner in tests.

use std::fmt;
use std::path::{Path, PathBuf};

use appvault_common::error::{Result, VaultError};
use async_trait::async_trait;

/// A fully described utility invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Absolute path of the program.
    pub program: PathBuf,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Working directory, inherited when `None`.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Starts a spec for `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends a path argument.
    #[must_use]
    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy())
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program and arguments joined by spaces, for logs and errors.
    #[must_use]
    pub fn command_line(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit status; `-1` when the process was killed by a signal.
    pub exit_code: i32,
}

impl CommandOutput {
    /// Whether the command exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the command to completion and returns whatever it produced,
    /// regardless of exit status.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Spawn`] if the program cannot be started.
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Runs the command and returns its standard output on exit status zero.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::CommandFailed`] carrying the full command line,
    /// exit status, and standard error on non-zero exit.
    async fn run(&self, spec: &CommandSpec) -> Result<String> {
        let output = self.output(spec).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(VaultError::CommandFailed {
                command: spec.command_line(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs commands as real child processes on the tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        tracing::debug!(command = %spec, "running");
        let mut cmd = tokio::process::Command::new(&spec.program);
        let _ = cmd.args(&spec.args).kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            let _ = cmd.current_dir(dir);
        }
        for (k, v) in &spec.env {
            let _ = cmd.env(k, v);
        }
        let output = cmd.output().await.map_err(|e| VaultError::Spawn {
            program: spec.program.display().to_string(),
            source: e,
        })?;
        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        };
        if !result.success() {
            tracing::debug!(command = %spec, exit_code = result.exit_code, "command failed");
        }
        Ok(result)
    }
}
