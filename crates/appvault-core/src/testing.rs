//! Scripted [`CommandRunner`] for exercising utility-driven logic without
//! spawning processes.
//!
//! Replies are matched by substring against the command line. Rules are
//! consulted in registration order and one-shot rules are consumed when used,
//! so a `once` rule registered before an `on` rule for the same command
//! answers first and the permanent rule answers afterwards.

use std::sync::{Mutex, PoisonError};

use appvault_common::error::Result;
use async_trait::async_trait;

use crate::process::{CommandOutput, CommandRunner, CommandSpec};

/// Canned reply to a matched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Exit status zero with this standard output.
    Stdout(String),
    /// Non-zero exit with this standard error.
    Fail {
        /// Exit status.
        exit_code: i32,
        /// Standard error.
        stderr: String,
    },
}

impl Reply {
    /// Successful reply.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::Stdout(stdout.into())
    }

    /// Failed reply with exit status 1.
    pub fn fail(stderr: impl Into<String>) -> Self {
        Self::Fail {
            exit_code: 1,
            stderr: stderr.into(),
        }
    }

    fn to_output(&self) -> CommandOutput {
        match self {
            Self::Stdout(stdout) => CommandOutput {
                stdout: stdout.clone(),
                stderr: String::new(),
                exit_code: 0,
            },
            Self::Fail { exit_code, stderr } => CommandOutput {
                stdout: String::new(),
                stderr: stderr.clone(),
                exit_code: *exit_code,
            },
        }
    }
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    reply: Reply,
    remaining: Option<usize>,
}

/// Records every command and answers from registered rules. Unmatched
/// commands fail with exit status 1.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    /// Creates a runner with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every command containing `pattern` with `reply`.
    pub fn on(&self, pattern: impl Into<String>, reply: Reply) -> &Self {
        self.push(pattern.into(), reply, None)
    }

    /// Answers the next command containing `pattern` with `reply`, once.
    pub fn once(&self, pattern: impl Into<String>, reply: Reply) -> &Self {
        self.push(pattern.into(), reply, Some(1))
    }

    fn push(&self, pattern: String, reply: Reply, remaining: Option<usize>) -> &Self {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Rule {
                pattern,
                reply,
                remaining,
            });
        self
    }

    /// Command lines received so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Command lines containing `pattern`, in order.
    pub fn calls_matching(&self, pattern: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.contains(pattern))
            .collect()
    }

    fn answer(&self, line: &str) -> CommandOutput {
        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        let found = rules
            .iter_mut()
            .find(|r| r.remaining != Some(0) && line.contains(&r.pattern));
        match found {
            Some(rule) => {
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                rule.reply.to_output()
            }
            None => Reply::fail(format!("no scripted reply for `{line}`")).to_output(),
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.command_line();
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.clone());
        Ok(self.answer(&line))
    }
}

/// Builds the XML property list `diskutil info -plist` would print for a
/// flat dictionary of string and boolean entries.
#[must_use]
pub fn info_plist(entries: &[(&str, PlistEntry<'_>)]) -> String {
    let mut body = String::new();
    for (key, value) in entries {
        body.push_str(&format!("\t<key>{key}</key>\n"));
        match value {
            PlistEntry::Str(s) => body.push_str(&format!("\t<string>{s}</string>\n")),
            PlistEntry::Bool(true) => body.push_str("\t<true/>\n"),
            PlistEntry::Bool(false) => body.push_str("\t<false/>\n"),
            PlistEntry::Int(n) => body.push_str(&format!("\t<integer>{n}</integer>\n")),
        }
    }
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
         <plist version=\"1.0\">\n<dict>\n{body}</dict>\n</plist>\n"
    )
}

/// Value for [`info_plist`].
#[derive(Debug, Clone, Copy)]
pub enum PlistEntry<'a> {
    /// `<string>`.
    Str(&'a str),
    /// `<true/>` or `<false/>`.
    Bool(bool),
    /// `<integer>`.
    Int(i64),
}
