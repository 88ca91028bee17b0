//! Command execution for run-command steps.
//!
//! The provisioner never spawns processes itself; it hands an
//! [`Invocation`] to a [`CommandRunner`] and waits for the outcome.
//!
//! - [`ChrootRunner`]: runs inside the image root via `chroot`
//! - [`HostRunner`]: runs on the host with the image root as working directory

mod chroot;
mod host;
mod stream;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use strata_core::error::Result;
use strata_core::{Command, Environment, RunnerKind};

pub use chroot::ChrootRunner;
pub use host::HostRunner;

/// `PATH` used when the image environment does not define one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Exit status conventionally returned by shells for an unknown command.
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// Everything a runner needs to execute one step's command.
#[derive(Debug)]
pub struct Invocation<'a> {
    /// Index of the step being executed
    pub index: usize,
    pub command: &'a Command,
    /// Host directory holding the image filesystem
    pub rootfs: &'a Path,
    /// Working directory inside the image
    pub workdir: &'a str,
    /// Environment the command sees (image env plus build args)
    pub env: &'a Environment,
    /// Suppress streaming of command output
    pub quiet: bool,
}

impl Invocation<'_> {
    /// Image `PATH` entries, falling back to [`DEFAULT_PATH`].
    pub fn search_path(&self) -> Vec<String> {
        let path = self.env.search_path();
        if path.is_empty() {
            DEFAULT_PATH.split(':').map(str::to_string).collect()
        } else {
            path
        }
    }
}

/// Result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, or -1 if terminated by signal
    pub code: i32,
    /// Last lines written to stderr
    pub stderr_tail: String,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Executes run-command steps against the image filesystem.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runner name for logs.
    fn name(&self) -> &'static str;

    /// Resolve an exec-form program on the current filesystem state.
    ///
    /// Returns `None` when the program cannot be found.
    fn resolve(&self, program: &str, invocation: &Invocation<'_>) -> Option<PathBuf>;

    /// Run the command to completion.
    ///
    /// A program that cannot be spawned because it does not exist yields
    /// `ProvisionError::CommandNotFound`. A non-zero exit is not an error at
    /// this level; it is reported through [`ExitOutcome::code`].
    async fn run(&self, invocation: &Invocation<'_>) -> Result<ExitOutcome>;
}

/// Construct the runner for a configured kind.
pub fn runner_for(kind: RunnerKind) -> std::sync::Arc<dyn CommandRunner> {
    match kind {
        RunnerKind::Chroot => std::sync::Arc::new(ChrootRunner::new()),
        RunnerKind::Host => std::sync::Arc::new(HostRunner::new()),
    }
}
