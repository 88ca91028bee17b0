//! Provisioning steps.
//!
//! A step is one ordered unit of work applied to the image filesystem.
//! Steps always depend on every step before them; there is no way to
//! declare a step that may run early or in parallel.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The two kinds of step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    CopyFile,
    RunCommand,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CopyFile => write!(f, "copy-file"),
            Self::RunCommand => write!(f, "run-command"),
        }
    }
}

/// A command invocation, in shell or exec form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    /// Run through `/bin/sh -c`
    Shell(String),
    /// Executed directly; the first element is the program
    Exec(Vec<String>),
}

impl Command {
    /// The program that has to be resolvable for this command to run.
    ///
    /// For shell form this is the first word of the script, which is only
    /// used for error reporting since the shell does its own lookup.
    pub fn program(&self) -> &str {
        match self {
            Self::Shell(script) => script.split_whitespace().next().unwrap_or(""),
            Self::Exec(argv) => argv.first().map(String::as_str).unwrap_or(""),
        }
    }

    /// Full argv to execute inside the image.
    pub fn argv(&self) -> Vec<String> {
        match self {
            Self::Shell(script) => vec!["/bin/sh".to_string(), "-c".to_string(), script.clone()],
            Self::Exec(argv) => argv.clone(),
        }
    }

    pub fn is_shell(&self) -> bool {
        matches!(self, Self::Shell(_))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(script) => write!(f, "{}", script),
            Self::Exec(argv) => write!(f, "{}", argv.join(" ")),
        }
    }
}

/// A single provisioning step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Step {
    /// Copy a file or directory from the build context into the image.
    CopyFile {
        /// Path relative to the build context
        source: String,
        /// Image path; relative paths resolve against the working directory
        destination: String,
        /// Permission bits applied to the copied file
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
    },
    /// Run a command against the image filesystem.
    RunCommand {
        command: Command,
        /// Image paths that must exist once the command has exited 0
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        verify: Vec<String>,
        /// Overrides the provisioner's per-step timeout
        #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_secs")]
        timeout: Option<Duration>,
    },
}

impl Step {
    pub fn copy(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Step::CopyFile {
            source: source.into(),
            destination: destination.into(),
            mode: None,
        }
    }

    /// Shell-form run-command step.
    pub fn run(script: impl Into<String>) -> Self {
        Step::RunCommand {
            command: Command::Shell(script.into()),
            verify: Vec::new(),
            timeout: None,
        }
    }

    /// Exec-form run-command step.
    pub fn exec<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Step::RunCommand {
            command: Command::Exec(argv.into_iter().map(Into::into).collect()),
            verify: Vec::new(),
            timeout: None,
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Step::CopyFile { .. } => StepKind::CopyFile,
            Step::RunCommand { .. } => StepKind::RunCommand,
        }
    }

    /// Recipe-style one-line description, used for history and progress.
    pub fn describe(&self) -> String {
        match self {
            Step::CopyFile {
                source,
                destination,
                mode: Some(mode),
            } => format!("COPY --chmod={:o} {} {}", mode, source, destination),
            Step::CopyFile {
                source,
                destination,
                mode: None,
            } => format!("COPY {} {}", source, destination),
            Step::RunCommand { command, .. } => format!("RUN {}", command),
        }
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
