use std::path::PathBuf;

use thiserror::Error;

use crate::step::StepKind;

/// Strata provisioning error types.
///
/// Every variant is fatal to a provisioning run. Step failures carry the
/// 0-based index of the failing step within the step list.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// A copy-file source is absent from the build context
    #[error("step {index} (copy-file): source not found: {path} (in context {})", context.display())]
    SourceNotFound {
        index: usize,
        path: String,
        context: PathBuf,
    },

    /// A copy-file destination could not be written
    #[error("step {index} (copy-file): destination {path} is not writable: {reason}")]
    DestinationUnwritable {
        index: usize,
        path: String,
        reason: String,
    },

    /// A run-command subprocess exited with a non-zero status
    #[error("step {index} (run-command): `{command}` failed (exit {status})")]
    CommandFailed {
        index: usize,
        command: String,
        status: i32,
        stderr: String,
    },

    /// The command binary could not be resolved on the image filesystem
    #[error("step {index} (run-command): command not found: {program}")]
    CommandNotFound { index: usize, program: String },

    /// A run-command step exceeded its time limit
    #[error("step {index} (run-command): `{command}` timed out after {secs}s")]
    Timeout {
        index: usize,
        command: String,
        secs: u64,
    },

    /// A run-command step succeeded but an expected path is missing
    #[error("step {index} (run-command): expected {path} to exist after the command")]
    VerificationFailed { index: usize, path: String },

    /// Recipe could not be parsed
    #[error("recipe line {line}: {message}")]
    Recipe { line: usize, message: String },

    /// Base image is not present in the image store
    #[error("base image not found: {0}")]
    BaseImageNotFound(String),

    /// Malformed image reference
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// The command runner itself is unavailable or misconfigured
    #[error("runner error: {0}")]
    Runner(String),

    /// Writing the final image failed
    #[error("commit failed: {0}")]
    Commit(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ProvisionError {
    /// Index of the failing step, if this error came from a step.
    pub fn step_index(&self) -> Option<usize> {
        match self {
            Self::SourceNotFound { index, .. }
            | Self::DestinationUnwritable { index, .. }
            | Self::CommandFailed { index, .. }
            | Self::CommandNotFound { index, .. }
            | Self::Timeout { index, .. }
            | Self::VerificationFailed { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Kind of the failing step, if this error came from a step.
    pub fn step_kind(&self) -> Option<StepKind> {
        match self {
            Self::SourceNotFound { .. } | Self::DestinationUnwritable { .. } => {
                Some(StepKind::CopyFile)
            }
            Self::CommandFailed { .. }
            | Self::CommandNotFound { .. }
            | Self::Timeout { .. }
            | Self::VerificationFailed { .. } => Some(StepKind::RunCommand),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ProvisionError {
    fn from(err: serde_json::Error) -> Self {
        ProvisionError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProvisionError {
    fn from(err: serde_yaml::Error) -> Self {
        ProvisionError::Serialization(err.to_string())
    }
}

/// Result type alias for strata operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_not_found_display() {
        let error = ProvisionError::SourceNotFound {
            index: 0,
            path: "a.sh".to_string(),
            context: PathBuf::from("/ctx"),
        };
        assert_eq!(
            error.to_string(),
            "step 0 (copy-file): source not found: a.sh (in context /ctx)"
        );
    }

    #[test]
    fn test_command_failed_display() {
        let error = ProvisionError::CommandFailed {
            index: 1,
            command: "make -j4".to_string(),
            status: 2,
            stderr: "boom".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "step 1 (run-command): `make -j4` failed (exit 2)"
        );
    }

    #[test]
    fn test_command_not_found_display() {
        let error = ProvisionError::CommandNotFound {
            index: 0,
            program: "install-missing-tool".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "step 0 (run-command): command not found: install-missing-tool"
        );
    }

    #[test]
    fn test_timeout_display() {
        let error = ProvisionError::Timeout {
            index: 3,
            command: "sleep 100".to_string(),
            secs: 5,
        };
        assert_eq!(
            error.to_string(),
            "step 3 (run-command): `sleep 100` timed out after 5s"
        );
    }

    #[test]
    fn test_recipe_error_display() {
        let error = ProvisionError::Recipe {
            line: 4,
            message: "unknown instruction 'FOO'".to_string(),
        };
        assert_eq!(error.to_string(), "recipe line 4: unknown instruction 'FOO'");
    }

    #[test]
    fn test_step_index_and_kind() {
        let error = ProvisionError::DestinationUnwritable {
            index: 2,
            path: "/usr/bin/x".to_string(),
            reason: "permission denied".to_string(),
        };
        assert_eq!(error.step_index(), Some(2));
        assert_eq!(error.step_kind(), Some(StepKind::CopyFile));

        let error = ProvisionError::VerificationFailed {
            index: 5,
            path: "/usr/lib/libtvm.so".to_string(),
        };
        assert_eq!(error.step_index(), Some(5));
        assert_eq!(error.step_kind(), Some(StepKind::RunCommand));
    }

    #[test]
    fn test_non_step_errors_have_no_index() {
        let error = ProvisionError::BaseImageNotFound("ubuntu:18.04".to_string());
        assert_eq!(error.step_index(), None);
        assert_eq!(error.step_kind(), None);
        assert_eq!(error.to_string(), "base image not found: ubuntu:18.04");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: ProvisionError = io_error.into();
        assert!(matches!(error, ProvisionError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let error: ProvisionError = result.unwrap_err().into();
        assert!(matches!(error, ProvisionError::Serialization(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: ProvisionError = result.unwrap_err().into();
        assert!(matches!(error, ProvisionError::Serialization(_)));
    }
}
