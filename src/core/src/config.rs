use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{ProvisionError, Result};

/// File name looked up in the build context when no config is given.
pub const CONFIG_FILE_NAME: &str = "strata.yaml";

/// Environment variable overriding the image store location.
pub const ENV_IMAGE_STORE: &str = "STRATA_IMAGE_STORE";

/// Environment variable overriding the runner.
pub const ENV_RUNNER: &str = "STRATA_RUNNER";

/// Strata configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    /// Local base image store (default: ~/.strata/images)
    pub image_store: PathBuf,

    /// How run-command steps are executed
    pub runner: RunnerKind,

    /// Per-step time limit in seconds (None = unlimited)
    pub step_timeout_secs: Option<u64>,

    /// Default build arguments, overridden by `--build-arg`
    pub build_args: HashMap<String, String>,

    /// Where intermediate build workspaces are created (default: system temp dir)
    pub workspace_root: Option<PathBuf>,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            image_store: default_image_store(),
            runner: RunnerKind::default(),
            step_timeout_secs: None,
            build_args: HashMap::new(),
            workspace_root: None,
        }
    }
}

impl StrataConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProvisionError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load `strata.yaml` from the build context if present, otherwise defaults.
    pub fn discover(context_dir: &Path) -> Result<Self> {
        let candidate = context_dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            tracing::debug!(path = %candidate.display(), "Loading config");
            Self::from_file(&candidate)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `STRATA_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(store) = lookup(ENV_IMAGE_STORE).filter(|s| !s.is_empty()) {
            self.image_store = PathBuf::from(store);
        }
        if let Some(runner) = lookup(ENV_RUNNER).filter(|s| !s.is_empty()) {
            self.runner = runner.parse().map_err(ProvisionError::Config)?;
        }
        Ok(())
    }
}

/// Default image store location: `~/.strata/images`.
pub fn default_image_store() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".strata"))
        .unwrap_or_else(|| PathBuf::from(".strata"))
        .join("images")
}

/// Command runner selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    /// Run commands inside the image root with `chroot`
    Chroot,
    /// Run commands on the host with the image root as working directory
    Host,
}

impl Default for RunnerKind {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            Self::Chroot
        } else {
            Self::Host
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chroot => write!(f, "chroot"),
            Self::Host => write!(f, "host"),
        }
    }
}

impl FromStr for RunnerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "chroot" => Ok(Self::Chroot),
            "host" => Ok(Self::Host),
            _ => Err(format!("unknown runner: '{}' (supported: chroot, host)", s)),
        }
    }
}
