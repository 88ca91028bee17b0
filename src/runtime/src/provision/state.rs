//! Accumulated image state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_core::error::Result;
use strata_core::{BaseImage, Environment};
use tempfile::TempDir;

use crate::snapshot;

/// Runtime metadata carried into the committed image config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exposed_ports: Vec<String>,
}

/// One applied instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Recipe-style description, e.g. `RUN make install`
    pub created_by: String,
    /// Step index, for copy-file and run-command entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    /// Number of filesystem paths added, modified or removed
    #[serde(default)]
    pub changed: usize,
}

impl HistoryEntry {
    pub(crate) fn step(index: usize, created_by: String, changed: usize) -> Self {
        Self {
            created_by,
            step: Some(index),
            changed,
        }
    }

    pub(crate) fn config(created_by: String) -> Self {
        Self {
            created_by,
            step: None,
            changed: 0,
        }
    }
}

/// The image under construction.
///
/// Owns a private workspace directory holding the image filesystem. Each
/// step mutates it in place; nothing is ever rolled back. The workspace is
/// deleted when the state is dropped, so a failed run leaves nothing behind.
#[derive(Debug)]
pub struct ImageState {
    workspace: TempDir,
    rootfs: PathBuf,
    pub(crate) base: BaseImage,
    pub(crate) env: Environment,
    pub(crate) workdir: String,
    pub(crate) metadata: ImageMetadata,
    pub(crate) history: Vec<HistoryEntry>,
}

impl ImageState {
    /// Create an empty state with a fresh workspace under `workspace_root`
    /// (or the system temp directory).
    pub(crate) fn create(base: BaseImage, workspace_root: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("strata-");
        let workspace = match workspace_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        let rootfs = workspace.path().join("rootfs");
        std::fs::create_dir_all(&rootfs)?;

        Ok(Self {
            workspace,
            rootfs,
            base,
            env: Environment::new(),
            workdir: "/".to_string(),
            metadata: ImageMetadata::default(),
            history: Vec::new(),
        })
    }

    /// Host directory holding the image filesystem.
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    pub fn base(&self) -> &BaseImage {
        &self.base
    }

    /// Resolved environment, in declaration order.
    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn metadata(&self) -> &ImageMetadata {
        &self.metadata
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Number of copy-file and run-command steps applied.
    pub fn steps_applied(&self) -> usize {
        self.history.iter().filter(|h| h.step.is_some()).count()
    }

    /// Content digest of the image filesystem, independent of timestamps.
    pub fn fingerprint(&self) -> Result<String> {
        snapshot::fingerprint(&self.rootfs)
    }
}
