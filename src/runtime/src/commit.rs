//! Freezing a provisioned image to disk.
//!
//! A committed image is a directory holding the filesystem as a single
//! gzip-compressed tarball plus a JSON config:
//!
//! ```text
//! <output>/rootfs.tar.gz
//! <output>/config.json
//! ```
//!
//! The directory is assembled next to its final location and renamed into
//! place, so a failed commit never leaves a partial image behind.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use strata_core::error::{ProvisionError, Result};
use walkdir::WalkDir;

use crate::provision::{HistoryEntry, ImageState};
use crate::snapshot::sha256_file;

/// File name of the filesystem layer.
pub const LAYER_FILE: &str = "rootfs.tar.gz";
/// File name of the image config.
pub const CONFIG_FILE: &str = "config.json";

/// Digest and size of the filesystem layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub file: String,
    /// `sha256:<hex>` of the compressed tarball
    pub digest: String,
    pub size: u64,
}

/// Config written alongside the layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub reference: String,
    pub base: String,
    pub created: DateTime<Utc>,
    /// `KEY=VALUE`, in declaration order
    pub env: Vec<String>,
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exposed_ports: Vec<String>,
    pub history: Vec<HistoryEntry>,
    pub layer: LayerDescriptor,
    /// Timestamp-independent digest of the filesystem
    pub fingerprint: String,
    pub strata_version: String,
}

impl ImageConfig {
    /// Read the config of a committed image directory.
    pub fn load(image_dir: &Path) -> Result<Self> {
        let path = image_dir.join(CONFIG_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ProvisionError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone)]
pub struct CommitResult {
    pub path: PathBuf,
    pub config: ImageConfig,
}

impl ImageState {
    /// Write the image to `output_dir`.
    ///
    /// An existing `output_dir` is replaced only if it holds a previously
    /// committed image.
    pub fn commit(&self, output_dir: &Path, reference: &str) -> Result<CommitResult> {
        if output_dir.exists() && !output_dir.join(CONFIG_FILE).is_file() {
            return Err(ProvisionError::Commit(format!(
                "refusing to overwrite {}: not a strata image",
                output_dir.display()
            )));
        }

        let parent = match output_dir.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|e| {
            ProvisionError::Commit(format!("failed to create {}: {}", parent.display(), e))
        })?;

        let staging = tempfile::Builder::new()
            .prefix(".strata-commit-")
            .tempdir_in(&parent)
            .map_err(|e| ProvisionError::Commit(format!("failed to create staging dir: {}", e)))?;

        let layer_path = staging.path().join(LAYER_FILE);
        write_layer(self.rootfs(), &layer_path)?;
        let size = std::fs::metadata(&layer_path)?.len();
        let digest = sha256_file(&layer_path)?;

        let metadata = self.metadata();
        let config = ImageConfig {
            reference: reference.to_string(),
            base: self.base().to_string(),
            created: Utc::now(),
            env: self.env().to_env_list(),
            working_dir: self.workdir().to_string(),
            labels: metadata.labels.clone(),
            cmd: metadata.cmd.clone(),
            entrypoint: metadata.entrypoint.clone(),
            exposed_ports: metadata.exposed_ports.clone(),
            history: self.history().to_vec(),
            layer: LayerDescriptor {
                file: LAYER_FILE.to_string(),
                digest: format!("sha256:{}", digest),
                size,
            },
            fingerprint: self.fingerprint()?,
            strata_version: strata_core::VERSION.to_string(),
        };
        std::fs::write(
            staging.path().join(CONFIG_FILE),
            serde_json::to_string_pretty(&config)?,
        )?;

        replace_dir(staging.path(), output_dir)?;

        tracing::info!(
            reference,
            path = %output_dir.display(),
            digest = %config.layer.digest,
            size,
            "Committed image"
        );

        Ok(CommitResult {
            path: output_dir.to_path_buf(),
            config,
        })
    }
}

/// Tar and gzip `rootfs` with sorted entries and normalized headers.
///
/// Timestamps and ownership are fixed so the layer digest only depends on
/// content. Permission bits are kept as they are, including setuid, setgid
/// and sticky.
fn write_layer(rootfs: &Path, layer_path: &Path) -> Result<()> {
    let file = File::create(layer_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for entry in WalkDir::new(rootfs)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| ProvisionError::Io(e.into()))?;
        let relative = entry.path().strip_prefix(rootfs).map_err(|e| {
            ProvisionError::Commit(format!("failed to compute layer path: {}", e))
        })?;
        append_entry(&mut builder, entry.path(), relative).map_err(|e| {
            ProvisionError::Commit(format!(
                "failed to add {} to layer: {}",
                relative.display(),
                e
            ))
        })?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| ProvisionError::Commit(format!("failed to finish layer tar: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| ProvisionError::Commit(format!("failed to finish layer gzip: {}", e)))?;
    Ok(())
}

fn append_entry<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    relative: &Path,
) -> std::io::Result<()> {
    let metadata = std::fs::symlink_metadata(path)?;
    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(&metadata, tar::HeaderMode::Deterministic);
    if let Some(mode) = permission_bits(&metadata) {
        header.set_mode(mode);
    }

    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        let target = std::fs::read_link(path)?;
        builder.append_link(&mut header, relative, target)
    } else if file_type.is_file() {
        builder.append_data(&mut header, relative, File::open(path)?)
    } else {
        header.set_size(0);
        builder.append_data(&mut header, relative, std::io::empty())
    }
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn permission_bits(_metadata: &std::fs::Metadata) -> Option<u32> {
    None
}

/// Move `staging` to `target`, swapping out a previous image if present.
fn replace_dir(staging: &Path, target: &Path) -> Result<()> {
    if !target.exists() {
        return std::fs::rename(staging, target).map_err(|e| {
            ProvisionError::Commit(format!("failed to move image into {}: {}", target.display(), e))
        });
    }

    let mut retired = target.as_os_str().to_os_string();
    retired.push(format!(".replaced-{}", std::process::id()));
    let retired = PathBuf::from(retired);

    std::fs::rename(target, &retired)?;
    if let Err(e) = std::fs::rename(staging, target) {
        let _ = std::fs::rename(&retired, target);
        return Err(ProvisionError::Commit(format!(
            "failed to move image into {}: {}",
            target.display(),
            e
        )));
    }
    if let Err(e) = std::fs::remove_dir_all(&retired) {
        tracing::warn!(path = %retired.display(), error = %e, "Failed to remove previous image");
    }
    Ok(())
}

/// Unpack a committed layer into `dest`.
pub fn extract_layer(image_dir: &Path, dest: &Path) -> Result<()> {
    let file = File::open(image_dir.join(LAYER_FILE))?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    archive.set_preserve_permissions(true);
    archive.unpack(dest)?;
    Ok(())
}
