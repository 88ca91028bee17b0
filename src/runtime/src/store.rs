//! Local base-image store.
//!
//! Base images are plain directory trees on disk:
//!
//! ```text
//! <root>/<name>/<tag>/rootfs/      image filesystem
//! <root>/<name>/<tag>/image.json   environment and working directory
//! ```
//!
//! A finished build can be installed back into the store so later recipes
//! can start `FROM` it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::error::{ProvisionError, Result};
use strata_core::BaseImage;
use walkdir::WalkDir;

use crate::fs::copy_tree;
use crate::provision::ImageState;

const ROOTFS_DIR: &str = "rootfs";
const IMAGE_FILE: &str = "image.json";

/// Configuration inherited from a base image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseImageConfig {
    /// `KEY=VALUE` entries
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// When the image was installed into the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed: Option<DateTime<Utc>>,
}

/// Supplies the starting filesystem for a provisioning run.
#[async_trait]
pub trait BaseImageSource: Send + Sync {
    /// Populate `rootfs` with the image's filesystem and return its config.
    ///
    /// `rootfs` is an existing, empty directory.
    async fn materialize(&self, image: &BaseImage, rootfs: &Path) -> Result<BaseImageConfig>;
}

/// An image present in the store.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub image: BaseImage,
    pub path: PathBuf,
    pub config: BaseImageConfig,
}

/// Directory-backed image store.
#[derive(Debug, Clone)]
pub struct LocalImageStore {
    root: PathBuf,
}

impl LocalImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn image_dir(&self, image: &BaseImage) -> PathBuf {
        self.root.join(&image.name).join(&image.tag)
    }

    /// Look up an image without copying it.
    pub fn get(&self, image: &BaseImage) -> Result<Option<StoredImage>> {
        let dir = self.image_dir(image);
        if !dir.join(ROOTFS_DIR).is_dir() {
            return Ok(None);
        }
        let config = read_config(&dir)?;
        Ok(Some(StoredImage {
            image: image.clone(),
            path: dir,
            config,
        }))
    }

    /// Register a provisioned image as a future base image.
    ///
    /// Replaces any image already stored under the same reference.
    pub fn install(&self, image: &BaseImage, state: &ImageState) -> Result<StoredImage> {
        if image.is_scratch() {
            return Err(ProvisionError::InvalidReference(
                "scratch is reserved and cannot be installed".to_string(),
            ));
        }

        let dir = self.image_dir(image);
        let parent = dir.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(parent).map_err(|e| {
            ProvisionError::Commit(format!(
                "failed to create image store directory {}: {}",
                parent.display(),
                e
            ))
        })?;

        let staging = tempfile::Builder::new()
            .prefix(".install-")
            .tempdir_in(parent)?;
        copy_tree(state.rootfs(), &staging.path().join(ROOTFS_DIR))?;

        let config = BaseImageConfig {
            env: state.env().to_env_list(),
            working_dir: Some(state.workdir().to_string()),
            installed: Some(Utc::now()),
        };
        std::fs::write(
            staging.path().join(IMAGE_FILE),
            serde_json::to_string_pretty(&config)?,
        )?;

        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::rename(staging.path(), &dir).map_err(|e| {
            ProvisionError::Commit(format!("failed to install {}: {}", image, e))
        })?;

        tracing::info!(image = %image, path = %dir.display(), "Installed image");

        Ok(StoredImage {
            image: image.clone(),
            path: dir,
            config,
        })
    }

    /// All images in the store, sorted by reference.
    pub fn list(&self) -> Result<Vec<StoredImage>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut images = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(2).follow_links(false) {
            let entry = entry.map_err(|e| ProvisionError::Io(e.into()))?;
            if entry.file_name() != IMAGE_FILE || !entry.file_type().is_file() {
                continue;
            }
            let Some(dir) = entry.path().parent() else {
                continue;
            };
            if !dir.join(ROOTFS_DIR).is_dir() {
                continue;
            }

            let Ok(relative) = dir.strip_prefix(&self.root) else {
                continue;
            };
            let Some(tag) = relative.file_name().map(|t| t.to_string_lossy().to_string()) else {
                continue;
            };
            let Some(name) = relative.parent().map(|n| n.to_string_lossy().replace('\\', "/"))
            else {
                continue;
            };
            // Dot-prefixed directories are in-progress installs.
            if name.is_empty() || tag.starts_with('.') || name.split('/').any(|c| c.starts_with('.')) {
                continue;
            }

            match read_config(dir) {
                Ok(config) => images.push(StoredImage {
                    image: BaseImage::new(name, tag),
                    path: dir.to_path_buf(),
                    config,
                }),
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "Skipping unreadable image");
                }
            }
        }

        images.sort_by_key(|i| i.image.to_string());
        Ok(images)
    }
}

#[async_trait]
impl BaseImageSource for LocalImageStore {
    async fn materialize(&self, image: &BaseImage, rootfs: &Path) -> Result<BaseImageConfig> {
        if image.is_scratch() {
            return Ok(BaseImageConfig::default());
        }

        let stored = self
            .get(image)?
            .ok_or_else(|| ProvisionError::BaseImageNotFound(image.to_string()))?;

        let count = copy_tree(&stored.path.join(ROOTFS_DIR), rootfs)?;
        tracing::debug!(image = %image, entries = count, "Materialized base image");

        Ok(stored.config)
    }
}

fn read_config(dir: &Path) -> Result<BaseImageConfig> {
    let path = dir.join(IMAGE_FILE);
    if !path.exists() {
        return Ok(BaseImageConfig::default());
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed(store: &Path, name: &str, tag: &str, env: &[&str]) {
        let dir = store.join(name).join(tag);
        std::fs::create_dir_all(dir.join("rootfs/bin")).unwrap();
        std::fs::write(dir.join("rootfs/bin/sh"), "").unwrap();
        let config = BaseImageConfig {
            env: env.iter().map(|s| s.to_string()).collect(),
            working_dir: Some("/".to_string()),
            installed: None,
        };
        std::fs::write(dir.join("image.json"), serde_json::to_string(&config).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_materialize_copies_rootfs_and_config() {
        let root = TempDir::new().unwrap();
        seed(root.path(), "ubuntu", "22.04", &["PATH=/usr/bin:/bin"]);
        let store = LocalImageStore::new(root.path());

        let target = TempDir::new().unwrap();
        let config = store
            .materialize(&BaseImage::new("ubuntu", "22.04"), target.path())
            .await
            .unwrap();

        assert!(target.path().join("bin/sh").exists());
        assert_eq!(config.env, vec!["PATH=/usr/bin:/bin"]);
    }

    #[tokio::test]
    async fn test_materialize_scratch_is_empty() {
        let root = TempDir::new().unwrap();
        let store = LocalImageStore::new(root.path());
        let target = TempDir::new().unwrap();

        let config = store
            .materialize(&BaseImage::scratch(), target.path())
            .await
            .unwrap();

        assert!(config.env.is_empty());
        assert_eq!(std::fs::read_dir(target.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_materialize_missing_image() {
        let root = TempDir::new().unwrap();
        let store = LocalImageStore::new(root.path());
        let target = TempDir::new().unwrap();

        let err = store
            .materialize(&BaseImage::new("ubuntu", "22.04"), target.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::BaseImageNotFound(ref r) if r == "ubuntu:22.04"));
    }

    #[test]
    fn test_list_sorted_with_nested_names() {
        let root = TempDir::new().unwrap();
        seed(root.path(), "ubuntu", "22.04", &[]);
        seed(root.path(), "registry.local/ml/tvm", "0.15", &[]);
        seed(root.path(), "alpine", "latest", &[]);

        let store = LocalImageStore::new(root.path());
        let refs: Vec<String> = store
            .list()
            .unwrap()
            .iter()
            .map(|i| i.image.to_string())
            .collect();
        assert_eq!(
            refs,
            vec!["alpine:latest", "registry.local/ml/tvm:0.15", "ubuntu:22.04"]
        );
    }

    #[test]
    fn test_list_missing_root() {
        let store = LocalImageStore::new("/nonexistent/strata/images");
        assert!(store.list().unwrap().is_empty());
    }
}
