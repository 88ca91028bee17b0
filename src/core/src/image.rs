//! Base image references.
//!
//! A base image is identified by `name[:tag]`. The name may carry a
//! registry host with a port (`registry.local:5000/ml/base`), so the tag is
//! only split off after the last `/`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};

/// Default tag when none is specified.
pub const DEFAULT_TAG: &str = "latest";

/// Name of the empty base image.
pub const SCRATCH: &str = "scratch";

/// Identifier of the starting filesystem snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseImage {
    pub name: String,
    pub tag: String,
}

impl BaseImage {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// The empty image: no files, no environment.
    pub fn scratch() -> Self {
        Self::new(SCRATCH, DEFAULT_TAG)
    }

    pub fn is_scratch(&self) -> bool {
        self.name == SCRATCH
    }

    /// Parse a `name[:tag]` reference.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ProvisionError::InvalidReference(
                "empty image reference".to_string(),
            ));
        }
        if reference.contains('@') {
            return Err(ProvisionError::InvalidReference(format!(
                "digest references are not supported: '{}'",
                reference
            )));
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(ProvisionError::InvalidReference(format!(
                "whitespace in image reference '{}'",
                reference
            )));
        }

        let last_segment_start = reference.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match reference[last_segment_start..].rfind(':') {
            Some(colon) => {
                let colon = last_segment_start + colon;
                (&reference[..colon], &reference[colon + 1..])
            }
            None => (reference, DEFAULT_TAG),
        };

        if name.is_empty() || name.ends_with('/') || name.split('/').any(|s| s == "..") {
            return Err(ProvisionError::InvalidReference(format!(
                "invalid image name in '{}'",
                reference
            )));
        }
        if tag.is_empty() {
            return Err(ProvisionError::InvalidReference(format!(
                "empty tag in '{}'",
                reference
            )));
        }

        Ok(Self::new(name, tag))
    }
}

impl FromStr for BaseImage {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for BaseImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}
