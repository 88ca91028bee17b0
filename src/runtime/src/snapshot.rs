//! Filesystem snapshots of the image root.
//!
//! Snapshots record which paths a step touched, and fingerprints give a
//! content digest of the whole filesystem that ignores timestamps, so two
//! runs of an idempotent recipe produce equal fingerprints.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use strata_core::error::{ProvisionError, Result};
use walkdir::WalkDir;

/// What kind of filesystem object an entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// Metadata for a single path in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Relative path from rootfs root
    pub path: PathBuf,
    pub kind: EntryKind,
    /// File size in bytes
    pub size: u64,
    /// Modification time (nanoseconds since epoch)
    pub mtime: i128,
    /// Permission bits
    pub mode: u32,
}

/// A snapshot of a directory's file state.
#[derive(Debug, Clone, Default)]
pub struct DirSnapshot {
    /// Map of relative path → file entry
    pub entries: HashMap<PathBuf, FileEntry>,
}

/// Paths that differ between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

impl DirSnapshot {
    /// Take a snapshot of a directory, recording all paths and their metadata.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = HashMap::new();

        for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
            let entry = entry.map_err(walk_error)?;
            let relative = relative_path(root, entry.path())?;
            let metadata = entry.metadata().map_err(walk_error)?;

            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as i128)
                .unwrap_or(0);

            entries.insert(
                relative.clone(),
                FileEntry {
                    path: relative,
                    kind: kind_of(&metadata),
                    size: metadata.len(),
                    mtime,
                    mode: mode_of(&metadata),
                },
            );
        }

        Ok(DirSnapshot { entries })
    }

    /// Compute the diff between this snapshot (before) and another (after).
    pub fn diff(&self, after: &DirSnapshot) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();

        for (path, after_entry) in &after.entries {
            match self.entries.get(path) {
                None => diff.added.push(path.clone()),
                Some(before_entry) => {
                    if before_entry.kind != after_entry.kind
                        || before_entry.size != after_entry.size
                        || before_entry.mtime != after_entry.mtime
                        || before_entry.mode != after_entry.mode
                    {
                        diff.modified.push(path.clone());
                    }
                }
            }
        }

        for path in self.entries.keys() {
            if !after.entries.contains_key(path) {
                diff.removed.push(path.clone());
            }
        }

        // Sort for deterministic output
        diff.added.sort();
        diff.modified.sort();
        diff.removed.sort();
        diff
    }
}

/// Content fingerprint of a directory tree.
///
/// Covers relative paths, entry kinds, permission bits, file contents and
/// symlink targets, walked in sorted order. Timestamps and ownership are
/// not part of the fingerprint.
pub fn fingerprint(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(walk_error)?;
        let relative = relative_path(root, entry.path())?;
        let metadata = entry.metadata().map_err(walk_error)?;
        let kind = kind_of(&metadata);

        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(match kind {
            EntryKind::File => b"f",
            EntryKind::Dir => b"d",
            EntryKind::Symlink => b"l",
        });
        hasher.update(mode_of(&metadata).to_le_bytes());

        match kind {
            EntryKind::File => {
                hasher.update(metadata.len().to_le_bytes());
                let mut file = std::fs::File::open(entry.path()).map_err(|e| {
                    ProvisionError::Io(std::io::Error::new(
                        e.kind(),
                        format!("failed to read {}: {}", entry.path().display(), e),
                    ))
                })?;
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
            }
            EntryKind::Symlink => {
                let target = std::fs::read_link(entry.path())?;
                hasher.update(target.to_string_lossy().as_bytes());
            }
            EntryKind::Dir => {}
        }
        hasher.update([0u8]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        ProvisionError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open {} for hashing: {}", path.display(), e),
        ))
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn relative_path(root: &Path, path: &Path) -> Result<PathBuf> {
    path.strip_prefix(root).map(Path::to_path_buf).map_err(|e| {
        ProvisionError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("failed to compute relative path for {}: {}", path.display(), e),
        ))
    })
}

fn walk_error(e: walkdir::Error) -> ProvisionError {
    let message = e.to_string();
    match e.into_io_error() {
        Some(io) => ProvisionError::Io(std::io::Error::new(io.kind(), message)),
        None => ProvisionError::Io(std::io::Error::new(std::io::ErrorKind::Other, message)),
    }
}

fn kind_of(metadata: &std::fs::Metadata) -> EntryKind {
    let ft = metadata.file_type();
    if ft.is_symlink() {
        EntryKind::Symlink
    } else if ft.is_dir() {
        EntryKind::Dir
    } else {
        EntryKind::File
    }
}

#[cfg(unix)]
fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}
