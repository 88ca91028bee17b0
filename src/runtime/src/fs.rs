//! Path handling for the image root and the build context.
//!
//! Image paths are always resolved inside the rootfs: `..` cannot climb
//! above `/`, and symlinks met along the way are re-rooted, so an absolute
//! link such as `/usr/lib -> /opt/lib` never points at the host.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Maximum symlinks followed while resolving one path.
const MAX_SYMLINKS: usize = 40;

/// Resolve an image path against a working directory.
///
/// Returns a normalized absolute image path (no trailing slash).
pub fn resolve_image_path(workdir: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for comp in joined.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Map an image path to its location under `rootfs` on the host.
///
/// Intermediate symlinks are followed within the rootfs; the final
/// component is not followed.
pub fn host_path(rootfs: &Path, image_path: &str) -> io::Result<PathBuf> {
    map_into_rootfs(rootfs, image_path, false)
}

/// Like [`host_path`], but a symlink in the final component is followed
/// too, so the returned path never names a symlink.
///
/// Use this before any host call that would follow the link itself
/// (`is_dir`, `create_dir_all`, `current_dir`).
pub fn host_path_resolved(rootfs: &Path, image_path: &str) -> io::Result<PathBuf> {
    map_into_rootfs(rootfs, image_path, true)
}

fn map_into_rootfs(rootfs: &Path, image_path: &str, follow_final: bool) -> io::Result<PathBuf> {
    let mut resolved: Vec<String> = Vec::new();
    let mut pending: VecDeque<String> = split_components(image_path);
    let mut links = 0;

    while let Some(comp) = pending.pop_front() {
        if comp == ".." {
            resolved.pop();
            continue;
        }

        let mut candidate = resolved.clone();
        candidate.push(comp);
        let on_host = join_components(rootfs, &candidate);

        let follow = follow_final || !pending.is_empty();
        let is_link = follow
            && std::fs::symlink_metadata(&on_host)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);

        if is_link {
            links += 1;
            if links > MAX_SYMLINKS {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("too many levels of symbolic links in {}", image_path),
                ));
            }
            let target = std::fs::read_link(&on_host)?;
            let target = target.to_string_lossy();
            if target.starts_with('/') {
                resolved.clear();
            }
            let mut next = split_components(&target);
            next.extend(pending.drain(..));
            pending = next;
        } else {
            resolved = candidate;
        }
    }

    Ok(join_components(rootfs, &resolved))
}

/// Resolve a build-context source path.
///
/// Absolute sources are taken relative to the context root. Returns `None`
/// when the path would leave the context.
pub fn context_path(context_dir: &Path, source: &str) -> Option<PathBuf> {
    let mut parts: Vec<&str> = Vec::new();
    for comp in source.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    let mut path = context_dir.to_path_buf();
    path.extend(parts);
    Some(path)
}

/// Copy a single file, preserving permissions.
pub fn copy_file(src: &Path, dst: &Path) -> io::Result<()> {
    if std::fs::symlink_metadata(dst)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
    {
        std::fs::remove_file(dst)?;
    }
    std::fs::copy(src, dst)?;
    Ok(())
}

/// Recursively copy a directory tree, keeping symlinks as symlinks.
///
/// Returns the number of entries copied.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<usize> {
    std::fs::create_dir_all(dst)?;
    let mut count = 0;

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            let perms = entry.metadata().map_err(io::Error::from)?.permissions();
            std::fs::set_permissions(&target, perms)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            if std::fs::symlink_metadata(&target).is_ok() {
                std::fs::remove_file(&target)?;
            }
            make_symlink(&link, &target)?;
        } else {
            copy_file(entry.path(), &target)?;
        }
        count += 1;
    }

    Ok(count)
}

/// Copy a host directory tree into the image at `dest_image`.
///
/// Every target is mapped through the rootfs, so symlinked directories
/// already in the image are followed inside it and never on the host.
/// Returns the number of entries copied.
pub fn copy_tree_into_image(src: &Path, rootfs: &Path, dest_image: &str) -> io::Result<usize> {
    std::fs::create_dir_all(host_path_resolved(rootfs, dest_image)?)?;
    let base = dest_image.trim_end_matches('/');
    let mut count = 0;

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let relative: Vec<_> = relative.iter().map(|c| c.to_string_lossy()).collect();
        let image_path = format!("{}/{}", base, relative.join("/"));
        let file_type = entry.file_type();

        if file_type.is_dir() {
            let target = host_path_resolved(rootfs, &image_path)?;
            std::fs::create_dir_all(&target)?;
            let perms = entry.metadata().map_err(io::Error::from)?.permissions();
            std::fs::set_permissions(&target, perms)?;
        } else {
            let target = host_path(rootfs, &image_path)?;
            if file_type.is_symlink() {
                let link = std::fs::read_link(entry.path())?;
                if std::fs::symlink_metadata(&target).is_ok() {
                    std::fs::remove_file(&target)?;
                }
                make_symlink(&link, &target)?;
            } else {
                copy_file(entry.path(), &target)?;
            }
        }
        count += 1;
    }

    Ok(count)
}

/// Apply permission bits to a path.
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    std::fs::set_permissions(path, perms)
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn make_symlink(link: &Path, target: &Path) -> io::Result<()> {
    tracing::warn!(link = %link.display(), "Symlinks are not supported on this host, copying target");
    std::fs::copy(link, target).map(|_| ())
}

fn split_components(path: &str) -> VecDeque<String> {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .map(str::to_string)
        .collect()
}

fn join_components(root: &Path, components: &[String]) -> PathBuf {
    let mut path = root.to_path_buf();
    path.extend(components);
    path
}
