//! Run commands inside the image root with `chroot(8)`.

use std::path::PathBuf;

use async_trait::async_trait;
use strata_core::error::{ProvisionError, Result};

use super::stream::run_streaming;
use super::{CommandRunner, ExitOutcome, Invocation, DEFAULT_PATH};
use crate::fs::{host_path, resolve_image_path};

/// Changes into the working directory (passed as `$0`) and execs the argv.
const ENTER_WORKDIR: &str = "cd \"$0\" && exec \"$@\"";

/// Runs every command as `chroot <rootfs> /bin/sh -c 'cd <workdir> && exec argv'`.
///
/// The command sees only the image environment. Requires root on Linux.
#[derive(Debug, Clone)]
pub struct ChrootRunner {
    chroot: PathBuf,
}

impl ChrootRunner {
    pub fn new() -> Self {
        Self {
            chroot: PathBuf::from("chroot"),
        }
    }

    /// Use a specific `chroot` binary instead of looking it up on `PATH`.
    pub fn with_binary(path: impl Into<PathBuf>) -> Self {
        Self {
            chroot: path.into(),
        }
    }
}

impl Default for ChrootRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ChrootRunner {
    fn name(&self) -> &'static str {
        "chroot"
    }

    fn resolve(&self, program: &str, invocation: &Invocation<'_>) -> Option<PathBuf> {
        let exists = |image_path: &str| {
            host_path(invocation.rootfs, image_path)
                .map(|p| p.exists() || std::fs::symlink_metadata(&p).is_ok())
                .unwrap_or(false)
        };

        if program.contains('/') {
            let image_path = resolve_image_path(invocation.workdir, program);
            return exists(&image_path).then(|| PathBuf::from(image_path));
        }

        invocation
            .search_path()
            .iter()
            .map(|dir| resolve_image_path(invocation.workdir, &format!("{}/{}", dir, program)))
            .find(|candidate| exists(candidate))
            .map(PathBuf::from)
    }

    async fn run(&self, invocation: &Invocation<'_>) -> Result<ExitOutcome> {
        let mut cmd = tokio::process::Command::new(&self.chroot);
        cmd.arg(invocation.rootfs)
            .arg("/bin/sh")
            .arg("-c")
            .arg(ENTER_WORKDIR)
            .arg(invocation.workdir)
            .args(invocation.command.argv());

        cmd.env_clear();
        for (key, value) in invocation.env.iter() {
            cmd.env(key, value);
        }
        if invocation.env.get("PATH").is_none() {
            cmd.env("PATH", DEFAULT_PATH);
        }
        if invocation.env.get("HOME").is_none() {
            cmd.env("HOME", "/root");
        }

        tracing::debug!(
            step = invocation.index,
            rootfs = %invocation.rootfs.display(),
            workdir = invocation.workdir,
            "Running command in chroot"
        );

        let chroot = self.chroot.display().to_string();
        run_streaming(cmd, invocation.index, &chroot, invocation.quiet)
            .await
            .map_err(|e| match e {
                ProvisionError::CommandNotFound { .. } => {
                    ProvisionError::Runner(format!("{} is not available on this host", chroot))
                }
                other => other,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use strata_core::{Command, Environment};
    use tempfile::TempDir;

    fn invocation<'a>(
        rootfs: &'a Path,
        command: &'a Command,
        env: &'a Environment,
    ) -> Invocation<'a> {
        Invocation {
            index: 2,
            command,
            rootfs,
            workdir: "/build",
            env,
            quiet: true,
        }
    }

    #[test]
    fn test_resolve_on_search_path() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("usr/bin")).unwrap();
        std::fs::write(root.path().join("usr/bin/cmake"), "").unwrap();

        let command = Command::Exec(vec!["cmake".to_string()]);
        let env = Environment::new();
        let inv = invocation(root.path(), &command, &env);
        let runner = ChrootRunner::new();

        assert_eq!(runner.resolve("cmake", &inv), Some(PathBuf::from("/usr/bin/cmake")));
        assert_eq!(runner.resolve("ninja", &inv), None);
    }

    #[test]
    fn test_resolve_uses_image_path_not_host() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("opt/tools")).unwrap();
        std::fs::write(root.path().join("opt/tools/gen"), "").unwrap();

        let command = Command::Exec(vec!["gen".to_string()]);
        let mut env = Environment::new();
        env.set("PATH", "/opt/tools");
        let inv = invocation(root.path(), &command, &env);
        let runner = ChrootRunner::new();

        assert_eq!(runner.resolve("gen", &inv), Some(PathBuf::from("/opt/tools/gen")));
        // `sh` exists on the host but not in this image
        assert_eq!(runner.resolve("sh", &inv), None);
    }

    #[test]
    fn test_resolve_relative_to_workdir() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("build")).unwrap();
        std::fs::write(root.path().join("build/configure"), "").unwrap();

        let command = Command::Exec(vec!["./configure".to_string()]);
        let env = Environment::new();
        let inv = invocation(root.path(), &command, &env);
        let runner = ChrootRunner::new();

        assert_eq!(
            runner.resolve("./configure", &inv),
            Some(PathBuf::from("/build/configure"))
        );
    }

    #[tokio::test]
    async fn test_missing_chroot_binary_is_runner_error() {
        let root = TempDir::new().unwrap();
        let command = Command::Shell("true".to_string());
        let env = Environment::new();
        let inv = invocation(root.path(), &command, &env);
        let runner = ChrootRunner::with_binary("/nonexistent/chroot");

        let err = runner.run(&inv).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Runner(_)));
    }
}
