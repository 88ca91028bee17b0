//! Run commands directly on the host.
//!
//! Useful for unprivileged builds and for tests. The command runs with the
//! image root's working directory as its cwd and can find programs
//! installed into the image through `PATH`, but nothing stops it from
//! touching the host filesystem.

use std::ffi::OsString;
use std::path::PathBuf;

use async_trait::async_trait;
use strata_core::error::{ProvisionError, Result};

use super::stream::run_streaming;
use super::{CommandRunner, ExitOutcome, Invocation};
use crate::fs::{host_path, host_path_resolved, resolve_image_path};

/// Variable pointing commands at the host directory holding the image root.
pub const ROOTFS_VAR: &str = "STRATA_ROOTFS";

#[derive(Debug, Clone, Default)]
pub struct HostRunner {
    _private: (),
}

impl HostRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Image `PATH` mapped into the rootfs, followed by the host `PATH`.
    fn search_path(invocation: &Invocation<'_>) -> Result<OsString> {
        let mut dirs: Vec<PathBuf> = invocation
            .search_path()
            .iter()
            .filter_map(|dir| host_path_resolved(invocation.rootfs, dir).ok())
            .collect();
        if let Some(host) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&host));
        }
        std::env::join_paths(dirs)
            .map_err(|e| ProvisionError::Runner(format!("invalid PATH entry: {}", e)))
    }

    fn cwd(invocation: &Invocation<'_>) -> Result<PathBuf> {
        Ok(host_path_resolved(invocation.rootfs, invocation.workdir)?)
    }
}

#[async_trait]
impl CommandRunner for HostRunner {
    fn name(&self) -> &'static str {
        "host"
    }

    fn resolve(&self, program: &str, invocation: &Invocation<'_>) -> Option<PathBuf> {
        if program.contains('/') {
            // Absolute paths prefer the image copy and fall back to the host.
            let image_path = resolve_image_path(invocation.workdir, program);
            let in_image = host_path(invocation.rootfs, &image_path).ok()?;
            if in_image.exists() {
                return Some(in_image);
            }
            let on_host = PathBuf::from(program);
            return (on_host.is_absolute() && on_host.exists()).then_some(on_host);
        }

        let path = Self::search_path(invocation).ok()?;
        let cwd = Self::cwd(invocation).ok()?;
        which::which_in(program, Some(path), cwd).ok()
    }

    async fn run(&self, invocation: &Invocation<'_>) -> Result<ExitOutcome> {
        let argv = invocation.command.argv();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProvisionError::Runner("empty command".to_string()))?;

        // Exec form runs the resolved binary so image-installed tools win.
        let executable = if invocation.command.is_shell() {
            PathBuf::from(program)
        } else {
            self.resolve(program, invocation)
                .unwrap_or_else(|| PathBuf::from(program))
        };

        let mut cmd = tokio::process::Command::new(&executable);
        cmd.args(args).current_dir(Self::cwd(invocation)?);

        cmd.env_clear();
        for (key, value) in invocation.env.iter() {
            cmd.env(key, value);
        }
        cmd.env("PATH", Self::search_path(invocation)?);
        cmd.env(ROOTFS_VAR, invocation.rootfs);

        tracing::debug!(
            step = invocation.index,
            program = %executable.display(),
            "Running command on host"
        );

        run_streaming(cmd, invocation.index, program, invocation.quiet).await
    }
}

#[cfg(all(test, unix))]
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
            index: 0,
            command,
            rootfs,
            workdir: "/",
            env,
            quiet: true,
        }
    }

    #[tokio::test]
    async fn test_run_in_rootfs_cwd() {
        let root = TempDir::new().unwrap();
        let command = Command::Shell("echo hi > marker && test -n \"$STRATA_ROOTFS\"".to_string());
        let env = Environment::new();
        let inv = invocation(root.path(), &command, &env);

        let outcome = HostRunner::new().run(&inv).await.unwrap();
        assert!(outcome.success());
        assert_eq!(std::fs::read_to_string(root.path().join("marker")).unwrap(), "hi\n");
    }

    #[tokio::test]
    async fn test_env_is_image_env() {
        let root = TempDir::new().unwrap();
        let command = Command::Shell("test \"$TVM_HOME\" = /opt/tvm".to_string());
        let mut env = Environment::new();
        env.set("TVM_HOME", "/opt/tvm");
        let inv = invocation(root.path(), &command, &env);

        let outcome = HostRunner::new().run(&inv).await.unwrap();
        assert_eq!(outcome.code, 0);
    }

    #[tokio::test]
    async fn test_shell_unknown_command_exits_127() {
        let root = TempDir::new().unwrap();
        let command = Command::Shell("definitely-not-a-real-tool-xyz".to_string());
        let env = Environment::new();
        let inv = invocation(root.path(), &command, &env);

        let outcome = HostRunner::new().run(&inv).await.unwrap();
        assert_eq!(outcome.code, super::super::EXIT_COMMAND_NOT_FOUND);
    }

    #[test]
    fn test_resolve_prefers_image_bin() {
        use std::os::unix::fs::PermissionsExt;

        let root = TempDir::new().unwrap();
        let bin = root.path().join("usr/local/bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("tvmc"), "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(bin.join("tvmc"), std::fs::Permissions::from_mode(0o755))
            .unwrap();

        let command = Command::Exec(vec!["tvmc".to_string()]);
        let mut env = Environment::new();
        env.set("PATH", "/usr/local/bin");
        let inv = invocation(root.path(), &command, &env);

        let resolved = HostRunner::new().resolve("tvmc", &inv).unwrap();
        assert!(resolved.starts_with(root.path()));
        assert!(HostRunner::new().resolve("not-a-tool-xyz", &inv).is_none());
    }
}
