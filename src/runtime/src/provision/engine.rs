//! Provisioning engine.
//!
//! Materializes a base image into a private workspace and applies steps to
//! it strictly in declaration order. The first failing step stops the run;
//! nothing after it executes and the partial state is discarded.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use strata_core::env::expand;
use strata_core::error::{ProvisionError, Result};
use strata_core::{BaseImage, Command, Environment, EnvironmentBinding, Step};
use walkdir::WalkDir;

use super::state::{HistoryEntry, ImageState};
use crate::exec::{CommandRunner, Invocation, EXIT_COMMAND_NOT_FOUND};
use crate::fs::{
    context_path, copy_file, copy_tree_into_image, host_path, host_path_resolved,
    resolve_image_path, set_mode,
};
use crate::recipe::{Instruction, Recipe};
use crate::snapshot::DirSnapshot;
use crate::store::BaseImageSource;

/// Applies provisioning steps on top of a base image.
pub struct Provisioner {
    /// Build context that copy-file sources are resolved against
    context_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    images: Arc<dyn BaseImageSource>,
    /// Build arguments, visible to commands and recipe expansion only
    build_args: HashMap<String, String>,
    /// Default limit for each run-command step
    step_timeout: Option<Duration>,
    /// Where workspaces are created (system temp dir if unset)
    workspace_root: Option<PathBuf>,
    quiet: bool,
}

impl Provisioner {
    pub fn new(
        context_dir: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        images: Arc<dyn BaseImageSource>,
    ) -> Self {
        Self {
            context_dir: context_dir.into(),
            runner,
            images,
            build_args: HashMap::new(),
            step_timeout: None,
            workspace_root: None,
            quiet: false,
        }
    }

    pub fn with_build_args(mut self, build_args: HashMap<String, String>) -> Self {
        self.build_args = build_args;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    /// Suppress progress lines and command output.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn context_dir(&self) -> &Path {
        &self.context_dir
    }

    /// Apply `steps` to `base` in order, then resolve `bindings` in order.
    ///
    /// Returns the accumulated state once every step has succeeded. On the
    /// first failure the remaining steps are not executed and the error
    /// carries the failing step's index.
    pub async fn provision(
        &self,
        base: &BaseImage,
        steps: &[Step],
        bindings: &[EnvironmentBinding],
    ) -> Result<ImageState> {
        let mut state = self.prepare(base).await?;
        let args = self.build_args.clone();
        let total = steps.len();

        for (index, step) in steps.iter().enumerate() {
            self.execute(&mut state, index, total, step, &args).await?;
        }

        for binding in bindings {
            let value = state.env.apply(binding);
            tracing::debug!(key = %binding.key, value = %value, "Bound environment variable");
            state
                .history
                .push(HistoryEntry::config(format!("ENV {}={}", binding.key, value)));
        }

        Ok(state)
    }

    /// Run a parsed recipe.
    ///
    /// Bindings, working directory changes and metadata are applied at
    /// their position in the recipe, so later steps observe them.
    pub async fn provision_recipe(&self, recipe: &Recipe) -> Result<ImageState> {
        let mut args = self.build_args.clone();
        let mut state: Option<ImageState> = None;
        let total = recipe.step_count();
        let mut index = 0;

        for instruction in &recipe.instructions {
            if let Instruction::Arg { name, default } = instruction {
                // --build-arg wins over the recipe default
                if !args.contains_key(name) {
                    if let Some(default) = default {
                        let value = lookup_expand(default, state.as_ref(), &args);
                        args.insert(name.clone(), value);
                    }
                }
                continue;
            }

            if let Instruction::From { image } = instruction {
                let reference = lookup_expand(image, None, &args);
                let base = BaseImage::parse(&reference)?;
                state = Some(self.prepare(&base).await?);
                continue;
            }

            let Some(state) = state.as_mut() else {
                return Err(ProvisionError::Recipe {
                    line: 0,
                    message: "instruction before FROM".to_string(),
                });
            };

            match instruction {
                Instruction::Step(step) => {
                    let step = expand_step(step, state, &args);
                    self.execute(state, index, total, &step, &args).await?;
                    index += 1;
                }
                Instruction::Env(binding) => {
                    let value = lookup_expand(&binding.value, Some(&*state), &args);
                    state.env.set(binding.key.clone(), value.clone());
                    tracing::debug!(key = %binding.key, value = %value, "Bound environment variable");
                    state
                        .history
                        .push(HistoryEntry::config(format!("ENV {}={}", binding.key, value)));
                }
                Instruction::Workdir { path } => {
                    let path = lookup_expand(path, Some(&*state), &args);
                    state.workdir = resolve_image_path(&state.workdir, &path);
                    std::fs::create_dir_all(host_path_resolved(state.rootfs(), &state.workdir)?)?;
                    state
                        .history
                        .push(HistoryEntry::config(format!("WORKDIR {}", state.workdir)));
                }
                Instruction::Label { key, value } => {
                    let value = lookup_expand(value, Some(&*state), &args);
                    state
                        .history
                        .push(HistoryEntry::config(format!("LABEL {}={}", key, value)));
                    state.metadata.labels.insert(key.clone(), value);
                }
                Instruction::Cmd { exec } => {
                    state.metadata.cmd = Some(exec.clone());
                    state
                        .history
                        .push(HistoryEntry::config(format!("CMD {:?}", exec)));
                }
                Instruction::Entrypoint { exec } => {
                    state.metadata.entrypoint = Some(exec.clone());
                    state
                        .history
                        .push(HistoryEntry::config(format!("ENTRYPOINT {:?}", exec)));
                }
                Instruction::Expose { port } => {
                    let port = lookup_expand(port, Some(&*state), &args);
                    state
                        .history
                        .push(HistoryEntry::config(format!("EXPOSE {}", port)));
                    if !state.metadata.exposed_ports.contains(&port) {
                        state.metadata.exposed_ports.push(port);
                    }
                }
                Instruction::Arg { .. } | Instruction::From { .. } => {}
            }
        }

        state.ok_or_else(|| ProvisionError::Recipe {
            line: 0,
            message: "recipe has no FROM instruction".to_string(),
        })
    }

    /// Create a workspace and materialize the base image into it.
    async fn prepare(&self, base: &BaseImage) -> Result<ImageState> {
        let mut state = ImageState::create(base.clone(), self.workspace_root.as_deref())?;

        if !self.quiet {
            println!("FROM {}", base);
        }
        let config = self.images.materialize(base, state.rootfs()).await?;

        state.env = Environment::from_env_list(&config.env);
        if let Some(workdir) = config.working_dir.filter(|w| !w.is_empty()) {
            state.workdir = resolve_image_path("/", &workdir);
        }
        state.history.push(HistoryEntry::config(format!("FROM {}", base)));

        tracing::info!(
            base = %base,
            runner = self.runner.name(),
            workspace = %state.workspace().display(),
            "Prepared base image"
        );
        Ok(state)
    }

    /// Execute one step against the state.
    async fn execute(
        &self,
        state: &mut ImageState,
        index: usize,
        total: usize,
        step: &Step,
        args: &HashMap<String, String>,
    ) -> Result<()> {
        let description = step.describe();
        if !self.quiet {
            println!("Step {}/{}: {}", index + 1, total, description);
        }
        tracing::info!(step = index, kind = %step.kind(), "{}", description);

        let before = DirSnapshot::capture(state.rootfs())?;

        let result = match step {
            Step::CopyFile {
                source,
                destination,
                mode,
            } => self.copy_file(state, index, source, destination, *mode),
            Step::RunCommand {
                command,
                verify,
                timeout,
            } => {
                self.run_command(state, index, command, verify, *timeout, args)
                    .await
            }
        };

        if let Err(e) = result {
            tracing::error!(step = index, kind = %step.kind(), error = %e, "Step failed");
            return Err(e);
        }

        let after = DirSnapshot::capture(state.rootfs())?;
        let changed = before.diff(&after);
        tracing::info!(step = index, changed = changed.len(), "Step complete");

        state
            .history
            .push(HistoryEntry::step(index, description, changed.len()));
        Ok(())
    }

    fn copy_file(
        &self,
        state: &ImageState,
        index: usize,
        source: &str,
        destination: &str,
        mode: Option<u32>,
    ) -> Result<()> {
        let not_found = || ProvisionError::SourceNotFound {
            index,
            path: source.to_string(),
            context: self.context_dir.clone(),
        };

        let src = context_path(&self.context_dir, source).ok_or_else(not_found)?;
        let metadata = std::fs::metadata(&src).map_err(|_| not_found())?;

        let dest_image = resolve_image_path(&state.workdir, destination);
        let unwritable = |e: std::io::Error| ProvisionError::DestinationUnwritable {
            index,
            path: dest_image.clone(),
            reason: e.to_string(),
        };

        // Symlinks already in the image, including a final one, are
        // followed inside the rootfs before anything touches the host.
        let resolved = host_path_resolved(state.rootfs(), &dest_image).map_err(unwritable)?;

        if metadata.is_dir() {
            let count = copy_tree_into_image(&src, state.rootfs(), &dest_image)
                .map_err(unwritable)?;
            if let Some(mode) = mode {
                chmod_tree(&resolved, mode).map_err(unwritable)?;
            }
            tracing::debug!(step = index, entries = count, dest = %dest_image, "Copied directory");
            return Ok(());
        }

        let target_image = if destination.ends_with('/') || resolved.is_dir() {
            std::fs::create_dir_all(&resolved).map_err(unwritable)?;
            let name = src.file_name().ok_or_else(not_found)?;
            format!(
                "{}/{}",
                dest_image.trim_end_matches('/'),
                name.to_string_lossy()
            )
        } else {
            dest_image.clone()
        };
        let target = host_path(state.rootfs(), &target_image).map_err(unwritable)?;

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(unwritable)?;
        }
        copy_file(&src, &target).map_err(unwritable)?;
        if let Some(mode) = mode {
            set_mode(&target, mode).map_err(unwritable)?;
        }

        tracing::debug!(step = index, dest = %target.display(), "Copied file");
        Ok(())
    }

    async fn run_command(
        &self,
        state: &ImageState,
        index: usize,
        command: &Command,
        verify: &[String],
        timeout: Option<Duration>,
        args: &HashMap<String, String>,
    ) -> Result<()> {
        // Build args are visible to the command but never stored in the image.
        let mut env = state.env.clone();
        let sorted: BTreeMap<_, _> = args.iter().collect();
        for (key, value) in sorted {
            if env.get(key).is_none() {
                env.set(key.clone(), value.clone());
            }
        }

        std::fs::create_dir_all(host_path_resolved(state.rootfs(), &state.workdir)?)?;

        let invocation = Invocation {
            index,
            command,
            rootfs: state.rootfs(),
            workdir: &state.workdir,
            env: &env,
            quiet: self.quiet,
        };

        if let Command::Exec(argv) = command {
            let program = argv.first().map(String::as_str).unwrap_or("");
            if program.is_empty() || self.runner.resolve(program, &invocation).is_none() {
                return Err(ProvisionError::CommandNotFound {
                    index,
                    program: program.to_string(),
                });
            }
        }

        let limit = timeout.or(self.step_timeout);
        let outcome = match limit {
            Some(limit) => tokio::time::timeout(limit, self.runner.run(&invocation))
                .await
                .map_err(|_| ProvisionError::Timeout {
                    index,
                    command: command.to_string(),
                    secs: limit.as_secs(),
                })??,
            None => self.runner.run(&invocation).await?,
        };

        if !outcome.success() {
            if command.is_shell() && outcome.code == EXIT_COMMAND_NOT_FOUND {
                return Err(ProvisionError::CommandNotFound {
                    index,
                    program: command.program().to_string(),
                });
            }
            return Err(ProvisionError::CommandFailed {
                index,
                command: command.to_string(),
                status: outcome.code,
                stderr: outcome.stderr_tail,
            });
        }

        for path in verify {
            let image_path = resolve_image_path(&state.workdir, &env.expand(path));
            let present = host_path(state.rootfs(), &image_path)
                .map(|p| std::fs::symlink_metadata(p).is_ok())
                .unwrap_or(false);
            if !present {
                return Err(ProvisionError::VerificationFailed {
                    index,
                    path: image_path,
                });
            }
        }

        Ok(())
    }
}

/// Expand a recipe template. Image environment wins over build args.
fn lookup_expand(
    template: &str,
    state: Option<&ImageState>,
    args: &HashMap<String, String>,
) -> String {
    expand(template, |name| {
        state
            .and_then(|s| s.env.get(name))
            .map(str::to_string)
            .or_else(|| args.get(name).cloned())
    })
}

/// Expand variable references in copy-file paths. Commands are left to the
/// shell.
fn expand_step(step: &Step, state: &ImageState, args: &HashMap<String, String>) -> Step {
    match step {
        Step::CopyFile {
            source,
            destination,
            mode,
        } => Step::CopyFile {
            source: lookup_expand(source, Some(state), args),
            destination: lookup_expand(destination, Some(state), args),
            mode: *mode,
        },
        other => other.clone(),
    }
}

/// Apply `mode` to every regular file under `root`.
fn chmod_tree(root: &Path, mode: u32) -> std::io::Result<()> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() {
            set_mode(entry.path(), mode)?;
        }
    }
    Ok(())
}
