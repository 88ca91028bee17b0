//! `strata build` command - Provision and commit an image from a recipe.
//!
//! Parses the recipe, materializes the base image from the local store,
//! runs every step in order, and writes the committed image to the output
//! directory. Nothing is written if any step fails.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use strata_core::{BaseImage, ProvisionError, RunnerKind};
use strata_runtime::{runner_for, LocalImageStore, Provisioner, Recipe};

use crate::output::format_size;

#[derive(Args)]
pub struct BuildArgs {
    /// Build context directory (contains the recipe and source files)
    #[arg(default_value = ".")]
    pub path: String,

    /// Name and optionally tag for the image (e.g., "tvm-demo:0.1")
    #[arg(short = 't', long = "tag")]
    pub tag: Option<String>,

    /// Path to the recipe (default: <PATH>/Recipe, then <PATH>/Dockerfile)
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    /// Output directory for the committed image (default: ./<name>.image)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Set build-time variables (KEY=VALUE), can be repeated
    #[arg(long = "build-arg")]
    pub build_arg: Vec<String>,

    /// How to execute RUN steps (chroot or host)
    #[arg(long)]
    pub runner: Option<RunnerKind>,

    /// Per-step time limit in seconds (0 = unlimited)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Configuration file (default: <PATH>/strata.yaml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Also install the result into the image store for use as a base image
    #[arg(long)]
    pub install: bool,

    /// Suppress build output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let context_dir = PathBuf::from(&args.path)
        .canonicalize()
        .map_err(|e| format!("Invalid build context path '{}': {}", args.path, e))?;

    if !context_dir.is_dir() {
        return Err(format!(
            "Build context '{}' is not a directory",
            context_dir.display()
        )
        .into());
    }

    let recipe_path = super::recipe_path(&context_dir, args.file.as_deref());
    if !recipe_path.exists() {
        return Err(format!("Recipe not found at {}", recipe_path.display()).into());
    }
    let recipe = Recipe::from_file(&recipe_path)?;

    // CLI flags override strata.yaml and STRATA_* variables
    let mut config = super::load_config(&context_dir, args.config.as_deref())?;
    if let Some(runner) = args.runner {
        config.runner = runner;
    }
    if let Some(timeout) = args.timeout {
        config.step_timeout_secs = Some(timeout);
    }
    let mut build_args = config.build_args.clone();
    build_args.extend(parse_build_args(&args.build_arg)?);

    let image = match &args.tag {
        Some(tag) => BaseImage::parse(tag)?,
        None => default_image(&context_dir),
    };
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&image));

    tracing::info!(
        image = %image,
        runner = %config.runner,
        store = %config.image_store.display(),
        "Starting build"
    );

    let store = Arc::new(LocalImageStore::new(&config.image_store));
    let mut provisioner = Provisioner::new(&context_dir, runner_for(config.runner), store.clone())
        .with_build_args(build_args)
        .with_step_timeout(
            config
                .step_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        )
        .quiet(args.quiet);
    if let Some(root) = &config.workspace_root {
        provisioner = provisioner.with_workspace_root(root);
    }

    if !args.quiet {
        println!("Building {} from {}", image, recipe_path.display());
    }

    let state = match provisioner.provision_recipe(&recipe).await {
        Ok(state) => state,
        Err(e) => {
            report_failure(&e, args.quiet);
            return Err(e.into());
        }
    };

    let result = state.commit(&output, &image.to_string())?;

    if args.install {
        let stored = store.install(&image, &state).map_err(|e| {
            format!(
                "Image was written to {}, but installing {} into the store failed: {}",
                result.path.display(),
                image,
                e
            )
        })?;
        if !args.quiet {
            println!("Installed {} into {}", image, stored.path.display());
        }
    }

    if args.quiet {
        println!("{}", result.config.layer.digest);
    } else {
        println!(
            "Successfully built {} ({} steps, {}) at {}",
            image,
            state.steps_applied(),
            format_size(result.config.layer.size),
            result.path.display()
        );
    }

    Ok(())
}

/// Print the captured stderr of a failed command when it was not streamed.
fn report_failure(error: &ProvisionError, quiet: bool) {
    if let ProvisionError::CommandFailed { stderr, .. } = error {
        if quiet && !stderr.is_empty() {
            eprintln!("{}", stderr);
        }
    }
    if let Some(index) = error.step_index() {
        tracing::debug!(step = index, "Build stopped; later steps were not run");
    }
}

/// Parse KEY=VALUE pairs into a HashMap.
fn parse_build_args(args: &[String]) -> Result<HashMap<String, String>, String> {
    let mut map = HashMap::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| format!("Invalid build arg (expected KEY=VALUE): {arg}"))?;
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

/// Image name derived from the context directory, tagged `latest`.
fn default_image(context_dir: &Path) -> BaseImage {
    let name: String = context_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let name = name.trim_matches(|c| c == '-' || c == '.');
    if name.is_empty() {
        BaseImage::new("strata-image", strata_core::image::DEFAULT_TAG)
    } else {
        BaseImage::new(name, strata_core::image::DEFAULT_TAG)
    }
}

/// `./<last name segment>.image`
fn default_output(image: &BaseImage) -> PathBuf {
    let short = image.name.rsplit('/').next().unwrap_or(&image.name);
    PathBuf::from(format!("{}.image", short))
}
