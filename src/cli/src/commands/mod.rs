//! CLI command definitions and dispatch.

mod build;
mod images;
mod inspect;
mod validate;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use strata_core::StrataConfig;

/// Recipe file looked up in the build context.
pub(crate) const DEFAULT_RECIPE: &str = "Recipe";

/// Fallback recipe name, for contexts written for Docker.
pub(crate) const FALLBACK_RECIPE: &str = "Dockerfile";

/// Strata - layered, fail-fast image provisioning.
#[derive(Parser)]
#[command(name = "strata", version, about)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a recipe
    Build(build::BuildArgs),
    /// Parse a recipe and print its step plan
    Validate(validate::ValidateArgs),
    /// Show the config of a built image
    Inspect(inspect::InspectArgs),
    /// List base images in the local store
    Images(images::ImagesArgs),
}

/// Resolve the recipe path: explicit file (relative to the context), else
/// `Recipe`, else `Dockerfile`.
pub(crate) fn recipe_path(context_dir: &Path, file: Option<&str>) -> PathBuf {
    match file {
        Some(f) => {
            let p = PathBuf::from(f);
            if p.is_absolute() {
                p
            } else {
                context_dir.join(p)
            }
        }
        None => {
            let primary = context_dir.join(DEFAULT_RECIPE);
            let fallback = context_dir.join(FALLBACK_RECIPE);
            if !primary.exists() && fallback.exists() {
                fallback
            } else {
                primary
            }
        }
    }
}

/// Load configuration from `--config` or the build context, then apply
/// `STRATA_*` environment overrides.
pub(crate) fn load_config(
    context_dir: &Path,
    config_file: Option<&Path>,
) -> Result<StrataConfig, Box<dyn std::error::Error>> {
    let mut config = match config_file {
        Some(path) => StrataConfig::from_file(path)?,
        None => StrataConfig::discover(context_dir)?,
    };
    config.apply_env_overrides()?;
    Ok(config)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args).await,
        Command::Validate(args) => validate::execute(args).await,
        Command::Inspect(args) => inspect::execute(args).await,
        Command::Images(args) => images::execute(args).await,
    }
}
