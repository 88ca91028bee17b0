//! `strata inspect` command - Show a committed image's config.

use std::path::{Path, PathBuf};

use clap::Args;
use strata_runtime::{extract_layer, ImageConfig};

#[derive(Args)]
pub struct InspectArgs {
    /// Image output directory produced by `strata build`
    pub image: PathBuf,

    /// Print only the resolved environment, one KEY=VALUE per line
    #[arg(long)]
    pub env: bool,

    /// Unpack the image filesystem into DIR (must be empty or missing)
    #[arg(long, value_name = "DIR", conflicts_with = "env")]
    pub extract: Option<PathBuf>,
}

pub async fn execute(args: InspectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ImageConfig::load(&args.image)?;

    if let Some(dest) = &args.extract {
        extract(&args.image, dest)?;
        println!("Extracted {} into {}", config.reference, dest.display());
        return Ok(());
    }

    if args.env {
        for entry in &config.env {
            println!("{}", entry);
        }
        return Ok(());
    }

    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn extract(image: &Path, dest: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if dest.exists() && std::fs::read_dir(dest)?.next().is_some() {
        return Err(format!("Extract directory '{}' is not empty", dest.display()).into());
    }
    std::fs::create_dir_all(dest)?;
    extract_layer(image, dest)?;
    tracing::info!(image = %image.display(), dest = %dest.display(), "Extracted layer");
    Ok(())
}
