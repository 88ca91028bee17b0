//! `strata images` command.

use std::path::PathBuf;

use clap::Args;
use strata_runtime::{LocalImageStore, StoredImage};

use crate::output;

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show image references (one per line)
    #[arg(short, long)]
    pub quiet: bool,

    /// Configuration file (default: ./strata.yaml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

pub async fn execute(args: ImagesArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(&std::env::current_dir()?, args.config.as_deref())?;
    let store = LocalImageStore::new(&config.image_store);
    let images = store.list()?;

    if args.quiet {
        for image in &images {
            println!("{}", image.image);
        }
        return Ok(());
    }

    let mut table = output::new_table(&["NAME", "TAG", "INSTALLED", "ENV", "PATH"]);
    for image in &images {
        table.add_row(row(image));
    }
    println!("{table}");
    Ok(())
}

fn row(image: &StoredImage) -> Vec<String> {
    vec![
        image.image.name.clone(),
        image.image.tag.clone(),
        image
            .config
            .installed
            .as_ref()
            .map(output::format_age)
            .unwrap_or_else(|| "-".to_string()),
        image.config.env.len().to_string(),
        image.path.display().to_string(),
    ]
}
