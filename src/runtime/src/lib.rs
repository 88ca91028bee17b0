//! Strata Runtime - provisioning engine.
//!
//! Parses recipes, materializes base images, executes copy-file and
//! run-command steps in order, and commits the resulting filesystem.

#![allow(clippy::result_large_err)]

pub mod commit;
pub mod exec;
pub mod fs;
pub mod provision;
pub mod recipe;
pub mod snapshot;
pub mod store;

// Re-export common types
pub use commit::{extract_layer, CommitResult, ImageConfig};
pub use exec::{runner_for, ChrootRunner, CommandRunner, ExitOutcome, HostRunner, Invocation};
pub use provision::{HistoryEntry, ImageMetadata, ImageState, Provisioner};
pub use recipe::{Instruction, Recipe};
pub use store::{BaseImageConfig, BaseImageSource, LocalImageStore, StoredImage};

/// Strata Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
