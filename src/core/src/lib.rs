//! Strata Core - Foundational Types
//!
//! Steps, environment bindings, base image references, the provisioning
//! error taxonomy, and configuration shared by the strata runtime and CLI.

pub mod config;
pub mod env;
pub mod error;
pub mod image;
pub mod step;

// Re-export commonly used types
pub use config::{RunnerKind, StrataConfig};
pub use env::{Environment, EnvironmentBinding};
pub use error::{ProvisionError, Result};
pub use image::BaseImage;
pub use step::{Command, Step, StepKind};

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
