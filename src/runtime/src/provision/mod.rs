//! Layered provisioning pipeline.
//!
//! [`Provisioner`] threads an [`ImageState`] through an ordered list of
//! steps, stopping at the first failure.

mod engine;
mod state;

pub use engine::Provisioner;
pub use state::{HistoryEntry, ImageMetadata, ImageState};
