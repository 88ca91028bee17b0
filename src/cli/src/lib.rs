//! Strata CLI - build images from provisioning recipes.

pub mod commands;
pub mod output;
