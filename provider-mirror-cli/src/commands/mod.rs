//! CLI subcommands.

pub mod build;
pub mod plan;
pub mod verify;
