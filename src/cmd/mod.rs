//! CLI command implementations

use clap::Subcommand;

pub mod diagnostics;
pub mod root;

#[derive(Subcommand)]
pub enum Commands {
    /// Check daemon prerequisites (Docker connectivity, config, store)
    Diagnostics,
}
