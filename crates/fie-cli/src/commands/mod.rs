//! Subcommand implementations.

mod topology;
mod up;

pub use topology::{InitTopologyCommand, TopologySummary, ValidateCommand};
pub use up::{UpCommand, run_shell};
