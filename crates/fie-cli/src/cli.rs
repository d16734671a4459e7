//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// fie - fog infrastructure emulator.
#[derive(Parser, Debug, Clone)]
#[command(name = "fie")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log output format.
    #[arg(long, value_enum, env = "FIE_LOG_FORMAT", default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    /// Output format of shell and command results.
    #[arg(short, long, value_enum, default_value_t = Format::Table, global = true)]
    pub format: Format,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Build the topology and open the operator shell on stdin.
    Up(UpArgs),

    /// Write a sample cloud/fog/driver topology.
    InitTopology {
        /// Destination file. Printed to stdout when omitted.
        path: Option<PathBuf>,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Check a topology file without touching the host.
    Validate {
        /// Topology file.
        path: PathBuf,
    },
}

/// Arguments for the up command.
#[derive(Parser, Debug, Clone)]
pub struct UpArgs {
    /// Topology file.
    #[arg(short, long, env = "FIE_TOPOLOGY")]
    pub topology: PathBuf,

    /// Install the full route mesh right after the build.
    #[arg(long)]
    pub route_all: bool,

    /// Container runtime binary, overriding the topology file.
    #[arg(long)]
    pub runtime: Option<String>,

    /// Run shell commands from this file instead of stdin.
    #[arg(long)]
    pub script: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_up() {
        let cli = Cli::parse_from(["fie", "up", "--topology", "topo.json", "--route-all"]);
        match cli.command {
            Commands::Up(args) => {
                assert_eq!(args.topology, PathBuf::from("topo.json"));
                assert!(args.route_all);
                assert!(args.script.is_none());
            }
            other => panic!("expected up, got {other:?}"),
        }
    }

    #[test]
    fn cli_parses_init_topology_without_path() {
        let cli = Cli::parse_from(["fie", "init-topology"]);
        assert!(matches!(
            cli.command,
            Commands::InitTopology { path: None, force: false }
        ));
    }

    #[test]
    fn cli_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["fie", "validate", "t.json", "--log-format", "json", "-f", "json"]);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.format, Format::Json);
    }

    #[test]
    fn cli_up_requires_topology() {
        let result = Cli::try_parse_from(["fie", "up"]);
        // FIE_TOPOLOGY may be set in the environment running the tests.
        if std::env::var_os("FIE_TOPOLOGY").is_none() {
            assert!(result.is_err());
        }
    }
}
