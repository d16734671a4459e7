//! fie binary entrypoint.

use std::io::{self, IsTerminal};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fie_cli::cli::{Cli, Commands, LogFormat, UpArgs};
use fie_cli::commands::{InitTopologyCommand, UpCommand, ValidateCommand};
use fie_cli::output::OutputFormat;
use fienode::TopologySpec;

const DEFAULT_LOG_FILTER: &str = "fie=info,fie_cli=info,fienode=info";

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let format = OutputFormat::new(cli.format);
    let mut stdout = io::stdout().lock();

    match cli.command {
        Commands::InitTopology { path, force } => {
            InitTopologyCommand::new(path, force).execute(&mut stdout, &format)?;
        }
        Commands::Validate { path } => {
            ValidateCommand::new(&path).execute(&mut stdout, &format)?;
        }
        Commands::Up(args) => up(&args, &format, &mut stdout)?,
    }

    Ok(())
}

fn up(args: &UpArgs, format: &OutputFormat, stdout: &mut impl io::Write) -> anyhow::Result<()> {
    let mut topology = TopologySpec::from_file(&args.topology)
        .with_context(|| format!("loading {}", args.topology.display()))?;
    if let Some(binary) = &args.runtime {
        topology.runtime.binary.clone_from(binary);
    }
    let command = UpCommand::new(topology, args.route_all);

    if let Some(script) = &args.script {
        let file = std::fs::File::open(script)
            .with_context(|| format!("opening script {}", script.display()))?;
        command.execute(io::BufReader::new(file), stdout, format, false)?;
    } else {
        let stdin = io::stdin();
        let interactive = stdin.is_terminal();
        command.execute(stdin.lock(), stdout, format, interactive)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn up_fails_on_missing_topology() {
        let cli = Cli::parse_from(["fie", "up", "--topology", "/nonexistent/topology.json"]);
        let err = run(cli).expect_err("should fail");
        assert!(format!("{err:#}").contains("loading /nonexistent/topology.json"));
    }

    #[test]
    fn validate_fails_on_missing_file() {
        let cli = Cli::parse_from(["fie", "validate", "/nonexistent/topology.json"]);
        assert!(run(cli).is_err());
    }
}
