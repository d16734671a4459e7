//! Topology file commands: write a sample and validate a file.

use std::io::Write;
use std::path::{Path, PathBuf};

use fienode::{NodeError, TopologySpec};
use serde::Serialize;
use tracing::info;

use crate::error::CliError;
use crate::output::{Message, OutputFormat, TableDisplay};

/// `init-topology` executor.
#[derive(Debug, Clone, Default)]
pub struct InitTopologyCommand {
    path: Option<PathBuf>,
    force: bool,
}

impl InitTopologyCommand {
    /// Create the command. Without a path the sample goes to the writer.
    #[must_use]
    pub fn new(path: Option<PathBuf>, force: bool) -> Self {
        Self { path, force }
    }

    /// Execute the command.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination exists without `force`, or
    /// writing fails.
    pub fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let json = TopologySpec::sample().to_json_pretty()?;

        let Some(path) = &self.path else {
            writeln!(writer, "{json}")?;
            return Ok(());
        };

        if path.exists() && !self.force {
            return Err(CliError::Config(format!(
                "{} already exists, pass --force to overwrite",
                path.display()
            )));
        }
        std::fs::write(path, format!("{json}\n"))?;
        info!(path = %path.display(), "sample topology written");
        format.write(
            writer,
            &Message::success(format!("wrote sample topology to {}", path.display())),
        )
    }
}

/// Summary printed by `validate`.
#[derive(Debug, Clone, Serialize)]
pub struct TopologySummary {
    /// File that was checked.
    pub path: String,
    /// Host names in declaration order.
    pub hosts: Vec<String>,
    /// Number of declared links.
    pub links: usize,
    /// Block of each host, in order.
    pub blocks: Vec<String>,
}

impl TableDisplay for TopologySummary {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "✓ {} is valid", self.path)?;
        for (host, block) in self.hosts.iter().zip(&self.blocks) {
            writeln!(writer, "  {host:<10} {block}")?;
        }
        writeln!(writer, "  {} link(s)", self.links)?;
        Ok(())
    }
}

/// `validate` executor.
#[derive(Debug, Clone)]
pub struct ValidateCommand {
    path: PathBuf,
}

impl ValidateCommand {
    /// Create the command.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load, validate and summarise the topology.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn summarize(&self) -> Result<TopologySummary, CliError> {
        let spec = TopologySpec::from_file(&self.path)?;
        let blocks = (0..spec.hosts.len())
            .map(|i| spec.pool.block_at(i).map(|b| b.to_string()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(NodeError::from)?;

        Ok(TopologySummary {
            path: self.path.display().to_string(),
            hosts: spec.hosts.iter().map(|h| h.name.clone()).collect(),
            links: spec.links.len(),
            blocks,
        })
    }

    /// Execute the command.
    ///
    /// # Errors
    ///
    /// Returns an error if validation or output fails.
    pub fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let summary = self.summarize()?;
        format.write(writer, &summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Format;

    #[test]
    fn init_topology_to_writer_is_valid_json() {
        let mut buf = Vec::new();
        InitTopologyCommand::new(None, false)
            .execute(&mut buf, &OutputFormat::default())
            .expect("should execute");

        let output = String::from_utf8(buf).expect("valid utf8");
        let spec = TopologySpec::from_json(&output).expect("sample parses");
        assert_eq!(spec, TopologySpec::sample());
    }

    #[test]
    fn init_topology_refuses_to_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("topology.json");
        std::fs::write(&path, "{}").expect("seed file");

        let err = InitTopologyCommand::new(Some(path.clone()), false)
            .execute(&mut Vec::new(), &OutputFormat::default())
            .expect_err("should refuse");
        assert!(err.to_string().contains("--force"));

        InitTopologyCommand::new(Some(path.clone()), true)
            .execute(&mut Vec::new(), &OutputFormat::default())
            .expect("force overwrites");
        assert!(TopologySpec::from_file(&path).is_ok());
    }

    #[test]
    fn validate_lists_blocks_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("topology.json");
        InitTopologyCommand::new(Some(path.clone()), false)
            .execute(&mut Vec::new(), &OutputFormat::default())
            .expect("write sample");

        let summary = ValidateCommand::new(&path).summarize().expect("valid");

        assert_eq!(summary.hosts, vec!["cloud", "fog", "driver"]);
        assert_eq!(
            summary.blocks,
            vec!["192.168.11.0/24", "192.168.12.0/24", "192.168.13.0/24"]
        );
        assert_eq!(summary.links, 2);
    }

    #[test]
    fn validate_json_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("topology.json");
        std::fs::write(&path, TopologySpec::sample().to_json_pretty().expect("json"))
            .expect("write");

        let mut buf = Vec::new();
        ValidateCommand::new(&path)
            .execute(&mut buf, &OutputFormat::new(Format::Json))
            .expect("valid");

        let parsed: serde_json::Value = serde_json::from_slice(&buf).expect("json");
        assert_eq!(parsed["links"], 2);
    }

    #[test]
    fn validate_rejects_long_host_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("topology.json");
        std::fs::write(
            &path,
            r#"{"hosts": [{"name": "much-too-long-name", "tier": "fog", "pid": 7}]}"#,
        )
        .expect("write");

        let err = ValidateCommand::new(&path).summarize().expect_err("invalid");
        assert!(matches!(err, CliError::Node(_)));
    }
}
