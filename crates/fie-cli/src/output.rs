//! Output formatting for shell results.
//!
//! Supports table (human-readable) and JSON output formats.

use std::io::Write;

use fienode::{NodeStats, Orchestrator, RouteReport, TeardownReport};
use serde::Serialize;

use crate::cli::Format;
use crate::error::CliError;

/// Output formatter that handles both table and JSON output.
#[derive(Debug, Clone)]
pub struct OutputFormat {
    format: Format,
}

impl OutputFormat {
    /// Create a new output formatter.
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self { format }
    }

    /// Get the current format.
    #[must_use]
    pub const fn format(&self) -> Format {
        self.format
    }

    /// Check if JSON format is selected.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, Format::Json)
    }

    /// Write a serializable value to the output.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> Result<(), CliError>
    where
        W: Write,
        T: Serialize + TableDisplay,
    {
        match self.format {
            Format::Json => {
                serde_json::to_writer(&mut *writer, value)
                    .map_err(|e| CliError::Format(format!("JSON serialization failed: {e}")))?;
                writeln!(writer)?;
            }
            Format::Table => {
                value.write_table(writer)?;
            }
        }
        Ok(())
    }

    /// Render a serializable value to a string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_string<T>(&self, value: &T) -> Result<String, CliError>
    where
        T: Serialize + TableDisplay,
    {
        let mut buf = Vec::new();
        self.write(&mut buf, value)?;
        String::from_utf8(buf).map_err(|e| CliError::Format(format!("UTF-8 error: {e}")))
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::new(Format::Table)
    }
}

/// Trait for types that can be displayed as a table.
pub trait TableDisplay {
    /// Write the value as a human-readable table.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError>;
}

/// One node row of the `nodes` listing.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    /// Node name.
    pub name: String,
    /// Tier.
    pub tier: String,
    /// Address block.
    pub block: String,
    /// Gateway address.
    pub gateway: String,
    /// Lifecycle state.
    pub state: String,
    /// Number of registered containers.
    pub containers: usize,
}

/// The `nodes` listing.
#[derive(Debug, Clone, Serialize)]
pub struct NodeList {
    /// Nodes in declaration order.
    pub nodes: Vec<NodeInfo>,
}

impl NodeList {
    /// Snapshot the orchestrator's nodes.
    #[must_use]
    pub fn from_orchestrator(orchestrator: &Orchestrator) -> Self {
        Self {
            nodes: orchestrator
                .nodes()
                .iter()
                .map(|n| NodeInfo {
                    name: n.name().to_string(),
                    tier: n.tier().to_string(),
                    block: n.block().to_string(),
                    gateway: n.gateway().to_string(),
                    state: n.state().to_string(),
                    containers: n.containers().len(),
                })
                .collect(),
        }
    }
}

impl TableDisplay for NodeList {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.nodes.is_empty() {
            writeln!(writer, "No nodes in topology")?;
            return Ok(());
        }

        writeln!(
            writer,
            "{:<10}  {:<7}  {:<18}  {:<15}  {:<13}  {:>10}",
            "NAME", "TIER", "BLOCK", "GATEWAY", "STATE", "CONTAINERS"
        )?;
        writeln!(writer, "{}", "─".repeat(82))?;

        for node in &self.nodes {
            writeln!(
                writer,
                "{:<10}  {:<7}  {:<18}  {:<15}  {:<13}  {:>10}",
                node.name, node.tier, node.block, node.gateway, node.state, node.containers
            )?;
        }
        Ok(())
    }
}

/// Containers of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeContainers {
    /// Node name.
    pub node: String,
    /// Container names in creation order.
    pub containers: Vec<String>,
}

/// The `ps` listing.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerList {
    /// Nodes in declaration order.
    pub nodes: Vec<NodeContainers>,
}

impl From<Vec<(String, Vec<String>)>> for ContainerList {
    fn from(ps: Vec<(String, Vec<String>)>) -> Self {
        Self {
            nodes: ps
                .into_iter()
                .map(|(node, containers)| NodeContainers { node, containers })
                .collect(),
        }
    }
}

impl TableDisplay for ContainerList {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        for entry in &self.nodes {
            if entry.containers.is_empty() {
                writeln!(writer, "{}: -", entry.node)?;
            } else {
                writeln!(writer, "{}: {}", entry.node, entry.containers.join(", "))?;
            }
        }
        Ok(())
    }
}

/// The `stats` report.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    /// Per-node utilisation.
    pub nodes: Vec<NodeStats>,
}

impl TableDisplay for StatsReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(
            writer,
            "{:<10}  {:<16}  {:>8}  {:>7}  {:>10}",
            "NODE", "PROCESS", "PID", "CPU %", "MEM (KiB)"
        )?;
        writeln!(writer, "{}", "─".repeat(59))?;

        for node in &self.nodes {
            let rows = std::iter::once(("(node)".to_string(), node.primary))
                .chain(node.containers.iter().cloned());
            for (process, sample) in rows {
                match sample {
                    Some(s) => writeln!(
                        writer,
                        "{:<10}  {:<16}  {:>8}  {:>7.1}  {:>10}",
                        node.node,
                        truncate(&process, 16),
                        s.pid,
                        s.cpu_percent,
                        s.memory_bytes / 1024
                    )?,
                    None => writeln!(
                        writer,
                        "{:<10}  {:<16}  {:>8}  {:>7}  {:>10}",
                        node.node,
                        truncate(&process, 16),
                        "-",
                        "-",
                        "-"
                    )?,
                }
            }
        }
        Ok(())
    }
}

impl TableDisplay for RouteReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        for (node, route) in &self.installed {
            writeln!(writer, "{node}: {route}")?;
        }
        for skipped in &self.skipped {
            writeln!(
                writer,
                "skipped {} -> {}: {}",
                skipped.from, skipped.to, skipped.reason
            )?;
        }
        writeln!(
            writer,
            "✓ {} route(s) installed, {} skipped",
            self.installed.len(),
            self.skipped.len()
        )?;
        Ok(())
    }
}

/// Per-node teardown results.
#[derive(Debug, Clone, Serialize)]
pub struct TeardownSummary {
    /// Node name and its report.
    pub nodes: Vec<(String, TeardownReport)>,
}

impl TableDisplay for TeardownSummary {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        for (node, report) in &self.nodes {
            let bridge = match (&report.bridge_kept, report.bridge_removed) {
                (Some(reason), _) => format!("kept ({reason})"),
                (None, true) => "removed".to_string(),
                (None, false) => "left".to_string(),
            };
            writeln!(
                writer,
                "{node}: {} destroyed, {} failed, bridge {bridge}",
                report.destroyed.len(),
                report.failed.len(),
            )?;
            for (container, reason) in &report.failed {
                writeln!(writer, "  {container}: {reason}")?;
            }
        }
        Ok(())
    }
}

/// Simple message output.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    /// Message text.
    pub message: String,
    /// Whether the operation succeeded.
    pub success: bool,
}

impl Message {
    /// Create a success message.
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            success: true,
        }
    }

    /// Create an error message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            success: false,
        }
    }
}

impl TableDisplay for Message {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.success {
            writeln!(writer, "✓ {}", self.message)?;
        } else {
            writeln!(writer, "✗ {}", self.message)?;
        }
        Ok(())
    }
}

/// Truncate a string to a maximum number of characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len > 3 {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{head}...")
    } else {
        s.chars().take(max_len).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fienode::ProcessStats;

    // ==================== TABLE TESTS ====================

    #[test]
    fn container_list_table_output() {
        let list = ContainerList::from(vec![
            ("cloud".to_string(), vec!["cloud-0".to_string(), "cloud-1".to_string()]),
            ("fog".to_string(), vec![]),
        ]);

        let output = OutputFormat::default().to_string(&list).expect("should format");

        assert_eq!(output, "cloud: cloud-0, cloud-1\nfog: -\n");
    }

    #[test]
    fn node_list_empty() {
        let list = NodeList { nodes: vec![] };
        let output = OutputFormat::default().to_string(&list).expect("should format");
        assert!(output.contains("No nodes in topology"));
    }

    #[test]
    fn node_list_table_output() {
        let list = NodeList {
            nodes: vec![NodeInfo {
                name: "fog".into(),
                tier: "fog".into(),
                block: "192.168.12.0/24".into(),
                gateway: "192.168.12.1".into(),
                state: "active".into(),
                containers: 2,
            }],
        };

        let output = OutputFormat::default().to_string(&list).expect("should format");

        assert!(output.contains("NAME"));
        assert!(output.contains("192.168.12.0/24"));
        assert!(output.contains("active"));
    }

    #[test]
    fn stats_report_marks_missing_samples() {
        let report = StatsReport {
            nodes: vec![NodeStats {
                node: "cloud".into(),
                primary: Some(ProcessStats {
                    pid: 1001,
                    cpu_percent: 12.5,
                    memory_bytes: 8192,
                }),
                containers: vec![("cloud-0".into(), None)],
            }],
        };

        let output = OutputFormat::default().to_string(&report).expect("should format");
        let lines: Vec<&str> = output.lines().collect();

        assert_eq!(lines.len(), 4);
        assert!(lines[2].contains("1001"));
        assert!(lines[2].contains("12.5"));
        assert!(lines[2].contains('8'));
        assert!(lines[3].contains("cloud-0"));
        assert!(lines[3].contains('-'));
    }

    #[test]
    fn message_success_and_error() {
        let fmt = OutputFormat::default();
        assert_eq!(
            fmt.to_string(&Message::success("destroyed fog-0")).expect("format"),
            "✓ destroyed fog-0\n"
        );
        assert_eq!(
            fmt.to_string(&Message::error("container not found: x")).expect("format"),
            "✗ container not found: x\n"
        );
    }

    #[test]
    fn teardown_summary_names_kept_bridge() {
        let summary = TeardownSummary {
            nodes: vec![
                (
                    "cloud".to_string(),
                    TeardownReport {
                        destroyed: vec!["cloud-0".to_string()],
                        bridge_removed: true,
                        ..TeardownReport::default()
                    },
                ),
                (
                    "fog".to_string(),
                    TeardownReport {
                        failed: vec![("fog-0".to_string(), "device busy".to_string())],
                        bridge_kept: Some("1 container(s) still attached".to_string()),
                        ..TeardownReport::default()
                    },
                ),
            ],
        };

        let output = OutputFormat::default().to_string(&summary).expect("should format");

        assert_eq!(
            output,
            "cloud: 1 destroyed, 0 failed, bridge removed\n\
             fog: 0 destroyed, 1 failed, bridge kept (1 container(s) still attached)\n\
             \x20 fog-0: device busy\n"
        );
    }

    // ==================== JSON TESTS ====================

    #[test]
    fn json_output_is_one_line() {
        let list = ContainerList::from(vec![("fog".to_string(), vec!["fog-0".to_string()])]);

        let fmt = OutputFormat::new(Format::Json);
        let output = fmt.to_string(&list).expect("should format");

        assert_eq!(output.lines().count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(&output).expect("valid json");
        assert_eq!(parsed["nodes"][0]["node"], "fog");
        assert_eq!(parsed["nodes"][0]["containers"][0], "fog-0");
    }

    #[test]
    fn json_message_carries_success_flag() {
        let fmt = OutputFormat::new(Format::Json);
        let output = fmt.to_string(&Message::error("boom")).expect("should format");
        let parsed: serde_json::Value = serde_json::from_str(&output).expect("valid json");
        assert_eq!(parsed["success"], false);
    }

    // ==================== TRUNCATE TESTS ====================

    #[test]
    fn truncate_short_string() {
        assert_eq!(truncate("hello", 10), "hello");
    }

    #[test]
    fn truncate_long_string() {
        assert_eq!(truncate("hello world", 8), "hello...");
    }

    #[test]
    fn truncate_very_short_max() {
        assert_eq!(truncate("hello", 3), "hel");
    }
}
