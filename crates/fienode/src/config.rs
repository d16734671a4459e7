//! Topology configuration.
//!
//! The topology file declares:
//! - the address pool layout
//! - the container runtime binary and bridge naming
//! - every emulated host with its tier, namespace pid and resource profile
//! - the links between hosts (built by the emulation framework)

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use fie_network::{PoolConfig, MAX_POOL_BLOCKS};
use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::resources::{IoLimit, ResourceProfile, DEFAULT_CPU_PERIOD_US};

/// Longest host name whose derived interface names fit the kernel limit.
pub const MAX_HOST_NAME_LEN: usize = 9;

/// Tier a host belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Data-center tier.
    Cloud,
    /// Edge tier.
    Fog,
    /// Device tier.
    Driver,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cloud => write!(f, "cloud"),
            Self::Fog => write!(f, "fog"),
            Self::Driver => write!(f, "driver"),
        }
    }
}

/// Container runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime binary.
    pub binary: String,
    /// Prefix of every per-node bridge network name.
    pub bridge_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            bridge_prefix: "netns-".to_string(),
        }
    }
}

/// One emulated host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostSpec {
    /// Host name, also the node name.
    pub name: String,
    /// Tier.
    pub tier: Tier,
    /// Process owning the host's network namespace.
    pub pid: u32,
    /// Uplink interface; `<name>-eth0` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_interface: Option<String>,
    /// Resource ceiling.
    #[serde(default)]
    pub profile: ResourceProfile,
}

impl HostSpec {
    /// A host with an empty profile.
    #[must_use]
    pub fn new(name: impl Into<String>, tier: Tier, pid: u32) -> Self {
        Self {
            name: name.into(),
            tier,
            pid,
            primary_interface: None,
            profile: ResourceProfile::default(),
        }
    }

    /// Set the resource profile.
    #[must_use]
    pub fn with_profile(mut self, profile: ResourceProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Set the uplink interface.
    #[must_use]
    pub fn with_primary_interface(mut self, interface: impl Into<String>) -> Self {
        self.primary_interface = Some(interface.into());
        self
    }
}

/// A link between two hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkSpec {
    /// One end.
    pub a: String,
    /// Other end.
    pub b: String,
    /// Shaped bandwidth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_mbps: Option<u32>,
}

/// The whole topology declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopologySpec {
    /// Address pool layout.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Container runtime settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// CFS period used for CPU quotas.
    #[serde(default = "default_cpu_period_us")]
    pub cpu_period_us: u64,
    /// Hosts in declaration order.
    pub hosts: Vec<HostSpec>,
    /// Links between hosts.
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

const fn default_cpu_period_us() -> u64 {
    DEFAULT_CPU_PERIOD_US
}

impl TopologySpec {
    /// A topology of `hosts` with default settings.
    #[must_use]
    pub fn new(hosts: Vec<HostSpec>) -> Self {
        Self {
            pool: PoolConfig::default(),
            runtime: RuntimeConfig::default(),
            cpu_period_us: DEFAULT_CPU_PERIOD_US,
            hosts,
            links: Vec::new(),
        }
    }

    /// Load a topology from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NodeError::Config(format!(
                "failed to read topology file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse a topology from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self, NodeError> {
        let spec: Self = serde_json::from_str(content)
            .map_err(|e| NodeError::Config(format!("invalid topology JSON: {e}")))?;

        spec.validate()?;
        Ok(spec)
    }

    /// Render as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String, NodeError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| NodeError::Config(format!("failed to serialize topology: {e}")))
    }

    /// Validate the topology.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.hosts.is_empty() {
            return Err(NodeError::Config("topology declares no hosts".to_string()));
        }

        if self.hosts.len() > MAX_POOL_BLOCKS {
            return Err(NodeError::Config(format!(
                "topology declares {} hosts, the limit is {MAX_POOL_BLOCKS}",
                self.hosts.len()
            )));
        }

        let mut seen = HashSet::new();
        for host in &self.hosts {
            validate_host_name(&host.name)?;
            if !seen.insert(host.name.as_str()) {
                return Err(NodeError::Config(format!(
                    "duplicate host name: {}",
                    host.name
                )));
            }
            if host.pid == 0 {
                return Err(NodeError::Config(format!(
                    "host {} has no namespace pid",
                    host.name
                )));
            }
            if host.primary_interface.as_deref().is_some_and(str::is_empty) {
                return Err(NodeError::Config(format!(
                    "host {} has an empty primary_interface",
                    host.name
                )));
            }
        }

        for link in &self.links {
            for end in [&link.a, &link.b] {
                if !seen.contains(end.as_str()) {
                    return Err(NodeError::Config(format!(
                        "link references unknown host: {end}"
                    )));
                }
            }
            if link.a == link.b {
                return Err(NodeError::Config(format!(
                    "link from {} to itself",
                    link.a
                )));
            }
        }

        if self.runtime.binary.is_empty() {
            return Err(NodeError::Config(
                "runtime.binary cannot be empty".to_string(),
            ));
        }

        if self.cpu_period_us < 1_000 || self.cpu_period_us > 1_000_000 {
            return Err(NodeError::Config(
                "cpu_period_us must lie between 1000 and 1000000".to_string(),
            ));
        }

        // Probe the layout once for the whole host count.
        if let Some(last) = self.hosts.len().checked_sub(1) {
            self.pool
                .block_at(last)
                .map_err(|e| NodeError::Config(e.to_string()))?;
        }

        Ok(())
    }

    /// Sample cloud/fog/driver topology.
    #[must_use]
    pub fn sample() -> Self {
        let hosts = vec![
            HostSpec::new("cloud", Tier::Cloud, 1001)
                .with_profile(ResourceProfile::new().with_cpu_fraction(0.5).with_memory_mb(512.0)),
            HostSpec::new("fog", Tier::Fog, 1002).with_profile(
                ResourceProfile::new()
                    .with_cpu_fraction(0.1)
                    .with_memory_mb(10.0)
                    .with_swap_mb(20.0)
                    .with_oom_kill(false)
                    .with_swappiness(60)
                    .with_io_limit(IoLimit::new("8:0").with_write_bps(1024)),
            ),
            HostSpec::new("driver", Tier::Driver, 1003),
        ];
        let mut spec = Self::new(hosts);
        spec.links = vec![
            LinkSpec {
                a: "cloud".to_string(),
                b: "fog".to_string(),
                bandwidth_mbps: Some(100),
            },
            LinkSpec {
                a: "fog".to_string(),
                b: "driver".to_string(),
                bandwidth_mbps: Some(10),
            },
        ];
        spec
    }
}

/// Check a host name against the interface-name constraints.
///
/// # Errors
///
/// Returns [`NodeError::Config`] if the name is empty, too long or has
/// characters outside `[A-Za-z0-9_-]`.
pub fn validate_host_name(name: &str) -> Result<(), NodeError> {
    if name.is_empty() {
        return Err(NodeError::Config("host name cannot be empty".to_string()));
    }

    if name.len() > MAX_HOST_NAME_LEN {
        return Err(NodeError::Config(format!(
            "host name {name} exceeds {MAX_HOST_NAME_LEN} characters"
        )));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(NodeError::Config(format!(
            "host name {name} must contain only alphanumeric characters, hyphens, and underscores"
        )));
    }

    Ok(())
}
