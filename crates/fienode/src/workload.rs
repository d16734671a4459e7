//! Workload configuration and the lifecycle handle of one container.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::runtime::{ContainerRuntime, CreateRequest};

/// A bind mount into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Path on the host.
    pub host_path: String,
    /// Absolute path inside the container.
    pub container_path: String,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    /// Create a read-write bind mount.
    #[must_use]
    pub fn new(host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }

    /// Make the mount read-only.
    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Renders the mount as a `-v` value.
    #[must_use]
    pub fn to_bind(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.host_path, self.container_path)
        } else {
            format!("{}:{}", self.host_path, self.container_path)
        }
    }
}

/// Creation parameters of a workload.
///
/// Checked at the node boundary with [`WorkloadSpec::validate`] before it
/// reaches the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Image reference.
    pub image: String,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Bind mounts.
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Command override.
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

impl WorkloadSpec {
    /// A spec that runs `image` with its defaults.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            env: BTreeMap::new(),
            volumes: Vec::new(),
            command: None,
        }
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a bind mount.
    #[must_use]
    pub fn with_volume(mut self, volume: VolumeMount) -> Self {
        self.volumes.push(volume);
        self
    }

    /// Override the image command.
    #[must_use]
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }

    /// Validate the workload configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidSpec`] describing the first problem.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.image.trim().is_empty() {
            return Err(NodeError::InvalidSpec("image cannot be empty".to_string()));
        }
        if self.image.chars().any(char::is_whitespace) {
            return Err(NodeError::InvalidSpec(format!(
                "image reference contains whitespace: {:?}",
                self.image
            )));
        }

        for key in self.env.keys() {
            let mut chars = key.chars();
            let valid_start = chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
            if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(NodeError::InvalidSpec(format!(
                    "invalid environment variable name: {key:?}"
                )));
            }
        }

        for volume in &self.volumes {
            if volume.host_path.is_empty() || volume.host_path.contains(':') {
                return Err(NodeError::InvalidSpec(format!(
                    "invalid volume host path: {:?}",
                    volume.host_path
                )));
            }
            if !volume.container_path.starts_with('/') || volume.container_path.contains(':') {
                return Err(NodeError::InvalidSpec(format!(
                    "volume container path must be absolute: {:?}",
                    volume.container_path
                )));
            }
        }

        if let Some(command) = &self.command {
            if command.first().is_none_or(|c| c.is_empty()) {
                return Err(NodeError::InvalidSpec(
                    "command override cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Copy of this spec with the `old` identity replaced by `new` in
    /// environment values and command arguments.
    ///
    /// Clones launched under a new name use this so that parameters derived
    /// from the container name (a cluster member address, a node id) follow
    /// the clone rather than pointing back at the source. Only whole tokens
    /// match: `fog-1` is rebound in `fog-1:2552` but not in `fog-10:2552`.
    #[must_use]
    pub fn rebind_identity(&self, old: &str, new: &str) -> Self {
        if old.is_empty() {
            return self.clone();
        }
        let mut spec = self.clone();
        for value in spec.env.values_mut() {
            *value = replace_token(value, old, new);
        }
        if let Some(command) = spec.command.as_mut() {
            for arg in command.iter_mut() {
                *arg = replace_token(arg, old, new);
            }
        }
        spec
    }
}

/// Characters that extend a container name, so a match bordered by one of
/// them is part of a longer name.
fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Replace occurrences of `token` in `text` that are not part of a longer
/// name.
fn replace_token(text: &str, token: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (start, _) in text.match_indices(token) {
        let end = start + token.len();
        let before = text[..start].chars().next_back();
        let after = text[end..].chars().next();
        if before.is_some_and(is_name_char) || after.is_some_and(is_name_char) {
            continue;
        }
        out.push_str(&text[last..start]);
        out.push_str(replacement);
        last = end;
    }
    out.push_str(&text[last..]);
    out
}

/// Lifecycle state of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadState {
    /// Instance created, process not confirmed yet.
    Created,
    /// Process running.
    Running,
    /// Process stopped, instance kept.
    Stopped,
    /// Instance removed. Terminal.
    Destroyed,
}

impl WorkloadState {
    /// Whether the state machine allows `self -> to`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Created, Self::Running | Self::Destroyed)
                | (Self::Running, Self::Stopped | Self::Destroyed)
                | (Self::Stopped, Self::Running | Self::Destroyed)
        )
    }

    /// Whether this is the terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed)
    }
}

impl fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Lifecycle wrapper around one container instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadHandle {
    name: String,
    node: String,
    network: String,
    cgroup_parent: String,
    spec: WorkloadSpec,
    runtime_id: String,
    pid: Option<u32>,
    state: WorkloadState,
    created_at: DateTime<Utc>,
}

impl WorkloadHandle {
    /// Create the instance through the runtime and confirm its process.
    ///
    /// The instance is attached to `network` and placed under the
    /// `cgroup_parent` accounting group. If the process id cannot be read
    /// back, the fresh instance is force-removed again.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::RuntimeCallFailure`] if creation or inspection
    /// fails.
    pub fn create(
        runtime: &dyn ContainerRuntime,
        name: &str,
        node: &str,
        network: &str,
        cgroup_parent: &str,
        spec: WorkloadSpec,
    ) -> Result<Self, NodeError> {
        let request = CreateRequest {
            name,
            network,
            cgroup_parent,
            spec: &spec,
        };
        let runtime_id = runtime.create(&request)?;

        let mut handle = Self {
            name: name.to_string(),
            node: node.to_string(),
            network: network.to_string(),
            cgroup_parent: cgroup_parent.to_string(),
            spec,
            runtime_id,
            pid: None,
            state: WorkloadState::Created,
            created_at: Utc::now(),
        };

        if let Err(e) = handle.inspect_pid(runtime) {
            warn!(container = %handle.name, error = %e, "pid lookup failed, removing instance");
            if let Err(cleanup) = runtime.remove(&handle.runtime_id, true) {
                warn!(container = %handle.name, error = %cleanup, "cleanup of fresh instance failed");
            }
            return Err(e);
        }
        handle.transition(WorkloadState::Running)?;

        info!(
            container = %handle.name,
            node = %handle.node,
            image = %handle.spec.image,
            pid = handle.pid.unwrap_or_default(),
            "container running"
        );
        Ok(handle)
    }

    /// Read the instance's process id from the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot report a pid.
    pub fn inspect_pid(&mut self, runtime: &dyn ContainerRuntime) -> Result<u32, NodeError> {
        let pid = runtime.inspect_pid(&self.name)?;
        self.pid = Some(pid);
        Ok(pid)
    }

    /// Stop the process, keeping the instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is not allowed or the runtime
    /// call fails.
    pub fn stop(&mut self, runtime: &dyn ContainerRuntime) -> Result<(), NodeError> {
        self.check(WorkloadState::Stopped)?;
        runtime.stop(&self.runtime_id)?;
        self.pid = None;
        self.transition(WorkloadState::Stopped)
    }

    /// Start a stopped instance again.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is not allowed or the runtime
    /// call fails.
    pub fn start(&mut self, runtime: &dyn ContainerRuntime) -> Result<(), NodeError> {
        self.check(WorkloadState::Running)?;
        runtime.start(&self.runtime_id)?;
        if let Err(e) = self.inspect_pid(runtime) {
            debug!(container = %self.name, error = %e, "pid unavailable after start");
        }
        self.transition(WorkloadState::Running)
    }

    /// Forcibly remove the instance, running or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime call fails; the handle then keeps
    /// its previous state.
    pub fn destroy(&mut self, runtime: &dyn ContainerRuntime) -> Result<(), NodeError> {
        self.check(WorkloadState::Destroyed)?;
        runtime.remove(&self.runtime_id, true)?;
        self.pid = None;
        self.transition(WorkloadState::Destroyed)
    }

    fn check(&self, to: WorkloadState) -> Result<(), NodeError> {
        if self.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(NodeError::InvalidTransition {
                name: self.name.clone(),
                from: self.state,
                to,
            })
        }
    }

    fn transition(&mut self, to: WorkloadState) -> Result<(), NodeError> {
        self.check(to)?;
        debug!(container = %self.name, from = %self.state, to = %to, "container state change");
        self.state = to;
        Ok(())
    }

    /// Container name, unique within the orchestrator.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning node.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Image reference.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.spec.image
    }

    /// Creation parameters.
    #[must_use]
    pub const fn spec(&self) -> &WorkloadSpec {
        &self.spec
    }

    /// Network the instance is attached to.
    #[must_use]
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Accounting group the instance is placed under.
    #[must_use]
    pub fn cgroup_parent(&self) -> &str {
        &self.cgroup_parent
    }

    /// Runtime-assigned identifier.
    #[must_use]
    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    /// Process id, while running.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> WorkloadState {
        self.state
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
