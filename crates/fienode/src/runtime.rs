//! Container runtime interface.
//!
//! The node and workload layers talk to containers and per-node bridge
//! networks only through [`ContainerRuntime`]. [`crate::docker::DockerCli`]
//! drives a real engine; [`FakeContainerRuntime`] keeps everything in
//! memory for tests.

use std::collections::{BTreeMap, BTreeSet};

use fie_network::AddressBlock;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::NodeError;
use crate::workload::WorkloadSpec;

/// Everything the runtime needs to create one instance.
#[derive(Debug, Clone, Copy)]
pub struct CreateRequest<'a> {
    /// Container name.
    pub name: &'a str,
    /// Bridge network to attach to.
    pub network: &'a str,
    /// Parent accounting group.
    pub cgroup_parent: &'a str,
    /// Image, env, volumes and command.
    pub spec: &'a WorkloadSpec,
}

/// Trait for container runtime implementations.
pub trait ContainerRuntime: Send + Sync {
    /// Create a bridge network owning `subnet`, backed by a host bridge
    /// device called `bridge`.
    ///
    /// # Errors
    ///
    /// Returns an error if the network cannot be created.
    fn create_network(&self, name: &str, subnet: AddressBlock, bridge: &str)
        -> Result<(), NodeError>;

    /// Remove a bridge network.
    ///
    /// # Errors
    ///
    /// Returns an error if the network cannot be removed.
    fn remove_network(&self, name: &str) -> Result<(), NodeError>;

    /// Create and start a detached instance. Returns the runtime id.
    ///
    /// # Errors
    ///
    /// Returns an error if creation fails.
    fn create(&self, request: &CreateRequest<'_>) -> Result<String, NodeError>;

    /// Host process id of a running instance, by name or id.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is unknown or not running.
    fn inspect_pid(&self, container: &str) -> Result<u32, NodeError>;

    /// Start a stopped instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance cannot be started.
    fn start(&self, container: &str) -> Result<(), NodeError>;

    /// Stop a running instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance cannot be stopped.
    fn stop(&self, container: &str) -> Result<(), NodeError>;

    /// Remove an instance. `force` removes it even while running.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance cannot be removed.
    fn remove(&self, container: &str, force: bool) -> Result<(), NodeError>;
}

/// One call received by [`FakeContainerRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    /// `create_network`.
    CreateNetwork {
        /// Network name.
        name: String,
        /// Subnet.
        subnet: AddressBlock,
        /// Host bridge name.
        bridge: String,
    },
    /// `remove_network`.
    RemoveNetwork {
        /// Network name.
        name: String,
    },
    /// `create`.
    Create {
        /// Container name.
        name: String,
        /// Network.
        network: String,
        /// Parent accounting group.
        cgroup_parent: String,
        /// Image.
        image: String,
    },
    /// `inspect_pid`.
    InspectPid {
        /// Name or id.
        container: String,
    },
    /// `start`.
    Start {
        /// Runtime id.
        id: String,
    },
    /// `stop`.
    Stop {
        /// Runtime id.
        id: String,
    },
    /// `remove`.
    Remove {
        /// Runtime id.
        id: String,
        /// Forced removal.
        force: bool,
    },
}

/// Instance held by [`FakeContainerRuntime`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FakeContainer {
    /// Runtime id.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Network.
    pub network: String,
    /// Parent accounting group.
    pub cgroup_parent: String,
    /// Image and parameters.
    pub spec: WorkloadSpec,
    /// Whether the process is running.
    pub running: bool,
    /// Host pid while running.
    pub pid: Option<u32>,
}

#[derive(Debug, Default)]
struct FakeState {
    networks: BTreeMap<String, AddressBlock>,
    containers: BTreeMap<String, FakeContainer>,
    calls: Vec<RuntimeCall>,
    next_id: u64,
    next_pid: u32,
    fail_network: bool,
    fail_create: BTreeSet<String>,
    fail_inspect: bool,
    fail_remove: BTreeSet<String>,
}

impl FakeState {
    fn find_mut(&mut self, container: &str) -> Option<&mut FakeContainer> {
        self.containers
            .values_mut()
            .find(|c| c.id == container || c.name == container)
    }

    fn spawn_pid(&mut self) -> u32 {
        self.next_pid += 1;
        4000 + self.next_pid
    }
}

/// In-memory fake runtime for testing.
///
/// Behaves like a strict engine: instances need an existing network, names
/// are unique, a running instance only goes away with `force`, and a
/// network with attached instances cannot be removed.
#[derive(Debug, Default)]
pub struct FakeContainerRuntime {
    state: Mutex<FakeState>,
}

impl FakeContainerRuntime {
    /// Create a new fake runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state.lock().calls.clone()
    }

    /// Number of live instances.
    #[must_use]
    pub fn container_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    /// Look up an instance by name or id.
    #[must_use]
    pub fn container(&self, container: &str) -> Option<FakeContainer> {
        self.state.lock().find_mut(container).map(|c| c.clone())
    }

    /// Names of live instances.
    #[must_use]
    pub fn container_names(&self) -> Vec<String> {
        self.state
            .lock()
            .containers
            .values()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Whether a network exists.
    #[must_use]
    pub fn has_network(&self, name: &str) -> bool {
        self.state.lock().networks.contains_key(name)
    }

    /// Make every `create_network` call fail.
    pub fn fail_network_create(&self, fail: bool) {
        self.state.lock().fail_network = fail;
    }

    /// Make `create` fail for one container name.
    pub fn fail_create_for(&self, name: &str) {
        self.state.lock().fail_create.insert(name.to_string());
    }

    /// Make every `inspect_pid` call fail.
    pub fn fail_inspect(&self, fail: bool) {
        self.state.lock().fail_inspect = fail;
    }

    /// Make `remove` fail for one container name.
    pub fn fail_remove_for(&self, name: &str) {
        self.state.lock().fail_remove.insert(name.to_string());
    }

    /// Clear every injected failure.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_network = false;
        state.fail_create.clear();
        state.fail_inspect = false;
        state.fail_remove.clear();
    }
}

impl ContainerRuntime for FakeContainerRuntime {
    fn create_network(
        &self,
        name: &str,
        subnet: AddressBlock,
        bridge: &str,
    ) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        state.calls.push(RuntimeCall::CreateNetwork {
            name: name.to_string(),
            subnet,
            bridge: bridge.to_string(),
        });

        if state.fail_network {
            return Err(NodeError::runtime("network create", "injected failure"));
        }
        if state.networks.contains_key(name) {
            return Err(NodeError::runtime(
                "network create",
                format!("network with name {name} already exists"),
            ));
        }
        if let Some((other, _)) = state.networks.iter().find(|(_, b)| b.overlaps(&subnet)) {
            return Err(NodeError::runtime(
                "network create",
                format!("subnet {subnet} overlaps with network {other}"),
            ));
        }

        state.networks.insert(name.to_string(), subnet);
        Ok(())
    }

    fn remove_network(&self, name: &str) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        state.calls.push(RuntimeCall::RemoveNetwork {
            name: name.to_string(),
        });

        if state.containers.values().any(|c| c.network == name) {
            return Err(NodeError::runtime(
                "network rm",
                format!("network {name} has active endpoints"),
            ));
        }
        state
            .networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| NodeError::runtime("network rm", format!("network {name} not found")))
    }

    fn create(&self, request: &CreateRequest<'_>) -> Result<String, NodeError> {
        let mut state = self.state.lock();
        state.calls.push(RuntimeCall::Create {
            name: request.name.to_string(),
            network: request.network.to_string(),
            cgroup_parent: request.cgroup_parent.to_string(),
            image: request.spec.image.clone(),
        });

        if state.fail_create.contains(request.name) {
            return Err(NodeError::runtime("run", "injected failure"));
        }
        if !state.networks.contains_key(request.network) {
            return Err(NodeError::runtime(
                "run",
                format!("network {} not found", request.network),
            ));
        }
        if state.containers.values().any(|c| c.name == request.name) {
            return Err(NodeError::runtime(
                "run",
                format!("container name {} is already in use", request.name),
            ));
        }

        state.next_id += 1;
        let id = format!("{:012x}", state.next_id);
        let pid = state.spawn_pid();
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: request.name.to_string(),
                network: request.network.to_string(),
                cgroup_parent: request.cgroup_parent.to_string(),
                spec: request.spec.clone(),
                running: true,
                pid: Some(pid),
            },
        );
        Ok(id)
    }

    fn inspect_pid(&self, container: &str) -> Result<u32, NodeError> {
        let mut state = self.state.lock();
        state.calls.push(RuntimeCall::InspectPid {
            container: container.to_string(),
        });

        if state.fail_inspect {
            return Err(NodeError::runtime("inspect", "injected failure"));
        }
        let found = state
            .find_mut(container)
            .ok_or_else(|| NodeError::runtime("inspect", format!("no such object: {container}")))?;
        found
            .pid
            .filter(|_| found.running)
            .ok_or_else(|| NodeError::runtime("inspect", format!("{container} is not running")))
    }

    fn start(&self, container: &str) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        state.calls.push(RuntimeCall::Start {
            id: container.to_string(),
        });

        let pid = state.spawn_pid();
        let found = state
            .find_mut(container)
            .ok_or_else(|| NodeError::runtime("start", format!("no such container: {container}")))?;
        if !found.running {
            found.running = true;
            found.pid = Some(pid);
        }
        Ok(())
    }

    fn stop(&self, container: &str) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        state.calls.push(RuntimeCall::Stop {
            id: container.to_string(),
        });

        let found = state
            .find_mut(container)
            .ok_or_else(|| NodeError::runtime("stop", format!("no such container: {container}")))?;
        found.running = false;
        found.pid = None;
        Ok(())
    }

    fn remove(&self, container: &str, force: bool) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        state.calls.push(RuntimeCall::Remove {
            id: container.to_string(),
            force,
        });

        let found = state
            .find_mut(container)
            .ok_or_else(|| NodeError::runtime("rm", format!("no such container: {container}")))?
            .clone();
        if state.fail_remove.contains(&found.name) {
            return Err(NodeError::runtime("rm", "injected failure"));
        }
        if found.running && !force {
            return Err(NodeError::runtime(
                "rm",
                format!("cannot remove running container {}", found.name),
            ));
        }

        state.containers.remove(&found.id);
        Ok(())
    }
}
