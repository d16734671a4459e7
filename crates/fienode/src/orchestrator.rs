//! Builds one node per declared host and mediates every cross-node
//! operation: lookup, full-mesh routing, migration and scale-out.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use fie_network::{ordered_pairs, BlockAllocator, RouteEntry};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{HostSpec, TopologySpec};
use crate::error::NodeError;
use crate::exec::{CommandRunner, ExecutionContext, NamespaceContext};
use crate::node::{FogNode, NodeLifecycleState, NodeServices, TeardownReport};
use crate::workload::WorkloadSpec;

/// Supplies the execution context of each declared host.
pub trait ContextFactory {
    /// Context for `host`.
    ///
    /// # Errors
    ///
    /// Returns an error if the host's context is unavailable.
    fn context(&self, host: &HostSpec) -> Result<Box<dyn ExecutionContext>, NodeError>;
}

impl<F> ContextFactory for F
where
    F: Fn(&HostSpec) -> Result<Box<dyn ExecutionContext>, NodeError>,
{
    fn context(&self, host: &HostSpec) -> Result<Box<dyn ExecutionContext>, NodeError> {
        self(host)
    }
}

/// Enters each host's namespace by pid.
pub struct NamespaceContextFactory {
    runner: Arc<dyn CommandRunner>,
}

impl NamespaceContextFactory {
    /// Create a factory issuing commands through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl ContextFactory for NamespaceContextFactory {
    fn context(&self, host: &HostSpec) -> Result<Box<dyn ExecutionContext>, NodeError> {
        Ok(Box::new(NamespaceContext::new(host.pid, Arc::clone(&self.runner))))
    }
}

/// Runtime container names: `[A-Za-z0-9][A-Za-z0-9_.-]*`.
fn is_valid_container_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// A route that was not installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRoute {
    /// Installing node.
    pub from: String,
    /// Peer node.
    pub to: String,
    /// Why.
    pub reason: String,
}

/// Result of [`Orchestrator::route_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteReport {
    /// Installed routes, keyed by installing node.
    pub installed: Vec<(String, RouteEntry)>,
    /// Pairs left without a route.
    pub skipped: Vec<SkippedRoute>,
}

/// Owns the allocator, the shared collaborators and every node.
pub struct Orchestrator {
    allocator: BlockAllocator,
    services: NodeServices,
    nodes: Vec<FogNode>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("nodes", &self.nodes)
            .field("available_blocks", &self.allocator.available())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build every declared node in order.
    ///
    /// # Errors
    ///
    /// Returns the first construction error. Nodes already built are torn
    /// down and their blocks released before it is returned.
    pub fn build(
        topology: &TopologySpec,
        services: NodeServices,
        contexts: &dyn ContextFactory,
    ) -> Result<Self, NodeError> {
        topology.validate()?;
        let allocator = BlockAllocator::with_config(&topology.pool, topology.hosts.len())?;
        let mut orchestrator = Self {
            allocator,
            services,
            nodes: Vec::with_capacity(topology.hosts.len()),
        };

        for host in &topology.hosts {
            if let Err(e) = orchestrator.add_node(host, &topology.runtime.bridge_prefix, contexts) {
                error!(node = %host.name, error = %e, "topology build failed, rolling back");
                orchestrator.teardown();
                return Err(e);
            }
        }

        info!(nodes = orchestrator.nodes.len(), "topology built");
        Ok(orchestrator)
    }

    fn add_node(
        &mut self,
        host: &HostSpec,
        bridge_prefix: &str,
        contexts: &dyn ContextFactory,
    ) -> Result<(), NodeError> {
        if self.nodes.iter().any(|n| n.name() == host.name) {
            return Err(NodeError::Config(format!(
                "duplicate node name: {}",
                host.name
            )));
        }

        let block = self.allocator.assign()?;
        let result = contexts.context(host).and_then(|context| {
            FogNode::provision(host, bridge_prefix, context, block, self.services.clone())
        });
        match result {
            Ok(node) => {
                self.nodes.push(node);
                Ok(())
            }
            Err(e) => {
                if let Err(release) = self.allocator.release(block) {
                    warn!(%block, error = %release, "block release failed");
                }
                Err(e)
            }
        }
    }

    /// Look up a node.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NotFound`] if no node has that name.
    pub fn node(&self, name: &str) -> Result<&FogNode, NodeError> {
        self.nodes
            .iter()
            .find(|n| n.name() == name)
            .ok_or_else(|| NodeError::node_not_found(name))
    }

    /// Look up a node for mutation.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NotFound`] if no node has that name.
    pub fn node_mut(&mut self, name: &str) -> Result<&mut FogNode, NodeError> {
        self.nodes
            .iter_mut()
            .find(|n| n.name() == name)
            .ok_or_else(|| NodeError::node_not_found(name))
    }

    fn node_index(&self, name: &str) -> Result<usize, NodeError> {
        self.nodes
            .iter()
            .position(|n| n.name() == name)
            .ok_or_else(|| NodeError::node_not_found(name))
    }

    /// Nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[FogNode] {
        &self.nodes
    }

    /// The address allocator.
    #[must_use]
    pub const fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    /// Node hosting `container`; first match in declaration order.
    #[must_use]
    pub fn locate(&self, container: &str) -> Option<&FogNode> {
        self.nodes.iter().find(|n| n.container(container).is_some())
    }

    fn locate_index(&self, container: &str) -> Result<usize, NodeError> {
        self.nodes
            .iter()
            .position(|n| n.container(container).is_some())
            .ok_or_else(|| NodeError::container_not_found(container))
    }

    fn container_names(&self) -> HashSet<String> {
        self.nodes
            .iter()
            .flat_map(FogNode::container_names)
            .collect()
    }

    /// Install on every node a route to every other node's block.
    ///
    /// The next hop is the peer's primary-interface address. Peers whose
    /// address cannot be resolved, and installs that fail, are reported as
    /// skipped.
    pub fn route_all(&self) -> RouteReport {
        let mut report = RouteReport::default();
        for (a, b) in ordered_pairs(self.nodes.len()) {
            let (from, to) = (&self.nodes[a], &self.nodes[b]);
            let skip = |reason: String| SkippedRoute {
                from: from.name().to_string(),
                to: to.name().to_string(),
                reason,
            };

            let Some(via) = to.primary_address() else {
                warn!(from = %from.name(), to = %to.name(), "peer primary address unresolved");
                report.skipped.push(skip(format!(
                    "no address on {}",
                    to.fabric_names().primary
                )));
                continue;
            };

            match from.install_route(to.block(), via) {
                Ok(entry) => report.installed.push((from.name().to_string(), entry)),
                Err(e) => {
                    warn!(from = %from.name(), to = %to.name(), error = %e, "route install failed");
                    report.skipped.push(skip(e.to_string()));
                }
            }
        }

        info!(
            installed = report.installed.len(),
            skipped = report.skipped.len(),
            "full-mesh routing done"
        );
        report
    }

    /// Node name to container names, in declaration order.
    #[must_use]
    pub fn ps(&self) -> Vec<(String, Vec<String>)> {
        self.nodes
            .iter()
            .map(|n| (n.name().to_string(), n.container_names()))
            .collect()
    }

    /// Launch a sequence-named container on `node`. Returns its name.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unknown or the launch fails.
    pub fn run(&mut self, node: &str, spec: WorkloadSpec) -> Result<String, NodeError> {
        let taken = self.container_names();
        let index = self.node_index(node)?;
        self.nodes[index]
            .run_avoiding(spec, &taken)
            .map(|h| h.name().to_string())
    }

    /// Stop a container wherever it lives.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NotFound`] if no node hosts it.
    pub fn stop(&mut self, container: &str) -> Result<(), NodeError> {
        let index = self.locate_index(container)?;
        self.nodes[index].stop(container)
    }

    /// Start a stopped container wherever it lives.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NotFound`] if no node hosts it.
    pub fn start(&mut self, container: &str) -> Result<(), NodeError> {
        let index = self.locate_index(container)?;
        self.nodes[index].start(container)
    }

    /// Destroy a container wherever it lives. Returns the node it lived on.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NotFound`] if no node hosts it.
    pub fn destroy(&mut self, container: &str) -> Result<String, NodeError> {
        let index = self.locate_index(container)?;
        self.nodes[index].destroy(container)?;
        Ok(self.nodes[index].name().to_string())
    }

    /// Cold-migrate `container` to `dest`: remove it from its node, destroy
    /// the instance, then launch the same image and parameters on `dest`.
    /// Returns the new container name.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NotFound`] if the container or the destination
    /// is unknown. If the source instance cannot be destroyed it stays
    /// registered where it was.
    pub fn migrate(&mut self, container: &str, dest: &str) -> Result<String, NodeError> {
        let source = self.locate_index(container)?;
        let target = self.node_index(dest)?;
        if self.nodes[target].state() != NodeLifecycleState::Active {
            return Err(NodeError::construction(
                dest,
                "migrate",
                format!("node is {}", self.nodes[target].state()),
            ));
        }

        let (position, mut handle) = self.nodes[source].take(container)?;
        if let Err(e) = handle.destroy(self.services.runtime.as_ref()) {
            self.nodes[source].restore(position, handle);
            return Err(e);
        }
        let spec = handle.spec().clone();
        let from = self.nodes[source].name().to_string();

        let taken = self.container_names();
        match self.nodes[target].run_avoiding(spec, &taken) {
            Ok(new) => {
                let new = new.name().to_string();
                info!(container, from = %from, to = %dest, new = %new, "container migrated");
                Ok(new)
            }
            Err(e) => {
                error!(container, from = %from, to = %dest, error = %e, "relaunch after migration failed");
                Err(e)
            }
        }
    }

    /// Launch a clone of `container` named `new_name` on `dest`. The source
    /// is left running. Identity-bound parameters are rebound to the new
    /// name.
    ///
    /// # Errors
    ///
    /// Returns an error if the container or destination is unknown, or
    /// `new_name` is invalid or already in use.
    pub fn scale(
        &mut self,
        container: &str,
        new_name: &str,
        dest: &str,
    ) -> Result<String, NodeError> {
        let source = self.locate_index(container)?;
        let target = self.node_index(dest)?;

        if !is_valid_container_name(new_name) {
            return Err(NodeError::InvalidSpec(format!(
                "invalid container name: {new_name:?}"
            )));
        }
        if self.container_names().contains(new_name) {
            return Err(NodeError::InvalidSpec(format!(
                "container name already in use: {new_name}"
            )));
        }

        let spec = self.nodes[source]
            .container(container)
            .map(|h| h.spec().rebind_identity(container, new_name))
            .ok_or_else(|| NodeError::container_not_found(container))?;

        self.nodes[target].run_named(new_name, spec)?;
        info!(container, clone = %new_name, node = %dest, "container scaled out");
        Ok(new_name.to_string())
    }

    /// Tear down every node, remove every accounting group and release
    /// every block.
    ///
    /// A node whose teardown is incomplete keeps its group and block until
    /// a later call finishes it.
    pub fn teardown(&mut self) -> Vec<(String, TeardownReport)> {
        let mut reports = Vec::with_capacity(self.nodes.len());
        for node in &mut self.nodes {
            let already_removed = node.state() == NodeLifecycleState::Removed;
            let report = node.destroy_all();
            if already_removed || node.state() != NodeLifecycleState::Removed {
                reports.push((node.name().to_string(), report));
                continue;
            }
            if let Err(e) = self.services.governor.release(node.name()) {
                warn!(node = %node.name(), error = %e, "accounting group removal failed");
            }
            if let Err(e) = self.allocator.release(node.block()) {
                warn!(node = %node.name(), error = %e, "block release failed");
            }
            reports.push((node.name().to_string(), report));
        }
        info!(nodes = reports.len(), "orchestrator torn down");
        reports
    }
}
