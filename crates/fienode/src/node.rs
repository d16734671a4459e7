//! The emulated node: one execution context, its fabric, its accounting
//! group and its ordered container registry.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use fie_network::{AddressBlock, RouteEntry};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{HostSpec, Tier};
use crate::error::NodeError;
use crate::exec::{CommandRunner, ExecutionContext};
use crate::fabric::{BridgeHandle, FabricBuilder, FabricNames};
use crate::resources::{ApplyReport, ResourceGovernor, ResourceProfile};
use crate::runtime::ContainerRuntime;
use crate::workload::{WorkloadHandle, WorkloadSpec};

/// Node lifecycle. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeLifecycleState {
    /// Nothing built yet.
    Uninitialized,
    /// Fabric built.
    NetworkReady,
    /// Accepts workloads.
    Active,
    /// Destroying workloads and the bridge.
    TearingDown,
    /// Gone.
    Removed,
}

impl fmt::Display for NodeLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::NetworkReady => write!(f, "network-ready"),
            Self::Active => write!(f, "active"),
            Self::TearingDown => write!(f, "tearing-down"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// Shared collaborators threaded through node construction.
#[derive(Clone)]
pub struct NodeServices {
    /// Container runtime.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Accounting governor.
    pub governor: Arc<ResourceGovernor>,
    /// Host command channel.
    pub host: Arc<dyn CommandRunner>,
}

impl NodeServices {
    /// Bundle the collaborators.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        governor: Arc<ResourceGovernor>,
        host: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            runtime,
            governor,
            host,
        }
    }

    fn fabric(&self) -> FabricBuilder {
        FabricBuilder::new(Arc::clone(&self.host), Arc::clone(&self.runtime))
    }
}

impl fmt::Debug for NodeServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeServices")
            .field("governor", &self.governor)
            .finish_non_exhaustive()
    }
}

/// Result of [`FogNode::destroy_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    /// Containers removed.
    pub destroyed: Vec<String>,
    /// Containers whose removal failed, with the reason.
    pub failed: Vec<(String, String)>,
    /// Whether the bridge network is gone.
    pub bridge_removed: bool,
    /// Why the bridge network was left in place, if it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_kept: Option<String>,
}

/// One emulated fog-infrastructure host.
pub struct FogNode {
    name: String,
    tier: Tier,
    context: Box<dyn ExecutionContext>,
    block: AddressBlock,
    names: FabricNames,
    bridge: Option<BridgeHandle>,
    profile: ResourceProfile,
    apply_report: ApplyReport,
    containers: Vec<WorkloadHandle>,
    next_sequence: u64,
    state: NodeLifecycleState,
    services: NodeServices,
}

impl fmt::Debug for FogNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FogNode")
            .field("name", &self.name)
            .field("tier", &self.tier)
            .field("block", &self.block)
            .field("state", &self.state)
            .field("containers", &self.container_names())
            .finish_non_exhaustive()
    }
}

impl FogNode {
    /// Build the fabric, apply the resource profile and return an active
    /// node.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::ConstructionFailure`] if a fabric or accounting
    /// step fails. Every fabric step is undone again when the profile
    /// cannot be applied.
    pub fn provision(
        host: &HostSpec,
        bridge_prefix: &str,
        context: Box<dyn ExecutionContext>,
        block: AddressBlock,
        services: NodeServices,
    ) -> Result<Self, NodeError> {
        let names = FabricNames::new(&host.name, bridge_prefix, host.primary_interface.as_deref());
        let mut node = Self {
            name: host.name.clone(),
            tier: host.tier,
            context,
            block,
            names,
            bridge: None,
            profile: host.profile.clone(),
            apply_report: ApplyReport::default(),
            containers: Vec::new(),
            next_sequence: 0,
            state: NodeLifecycleState::Uninitialized,
            services,
        };

        let fabric = node.services.fabric();
        let bridge = fabric.build(&node.names, block, node.context.as_ref())?;
        node.bridge = Some(bridge);
        node.state = NodeLifecycleState::NetworkReady;

        match node
            .services
            .governor
            .apply(&node.name, node.context.pid(), &node.profile)
        {
            Ok(report) => node.apply_report = report,
            Err(e) => {
                error!(node = %node.name, error = %e, "resource profile failed, unwinding fabric");
                if let Some(bridge) = node.bridge.take() {
                    fabric.unwind_built(&bridge, node.context.as_ref());
                }
                return Err(e);
            }
        }

        node.state = NodeLifecycleState::Active;
        info!(
            node = %node.name,
            tier = %node.tier,
            %block,
            gateway = %block.gateway(),
            pid = node.context.pid(),
            "node active"
        );
        Ok(node)
    }

    fn ensure_active(&self, operation: &str) -> Result<(), NodeError> {
        if self.state == NodeLifecycleState::Active {
            Ok(())
        } else {
            Err(NodeError::construction(
                &self.name,
                operation,
                format!("node is {}", self.state),
            ))
        }
    }

    /// Launch a container named `<node>-<sequence>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not active, the workload spec is invalid or
    /// the runtime fails.
    pub fn run(&mut self, spec: WorkloadSpec) -> Result<&WorkloadHandle, NodeError> {
        self.run_avoiding(spec, &HashSet::new())
    }

    /// Like [`FogNode::run`], also skipping sequence names found in
    /// `taken`.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not active, the workload spec is invalid or
    /// the runtime fails.
    pub fn run_avoiding(
        &mut self,
        spec: WorkloadSpec,
        taken: &HashSet<String>,
    ) -> Result<&WorkloadHandle, NodeError> {
        self.ensure_active("run")?;
        spec.validate()?;
        let name = self.next_name(taken);
        self.launch(name, spec)
    }

    /// Launch a container under an explicit name. Does not consume a
    /// sequence number.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not active, the name is already
    /// registered, the workload spec is invalid or the runtime fails.
    pub fn run_named(
        &mut self,
        name: &str,
        spec: WorkloadSpec,
    ) -> Result<&WorkloadHandle, NodeError> {
        self.ensure_active("run")?;
        spec.validate()?;
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(NodeError::InvalidSpec(format!(
                "invalid container name: {name:?}"
            )));
        }
        if self.position(name).is_some() {
            return Err(NodeError::InvalidSpec(format!(
                "container name already in use: {name}"
            )));
        }
        self.launch(name.to_string(), spec)
    }

    fn next_name(&mut self, taken: &HashSet<String>) -> String {
        loop {
            let candidate = format!("{}-{}", self.name, self.next_sequence);
            self.next_sequence += 1;
            if self.position(&candidate).is_none() && !taken.contains(&candidate) {
                return candidate;
            }
        }
    }

    fn launch(&mut self, name: String, spec: WorkloadSpec) -> Result<&WorkloadHandle, NodeError> {
        let network = self
            .bridge
            .as_ref()
            .map(|b| b.network().to_string())
            .ok_or_else(|| NodeError::construction(&self.name, "run", "no bridge network"))?;

        let handle = WorkloadHandle::create(
            self.services.runtime.as_ref(),
            &name,
            &self.name,
            &network,
            &self.name,
            spec,
        )?;
        self.containers.push(handle);
        Ok(&self.containers[self.containers.len() - 1])
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.containers.iter().position(|h| h.name() == name)
    }

    fn handle_mut(&mut self, name: &str) -> Result<&mut WorkloadHandle, NodeError> {
        self.containers
            .iter_mut()
            .find(|h| h.name() == name)
            .ok_or_else(|| NodeError::container_not_found(name))
    }

    /// Stop a container, keeping it registered.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NotFound`] if no such container is registered.
    pub fn stop(&mut self, name: &str) -> Result<(), NodeError> {
        let runtime = Arc::clone(&self.services.runtime);
        self.handle_mut(name)?.stop(runtime.as_ref())
    }

    /// Start a stopped container.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NotFound`] if no such container is registered.
    pub fn start(&mut self, name: &str) -> Result<(), NodeError> {
        let runtime = Arc::clone(&self.services.runtime);
        self.handle_mut(name)?.start(runtime.as_ref())
    }

    /// Force-remove a container and drop it from the registry.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NotFound`] if no such container is registered,
    /// or the runtime error; the handle then stays registered.
    pub fn destroy(&mut self, name: &str) -> Result<WorkloadHandle, NodeError> {
        let index = self
            .position(name)
            .ok_or_else(|| NodeError::container_not_found(name))?;
        self.containers[index].destroy(self.services.runtime.as_ref())?;
        let handle = self.containers.remove(index);
        info!(node = %self.name, container = %name, "container destroyed");
        Ok(handle)
    }

    /// Remove a container from the registry without touching the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NotFound`] if no such container is registered.
    pub fn take(&mut self, name: &str) -> Result<(usize, WorkloadHandle), NodeError> {
        let index = self
            .position(name)
            .ok_or_else(|| NodeError::container_not_found(name))?;
        Ok((index, self.containers.remove(index)))
    }

    /// Put a handle taken with [`FogNode::take`] back at its position.
    pub fn restore(&mut self, index: usize, handle: WorkloadHandle) {
        let index = index.min(self.containers.len());
        self.containers.insert(index, handle);
    }

    /// Destroy every container in registry order, then remove the bridge.
    ///
    /// Failures are logged and the remaining containers are still
    /// destroyed. Containers that could not be removed stay registered and
    /// keep the bridge alive: the node then stays tearing-down, refuses
    /// workloads, and a later call retries what is left. The node is
    /// removed once no container and no bridge remain.
    pub fn destroy_all(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.state == NodeLifecycleState::Removed {
            return report;
        }
        self.state = NodeLifecycleState::TearingDown;

        let runtime = Arc::clone(&self.services.runtime);
        for mut handle in std::mem::take(&mut self.containers) {
            if handle.state().is_terminal() {
                continue;
            }
            match handle.destroy(runtime.as_ref()) {
                Ok(()) => report.destroyed.push(handle.name().to_string()),
                Err(e) => {
                    warn!(node = %self.name, container = %handle.name(), error = %e, "container removal failed during teardown");
                    report.failed.push((handle.name().to_string(), e.to_string()));
                    self.containers.push(handle);
                }
            }
        }

        if !self.containers.is_empty() {
            let reason = format!("{} container(s) still attached", self.containers.len());
            warn!(node = %self.name, %reason, "bridge removal deferred");
            report.bridge_kept = Some(reason);
        } else if let Some(bridge) = self.bridge.take() {
            match self.services.fabric().teardown(&bridge) {
                Ok(()) => report.bridge_removed = true,
                Err(e) => {
                    warn!(node = %self.name, error = %e, "bridge removal failed during teardown");
                    report.bridge_kept = Some(e.to_string());
                    self.bridge = Some(bridge);
                }
            }
        }

        if self.containers.is_empty() && self.bridge.is_none() {
            self.state = NodeLifecycleState::Removed;
        }
        info!(
            node = %self.name,
            destroyed = report.destroyed.len(),
            failed = report.failed.len(),
            state = %self.state,
            "node torn down"
        );
        report
    }

    /// Install a static route to `destination` via `via` on the primary
    /// interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not active or the route command
    /// fails.
    pub fn install_route(
        &self,
        destination: AddressBlock,
        via: Ipv4Addr,
    ) -> Result<RouteEntry, NodeError> {
        self.ensure_active("route")?;
        let entry = RouteEntry::new(destination, via, &self.names.primary);
        self.context.cmd_checked("ip", &entry.to_ip_args())?;
        info!(node = %self.name, route = %entry, "route installed");
        Ok(entry)
    }

    /// Current address of the primary interface.
    #[must_use]
    pub fn primary_address(&self) -> Option<Ipv4Addr> {
        self.context.interface_ipv4(&self.names.primary)
    }

    /// Node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tier.
    #[must_use]
    pub const fn tier(&self) -> Tier {
        self.tier
    }

    /// Address block.
    #[must_use]
    pub const fn block(&self) -> AddressBlock {
        self.block
    }

    /// Gateway address of the block.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        self.block.gateway()
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn state(&self) -> NodeLifecycleState {
        self.state
    }

    /// Fabric, while network-ready or active.
    #[must_use]
    pub const fn bridge(&self) -> Option<&BridgeHandle> {
        self.bridge.as_ref()
    }

    /// Derived interface and network names.
    #[must_use]
    pub const fn fabric_names(&self) -> &FabricNames {
        &self.names
    }

    /// Resource profile.
    #[must_use]
    pub const fn profile(&self) -> &ResourceProfile {
        &self.profile
    }

    /// What the governor did with the profile.
    #[must_use]
    pub const fn apply_report(&self) -> &ApplyReport {
        &self.apply_report
    }

    /// Process owning the node's namespace.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.context.pid()
    }

    /// Registered containers in creation order.
    #[must_use]
    pub fn containers(&self) -> &[WorkloadHandle] {
        &self.containers
    }

    /// Look up a registered container.
    #[must_use]
    pub fn container(&self, name: &str) -> Option<&WorkloadHandle> {
        self.containers.iter().find(|h| h.name() == name)
    }

    /// Registered container names in creation order.
    #[must_use]
    pub fn container_names(&self) -> Vec<String> {
        self.containers.iter().map(|h| h.name().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{FakeExecutionContext, RecordingRunner};
    use crate::resources::{AccountingBackend, FakeAccounting};
    use crate::runtime::{FakeContainerRuntime, RuntimeCall};
    use crate::workload::WorkloadState;
    use proptest::prelude::*;

    struct Fixture {
        host: Arc<RecordingRunner>,
        runtime: Arc<FakeContainerRuntime>,
        accounting: Arc<FakeAccounting>,
        services: NodeServices,
    }

    fn fixture() -> Fixture {
        let host = Arc::new(RecordingRunner::new());
        let runtime = Arc::new(FakeContainerRuntime::new());
        let accounting = Arc::new(FakeAccounting::new());
        let governor = ResourceGovernor::new(Arc::clone(&accounting) as Arc<dyn AccountingBackend>)
            .with_host_cores(2);
        let services = NodeServices::new(
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            Arc::new(governor),
            Arc::clone(&host) as Arc<dyn CommandRunner>,
        );
        Fixture {
            host,
            runtime,
            accounting,
            services,
        }
    }

    fn block() -> AddressBlock {
        "192.168.11.0/24".parse().expect("valid block")
    }

    fn provision(fx: &Fixture, name: &str) -> FogNode {
        let context = FakeExecutionContext::new(5000)
            .with_interface(format!("{name}-eth0"), Ipv4Addr::new(10, 0, 0, 1));
        FogNode::provision(
            &HostSpec::new(name, Tier::Fog, 5000),
            "netns-",
            Box::new(context),
            block(),
            fx.services.clone(),
        )
        .expect("should provision")
    }

    fn image() -> WorkloadSpec {
        WorkloadSpec::new("tz70s/busy-wait")
    }

    // ==================== PROVISION TESTS ====================

    #[test]
    fn test_provisioned_node_is_active() {
        let fx = fixture();
        let node = provision(&fx, "fog");

        assert_eq!(node.state(), NodeLifecycleState::Active);
        assert_eq!(node.gateway(), Ipv4Addr::new(192, 168, 11, 1));
        assert!(node.bridge().is_some());
        assert!(node.containers().is_empty());
        assert!(fx.runtime.has_network("netns-fog"));
        assert!(fx.accounting.has_group("fog"));
    }

    #[test]
    fn test_profile_failure_unwinds_whole_fabric() {
        let fx = fixture();
        fx.accounting.fail_classify(true);
        let recorder = Arc::new(RecordingRunner::new());

        let result = FogNode::provision(
            &HostSpec::new("fog", Tier::Fog, 5000),
            "netns-",
            Box::new(FakeExecutionContext::new(5000).with_recorder(Arc::clone(&recorder))),
            block(),
            fx.services.clone(),
        );

        assert!(matches!(result, Err(NodeError::ConstructionFailure { .. })));
        assert!(!fx.runtime.has_network("netns-fog"));
        assert_eq!(fx.host.calls_matching("link del"), vec!["ip link del fog-dport"]);
        assert_eq!(recorder.calls_matching("iptables").len(), 6);
        assert_eq!(recorder.calls_matching(" -D ").len(), 3);
        assert!(!fx.accounting.has_group("fog"));
    }

    // ==================== NAMING TESTS ====================

    #[test]
    fn test_sequence_names_never_reused() {
        let fx = fixture();
        let mut node = provision(&fx, "cloud");

        assert_eq!(node.run(image()).expect("run").name(), "cloud-0");
        assert_eq!(node.run(image()).expect("run").name(), "cloud-1");
        node.destroy("cloud-0").expect("destroy");
        assert_eq!(node.run(image()).expect("run").name(), "cloud-2");
        assert_eq!(node.container_names(), vec!["cloud-1", "cloud-2"]);
    }

    #[test]
    fn test_explicit_name_does_not_consume_sequence() {
        let fx = fixture();
        let mut node = provision(&fx, "fog");

        node.run_named("fog-0", image()).expect("run named");
        assert_eq!(node.run(image()).expect("run").name(), "fog-1");
        node.run_named("replica", image()).expect("run named");
        assert_eq!(node.run(image()).expect("run").name(), "fog-2");
    }

    #[test]
    fn test_taken_names_are_skipped() {
        let fx = fixture();
        let mut node = provision(&fx, "fog");
        let taken: HashSet<String> = ["fog-0".to_string()].into_iter().collect();

        assert_eq!(
            node.run_avoiding(image(), &taken).expect("run").name(),
            "fog-1"
        );
    }

    #[test]
    fn test_duplicate_explicit_name_rejected() {
        let fx = fixture();
        let mut node = provision(&fx, "fog");
        node.run_named("db", image()).expect("run named");

        assert!(matches!(
            node.run_named("db", image()),
            Err(NodeError::InvalidSpec(_))
        ));
    }

    // ==================== WORKLOAD TESTS ====================

    #[test]
    fn test_run_attaches_to_bridge_and_group() {
        let fx = fixture();
        let mut node = provision(&fx, "fog");
        let handle = node.run(image()).expect("run");

        assert_eq!(handle.network(), "netns-fog");
        assert_eq!(handle.cgroup_parent(), "fog");
        assert_eq!(handle.state(), WorkloadState::Running);
    }

    #[test]
    fn test_invalid_spec_rejected_before_runtime() {
        let fx = fixture();
        let mut node = provision(&fx, "fog");
        let before = fx.runtime.calls().len();

        assert!(matches!(
            node.run(WorkloadSpec::new("")),
            Err(NodeError::InvalidSpec(_))
        ));
        assert_eq!(fx.runtime.calls().len(), before);
    }

    #[test]
    fn test_missing_container_is_not_found() {
        let fx = fixture();
        let mut node = provision(&fx, "fog");

        assert!(node.stop("fog-9").expect_err("missing").is_not_found());
        assert!(node.start("fog-9").expect_err("missing").is_not_found());
        assert!(node.destroy("fog-9").expect_err("missing").is_not_found());
    }

    #[test]
    fn test_stop_and_start() {
        let fx = fixture();
        let mut node = provision(&fx, "fog");
        node.run(image()).expect("run");

        node.stop("fog-0").expect("stop");
        assert_eq!(
            node.container("fog-0").map(WorkloadHandle::state),
            Some(WorkloadState::Stopped)
        );
        node.start("fog-0").expect("start");
        assert_eq!(
            node.container("fog-0").map(WorkloadHandle::state),
            Some(WorkloadState::Running)
        );
    }

    #[test]
    fn test_take_and_restore_keep_position() {
        let fx = fixture();
        let mut node = provision(&fx, "fog");
        for _ in 0..3 {
            node.run(image()).expect("run");
        }

        let (index, handle) = node.take("fog-1").expect("take");
        assert_eq!(node.container_names(), vec!["fog-0", "fog-2"]);
        node.restore(index, handle);
        assert_eq!(node.container_names(), vec!["fog-0", "fog-1", "fog-2"]);
    }

    // ==================== TEARDOWN TESTS ====================

    #[test]
    fn test_destroy_all_empties_registry_then_removes_bridge() {
        let fx = fixture();
        let mut node = provision(&fx, "fog");
        node.run(image()).expect("run");
        node.run(image()).expect("run");

        let report = node.destroy_all();

        assert_eq!(report.destroyed, vec!["fog-0", "fog-1"]);
        assert!(report.bridge_removed);
        assert!(node.containers().is_empty());
        assert!(node.bridge().is_none());
        assert_eq!(node.state(), NodeLifecycleState::Removed);

        let calls = fx.runtime.calls();
        let bridge_removal = calls
            .iter()
            .position(|c| matches!(c, RuntimeCall::RemoveNetwork { .. }))
            .expect("bridge removed");
        let last_container_removal = calls
            .iter()
            .rposition(|c| matches!(c, RuntimeCall::Remove { .. }))
            .expect("containers removed");
        assert!(last_container_removal < bridge_removal);
    }

    #[test]
    fn test_run_after_destroy_all_is_construction_failure() {
        let fx = fixture();
        let mut node = provision(&fx, "fog");
        node.destroy_all();

        assert!(matches!(
            node.run(image()),
            Err(NodeError::ConstructionFailure { .. })
        ));
    }

    #[test]
    fn test_destroy_all_is_best_effort() {
        let fx = fixture();
        let mut node = provision(&fx, "fog");
        for _ in 0..3 {
            node.run(image()).expect("run");
        }
        fx.runtime.fail_remove_for("fog-1");

        let report = node.destroy_all();

        assert_eq!(report.destroyed, vec!["fog-0", "fog-2"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "fog-1");
        assert_eq!(node.container_names(), vec!["fog-1"]);
    }

    #[test]
    fn test_destroy_all_keeps_bridge_while_containers_remain() {
        let fx = fixture();
        let mut node = provision(&fx, "fog");
        node.run(image()).expect("run");
        node.run(image()).expect("run");
        fx.runtime.fail_remove_for("fog-1");

        let report = node.destroy_all();

        assert!(!report.bridge_removed);
        assert_eq!(report.bridge_kept.as_deref(), Some("1 container(s) still attached"));
        assert!(node.bridge().is_some());
        assert!(fx.runtime.has_network("netns-fog"));
        assert!(!fx
            .runtime
            .calls()
            .iter()
            .any(|c| matches!(c, RuntimeCall::RemoveNetwork { .. })));
        assert_eq!(node.state(), NodeLifecycleState::TearingDown);
        assert!(node.run(image()).is_err());
    }

    #[test]
    fn test_destroy_all_retry_finishes_teardown() {
        let fx = fixture();
        let mut node = provision(&fx, "fog");
        node.run(image()).expect("run");
        fx.runtime.fail_remove_for("fog-0");
        node.destroy_all();

        fx.runtime.clear_failures();
        let report = node.destroy_all();

        assert_eq!(report.destroyed, vec!["fog-0"]);
        assert!(report.bridge_removed);
        assert_eq!(report.bridge_kept, None);
        assert!(node.bridge().is_none());
        assert!(!fx.runtime.has_network("netns-fog"));
        assert_eq!(node.state(), NodeLifecycleState::Removed);
    }

    #[test]
    fn test_destroy_all_twice_is_noop() {
        let fx = fixture();
        let mut node = provision(&fx, "fog");
        node.destroy_all();
        assert_eq!(node.destroy_all(), TeardownReport::default());
    }

    // ==================== ROUTE TESTS ====================

    #[test]
    fn test_install_route_uses_primary_interface() {
        let fx = fixture();
        let node = provision(&fx, "fog");
        let peer: AddressBlock = "192.168.12.0/24".parse().expect("valid block");

        let entry = node
            .install_route(peer, Ipv4Addr::new(10, 0, 0, 2))
            .expect("route");

        assert_eq!(entry.to_string(), "192.168.12.0/24 via 10.0.0.2 dev fog-eth0");
        assert_eq!(node.primary_address(), Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    proptest! {
        #[test]
        fn prop_sequence_names_strictly_increase(ops in proptest::collection::vec(any::<bool>(), 1..40)) {
            let fx = fixture();
            let mut node = provision(&fx, "fog");
            let mut last: Option<u64> = None;

            for run in ops {
                if run || node.containers().is_empty() {
                    let name = node.run(image()).expect("run").name().to_string();
                    let seq: u64 = name
                        .strip_prefix("fog-")
                        .and_then(|s| s.parse().ok())
                        .expect("sequence name");
                    prop_assert!(last.is_none_or(|l| seq > l), "{name} after {last:?}");
                    last = Some(seq);
                } else {
                    let first = node.container_names()[0].clone();
                    node.destroy(&first).expect("destroy");
                }
            }
        }
    }
}
