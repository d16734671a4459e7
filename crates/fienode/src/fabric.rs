//! Node network fabric: virtual link, per-node bridge network and NAT.
//!
//! ```text
//!   host namespace                       node context (pid)
//!  ┌───────────────────────┐            ┌──────────────────────────┐
//!  │ bridge <prefix><node> │            │ <node>-eth1  gateway/nn  │
//!  │   └─ <node>-dport ◄───┼── veth ────┼──►                       │
//!  │   └─ containers       │            │ <node>-eth0  primary     │
//!  └───────────────────────┘            │ NAT: masquerade on eth0  │
//!                                       └──────────────────────────┘
//! ```
//!
//! Steps run strictly in order. A failed step undoes every step already
//! applied before the error is returned.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use fie_network::AddressBlock;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::NodeError;
use crate::exec::{argv, CommandRunner, ExecutionContext};
use crate::runtime::ContainerRuntime;

/// Interface and network names derived from a node name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FabricNames {
    /// Node name.
    pub node: String,
    /// Link end living in the node context.
    pub node_link: String,
    /// Link end left on the host and attached to the bridge.
    pub host_link: String,
    /// Runtime network name.
    pub network: String,
    /// Host bridge device name.
    pub bridge: String,
    /// The node's uplink interface, NAT egress and route egress.
    pub primary: String,
}

impl FabricNames {
    /// Derive names for `node`. The primary interface defaults to
    /// `<node>-eth0`.
    #[must_use]
    pub fn new(node: &str, bridge_prefix: &str, primary: Option<&str>) -> Self {
        let network = format!("{bridge_prefix}{node}");
        Self {
            node: node.to_string(),
            node_link: format!("{node}-eth1"),
            host_link: format!("{node}-dport"),
            bridge: network.clone(),
            network,
            primary: primary.map_or_else(|| format!("{node}-eth0"), str::to_string),
        }
    }
}

/// One step of fabric construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricStep {
    /// Create the veth pair on the host.
    CreateLink,
    /// Move the node end into the node context.
    MoveLink,
    /// Bring the node end up with the gateway address.
    ConfigureAddress,
    /// Create the bridge network.
    CreateBridge,
    /// Enslave the host end to the bridge.
    AttachBridge,
    /// Install masquerade and forwarding rules.
    InstallNat,
}

impl fmt::Display for FabricStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateLink => "create link",
            Self::MoveLink => "move link",
            Self::ConfigureAddress => "configure address",
            Self::CreateBridge => "create bridge",
            Self::AttachBridge => "attach bridge",
            Self::InstallNat => "install nat",
        };
        f.write_str(name)
    }
}

/// A built fabric. Exists only while the node is network-ready or active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeHandle {
    /// Derived names.
    pub names: FabricNames,
    /// The node's block.
    pub block: AddressBlock,
    /// Address on the node end of the link.
    pub gateway: Ipv4Addr,
}

impl BridgeHandle {
    /// Runtime network containers attach to.
    #[must_use]
    pub fn network(&self) -> &str {
        &self.names.network
    }
}

/// `iptables` arguments of the masquerade rule and both forwarding rules.
#[must_use]
pub fn nat_rules(primary: &str, node_link: &str) -> Vec<Vec<String>> {
    vec![
        argv(["-t", "nat", "-A", "POSTROUTING", "-o", primary, "-j", "MASQUERADE"]),
        argv([
            "-A",
            "FORWARD",
            "-i",
            primary,
            "-o",
            node_link,
            "-m",
            "state",
            "--state",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ]),
        argv(["-A", "FORWARD", "-i", node_link, "-o", primary, "-j", "ACCEPT"]),
    ]
}

fn delete_form(rule: &[String]) -> Vec<String> {
    rule.iter()
        .map(|arg| if arg == "-A" { "-D".to_string() } else { arg.clone() })
        .collect()
}

enum Undo {
    DeleteLink(String),
    RemoveNetwork(String),
    DeleteRule(Vec<String>),
}

/// Builds and tears down node fabrics.
pub struct FabricBuilder {
    host: Arc<dyn CommandRunner>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl fmt::Debug for FabricBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FabricBuilder").finish_non_exhaustive()
    }
}

impl FabricBuilder {
    /// Create a builder issuing host commands through `host` and network
    /// calls through `runtime`.
    #[must_use]
    pub fn new(host: Arc<dyn CommandRunner>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { host, runtime }
    }

    /// Build the fabric for one node.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::ConstructionFailure`] naming the failed step.
    /// Every step applied before it has been undone by then.
    pub fn build(
        &self,
        names: &FabricNames,
        block: AddressBlock,
        context: &dyn ExecutionContext,
    ) -> Result<BridgeHandle, NodeError> {
        let mut undo = Vec::new();
        match self.run_steps(names, block, context, &mut undo) {
            Ok(handle) => {
                info!(node = %names.node, %block, network = %names.network, "fabric ready");
                Ok(handle)
            }
            Err((step, e)) => {
                error!(node = %names.node, %step, error = %e, "fabric construction failed");
                self.unwind(names, context, undo);
                Err(NodeError::construction(&names.node, step, e))
            }
        }
    }

    fn run_steps(
        &self,
        names: &FabricNames,
        block: AddressBlock,
        context: &dyn ExecutionContext,
        undo: &mut Vec<Undo>,
    ) -> Result<BridgeHandle, (FabricStep, NodeError)> {
        let pid = context.pid().to_string();
        let gateway_cidr = block.gateway_cidr();

        self.host(
            FabricStep::CreateLink,
            &argv([
                "link",
                "add",
                names.node_link.as_str(),
                "type",
                "veth",
                "peer",
                "name",
                names.host_link.as_str(),
            ]),
        )?;
        undo.push(Undo::DeleteLink(names.host_link.clone()));

        self.host(
            FabricStep::MoveLink,
            &argv(["link", "set", names.node_link.as_str(), "netns", pid.as_str()]),
        )?;

        let step = FabricStep::ConfigureAddress;
        context
            .cmd_checked("ip", &argv(["link", "set", names.node_link.as_str(), "up"]))
            .map_err(|e| (step, e))?;
        context
            .cmd_checked(
                "ip",
                &argv(["addr", "add", gateway_cidr.as_str(), "dev", names.node_link.as_str()]),
            )
            .map_err(|e| (step, e))?;

        self.runtime
            .create_network(&names.network, block, &names.bridge)
            .map_err(|e| (FabricStep::CreateBridge, e))?;
        undo.push(Undo::RemoveNetwork(names.network.clone()));

        self.host(
            FabricStep::AttachBridge,
            &argv(["link", "set", names.host_link.as_str(), "master", names.bridge.as_str()]),
        )?;
        self.host(
            FabricStep::AttachBridge,
            &argv(["link", "set", names.host_link.as_str(), "up"]),
        )?;

        for rule in nat_rules(&names.primary, &names.node_link) {
            context
                .cmd_checked("iptables", &rule)
                .map_err(|e| (FabricStep::InstallNat, e))?;
            undo.push(Undo::DeleteRule(delete_form(&rule)));
        }

        Ok(BridgeHandle {
            names: names.clone(),
            block,
            gateway: block.gateway(),
        })
    }

    fn host(&self, step: FabricStep, args: &[String]) -> Result<(), (FabricStep, NodeError)> {
        debug!(%step, args = ?args, "host ip call");
        self.host
            .run_checked("ip", args)
            .map(|_| ())
            .map_err(|e| (step, e))
    }

    fn unwind(&self, names: &FabricNames, context: &dyn ExecutionContext, undo: Vec<Undo>) {
        for action in undo.into_iter().rev() {
            let result = match &action {
                Undo::DeleteRule(rule) => context.cmd_checked("iptables", rule).map(|_| ()),
                Undo::RemoveNetwork(network) => self.runtime.remove_network(network),
                Undo::DeleteLink(link) => self
                    .host
                    .run_checked("ip", &argv(["link", "del", link.as_str()]))
                    .map(|_| ()),
            };
            if let Err(e) = result {
                warn!(node = %names.node, error = %e, "fabric cleanup step failed");
            }
        }
    }

    /// Undo every step of a completed build: the NAT rules, the bridge
    /// network and the veth pair, in reverse order. Failures are logged and
    /// the remaining steps still run.
    ///
    /// Used when a node fails after its fabric came up, so nothing the
    /// build added outlives the node.
    pub fn unwind_built(&self, handle: &BridgeHandle, context: &dyn ExecutionContext) {
        let names = &handle.names;
        let mut undo = vec![
            Undo::DeleteLink(names.host_link.clone()),
            Undo::RemoveNetwork(names.network.clone()),
        ];
        undo.extend(
            nat_rules(&names.primary, &names.node_link)
                .iter()
                .map(|rule| Undo::DeleteRule(delete_form(rule))),
        );
        self.unwind(names, context, undo);
        info!(node = %names.node, network = %names.network, "fabric unwound");
    }

    /// Remove the bridge network. Every container attached to it must be
    /// gone by then.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime refuses to remove the network.
    pub fn teardown(&self, handle: &BridgeHandle) -> Result<(), NodeError> {
        self.runtime.remove_network(handle.network())?;
        info!(node = %handle.names.node, network = %handle.network(), "bridge removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{FakeExecutionContext, RecordingRunner};
    use crate::runtime::{FakeContainerRuntime, RuntimeCall};

    struct Harness {
        host: Arc<RecordingRunner>,
        runtime: Arc<FakeContainerRuntime>,
        context: FakeExecutionContext,
        builder: FabricBuilder,
    }

    fn harness(host: RecordingRunner, ctx: RecordingRunner) -> Harness {
        let host = Arc::new(host);
        let runtime = Arc::new(FakeContainerRuntime::new());
        let context = FakeExecutionContext::new(4242).with_recorder(Arc::new(ctx));
        let builder = FabricBuilder::new(
            Arc::clone(&host) as Arc<dyn CommandRunner>,
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        );
        Harness {
            host,
            runtime,
            context,
            builder,
        }
    }

    fn block() -> AddressBlock {
        "192.168.11.0/24".parse().expect("valid block")
    }

    #[test]
    fn test_names() {
        let names = FabricNames::new("fog", "netns-", None);
        assert_eq!(names.node_link, "fog-eth1");
        assert_eq!(names.host_link, "fog-dport");
        assert_eq!(names.network, "netns-fog");
        assert_eq!(names.bridge, "netns-fog");
        assert_eq!(names.primary, "fog-eth0");

        let names = FabricNames::new("fog", "netns-", Some("uplink0"));
        assert_eq!(names.primary, "uplink0");
    }

    #[test]
    fn test_nat_rules() {
        let rules: Vec<String> = nat_rules("fog-eth0", "fog-eth1")
            .iter()
            .map(|r| r.join(" "))
            .collect();
        assert_eq!(
            rules,
            vec![
                "-t nat -A POSTROUTING -o fog-eth0 -j MASQUERADE",
                "-A FORWARD -i fog-eth0 -o fog-eth1 -m state --state RELATED,ESTABLISHED -j ACCEPT",
                "-A FORWARD -i fog-eth1 -o fog-eth0 -j ACCEPT",
            ]
        );
    }

    // ==================== BUILD TESTS ====================

    #[test]
    fn test_build_runs_steps_in_order() {
        let h = harness(RecordingRunner::new(), RecordingRunner::new());
        let names = FabricNames::new("fog", "netns-", None);

        let handle = h
            .builder
            .build(&names, block(), &h.context)
            .expect("should build");

        assert_eq!(handle.gateway, Ipv4Addr::new(192, 168, 11, 1));
        assert_eq!(handle.network(), "netns-fog");
        assert_eq!(
            h.host.calls(),
            vec![
                "ip link add fog-eth1 type veth peer name fog-dport",
                "ip link set fog-eth1 netns 4242",
                "ip link set fog-dport master netns-fog",
                "ip link set fog-dport up",
            ]
        );
        assert_eq!(
            h.context.recorder().calls(),
            vec![
                "ip link set fog-eth1 up",
                "ip addr add 192.168.11.1/24 dev fog-eth1",
                "iptables -t nat -A POSTROUTING -o fog-eth0 -j MASQUERADE",
                "iptables -A FORWARD -i fog-eth0 -o fog-eth1 -m state --state RELATED,ESTABLISHED -j ACCEPT",
                "iptables -A FORWARD -i fog-eth1 -o fog-eth0 -j ACCEPT",
            ]
        );
        assert!(h.runtime.has_network("netns-fog"));
    }

    #[test]
    fn test_bridge_failure_removes_link() {
        let h = harness(RecordingRunner::new(), RecordingRunner::new());
        h.runtime.fail_network_create(true);
        let names = FabricNames::new("fog", "netns-", None);

        let err = h
            .builder
            .build(&names, block(), &h.context)
            .expect_err("should fail");

        assert!(
            matches!(err, NodeError::ConstructionFailure { ref step, .. } if step == "create bridge")
        );
        assert_eq!(h.host.calls().last().map(String::as_str), Some("ip link del fog-dport"));
        assert!(h.context.recorder().calls_matching("iptables").is_empty());
    }

    #[test]
    fn test_nat_failure_unwinds_everything() {
        let h = harness(
            RecordingRunner::new(),
            RecordingRunner::new().failing_on("RELATED,ESTABLISHED"),
        );
        let names = FabricNames::new("fog", "netns-", None);

        let err = h
            .builder
            .build(&names, block(), &h.context)
            .expect_err("should fail");

        assert!(matches!(err, NodeError::ConstructionFailure { ref step, .. } if step == "install nat"));
        assert_eq!(
            h.context.recorder().calls_matching("-D"),
            vec!["iptables -t nat -D POSTROUTING -o fog-eth0 -j MASQUERADE"]
        );
        assert!(!h.runtime.has_network("netns-fog"));
        assert!(h
            .runtime
            .calls()
            .contains(&RuntimeCall::RemoveNetwork {
                name: "netns-fog".to_string()
            }));
        assert_eq!(h.host.calls().last().map(String::as_str), Some("ip link del fog-dport"));
    }

    #[test]
    fn test_link_creation_failure_has_nothing_to_undo() {
        let h = harness(RecordingRunner::new().failing_on("link add"), RecordingRunner::new());
        let names = FabricNames::new("fog", "netns-", None);

        let err = h
            .builder
            .build(&names, block(), &h.context)
            .expect_err("should fail");

        assert!(matches!(err, NodeError::ConstructionFailure { ref step, .. } if step == "create link"));
        assert_eq!(h.host.calls().len(), 1);
        assert!(h.runtime.calls().is_empty());
    }

    #[test]
    fn test_teardown_removes_network() {
        let h = harness(RecordingRunner::new(), RecordingRunner::new());
        let names = FabricNames::new("fog", "netns-", None);
        let handle = h
            .builder
            .build(&names, block(), &h.context)
            .expect("should build");

        h.builder.teardown(&handle).expect("should tear down");
        assert!(!h.runtime.has_network("netns-fog"));
    }

    #[test]
    fn test_unwind_built_reverses_every_step() {
        let h = harness(RecordingRunner::new(), RecordingRunner::new());
        let names = FabricNames::new("fog", "netns-", None);
        let handle = h
            .builder
            .build(&names, block(), &h.context)
            .expect("should build");

        h.builder.unwind_built(&handle, &h.context);

        assert_eq!(h.context.recorder().calls_matching(" -D ").len(), 3);
        assert_eq!(
            h.context.recorder().calls_matching(" -D ")[0],
            "iptables -D FORWARD -i fog-eth1 -o fog-eth0 -j ACCEPT"
        );
        assert!(!h.runtime.has_network("netns-fog"));
        assert_eq!(h.host.calls().last().map(String::as_str), Some("ip link del fog-dport"));
    }

    #[test]
    fn test_unwind_built_continues_past_failures() {
        let h = harness(
            RecordingRunner::new(),
            RecordingRunner::new().failing_on("-t nat -D"),
        );
        let names = FabricNames::new("fog", "netns-", None);
        let handle = h
            .builder
            .build(&names, block(), &h.context)
            .expect("should build");

        h.builder.unwind_built(&handle, &h.context);

        assert!(!h.runtime.has_network("netns-fog"));
        assert_eq!(h.host.calls_matching("link del"), vec!["ip link del fog-dport"]);
    }
}
