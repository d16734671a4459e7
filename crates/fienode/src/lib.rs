//! fienode - emulated fog-infrastructure nodes.
//!
//! Turns bare network-namespace execution contexts into nodes that host
//! isolated containers reachable from the outside:
//!
//! - [`fabric`] builds the per-node veth link, bridge network and NAT
//! - [`resources`] governs each node's CPU, memory and block-IO ceiling
//! - [`workload`] wraps the lifecycle of one container
//! - [`node`] ties them together with an ordered container registry
//! - [`orchestrator`] builds the topology, routes the full mesh and
//!   migrates or scales containers between nodes
//!
//! External collaborators sit behind traits: [`exec::ExecutionContext`]
//! for the namespace, [`exec::CommandRunner`] for host commands,
//! [`runtime::ContainerRuntime`] for the container daemon and
//! [`resources::AccountingBackend`] for the accounting groups. Each has an
//! in-memory fake for tests.

#![forbid(unsafe_code)]

pub mod config;
pub mod docker;
pub mod error;
pub mod exec;
pub mod fabric;
pub mod node;
pub mod orchestrator;
pub mod resources;
pub mod runtime;
pub mod stats;
pub mod workload;

pub use config::{HostSpec, LinkSpec, RuntimeConfig, Tier, TopologySpec};
pub use docker::DockerCli;
pub use error::{NodeError, ObjectKind};
pub use exec::{
    CommandOutput, CommandRunner, ExecutionContext, FakeExecutionContext, NamespaceContext,
    RecordingRunner, SystemRunner,
};
pub use fabric::{BridgeHandle, FabricBuilder, FabricNames, FabricStep};
pub use node::{FogNode, NodeLifecycleState, NodeServices, TeardownReport};
pub use orchestrator::{
    ContextFactory, NamespaceContextFactory, Orchestrator, RouteReport, SkippedRoute,
};
pub use resources::{
    AccountingBackend, ApplyReport, CgroupTools, FakeAccounting, IoLimit, ResourceGovernor,
    ResourceProfile,
};
pub use runtime::{ContainerRuntime, FakeContainerRuntime};
pub use stats::{NodeStats, ProcessProbe, ProcessStats, SysinfoProbe};
pub use workload::{VolumeMount, WorkloadHandle, WorkloadSpec, WorkloadState};
