//! CPU and memory utilisation of node and container processes.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::orchestrator::Orchestrator;

/// Utilisation of one process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProcessStats {
    /// Process id.
    pub pid: u32,
    /// CPU usage in percent of one core.
    pub cpu_percent: f32,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
}

/// Utilisation of one node and its containers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStats {
    /// Node name.
    pub node: String,
    /// The namespace-owning process.
    pub primary: Option<ProcessStats>,
    /// Container name and its process, if it is running and visible.
    pub containers: Vec<(String, Option<ProcessStats>)>,
}

/// Samples process utilisation.
pub trait ProcessProbe {
    /// Current utilisation of each pid still alive.
    fn sample(&mut self, pids: &[u32]) -> BTreeMap<u32, ProcessStats>;
}

/// [`ProcessProbe`] reading the host process table with `sysinfo`.
pub struct SysinfoProbe {
    sys: sysinfo::System,
}

impl std::fmt::Debug for SysinfoProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoProbe").finish_non_exhaustive()
    }
}

impl SysinfoProbe {
    /// Create a probe with a primed process table.
    #[must_use]
    pub fn new() -> Self {
        let mut sys = sysinfo::System::new_all();
        sys.refresh_all();
        Self { sys }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SysinfoProbe {
    fn sample(&mut self, pids: &[u32]) -> BTreeMap<u32, ProcessStats> {
        // CPU usage is a delta between two refreshes.
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        self.sys.refresh_all();

        pids.iter()
            .filter_map(|&pid| {
                self.sys
                    .process(sysinfo::Pid::from_u32(pid))
                    .map(|p| ProcessStats {
                        pid,
                        cpu_percent: p.cpu_usage(),
                        memory_bytes: p.memory(),
                    })
            })
            .map(|s| (s.pid, s))
            .collect()
    }
}

/// Sample every node process and every running container process.
pub fn collect(orchestrator: &Orchestrator, probe: &mut dyn ProcessProbe) -> Vec<NodeStats> {
    let pids: Vec<u32> = orchestrator
        .nodes()
        .iter()
        .flat_map(|n| std::iter::once(n.pid()).chain(n.containers().iter().filter_map(|h| h.pid())))
        .collect();
    let sampled = probe.sample(&pids);

    orchestrator
        .nodes()
        .iter()
        .map(|n| NodeStats {
            node: n.name().to_string(),
            primary: sampled.get(&n.pid()).copied(),
            containers: n
                .containers()
                .iter()
                .map(|h| {
                    (
                        h.name().to_string(),
                        h.pid().and_then(|pid| sampled.get(&pid).copied()),
                    )
                })
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostSpec, Tier, TopologySpec};
    use crate::error::NodeError;
    use crate::exec::{ExecutionContext, FakeExecutionContext, RecordingRunner};
    use crate::node::NodeServices;
    use crate::resources::{FakeAccounting, ResourceGovernor};
    use crate::runtime::FakeContainerRuntime;
    use crate::workload::WorkloadSpec;
    use std::sync::Arc;

    struct FixedProbe {
        requested: Vec<u32>,
    }

    impl ProcessProbe for FixedProbe {
        fn sample(&mut self, pids: &[u32]) -> BTreeMap<u32, ProcessStats> {
            self.requested = pids.to_vec();
            pids.iter()
                .filter(|pid| **pid != 101)
                .map(|&pid| {
                    (
                        pid,
                        ProcessStats {
                            pid,
                            cpu_percent: 12.5,
                            memory_bytes: 4096,
                        },
                    )
                })
                .collect()
        }
    }

    #[test]
    fn test_collect_covers_nodes_and_containers() {
        let services = NodeServices::new(
            Arc::new(FakeContainerRuntime::new()),
            Arc::new(ResourceGovernor::new(Arc::new(FakeAccounting::new())).with_host_cores(1)),
            Arc::new(RecordingRunner::new()),
        );
        let topology = TopologySpec::new(vec![
            HostSpec::new("cloud", Tier::Cloud, 100),
            HostSpec::new("fog", Tier::Fog, 101),
        ]);
        let contexts = |host: &HostSpec| -> Result<Box<dyn ExecutionContext>, NodeError> {
            Ok(Box::new(FakeExecutionContext::new(host.pid)))
        };
        let mut orch = Orchestrator::build(&topology, services, &contexts).expect("build");
        orch.run("cloud", WorkloadSpec::new("alpine")).expect("run");

        let mut probe = FixedProbe { requested: Vec::new() };
        let stats = collect(&orch, &mut probe);

        assert_eq!(probe.requested.len(), 3);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].node, "cloud");
        assert_eq!(stats[0].primary.map(|s| s.pid), Some(100));
        assert_eq!(stats[0].containers.len(), 1);
        assert!(stats[0].containers[0].1.is_some());
        assert!(stats[1].primary.is_none());
    }
}
