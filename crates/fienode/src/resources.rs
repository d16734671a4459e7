//! Per-node resource governance through hierarchical accounting groups.
//!
//! A [`ResourceProfile`] is applied by the [`ResourceGovernor`] to one
//! accounting group per node. The group is created and the node's primary
//! process classified into it before any limit is written.
//!
//! ```text
//! /<node>                       accounting group
//!   cpu.cfs_period_us           cpu_period_us
//!   cpu.cfs_quota_us            fraction * period * host cores
//!   cpuset.cpus                 pinned cores
//!   memory.limit_in_bytes       memory ceiling
//!   memory.memsw.limit_in_bytes swap ceiling (memory + swap)
//!   memory.oom_control          0 = kill, 1 = pause
//!   memory.swappiness           0..=100
//!   blkio.throttle.*_device     "maj:min value"
//!   blkio.weight                10..=1000
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::exec::{argv, CommandRunner};

/// Default CFS scheduling period.
pub const DEFAULT_CPU_PERIOD_US: u64 = 100_000;

/// Smallest quota the kernel accepts.
const MIN_CPU_QUOTA_US: u64 = 1_000;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Block-IO throttle for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoLimit {
    /// Device as `major:minor`, e.g. `8:0`.
    pub device: String,
    /// Read bytes per second.
    pub read_bps: Option<u64>,
    /// Write bytes per second.
    pub write_bps: Option<u64>,
    /// Read operations per second.
    pub read_iops: Option<u64>,
    /// Write operations per second.
    pub write_iops: Option<u64>,
}

impl IoLimit {
    /// A limit with no throttles set.
    #[must_use]
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Self::default()
        }
    }

    /// Throttle read bandwidth.
    #[must_use]
    pub const fn with_read_bps(mut self, bps: u64) -> Self {
        self.read_bps = Some(bps);
        self
    }

    /// Throttle write bandwidth.
    #[must_use]
    pub const fn with_write_bps(mut self, bps: u64) -> Self {
        self.write_bps = Some(bps);
        self
    }

    /// Throttle read operations.
    #[must_use]
    pub const fn with_read_iops(mut self, iops: u64) -> Self {
        self.read_iops = Some(iops);
        self
    }

    /// Throttle write operations.
    #[must_use]
    pub const fn with_write_iops(mut self, iops: u64) -> Self {
        self.write_iops = Some(iops);
        self
    }

    fn has_valid_device(&self) -> bool {
        let mut parts = self.device.split(':');
        let numeric = |p: Option<&str>| {
            p.is_some_and(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
        };
        numeric(parts.next()) && numeric(parts.next()) && parts.next().is_none()
    }
}

/// Declarative resource ceiling of one node.
///
/// Every field is optional; unset and zero values leave the corresponding
/// control untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceProfile {
    /// Share of the whole host's CPU time, in `(0, 1]`.
    pub cpu_fraction: Option<f64>,
    /// Cores the node may run on.
    pub pinned_cores: BTreeSet<u32>,
    /// Memory ceiling in MB.
    pub memory_mb: Option<f64>,
    /// Memory plus swap ceiling in MB.
    pub swap_mb: Option<f64>,
    /// Kill on out-of-memory instead of pausing.
    pub oom_kill: Option<bool>,
    /// Swap tendency, `0..=100`.
    pub swappiness: Option<u8>,
    /// Per-device block-IO throttles.
    pub io_limits: Vec<IoLimit>,
    /// Proportional block-IO weight, `10..=1000`.
    pub io_weight: Option<u32>,
}

impl ResourceProfile {
    /// An empty profile.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the CPU fraction.
    #[must_use]
    pub const fn with_cpu_fraction(mut self, fraction: f64) -> Self {
        self.cpu_fraction = Some(fraction);
        self
    }

    /// Pin to a set of cores.
    #[must_use]
    pub fn with_pinned_cores(mut self, cores: impl IntoIterator<Item = u32>) -> Self {
        self.pinned_cores = cores.into_iter().collect();
        self
    }

    /// Set the memory ceiling.
    #[must_use]
    pub const fn with_memory_mb(mut self, mb: f64) -> Self {
        self.memory_mb = Some(mb);
        self
    }

    /// Set the memory plus swap ceiling.
    #[must_use]
    pub const fn with_swap_mb(mut self, mb: f64) -> Self {
        self.swap_mb = Some(mb);
        self
    }

    /// Choose the out-of-memory policy.
    #[must_use]
    pub const fn with_oom_kill(mut self, kill: bool) -> Self {
        self.oom_kill = Some(kill);
        self
    }

    /// Set swappiness.
    #[must_use]
    pub const fn with_swappiness(mut self, swappiness: u8) -> Self {
        self.swappiness = Some(swappiness);
        self
    }

    /// Add a block-IO throttle.
    #[must_use]
    pub fn with_io_limit(mut self, limit: IoLimit) -> Self {
        self.io_limits.push(limit);
        self
    }

    /// Set the block-IO weight.
    #[must_use]
    pub const fn with_io_weight(mut self, weight: u32) -> Self {
        self.io_weight = Some(weight);
        self
    }

    /// Whether applying this profile writes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Accounting controllers used by the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Controller {
    /// CFS bandwidth.
    Cpu,
    /// CPU usage accounting.
    Cpuacct,
    /// Core pinning.
    Cpuset,
    /// Memory and swap.
    Memory,
    /// Block IO.
    Blkio,
}

impl Controller {
    /// Every controller a node group is created with.
    pub const ALL: [Self; 5] = [
        Self::Cpu,
        Self::Cpuacct,
        Self::Cpuset,
        Self::Memory,
        Self::Blkio,
    ];

    /// Controllers the primary process joins at creation. Cpuset is joined
    /// only once cores are pinned, since an unconfigured cpuset group
    /// refuses tasks.
    pub const INITIAL: [Self; 4] = [Self::Cpu, Self::Cpuacct, Self::Memory, Self::Blkio];

    /// Kernel name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cpuacct => "cpuacct",
            Self::Cpuset => "cpuset",
            Self::Memory => "memory",
            Self::Blkio => "blkio",
        }
    }

    /// `cpu,cpuacct:/group` style spec for cgroup-tools.
    #[must_use]
    pub fn group_spec(controllers: &[Self], group: &str) -> String {
        let names: Vec<_> = controllers.iter().map(|c| c.as_str()).collect();
        format!("{}:/{}", names.join(","), group.trim_start_matches('/'))
    }
}

impl fmt::Display for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hierarchical OS-level accounting primitives.
pub trait AccountingBackend: Send + Sync {
    /// Create `group` under each controller.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be created.
    fn create_group(&self, controllers: &[Controller], group: &str) -> Result<(), NodeError>;

    /// Move `pid` into `group` for each controller.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be moved.
    fn classify(&self, controllers: &[Controller], group: &str, pid: u32)
        -> Result<(), NodeError>;

    /// Write one control file.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    fn set(&self, group: &str, key: &str, value: &str) -> Result<(), NodeError>;

    /// Read one control file.
    ///
    /// # Errors
    ///
    /// Returns an error if the control cannot be read.
    fn get(&self, group: &str, key: &str) -> Result<String, NodeError>;

    /// Remove `group` from each controller.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be removed.
    fn delete_group(&self, controllers: &[Controller], group: &str) -> Result<(), NodeError>;
}

/// cgroup v1 through the cgroup-tools binaries.
pub struct CgroupTools {
    runner: Arc<dyn CommandRunner>,
}

impl CgroupTools {
    /// Create a backend that runs cgroup-tools through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl fmt::Debug for CgroupTools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CgroupTools").finish_non_exhaustive()
    }
}

fn group_path(group: &str) -> String {
    format!("/{}", group.trim_start_matches('/'))
}

impl AccountingBackend for CgroupTools {
    fn create_group(&self, controllers: &[Controller], group: &str) -> Result<(), NodeError> {
        let spec = Controller::group_spec(controllers, group);
        self.runner
            .run_checked("cgcreate", &argv(["-g", spec.as_str()]))
            .map(|_| ())
    }

    fn classify(
        &self,
        controllers: &[Controller],
        group: &str,
        pid: u32,
    ) -> Result<(), NodeError> {
        let spec = Controller::group_spec(controllers, group);
        let pid = pid.to_string();
        self.runner
            .run_checked("cgclassify", &argv(["-g", spec.as_str(), pid.as_str()]))
            .map(|_| ())
    }

    fn set(&self, group: &str, key: &str, value: &str) -> Result<(), NodeError> {
        let assignment = format!("{key}={value}");
        let path = group_path(group);
        self.runner
            .run_checked("cgset", &argv(["-r", assignment.as_str(), path.as_str()]))
            .map(|_| ())
    }

    fn get(&self, group: &str, key: &str) -> Result<String, NodeError> {
        let path = group_path(group);
        let output = self
            .runner
            .run_checked("cgget", &argv(["-n", "-v", "-r", key, path.as_str()]))?;
        Ok(output.stdout.trim().to_string())
    }

    fn delete_group(&self, controllers: &[Controller], group: &str) -> Result<(), NodeError> {
        let spec = Controller::group_spec(controllers, group);
        self.runner
            .run_checked("cgdelete", &argv(["-g", spec.as_str()]))
            .map(|_| ())
    }
}

/// One call received by [`FakeAccounting`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountingCall {
    /// `create_group`.
    CreateGroup {
        /// Group.
        group: String,
        /// Controllers.
        controllers: Vec<Controller>,
    },
    /// `classify`.
    Classify {
        /// Group.
        group: String,
        /// Controllers.
        controllers: Vec<Controller>,
        /// Process.
        pid: u32,
    },
    /// `set`.
    Set {
        /// Group.
        group: String,
        /// Control file.
        key: String,
        /// Written value.
        value: String,
    },
    /// `get`.
    Get {
        /// Group.
        group: String,
        /// Control file.
        key: String,
    },
    /// `delete_group`.
    DeleteGroup {
        /// Group.
        group: String,
    },
}

#[derive(Debug, Default)]
struct FakeAccountingState {
    calls: Vec<AccountingCall>,
    groups: BTreeSet<String>,
    values: BTreeMap<(String, String), String>,
    effective: BTreeMap<String, String>,
    failing_keys: BTreeSet<String>,
    fail_create: bool,
    fail_classify: bool,
}

/// In-memory accounting backend for testing.
///
/// Stores written values and reads them back unchanged unless an
/// effective value is scripted for the key.
#[derive(Debug, Default)]
pub struct FakeAccounting {
    state: Mutex<FakeAccountingState>,
}

impl FakeAccounting {
    /// Create a new fake backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make reads of `key` return `value` regardless of what was written.
    #[must_use]
    pub fn with_effective(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.state.lock().effective.insert(key.into(), value.into());
        self
    }

    /// Make writes to `key` fail.
    #[must_use]
    pub fn failing_set(self, key: impl Into<String>) -> Self {
        self.state.lock().failing_keys.insert(key.into());
        self
    }

    /// Make group creation fail.
    pub fn fail_create(&self, fail: bool) {
        self.state.lock().fail_create = fail;
    }

    /// Make classification fail.
    pub fn fail_classify(&self, fail: bool) {
        self.state.lock().fail_classify = fail;
    }

    /// Every call received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<AccountingCall> {
        self.state.lock().calls.clone()
    }

    /// Keys written to `group`, in order.
    #[must_use]
    pub fn keys_set(&self, group: &str) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                AccountingCall::Set { group: g, key, .. } if g == group => Some(key.clone()),
                _ => None,
            })
            .collect()
    }

    /// Last value written to `key` in `group`.
    #[must_use]
    pub fn value(&self, group: &str, key: &str) -> Option<String> {
        self.state
            .lock()
            .values
            .get(&(group.to_string(), key.to_string()))
            .cloned()
    }

    /// Whether `group` exists.
    #[must_use]
    pub fn has_group(&self, group: &str) -> bool {
        self.state.lock().groups.contains(group)
    }
}

impl AccountingBackend for FakeAccounting {
    fn create_group(&self, controllers: &[Controller], group: &str) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        state.calls.push(AccountingCall::CreateGroup {
            group: group.to_string(),
            controllers: controllers.to_vec(),
        });
        if state.fail_create {
            return Err(NodeError::Command {
                program: "cgcreate".to_string(),
                reason: "injected failure".to_string(),
            });
        }
        state.groups.insert(group.to_string());
        Ok(())
    }

    fn classify(
        &self,
        controllers: &[Controller],
        group: &str,
        pid: u32,
    ) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        state.calls.push(AccountingCall::Classify {
            group: group.to_string(),
            controllers: controllers.to_vec(),
            pid,
        });
        if state.fail_classify || !state.groups.contains(group) {
            return Err(NodeError::Command {
                program: "cgclassify".to_string(),
                reason: format!("cannot move {pid} into {group}"),
            });
        }
        Ok(())
    }

    fn set(&self, group: &str, key: &str, value: &str) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        state.calls.push(AccountingCall::Set {
            group: group.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        });
        if state.failing_keys.contains(key) {
            return Err(NodeError::Command {
                program: "cgset".to_string(),
                reason: format!("invalid argument writing {key}"),
            });
        }
        state
            .values
            .insert((group.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn get(&self, group: &str, key: &str) -> Result<String, NodeError> {
        let mut state = self.state.lock();
        state.calls.push(AccountingCall::Get {
            group: group.to_string(),
            key: key.to_string(),
        });
        if let Some(value) = state.effective.get(key) {
            return Ok(value.clone());
        }
        state
            .values
            .get(&(group.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| NodeError::Command {
                program: "cgget".to_string(),
                reason: format!("{key} is not set in {group}"),
            })
    }

    fn delete_group(&self, _controllers: &[Controller], group: &str) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        state.calls.push(AccountingCall::DeleteGroup {
            group: group.to_string(),
        });
        state.groups.remove(group);
        state.values.retain(|(g, _), _| g != group);
        Ok(())
    }
}

/// A setting left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSetting {
    /// Setter name.
    pub setting: &'static str,
    /// Why nothing was written.
    pub reason: String,
}

/// A control whose effective value differs from the requested one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Divergence {
    /// Control file.
    pub key: String,
    /// Written value.
    pub requested: String,
    /// Value read back.
    pub effective: String,
}

/// A control write the backend rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingFailure {
    /// Control file.
    pub key: String,
    /// Backend error.
    pub reason: String,
}

/// Outcome of one [`ResourceGovernor::apply`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// Control files written, in order.
    pub applied: Vec<String>,
    /// Settings left untouched.
    pub skipped: Vec<SkippedSetting>,
    /// Controls whose read-back differs.
    pub divergences: Vec<Divergence>,
    /// Writes the backend rejected.
    pub failures: Vec<SettingFailure>,
}

impl ApplyReport {
    /// Whether every requested value is in effect.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.divergences.is_empty() && self.failures.is_empty()
    }

    fn skip(&mut self, setting: &'static str, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(setting, %reason, "setting skipped");
        self.skipped.push(SkippedSetting { setting, reason });
    }
}

/// Renders cores in kernel list format, e.g. `0-2,5`.
#[must_use]
pub fn format_cpu_list(cores: &BTreeSet<u32>) -> String {
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for &core in cores {
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == core => *end = core,
            _ => ranges.push((core, core)),
        }
    }
    ranges
        .iter()
        .map(|&(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{start}-{end}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn mb_to_bytes(mb: f64) -> u64 {
    (mb.max(1.0) * BYTES_PER_MB) as u64
}

fn positive_mb(value: Option<f64>) -> Option<f64> {
    value.filter(|mb| mb.is_finite() && *mb > 0.0)
}

/// Applies [`ResourceProfile`]s to per-node accounting groups.
pub struct ResourceGovernor {
    backend: Arc<dyn AccountingBackend>,
    host_cores: usize,
    cpu_period_us: u64,
}

impl fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("host_cores", &self.host_cores)
            .field("cpu_period_us", &self.cpu_period_us)
            .finish_non_exhaustive()
    }
}

impl ResourceGovernor {
    /// Create a governor sized to this host's CPU count.
    #[must_use]
    pub fn new(backend: Arc<dyn AccountingBackend>) -> Self {
        let mut sys = sysinfo::System::new_all();
        sys.refresh_all();
        Self {
            backend,
            host_cores: sys.cpus().len().max(1),
            cpu_period_us: DEFAULT_CPU_PERIOD_US,
        }
    }

    /// Override the host core count.
    #[must_use]
    pub fn with_host_cores(mut self, cores: usize) -> Self {
        self.host_cores = cores.max(1);
        self
    }

    /// Override the CFS period.
    #[must_use]
    pub fn with_cpu_period_us(mut self, period_us: u64) -> Self {
        if period_us >= MIN_CPU_QUOTA_US {
            self.cpu_period_us = period_us;
        }
        self
    }

    /// Host cores the governor computes quotas against.
    #[must_use]
    pub const fn host_cores(&self) -> usize {
        self.host_cores
    }

    /// Create the group for `group`, classify `pid` into it, then apply
    /// every setting of `profile`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::ConstructionFailure`] if the group cannot be
    /// created or the process cannot be classified; in the latter case the
    /// group is removed again. Individual settings never fail the apply;
    /// see the returned [`ApplyReport`].
    pub fn apply(
        &self,
        group: &str,
        pid: u32,
        profile: &ResourceProfile,
    ) -> Result<ApplyReport, NodeError> {
        self.backend
            .create_group(&Controller::ALL, group)
            .map_err(|e| NodeError::construction(group, "accounting group", e))?;
        if let Err(e) = self.backend.classify(&Controller::INITIAL, group, pid) {
            if let Err(cleanup) = self.backend.delete_group(&Controller::ALL, group) {
                warn!(node = %group, error = %cleanup, "accounting group removal failed");
            }
            return Err(NodeError::construction(group, "classify", e));
        }

        let mut report = ApplyReport::default();
        self.set_cpu(group, pid, profile.cpu_fraction, &profile.pinned_cores, &mut report);
        self.set_memory(group, profile.memory_mb, &mut report);
        self.set_swap(group, profile.memory_mb, profile.swap_mb, &mut report);
        self.set_oom(group, profile.oom_kill, &mut report);
        self.set_swappiness(group, profile.swappiness, &mut report);
        self.set_io_limit(group, &profile.io_limits, &mut report);
        self.set_io_weight(group, profile.io_weight, &mut report);

        info!(
            node = %group,
            pid,
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            divergences = report.divergences.len(),
            failures = report.failures.len(),
            "resource profile applied"
        );
        Ok(report)
    }

    /// CPU bandwidth quota and core pinning.
    pub fn set_cpu(
        &self,
        group: &str,
        pid: u32,
        fraction: Option<f64>,
        cores: &BTreeSet<u32>,
        report: &mut ApplyReport,
    ) {
        match fraction {
            None => report.skip("cpu", "unset"),
            Some(f) if !f.is_finite() || f <= 0.0 || f > 1.0 => {
                report.skip("cpu", format!("fraction {f} outside (0, 1]"));
            }
            Some(f) => {
                let quota = (f * self.cpu_period_us as f64 * self.host_cores as f64) as u64;
                let quota = quota.max(MIN_CPU_QUOTA_US);
                self.write_verified(group, "cpu.cfs_period_us", &self.cpu_period_us.to_string(), report);
                self.write_verified(group, "cpu.cfs_quota_us", &quota.to_string(), report);
            }
        }

        if cores.is_empty() {
            report.skip("cpuset", "unset");
            return;
        }
        if let Some(bad) = cores.iter().find(|&&c| c as usize >= self.host_cores) {
            report.skip(
                "cpuset",
                format!("core {bad} not present on a {}-core host", self.host_cores),
            );
            return;
        }

        self.write(group, "cpuset.mems", "0", report);
        if self.write_verified(group, "cpuset.cpus", &format_cpu_list(cores), report) {
            if let Err(e) = self.backend.classify(&[Controller::Cpuset], group, pid) {
                warn!(node = %group, pid, error = %e, "cpuset classification failed");
                report.failures.push(SettingFailure {
                    key: "cpuset.tasks".to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Memory ceiling.
    pub fn set_memory(&self, group: &str, memory_mb: Option<f64>, report: &mut ApplyReport) {
        let Some(mb) = positive_mb(memory_mb) else {
            report.skip("memory", "unset");
            return;
        };
        self.write_verified(group, "memory.limit_in_bytes", &mb_to_bytes(mb).to_string(), report);
    }

    /// Memory plus swap ceiling. Needs a memory ceiling no larger than it.
    pub fn set_swap(
        &self,
        group: &str,
        memory_mb: Option<f64>,
        swap_mb: Option<f64>,
        report: &mut ApplyReport,
    ) {
        let Some(swap) = positive_mb(swap_mb) else {
            report.skip("swap", "unset");
            return;
        };
        let Some(memory) = positive_mb(memory_mb) else {
            report.skip("swap", "requires a memory ceiling");
            return;
        };
        let (swap_bytes, memory_bytes) = (mb_to_bytes(swap), mb_to_bytes(memory));
        if swap_bytes < memory_bytes {
            report.skip(
                "swap",
                format!("swap ceiling {swap} MB below memory ceiling {memory} MB"),
            );
            return;
        }
        self.write_verified(group, "memory.memsw.limit_in_bytes", &swap_bytes.to_string(), report);
    }

    /// Out-of-memory policy. Write-only.
    pub fn set_oom(&self, group: &str, oom_kill: Option<bool>, report: &mut ApplyReport) {
        let Some(kill) = oom_kill else {
            report.skip("oom", "unset");
            return;
        };
        self.write(group, "memory.oom_control", if kill { "0" } else { "1" }, report);
    }

    /// Swappiness.
    pub fn set_swappiness(&self, group: &str, swappiness: Option<u8>, report: &mut ApplyReport) {
        match swappiness {
            None => report.skip("swappiness", "unset"),
            Some(s) if s > 100 => report.skip("swappiness", format!("{s} outside 0..=100")),
            Some(s) => {
                self.write_verified(group, "memory.swappiness", &s.to_string(), report);
            }
        }
    }

    /// Per-device block-IO throttles. Write-only.
    pub fn set_io_limit(&self, group: &str, limits: &[IoLimit], report: &mut ApplyReport) {
        if limits.is_empty() {
            report.skip("io_limit", "unset");
            return;
        }
        for limit in limits {
            if !limit.has_valid_device() {
                report.skip("io_limit", format!("invalid device {:?}", limit.device));
                continue;
            }
            let throttles = [
                ("blkio.throttle.read_bps_device", limit.read_bps),
                ("blkio.throttle.write_bps_device", limit.write_bps),
                ("blkio.throttle.read_iops_device", limit.read_iops),
                ("blkio.throttle.write_iops_device", limit.write_iops),
            ];
            for (key, value) in throttles {
                if let Some(value) = value.filter(|v| *v > 0) {
                    self.write(group, key, &format!("{} {value}", limit.device), report);
                }
            }
        }
    }

    /// Proportional block-IO weight.
    pub fn set_io_weight(&self, group: &str, weight: Option<u32>, report: &mut ApplyReport) {
        match weight {
            None => report.skip("io_weight", "unset"),
            Some(w) if !(10..=1000).contains(&w) => {
                report.skip("io_weight", format!("{w} outside 10..=1000"));
            }
            Some(w) => {
                self.write_verified(group, "blkio.weight", &w.to_string(), report);
            }
        }
    }

    /// Remove the node's accounting group.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend refuses, e.g. while tasks remain.
    pub fn release(&self, group: &str) -> Result<(), NodeError> {
        self.backend.delete_group(&Controller::ALL, group)?;
        debug!(node = %group, "accounting group removed");
        Ok(())
    }

    fn write(&self, group: &str, key: &str, value: &str, report: &mut ApplyReport) -> bool {
        match self.backend.set(group, key, value) {
            Ok(()) => {
                debug!(node = %group, key, value, "control written");
                report.applied.push(key.to_string());
                true
            }
            Err(e) => {
                warn!(node = %group, key, value, error = %e, "control write failed");
                report.failures.push(SettingFailure {
                    key: key.to_string(),
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    fn write_verified(&self, group: &str, key: &str, value: &str, report: &mut ApplyReport) -> bool {
        if !self.write(group, key, value, report) {
            return false;
        }
        match self.backend.get(group, key) {
            Ok(effective) if effective.trim() == value => {}
            Ok(effective) => {
                warn!(
                    node = %group,
                    key,
                    requested = value,
                    effective = %effective.trim(),
                    "effective value differs from requested"
                );
                report.divergences.push(Divergence {
                    key: key.to_string(),
                    requested: value.to_string(),
                    effective: effective.trim().to_string(),
                });
            }
            Err(e) => debug!(node = %group, key, error = %e, "read-back unavailable"),
        }
        true
    }
}
