//! Command execution seams.
//!
//! Two collaborators run external commands on behalf of the core:
//!
//! - a [`CommandRunner`] runs commands on the host (creating veth pairs,
//!   talking to the container runtime, cgroup tools);
//! - an [`ExecutionContext`] runs commands inside one node's isolated
//!   network namespace and resolves interface addresses there.
//!
//! Both are synchronous and impose no timeout of their own.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::NodeError;

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if terminated by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful run with the given stdout.
    #[must_use]
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed run with the given exit code and stderr.
    #[must_use]
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited with status 0.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Turns a non-zero exit into [`NodeError::Command`].
    ///
    /// # Errors
    ///
    /// Returns an error if the command did not succeed.
    pub fn into_result(self, program: &str) -> Result<Self, NodeError> {
        if self.is_success() {
            return Ok(self);
        }
        let status = self
            .code
            .map_or_else(|| "killed by signal".to_string(), |c| format!("exit {c}"));
        Err(NodeError::Command {
            program: program.to_string(),
            reason: format!("{status}: {}", self.stderr.trim()),
        })
    }
}

/// Builds an owned argument vector from string-likes.
pub fn argv<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items.into_iter().map(|s| s.as_ref().to_string()).collect()
}

/// Renders `program args...` on one line.
#[must_use]
pub fn command_line(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    }
}

/// Runs commands on the host.
pub trait CommandRunner: Send + Sync {
    /// Run a command and capture its output.
    ///
    /// # Errors
    ///
    /// Returns an error only if the command could not be spawned. A
    /// non-zero exit is reported through [`CommandOutput::code`].
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, NodeError>;

    /// Run a command and fail on a non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the command could not be spawned or exited
    /// non-zero.
    fn run_checked(&self, program: &str, args: &[String]) -> Result<CommandOutput, NodeError> {
        self.run(program, args)?.into_result(program)
    }
}

/// [`CommandRunner`] backed by `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, NodeError> {
        debug!(command = %command_line(program, args), "running host command");

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| NodeError::Command {
                program: program.to_string(),
                reason: e.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// In-memory runner for testing.
///
/// Records every invocation. Commands whose rendered line contains a
/// scripted pattern get the scripted output; everything else succeeds with
/// empty output.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, CommandOutput)>>,
}

impl RecordingRunner {
    /// Create a new recording runner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the output of commands containing `pattern`.
    #[must_use]
    pub fn with_response(self, pattern: impl Into<String>, output: CommandOutput) -> Self {
        self.responses.lock().push((pattern.into(), output));
        self
    }

    /// Make commands containing `pattern` exit 1.
    #[must_use]
    pub fn failing_on(self, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let stderr = format!("scripted failure: {pattern}");
        self.with_response(pattern, CommandOutput::failure(1, stderr))
    }

    /// Script a failure after construction.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        let pattern = pattern.into();
        let stderr = format!("scripted failure: {pattern}");
        self.responses
            .lock()
            .push((pattern, CommandOutput::failure(1, stderr)));
    }

    /// Every command line run so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Command lines containing `pattern`.
    #[must_use]
    pub fn calls_matching(&self, pattern: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.contains(pattern))
            .cloned()
            .collect()
    }

    /// Index of the first command line containing `pattern`.
    #[must_use]
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.calls.lock().iter().position(|c| c.contains(pattern))
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, NodeError> {
        let line = command_line(program, args);
        self.calls.lock().push(line.clone());

        let scripted = self
            .responses
            .lock()
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, output)| output.clone());

        Ok(scripted.unwrap_or_else(|| CommandOutput::success("")))
    }
}

/// One node's isolated execution context.
///
/// Supplied by the network-emulation framework: a stable process id, a
/// synchronous command channel into the namespace, and interface address
/// lookup.
pub trait ExecutionContext: Send + Sync {
    /// Process that owns the namespace.
    fn pid(&self) -> u32;

    /// Run a command inside the context.
    ///
    /// # Errors
    ///
    /// Returns an error only if the command could not be spawned.
    fn cmd(&self, program: &str, args: &[String]) -> Result<CommandOutput, NodeError>;

    /// Current IPv4 address of a named interface, if any.
    fn interface_ipv4(&self, interface: &str) -> Option<Ipv4Addr>;

    /// Run a command inside the context and fail on a non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the command could not be spawned or exited
    /// non-zero.
    fn cmd_checked(&self, program: &str, args: &[String]) -> Result<CommandOutput, NodeError> {
        self.cmd(program, args)?.into_result(program)
    }
}

/// Extracts the first `inet a.b.c.d/nn` address from `ip -4 -o addr` output.
#[must_use]
pub fn parse_inet_addr(output: &str) -> Option<Ipv4Addr> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "inet" {
            return tokens
                .next()
                .and_then(|cidr| cidr.split('/').next())
                .and_then(|addr| addr.parse().ok());
        }
    }
    None
}

/// [`ExecutionContext`] that enters a network namespace with `nsenter`.
pub struct NamespaceContext {
    pid: u32,
    runner: Arc<dyn CommandRunner>,
}

impl NamespaceContext {
    /// Wrap the network namespace of `pid`.
    #[must_use]
    pub fn new(pid: u32, runner: Arc<dyn CommandRunner>) -> Self {
        Self { pid, runner }
    }
}

impl std::fmt::Debug for NamespaceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceContext")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl ExecutionContext for NamespaceContext {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn cmd(&self, program: &str, args: &[String]) -> Result<CommandOutput, NodeError> {
        let mut full = argv([
            "--target".to_string(),
            self.pid.to_string(),
            "--net".to_string(),
            "--".to_string(),
            program.to_string(),
        ]);
        full.extend_from_slice(args);
        self.runner.run("nsenter", &full)
    }

    fn interface_ipv4(&self, interface: &str) -> Option<Ipv4Addr> {
        let output = self
            .cmd("ip", &argv(["-4", "-o", "addr", "show", "dev", interface]))
            .ok()?;
        if !output.is_success() {
            return None;
        }
        parse_inet_addr(&output.stdout)
    }
}

/// In-memory execution context for testing.
#[derive(Debug, Clone)]
pub struct FakeExecutionContext {
    pid: u32,
    interfaces: HashMap<String, Ipv4Addr>,
    recorder: Arc<RecordingRunner>,
}

impl FakeExecutionContext {
    /// Create a fake context for `pid`.
    #[must_use]
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            interfaces: HashMap::new(),
            recorder: Arc::new(RecordingRunner::new()),
        }
    }

    /// Give an interface an address.
    #[must_use]
    pub fn with_interface(mut self, name: impl Into<String>, addr: Ipv4Addr) -> Self {
        self.interfaces.insert(name.into(), addr);
        self
    }

    /// Share a recorder, e.g. one scripted to fail.
    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<RecordingRunner>) -> Self {
        self.recorder = recorder;
        self
    }

    /// The recorder holding every command run in this context.
    #[must_use]
    pub fn recorder(&self) -> Arc<RecordingRunner> {
        Arc::clone(&self.recorder)
    }
}

impl ExecutionContext for FakeExecutionContext {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn cmd(&self, program: &str, args: &[String]) -> Result<CommandOutput, NodeError> {
        self.recorder.run(program, args)
    }

    fn interface_ipv4(&self, interface: &str) -> Option<Ipv4Addr> {
        self.interfaces.get(interface).copied()
    }
}
