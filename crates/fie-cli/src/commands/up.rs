//! `up`: build the topology on this host and serve the operator shell.

use std::io::{BufRead, Write};
use std::sync::Arc;

use fienode::{
    CgroupTools, CommandRunner, DockerCli, NamespaceContextFactory, NodeServices, Orchestrator,
    ResourceGovernor, SysinfoProbe, SystemRunner, TopologySpec,
};
use tracing::{info, warn};

use crate::control::{ControlCommand, ControlSurface, Outcome};
use crate::error::CliError;
use crate::output::OutputFormat;

/// `up` executor.
#[derive(Debug, Clone)]
pub struct UpCommand {
    topology: TopologySpec,
    route_all: bool,
}

impl UpCommand {
    /// Create the command for a loaded topology.
    #[must_use]
    pub fn new(topology: TopologySpec, route_all: bool) -> Self {
        Self {
            topology,
            route_all,
        }
    }

    /// Build every node with the host's real collaborators: `nsenter`
    /// contexts, cgroup tools and the container runtime CLI.
    ///
    /// # Errors
    ///
    /// Returns the first construction error; partially built nodes are
    /// already torn down by then.
    pub fn build(&self) -> Result<Orchestrator, CliError> {
        let host: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let runtime = Arc::new(DockerCli::new(
            self.topology.runtime.binary.as_str(),
            Arc::clone(&host),
        ));
        let governor = ResourceGovernor::new(Arc::new(CgroupTools::new(Arc::clone(&host))))
            .with_cpu_period_us(self.topology.cpu_period_us);
        let services = NodeServices::new(runtime, Arc::new(governor), Arc::clone(&host));
        let contexts = NamespaceContextFactory::new(host);

        info!(hosts = self.topology.hosts.len(), "building topology");
        Ok(Orchestrator::build(&self.topology, services, &contexts)?)
    }

    /// Build, optionally route, then serve commands from `input` until it
    /// ends or the operator types `exit`. The topology is torn down on
    /// the way out.
    ///
    /// # Errors
    ///
    /// Returns an error if the build fails or the streams fail.
    pub fn execute<R: BufRead, W: Write>(
        &self,
        input: R,
        writer: &mut W,
        format: &OutputFormat,
        interactive: bool,
    ) -> Result<(), CliError> {
        let orchestrator = self.build()?;
        let surface = ControlSurface::new(orchestrator, Box::new(SysinfoProbe::new()), format.clone());

        if self.route_all {
            write!(writer, "{}", surface.reply(&ControlCommand::RouteAll))?;
        }

        let served = run_shell(&surface, input, writer, interactive);
        write!(writer, "{}", surface.teardown())?;
        writer.flush()?;
        served.map(|_| ())
    }
}

/// Feed `input` line by line to `surface`, writing every reply.
/// Returns the number of commands executed.
///
/// # Errors
///
/// Returns an error if reading or writing fails.
pub fn run_shell<R: BufRead, W: Write>(
    surface: &ControlSurface,
    mut input: R,
    writer: &mut W,
    interactive: bool,
) -> Result<usize, CliError> {
    let mut executed = 0;
    if interactive {
        writeln!(writer, "fie shell, type `help` for commands")?;
    }

    let mut buf = Vec::new();
    loop {
        if interactive {
            write!(writer, "fie> ")?;
            writer.flush()?;
        }
        buf.clear();
        let read = match input.read_until(b'\n', &mut buf) {
            Ok(read) => read,
            Err(e) => {
                warn!(error = %e, "shell input failed");
                return Err(e.into());
            }
        };
        if read == 0 {
            break;
        }

        // A garbled line is a bad command, not the end of the session.
        match surface.execute_bytes(&buf) {
            Outcome::Empty => {}
            Outcome::Exit => break,
            Outcome::Reply(text) => {
                executed += 1;
                write!(writer, "{text}")?;
            }
        }
    }

    if interactive {
        writeln!(writer)?;
    }
    info!(executed, "shell closed");
    Ok(executed)
}
