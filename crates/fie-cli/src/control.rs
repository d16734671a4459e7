//! Control surface: parses operator command lines and applies them to the
//! orchestrator.
//!
//! Every command yields a printable reply. Errors, including malformed
//! arguments, are rendered as replies too, so nothing typed at the shell
//! can take the orchestrator down.

use fienode::{stats, Orchestrator, ProcessProbe, WorkloadSpec};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::CliError;
use crate::output::{ContainerList, Message, NodeList, OutputFormat, StatsReport, TeardownSummary};

/// Shell help text.
pub const HELP: &str = "\
commands:
  ps                                     list containers per node
  nodes                                  list nodes with block, gateway and state
  run <node> [-e KEY=VALUE]... <image> [cmd...]
                                         launch a container on a node
  stop <container>                       stop a running container
  start <container>                      start a stopped container
  destroy <container>                    remove a container
  migrate <container> <node>             cold-migrate a container to another node
  scale <container> <new-name> <node>    launch a clone of a container on a node
  routeall                               install routes between every pair of nodes
  stats                                  CPU and memory of node and container processes
  help                                   show this text
  exit                                   tear everything down and leave";

/// One parsed shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// List containers per node.
    Ps,
    /// List nodes.
    Nodes,
    /// Launch a container.
    Run {
        /// Target node.
        node: String,
        /// Image.
        image: String,
        /// Environment pairs.
        env: Vec<(String, String)>,
        /// Command override.
        command: Vec<String>,
    },
    /// Stop a container.
    Stop {
        /// Container name.
        container: String,
    },
    /// Start a stopped container.
    Start {
        /// Container name.
        container: String,
    },
    /// Remove a container.
    Destroy {
        /// Container name.
        container: String,
    },
    /// Cold-migrate a container.
    Migrate {
        /// Container name.
        container: String,
        /// Destination node.
        dest: String,
    },
    /// Clone a container onto a node.
    Scale {
        /// Source container.
        container: String,
        /// Name of the clone.
        new_name: String,
        /// Destination node.
        dest: String,
    },
    /// Install the full route mesh.
    RouteAll,
    /// Process utilisation.
    Stats,
    /// Show help.
    Help,
    /// Leave the shell.
    Exit,
}

impl ControlCommand {
    /// Parse one shell line. Blank lines and `#` comments yield `None`.
    ///
    /// # Errors
    ///
    /// Returns [`CliError::Usage`] for unknown commands or wrong arity.
    pub fn parse(line: &str) -> Result<Option<Self>, CliError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();

        let command = match verb.to_ascii_lowercase().as_str() {
            "ps" => exact(&args, 0, "ps").map(|_| Self::Ps)?,
            "nodes" => exact(&args, 0, "nodes").map(|_| Self::Nodes)?,
            "routeall" => exact(&args, 0, "routeall").map(|_| Self::RouteAll)?,
            "stats" => exact(&args, 0, "stats").map(|_| Self::Stats)?,
            "help" | "?" => Self::Help,
            "exit" | "quit" => Self::Exit,
            "stop" => Self::Stop {
                container: exact(&args, 1, "stop <container>")?[0].to_string(),
            },
            "start" => Self::Start {
                container: exact(&args, 1, "start <container>")?[0].to_string(),
            },
            "destroy" => Self::Destroy {
                container: exact(&args, 1, "destroy <container>")?[0].to_string(),
            },
            "migrate" => {
                let a = exact(&args, 2, "migrate <container> <node>")?;
                Self::Migrate {
                    container: a[0].to_string(),
                    dest: a[1].to_string(),
                }
            }
            "scale" => {
                let a = exact(&args, 3, "scale <container> <new-name> <node>")?;
                Self::Scale {
                    container: a[0].to_string(),
                    new_name: a[1].to_string(),
                    dest: a[2].to_string(),
                }
            }
            "run" => parse_run(&args)?,
            other => {
                return Err(CliError::usage(format!(
                    "unknown command `{other}`, type `help`"
                )));
            }
        };
        Ok(Some(command))
    }
}

fn exact<'a, 'b>(args: &'b [&'a str], n: usize, usage: &str) -> Result<&'b [&'a str], CliError> {
    if args.len() == n {
        Ok(args)
    } else {
        Err(CliError::usage(usage))
    }
}

fn parse_run(args: &[&str]) -> Result<ControlCommand, CliError> {
    const USAGE: &str = "run <node> [-e KEY=VALUE]... <image> [cmd...]";

    let mut rest = args.iter();
    let node = rest.next().ok_or_else(|| CliError::usage(USAGE))?;
    let mut env = Vec::new();
    let image = loop {
        match rest.next() {
            Some(&"-e") => {
                let pair = rest.next().ok_or_else(|| CliError::usage(USAGE))?;
                let (key, value) = pair
                    .split_once('=')
                    .filter(|(k, _)| !k.is_empty())
                    .ok_or_else(|| CliError::usage(format!("expected KEY=VALUE, got `{pair}`")))?;
                env.push((key.to_string(), value.to_string()));
            }
            Some(image) => break image,
            None => return Err(CliError::usage(USAGE)),
        }
    };

    Ok(ControlCommand::Run {
        node: (*node).to_string(),
        image: (*image).to_string(),
        env,
        command: rest.map(|s| (*s).to_string()).collect(),
    })
}

/// Result of feeding one line to the control surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to do.
    Empty,
    /// Text to print.
    Reply(String),
    /// The operator asked to leave.
    Exit,
}

/// Serialises operator commands onto one orchestrator.
pub struct ControlSurface {
    orchestrator: Mutex<Orchestrator>,
    probe: Mutex<Box<dyn ProcessProbe>>,
    format: OutputFormat,
}

impl std::fmt::Debug for ControlSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSurface")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl ControlSurface {
    /// Wrap a built orchestrator.
    #[must_use]
    pub fn new(orchestrator: Orchestrator, probe: Box<dyn ProcessProbe>, format: OutputFormat) -> Self {
        Self {
            orchestrator: Mutex::new(orchestrator),
            probe: Mutex::new(probe),
            format,
        }
    }

    /// Parse and apply one line.
    pub fn execute(&self, line: &str) -> Outcome {
        match ControlCommand::parse(line) {
            Ok(None) => Outcome::Empty,
            Ok(Some(ControlCommand::Exit)) => Outcome::Exit,
            Ok(Some(command)) => Outcome::Reply(self.reply(&command)),
            Err(e) => Outcome::Reply(self.render_error(&e)),
        }
    }

    /// Like [`Self::execute`] for raw input. A line that is not UTF-8 is
    /// answered with a usage error instead of being guessed at.
    pub fn execute_bytes(&self, line: &[u8]) -> Outcome {
        match std::str::from_utf8(line) {
            Ok(line) => self.execute(line.trim_end_matches(['\n', '\r'])),
            Err(e) => {
                warn!(bytes = line.len(), error = %e, "shell line is not valid UTF-8");
                let lossy = String::from_utf8_lossy(line);
                Outcome::Reply(self.render_error(&CliError::usage(format!(
                    "line is not valid UTF-8: {}",
                    lossy.trim_end()
                ))))
            }
        }
    }

    /// Apply a parsed command and render its reply. Errors are rendered
    /// rather than returned.
    pub fn reply(&self, command: &ControlCommand) -> String {
        debug!(?command, "dispatching");
        match self.dispatch(command) {
            Ok(text) => text,
            Err(e) => {
                warn!(?command, error = %e, "command failed");
                self.render_error(&e)
            }
        }
    }

    /// Apply a parsed command.
    ///
    /// # Errors
    ///
    /// Returns the orchestrator error or a formatting error.
    pub fn dispatch(&self, command: &ControlCommand) -> Result<String, CliError> {
        let fmt = &self.format;
        match command {
            ControlCommand::Ps => fmt.to_string(&ContainerList::from(self.orchestrator.lock().ps())),
            ControlCommand::Nodes => {
                fmt.to_string(&NodeList::from_orchestrator(&self.orchestrator.lock()))
            }
            ControlCommand::RouteAll => fmt.to_string(&self.orchestrator.lock().route_all()),
            ControlCommand::Stats => {
                let orchestrator = self.orchestrator.lock();
                let mut probe = self.probe.lock();
                let nodes = stats::collect(&orchestrator, probe.as_mut());
                fmt.to_string(&StatsReport { nodes })
            }
            ControlCommand::Run {
                node,
                image,
                env,
                command,
            } => {
                let mut spec = WorkloadSpec::new(image.as_str());
                for (key, value) in env {
                    spec = spec.with_env(key.as_str(), value.as_str());
                }
                if !command.is_empty() {
                    spec = spec.with_command(command.clone());
                }
                let name = self.orchestrator.lock().run(node, spec)?;
                fmt.to_string(&Message::success(format!("started {name} on {node}")))
            }
            ControlCommand::Stop { container } => {
                self.orchestrator.lock().stop(container)?;
                fmt.to_string(&Message::success(format!("stopped {container}")))
            }
            ControlCommand::Start { container } => {
                self.orchestrator.lock().start(container)?;
                fmt.to_string(&Message::success(format!("started {container}")))
            }
            ControlCommand::Destroy { container } => {
                let node = self.orchestrator.lock().destroy(container)?;
                fmt.to_string(&Message::success(format!("destroyed {container} on {node}")))
            }
            ControlCommand::Migrate { container, dest } => {
                let new = self.orchestrator.lock().migrate(container, dest)?;
                fmt.to_string(&Message::success(format!(
                    "migrated {container} to {dest} as {new}"
                )))
            }
            ControlCommand::Scale {
                container,
                new_name,
                dest,
            } => {
                self.orchestrator.lock().scale(container, new_name, dest)?;
                fmt.to_string(&Message::success(format!(
                    "scaled {container} to {dest} as {new_name}"
                )))
            }
            ControlCommand::Help => Ok(format!("{HELP}\n")),
            ControlCommand::Exit => Ok(String::new()),
        }
    }

    /// Tear the whole topology down and render the per-node results.
    pub fn teardown(&self) -> String {
        let nodes = self.orchestrator.lock().teardown();
        self.format
            .to_string(&TeardownSummary { nodes })
            .unwrap_or_else(|e| format!("teardown done, report unavailable: {e}\n"))
    }

    /// Run a closure against the orchestrator.
    pub fn with_orchestrator<R>(&self, f: impl FnOnce(&Orchestrator) -> R) -> R {
        f(&self.orchestrator.lock())
    }

    fn render_error(&self, e: &CliError) -> String {
        self.format
            .to_string(&Message::error(e.to_string()))
            .unwrap_or_else(|_| format!("error: {e}\n"))
    }
}
