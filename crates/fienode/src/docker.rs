//! Docker engine adapter driven through the `docker` CLI.
//!
//! ```text
//! FogNode / WorkloadHandle
//!          │
//!          ▼
//!   ContainerRuntime trait
//!          │
//!          ▼
//!      DockerCli ──► CommandRunner ──► docker run / inspect / rm / network
//! ```

use std::fmt;
use std::sync::Arc;

use fie_network::AddressBlock;
use tracing::debug;

use crate::error::NodeError;
use crate::exec::{argv, CommandRunner};
use crate::runtime::{ContainerRuntime, CreateRequest};

/// Bridge name option understood by the docker bridge driver.
const BRIDGE_NAME_OPTION: &str = "com.docker.network.bridge.name";

/// [`ContainerRuntime`] backed by the docker command line.
pub struct DockerCli {
    binary: String,
    runner: Arc<dyn CommandRunner>,
}

impl DockerCli {
    /// Create an adapter that runs `binary` (usually `docker`).
    #[must_use]
    pub fn new(binary: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            binary: binary.into(),
            runner,
        }
    }

    fn docker(&self, operation: &str, args: &[String]) -> Result<String, NodeError> {
        debug!(operation, args = ?args, "docker call");
        let output = self
            .runner
            .run(&self.binary, args)
            .map_err(|e| NodeError::runtime(operation, e))?;
        if output.is_success() {
            Ok(output.stdout.trim().to_string())
        } else {
            Err(NodeError::runtime(operation, output.stderr.trim()))
        }
    }

    /// Arguments of the `run` call for one request.
    #[must_use]
    pub fn run_args(request: &CreateRequest<'_>) -> Vec<String> {
        let mut args = argv([
            "run",
            "-itd",
            "--name",
            request.name,
            "--network",
            request.network,
            "--cgroup-parent",
        ]);
        args.push(format!("/{}", request.cgroup_parent.trim_start_matches('/')));

        for (key, value) in &request.spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for volume in &request.spec.volumes {
            args.push("-v".to_string());
            args.push(volume.to_bind());
        }

        args.push(request.spec.image.clone());
        if let Some(command) = &request.spec.command {
            args.extend(command.iter().cloned());
        }
        args
    }
}

impl fmt::Debug for DockerCli {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DockerCli")
            .field("binary", &self.binary)
            .finish_non_exhaustive()
    }
}

impl ContainerRuntime for DockerCli {
    fn create_network(
        &self,
        name: &str,
        subnet: AddressBlock,
        bridge: &str,
    ) -> Result<(), NodeError> {
        let subnet = subnet.to_string();
        let option = format!("{BRIDGE_NAME_OPTION}={bridge}");
        self.docker(
            "network create",
            &argv([
                "network",
                "create",
                "--driver",
                "bridge",
                "--subnet",
                subnet.as_str(),
                "-o",
                option.as_str(),
                name,
            ]),
        )
        .map(|_| ())
    }

    fn remove_network(&self, name: &str) -> Result<(), NodeError> {
        self.docker("network rm", &argv(["network", "rm", name]))
            .map(|_| ())
    }

    fn create(&self, request: &CreateRequest<'_>) -> Result<String, NodeError> {
        let id = self.docker("run", &Self::run_args(request))?;
        if id.is_empty() {
            return Err(NodeError::runtime("run", "engine returned no container id"));
        }
        Ok(id)
    }

    fn inspect_pid(&self, container: &str) -> Result<u32, NodeError> {
        let out = self.docker(
            "inspect",
            &argv(["inspect", "-f", "{{.State.Pid}}", container]),
        )?;
        let pid: u32 = out
            .parse()
            .map_err(|_| NodeError::runtime("inspect", format!("unexpected pid output: {out:?}")))?;
        if pid == 0 {
            return Err(NodeError::runtime(
                "inspect",
                format!("{container} is not running"),
            ));
        }
        Ok(pid)
    }

    fn start(&self, container: &str) -> Result<(), NodeError> {
        self.docker("start", &argv(["start", container])).map(|_| ())
    }

    fn stop(&self, container: &str) -> Result<(), NodeError> {
        self.docker("stop", &argv(["stop", container])).map(|_| ())
    }

    fn remove(&self, container: &str, force: bool) -> Result<(), NodeError> {
        let args = if force {
            argv(["rm", "-f", container])
        } else {
            argv(["rm", container])
        };
        self.docker("rm", &args).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, RecordingRunner};
    use crate::workload::{VolumeMount, WorkloadSpec};

    fn cli(runner: RecordingRunner) -> (DockerCli, Arc<RecordingRunner>) {
        let runner = Arc::new(runner);
        let cli = DockerCli::new("docker", Arc::clone(&runner) as Arc<dyn CommandRunner>);
        (cli, runner)
    }

    #[test]
    fn test_run_args() {
        let spec = WorkloadSpec::new("tz70s/busy-wait")
            .with_env("MODE", "spin")
            .with_volume(VolumeMount::new("/tmp/data", "/data"))
            .with_command(vec!["sleep".to_string(), "60".to_string()]);
        let request = CreateRequest {
            name: "fog-0",
            network: "netns-fog",
            cgroup_parent: "fog",
            spec: &spec,
        };

        assert_eq!(
            DockerCli::run_args(&request).join(" "),
            "run -itd --name fog-0 --network netns-fog --cgroup-parent /fog \
             -e MODE=spin -v /tmp/data:/data tz70s/busy-wait sleep 60"
        );
    }

    #[test]
    fn test_create_network_passes_subnet_and_bridge_name() {
        let (cli, runner) = cli(RecordingRunner::new());
        cli.create_network(
            "netns-fog",
            "192.168.11.0/24".parse().expect("valid block"),
            "netns-fog",
        )
        .expect("should create");

        assert_eq!(
            runner.calls(),
            vec![
                "docker network create --driver bridge --subnet 192.168.11.0/24 \
                 -o com.docker.network.bridge.name=netns-fog netns-fog"
                    .to_string()
            ]
        );
    }

    #[test]
    fn test_create_returns_container_id() {
        let (cli, _) = cli(
            RecordingRunner::new().with_response("docker run", CommandOutput::success("abc123\n")),
        );
        let spec = WorkloadSpec::new("alpine");
        let request = CreateRequest {
            name: "c",
            network: "n",
            cgroup_parent: "fog",
            spec: &spec,
        };
        assert_eq!(cli.create(&request).expect("should create"), "abc123");
    }

    #[test]
    fn test_inspect_pid_parses_output() {
        let (cli, _) = cli(
            RecordingRunner::new().with_response("inspect", CommandOutput::success("31337\n")),
        );
        assert_eq!(cli.inspect_pid("fog-0").expect("should inspect"), 31337);
    }

    #[test]
    fn test_inspect_pid_zero_means_not_running() {
        let (cli, _) =
            cli(RecordingRunner::new().with_response("inspect", CommandOutput::success("0")));
        assert!(matches!(
            cli.inspect_pid("fog-0"),
            Err(NodeError::RuntimeCallFailure { .. })
        ));
    }

    #[test]
    fn test_failure_maps_to_runtime_call_failure() {
        let (cli, _) = cli(RecordingRunner::new().failing_on("docker rm"));
        let err = cli.remove("fog-0", true).expect_err("should fail");
        assert!(matches!(err, NodeError::RuntimeCallFailure { ref operation, .. } if operation == "rm"));
    }

    #[test]
    fn test_forced_remove() {
        let (cli, runner) = cli(RecordingRunner::new());
        cli.remove("fog-0", true).expect("should remove");
        cli.remove("fog-1", false).expect("should remove");
        assert_eq!(
            runner.calls(),
            vec!["docker rm -f fog-0".to_string(), "docker rm fog-1".to_string()]
        );
    }
}
