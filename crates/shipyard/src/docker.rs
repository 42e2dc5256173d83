//! Local agents run as host-networked containers driven through the engine CLI.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::process::Output;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use shipyard_registry::{AgentState, LocalAgent};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::agent_env::{build_agent_env, generate_container_name, AgentIdentity, RepoOptions};
use crate::config::ContainerConfig;
use crate::error::{OrchestratorError, Result};
use crate::http::HttpClient;
use crate::probe::StatusEndpoint;
use crate::readiness::{best_effort, poll_until_ready, ReadinessCheck, Tick};

/// How many ports above the start port are considered.
pub const PORT_SCAN_SPAN: u16 = 100;
pub const CRASH_LOG_TAIL: u32 = 30;

const NO_SUCH_CONTAINER: &str = "No such container";

/// Thin wrapper over the engine binary.
#[derive(Clone, Debug)]
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.bin, args.join(" "))
    }

    async fn output(&self, args: &[&str]) -> Result<Output> {
        Command::new(&self.bin)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| OrchestratorError::EngineSpawn {
                command: self.describe(args),
                source,
            })
    }

    async fn run_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        Err(OrchestratorError::EngineFailed {
            command: self.describe(args),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    pub async fn image_exists(&self, tag: &str) -> Result<bool> {
        let output = self.output(&["image", "inspect", tag]).await?;
        Ok(output.status.success())
    }

    pub async fn build(&self, tag: &str, context_dir: &Path, timeout: Duration) -> Result<()> {
        let context = context_dir.to_string_lossy();
        let args = ["build", "--network", "host", "-t", tag, &*context];
        let output = match tokio::time::timeout(timeout, self.output(&args)).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(OrchestratorError::Build {
                    image: tag.to_string(),
                    stderr: format!("build timed out after {timeout:?}"),
                })
            }
        };
        if !output.status.success() {
            return Err(OrchestratorError::Build {
                image: tag.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    /// Starts a detached container and returns its id.
    pub async fn run(&self, args: &[String]) -> Result<String> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match self.run_checked(&args).await {
            Ok(id) => Ok(id),
            Err(OrchestratorError::EngineFailed { stderr, code, .. }) => Err(
                OrchestratorError::Launch(format!("engine exited with {code:?}: {stderr}")),
            ),
            Err(err) => Err(err),
        }
    }

    /// `false` once the container has exited, which with `--rm` also means it
    /// no longer exists.
    pub async fn is_running(&self, name: &str) -> Result<bool> {
        let output = self
            .output(&["inspect", "--format", "{{.State.Running}}", name])
            .await?;
        Ok(output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    pub async fn logs(&self, name: &str, tail: u32) -> Result<String> {
        let tail = tail.to_string();
        let output = self.output(&["logs", "--tail", &tail, name]).await?;
        if !output.status.success() {
            return Err(OrchestratorError::EngineFailed {
                command: self.describe(&["logs", "--tail", &tail, name]),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        // Agents log to both streams.
        let mut logs = String::from_utf8_lossy(&output.stdout).to_string();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    /// Stopping a container that is already gone succeeds.
    pub async fn stop(&self, name: &str) -> Result<()> {
        match self.run_checked(&["stop", name]).await {
            Ok(_) => Ok(()),
            Err(OrchestratorError::EngineFailed { stderr, .. })
                if stderr.contains(NO_SUCH_CONTAINER) =>
            {
                debug!(container_name = %name, "container already gone");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Arguments for `docker run`. Env keys come out sorted.
pub fn run_args(name: &str, image: &str, env: &BTreeMap<String, String>) -> Vec<String> {
    let mut args: Vec<String> = ["run", "-d", "--rm", "--network", "host", "--name", name]
        .iter()
        .map(|s| s.to_string())
        .collect();
    for (key, value) in env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(image.to_string());
    args
}

/// Ports in the `Local Address:Port` column of `ss -Hltn` output.
pub fn parse_listening_ports(ss_output: &str) -> BTreeSet<u16> {
    ss_output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(3))
        .filter_map(|addr| addr.rsplit_once(':'))
        .filter_map(|(_, port)| port.parse().ok())
        .collect()
}

/// First port at or above `start` that nothing listens on.
pub fn first_free_port(start: u16, taken: &BTreeSet<u16>) -> Option<u16> {
    (start..=start.saturating_add(PORT_SCAN_SPAN)).find(|port| !taken.contains(port))
}

async fn listening_ports() -> Option<BTreeSet<u16>> {
    let output = Command::new("ss").arg("-Hltn").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    Some(parse_listening_ports(&String::from_utf8_lossy(&output.stdout)))
}

/// Fails the readiness loop when the container is no longer running.
pub struct ContainerRunning<'a> {
    pub docker: &'a DockerCli,
    pub name: &'a str,
}

#[async_trait]
impl ReadinessCheck for ContainerRunning<'_> {
    fn label(&self) -> &str {
        "container running"
    }

    async fn check(&self, _remaining: Duration) -> Tick {
        match self.docker.is_running(self.name).await {
            Ok(true) => Tick::Continue,
            Ok(false) => {
                let logs = best_effort(
                    "collect crash logs",
                    self.docker.logs(self.name, CRASH_LOG_TAIL),
                )
                .await;
                Tick::Failed(OrchestratorError::CrashedBeforeReady {
                    name: self.name.to_string(),
                    logs,
                })
            }
            Err(err) => Tick::Failed(err),
        }
    }
}

pub struct LocalDriver<'a> {
    config: &'a ContainerConfig,
    http: &'a HttpClient,
    docker: DockerCli,
}

impl<'a> LocalDriver<'a> {
    pub fn new(config: &'a ContainerConfig, http: &'a HttpClient) -> Self {
        Self {
            config,
            http,
            docker: DockerCli::new(config.docker.bin.clone()),
        }
    }

    pub async fn ensure_image(&self) -> Result<()> {
        let tag = &self.config.docker.image;
        if self.docker.image_exists(tag).await? {
            debug!(image = %tag, "agent image present");
            return Ok(());
        }
        info!(image = %tag, context = %self.config.project_dir.display(), "building agent image");
        let started = Instant::now();
        self.docker
            .build(tag, &self.config.project_dir, self.config.timings.build_timeout)
            .await?;
        info!(
            image = %tag,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "built agent image"
        );
        Ok(())
    }

    pub async fn pick_port(&self) -> Result<u16> {
        if let Some(port) = self.config.docker.port {
            debug!(port, "using pinned port");
            return Ok(port);
        }
        let start = self.config.docker.start_port;
        let Some(taken) = listening_ports().await else {
            debug!(port = start, "could not list listening ports; using start port");
            return Ok(start);
        };
        first_free_port(start, &taken).ok_or_else(|| {
            OrchestratorError::Launch(format!(
                "no free port in {start}..={}",
                start.saturating_add(PORT_SCAN_SPAN)
            ))
        })
    }

    pub async fn launch(&self, name: &str, port: u16, repo: &RepoOptions) -> Result<String> {
        let env = build_agent_env(
            repo,
            &self.config.env,
            &AgentIdentity {
                container_name: name,
                port,
                webhook_url: self.config.webhook_url.as_deref(),
            },
        );
        info!(container_name = %name, port, image = %self.config.docker.image, "launching local agent");
        self.docker
            .run(&run_args(name, &self.config.docker.image, &env))
            .await
    }

    pub async fn wait_until_ready(&self, name: &str, base_url: &str) -> Result<()> {
        let running = ContainerRunning {
            docker: &self.docker,
            name,
        };
        let status = StatusEndpoint {
            http: self.http,
            base_url,
            container_name: name,
            instance_id: None,
            timeout: self.config.timings.probe_timeout,
        };
        poll_until_ready(name, &[&running, &status], self.config.timings.local_ready).await
    }

    pub async fn start(&self, repo: &RepoOptions) -> Result<AgentState> {
        let started = Instant::now();
        self.ensure_image().await?;

        let name = generate_container_name();
        let port = self.pick_port().await?;
        let base_url = format!("http://{}:{port}", self.config.docker.host);
        self.launch(&name, port, repo).await?;

        if let Err(err) = self.wait_until_ready(&name, &base_url).await {
            warn!(container_name = %name, error = %err, "local agent never became ready");
            best_effort("stop unready container", self.docker.stop(&name)).await;
            return Err(err);
        }

        let state = AgentState::Local(LocalAgent {
            container_name: name,
            base_url,
            port,
        });
        if let Err(err) = self.config.registry.log(&state) {
            warn!(
                container_name = %state.container_name(),
                error = %err,
                "could not register local agent"
            );
            best_effort(
                "stop unregistered container",
                self.docker.stop(state.container_name()),
            )
            .await;
            return Err(err.into());
        }
        info!(
            container_name = %state.container_name(),
            base_url = %state.base_url(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "local agent ready"
        );
        Ok(state)
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        info!(container_name = %name, "stopping local agent");
        self.docker.stop(name).await
    }
}
