use serde::Serialize;
use shipyard_registry::{AgentState, RegistryEntry};
use tracing::{info, warn};

use crate::agent_env::RepoOptions;
use crate::config::ContainerConfig;
use crate::docker::LocalDriver;
use crate::error::{OrchestratorError, Result};
use crate::fly::{FlyClient, Machine, RemoteDriver};
use crate::http::HttpClient;
use crate::probe;
use crate::readiness::best_effort;

/// Registry row plus the result of probing it.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbedEntry {
    #[serde(flatten)]
    pub entry: RegistryEntry,
    pub alive: bool,
}

/// Entry point for scripts: hands out ready agents and tears them down.
#[derive(Clone, Debug)]
pub struct Orchestrator {
    config: ContainerConfig,
    http: HttpClient,
}

impl Orchestrator {
    pub fn new(config: ContainerConfig) -> Self {
        Self::with_http(config, HttpClient::new())
    }

    pub fn with_http(config: ContainerConfig, http: HttpClient) -> Self {
        Self { config, http }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub async fn start_container(&self, repo: &RepoOptions) -> Result<AgentState> {
        LocalDriver::new(&self.config, &self.http).start(repo).await
    }

    pub async fn start_remote_container(&self, repo: &RepoOptions) -> Result<AgentState> {
        RemoteDriver::new(&self.config, &self.http)?.start(repo).await
    }

    /// Stops the container, then closes its registry row even if stopping
    /// failed.
    pub async fn stop_container(&self, container_name: &str) -> Result<()> {
        let stopped = LocalDriver::new(&self.config, &self.http)
            .stop(container_name)
            .await;
        self.finish_stop(container_name, stopped).await
    }

    pub async fn stop_remote_container(&self, state: &AgentState) -> Result<()> {
        let AgentState::Remote(agent) = state else {
            return Err(OrchestratorError::InvalidState(format!(
                "{} is not a remote agent",
                state.container_name()
            )));
        };
        let stopped = match RemoteDriver::new(&self.config, &self.http) {
            Ok(driver) => driver.stop(agent).await,
            Err(err) => Err(err),
        };
        self.finish_stop(&agent.container_name, stopped).await
    }

    pub async fn stop(&self, state: &AgentState) -> Result<()> {
        match state {
            AgentState::Local(agent) => self.stop_container(&agent.container_name).await,
            AgentState::Remote(_) => self.stop_remote_container(state).await,
        }
    }

    /// Stop whatever the registry last recorded under `container_name`.
    pub async fn stop_by_name(&self, container_name: &str) -> Result<()> {
        match self.config.registry.find(container_name)? {
            Some(entry) => self.stop(&entry.state).await,
            None => self.stop_container(container_name).await,
        }
    }

    async fn finish_stop(&self, container_name: &str, stopped: Result<()>) -> Result<()> {
        let registry = &self.config.registry;
        let marked = best_effort("mark agent stopped", async {
            registry.mark_stopped(Some(container_name))
        })
        .await;
        match stopped {
            Ok(()) => {
                info!(%container_name, marked = marked.unwrap_or(false), "agent stopped");
                Ok(())
            }
            Err(err) => {
                warn!(%container_name, error = %err, "agent teardown failed");
                Err(err)
            }
        }
    }

    pub async fn provision_remote_app(&self) -> Result<()> {
        self.fly_client()?.provision_app().await
    }

    pub async fn list_machines(&self) -> Result<Vec<Machine>> {
        self.fly_client()?.list_machines().await
    }

    pub async fn probe(&self, state: &AgentState) -> bool {
        probe::probe_with_timeout(&self.http, state, self.config.timings.probe_timeout).await
    }

    /// Newest `limit` registry rows, each probed. Stopped rows are reported
    /// without a network call.
    pub async fn probe_recent(&self, limit: usize) -> Result<Vec<ProbedEntry>> {
        let mut probed = Vec::new();
        for entry in self.config.registry.recent(limit)? {
            let alive = !entry.is_stopped() && self.probe(&entry.state).await;
            probed.push(ProbedEntry { entry, alive });
        }
        Ok(probed)
    }

    fn fly_client(&self) -> Result<FlyClient> {
        let timings = &self.config.timings;
        Ok(FlyClient::new(self.http.clone(), self.config.fly()?.clone())
            .with_retries(timings.api_retries, timings.api_retry_delay))
    }
}
