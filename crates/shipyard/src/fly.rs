//! Remote agents on Fly Machines.
//!
//! Machines are created from a prebuilt image, registered as soon as they
//! exist, and only handed back once the app's public hostname answers
//! `/status` for that exact machine. A machine that never gets there is
//! destroyed before the error is returned.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shipyard_registry::{AgentState, RemoteAgent};
use tracing::{debug, info, warn};

use crate::agent_env::{build_agent_env, generate_container_name, AgentIdentity, RepoOptions};
use crate::config::{ContainerConfig, FlyConfig};
use crate::error::{HttpError, OrchestratorError, Result};
use crate::http::{HttpClient, RequestOptions, DEFAULT_RETRIES, DEFAULT_RETRY_DELAY};
use crate::image::resolve_image_ref;
use crate::probe::StatusEndpoint;
use crate::readiness::{best_effort, poll_until_ready, ReadinessCheck, Tick};

pub const AGENT_INTERNAL_PORT: u16 = 8080;
pub const PUBLIC_PORT: u16 = 443;
/// Error code in the create response while a freshly pushed image is not yet
/// visible to the machines API.
pub const MANIFEST_UNKNOWN: &str = "MANIFEST_UNKNOWN";

/// Added on top of the server-side wait so the request outlives it.
const WAIT_REQUEST_SLACK: Duration = Duration::from_secs(5);

const ALLOCATE_IP_MUTATION: &str = "mutation($input: AllocateIPAddressInput!) { \
allocateIpAddress(input: $input) { ipAddress { id address type } } }";

#[derive(Debug, Serialize)]
struct CreateAppRequest<'a> {
    app_name: &'a str,
    org_slug: &'a str,
}

#[derive(Debug, Serialize)]
pub struct CreateMachineRequest {
    pub name: String,
    pub config: MachineConfig,
}

#[derive(Debug, Serialize)]
pub struct MachineConfig {
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub guest: GuestConfig,
    pub restart: RestartPolicy,
    pub services: Vec<MachineService>,
}

#[derive(Debug, Serialize)]
pub struct GuestConfig {
    pub cpu_kind: String,
    pub cpus: u32,
    pub memory_mb: u32,
}

#[derive(Debug, Serialize)]
pub struct RestartPolicy {
    pub policy: String,
}

#[derive(Debug, Serialize)]
pub struct MachineService {
    pub protocol: String,
    pub internal_port: u16,
    pub autostart: bool,
    pub autostop: bool,
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Serialize)]
pub struct ServicePort {
    pub port: u16,
    pub handlers: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Machine {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

/// One agent per machine: never restarted, reachable through the app's TLS
/// edge on 443.
pub fn build_create_machine_request(
    name: &str,
    image: &str,
    env: BTreeMap<String, String>,
) -> CreateMachineRequest {
    CreateMachineRequest {
        name: name.to_string(),
        config: MachineConfig {
            image: image.to_string(),
            env,
            guest: GuestConfig {
                cpu_kind: "shared".to_string(),
                cpus: 4,
                memory_mb: 4096,
            },
            restart: RestartPolicy {
                policy: "no".to_string(),
            },
            services: vec![MachineService {
                protocol: "tcp".to_string(),
                internal_port: AGENT_INTERNAL_PORT,
                autostart: false,
                autostop: false,
                ports: vec![ServicePort {
                    port: PUBLIC_PORT,
                    handlers: vec!["tls".to_string(), "http".to_string()],
                }],
            }],
        },
    }
}

pub fn is_manifest_unknown(err: &HttpError) -> bool {
    err.body().is_some_and(|body| body.contains(MANIFEST_UNKNOWN))
}

#[derive(Clone, Debug)]
pub struct FlyClient {
    http: HttpClient,
    config: FlyConfig,
    retries: u32,
    retry_delay: Duration,
}

impl FlyClient {
    pub fn new(http: HttpClient, config: FlyConfig) -> Self {
        Self {
            http,
            config,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retries(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Same credentials, different app. Used to tear down machines recorded
    /// under another app name.
    pub fn for_app(&self, app_name: &str) -> Self {
        let mut config = self.config.clone();
        config.app_name = app_name.to_string();
        Self::new(self.http.clone(), config).with_retries(self.retries, self.retry_delay)
    }

    pub fn app_name(&self) -> &str {
        &self.config.app_name
    }

    fn opts(&self) -> RequestOptions {
        RequestOptions::default()
            .with_bearer(&self.config.api_token)
            .with_retries(self.retries, self.retry_delay)
    }

    fn app_url(&self) -> String {
        format!(
            "{}/v1/apps/{}",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.app_name
        )
    }

    fn machine_url(&self, machine_id: &str) -> String {
        format!("{}/machines/{machine_id}", self.app_url())
    }

    pub async fn create_app(&self) -> Result<()> {
        let url = format!(
            "{}/v1/apps",
            self.config.api_base_url.trim_end_matches('/')
        );
        let body = CreateAppRequest {
            app_name: &self.config.app_name,
            org_slug: &self.config.org_slug,
        };
        match self.http.post_json::<_, Value>(&url, &body, &self.opts()).await {
            Ok(_) => {
                info!(app = %self.config.app_name, org = %self.config.org_slug, "created fly app");
                Ok(())
            }
            Err(err) if err.body().is_some_and(|b| b.contains("already exists")) => {
                debug!(app = %self.config.app_name, "fly app already exists");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// `kind` is `shared_v4` or `v6`.
    pub async fn allocate_ip(&self, kind: &str) -> Result<()> {
        let body = json!({
            "query": ALLOCATE_IP_MUTATION,
            "variables": { "input": { "appId": self.config.app_name, "type": kind } },
        });
        let resp: GraphqlResponse = self
            .http
            .post_json(&self.config.graphql_url, &body, &self.opts())
            .await?;
        if let Some(first) = resp.errors.unwrap_or_default().into_iter().next() {
            return Err(OrchestratorError::Launch(format!(
                "allocate {kind} address for {}: {}",
                self.config.app_name, first.message
            )));
        }
        info!(app = %self.config.app_name, kind, "allocated ip address");
        Ok(())
    }

    pub async fn provision_app(&self) -> Result<()> {
        self.create_app().await?;
        self.allocate_ip("shared_v4").await?;
        self.allocate_ip("v6").await
    }

    /// Single attempt. The caller decides which failures are worth retrying.
    pub async fn create_machine(
        &self,
        request: &CreateMachineRequest,
    ) -> std::result::Result<Machine, HttpError> {
        let url = format!("{}/machines", self.app_url());
        let opts = RequestOptions::once().with_bearer(&self.config.api_token);
        self.http.post_json(&url, request, &opts).await
    }

    /// Blocks server-side for up to `wait_secs`. `request_timeout` bounds the
    /// whole call.
    pub async fn wait_for_state(
        &self,
        machine_id: &str,
        state: &str,
        wait_secs: u64,
        request_timeout: Duration,
    ) -> std::result::Result<(), HttpError> {
        let url = format!(
            "{}/wait?state={state}&timeout={wait_secs}",
            self.machine_url(machine_id)
        );
        let opts = RequestOptions::once()
            .with_bearer(&self.config.api_token)
            .with_timeout(request_timeout);
        self.http.get_text(&url, &opts).await.map(|_| ())
    }

    /// Gone already counts as destroyed, and a 404 is not retried.
    pub async fn destroy_machine(&self, machine_id: &str) -> Result<()> {
        let url = format!("{}?force=true", self.machine_url(machine_id));
        let opts = self.opts().with_final_status(404);
        match self.http.delete(&url, &opts).await {
            Ok(()) => {
                info!(app = %self.config.app_name, machine_id, "destroyed machine");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                debug!(machine_id, "machine already gone");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list_machines(&self) -> Result<Vec<Machine>> {
        let url = format!("{}/machines", self.app_url());
        let machines: Option<Vec<Machine>> = self.http.get_json(&url, &self.opts()).await?;
        Ok(machines.unwrap_or_default())
    }
}

/// Resolves once the machines API reports the machine started.
struct MachineStarted<'a> {
    client: &'a FlyClient,
    machine_id: &'a str,
    wait_secs: u64,
}

#[async_trait]
impl ReadinessCheck for MachineStarted<'_> {
    fn label(&self) -> &str {
        "machine started"
    }

    async fn check(&self, remaining: Duration) -> Tick {
        let timeout = (Duration::from_secs(self.wait_secs) + WAIT_REQUEST_SLACK).min(remaining);
        match self
            .client
            .wait_for_state(self.machine_id, "started", self.wait_secs, timeout)
            .await
        {
            Ok(()) => Tick::Ready,
            Err(err) => {
                warn!(machine_id = %self.machine_id, error = %err, "machine not started yet");
                Tick::Pending
            }
        }
    }
}

pub struct RemoteDriver<'a> {
    config: &'a ContainerConfig,
    http: &'a HttpClient,
    client: FlyClient,
}

impl<'a> RemoteDriver<'a> {
    pub fn new(config: &'a ContainerConfig, http: &'a HttpClient) -> Result<Self> {
        let client = FlyClient::new(http.clone(), config.fly()?.clone())
            .with_retries(config.timings.api_retries, config.timings.api_retry_delay);
        Ok(Self {
            config,
            http,
            client,
        })
    }

    pub fn client(&self) -> &FlyClient {
        &self.client
    }

    pub async fn create_machine_with_retry(
        &self,
        request: &CreateMachineRequest,
    ) -> Result<Machine> {
        let attempts = self.config.timings.image_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.client.create_machine(request).await {
                Ok(machine) => return Ok(machine),
                Err(err) if is_manifest_unknown(&err) && attempt < attempts => {
                    warn!(
                        container_name = %request.name,
                        image = %request.config.image,
                        attempt,
                        attempts,
                        "image not visible yet; retrying machine create"
                    );
                    tokio::time::sleep(self.config.timings.image_retry_delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(OrchestratorError::Launch(format!(
                        "create machine {}: {err}",
                        request.name
                    )))
                }
            }
        }
    }

    pub async fn wait_until_ready(&self, agent: &RemoteAgent) -> Result<()> {
        let timings = &self.config.timings;
        let started = MachineStarted {
            client: &self.client,
            machine_id: &agent.fly_machine_id,
            wait_secs: timings.machine_wait_secs,
        };
        poll_until_ready(&agent.container_name, &[&started], timings.remote_started).await?;
        debug!(machine_id = %agent.fly_machine_id, "machine started");

        let status = StatusEndpoint {
            http: self.http,
            base_url: &agent.base_url,
            container_name: &agent.container_name,
            instance_id: Some(agent.fly_machine_id.as_str()),
            timeout: timings.probe_timeout,
        };
        poll_until_ready(&agent.container_name, &[&status], timings.remote_ready).await
    }

    /// Destroy the machine and close its registry row. Neither failure is
    /// propagated. A machine that could not be destroyed keeps its row open
    /// so it stays visible to `ps` and `stop`.
    async fn cleanup(&self, agent: &RemoteAgent) {
        let destroyed = best_effort(
            "destroy unready machine",
            self.client.destroy_machine(&agent.fly_machine_id),
        )
        .await;
        if destroyed.is_none() {
            warn!(
                container_name = %agent.container_name,
                machine_id = %agent.fly_machine_id,
                "machine may still be running; leaving registry row open"
            );
            return;
        }
        let registry = &self.config.registry;
        best_effort("mark unready machine stopped", async {
            registry.mark_stopped(Some(agent.container_name.as_str()))
        })
        .await;
    }

    pub async fn start(&self, repo: &RepoOptions) -> Result<AgentState> {
        let started = Instant::now();
        let fly = self.config.fly()?;
        let image = resolve_image_ref(self.config.image_ref.as_deref());
        let name = generate_container_name();
        let env = build_agent_env(
            repo,
            &self.config.env,
            &AgentIdentity {
                container_name: &name,
                port: AGENT_INTERNAL_PORT,
                webhook_url: self.config.webhook_url.as_deref(),
            },
        );

        info!(container_name = %name, app = %fly.app_name, %image, "creating remote agent");
        let request = build_create_machine_request(&name, &image, env);
        let machine = self.create_machine_with_retry(&request).await?;

        let agent = RemoteAgent {
            container_name: name,
            base_url: fly.public_url(),
            port: AGENT_INTERNAL_PORT,
            fly_app: fly.app_name.clone(),
            fly_machine_id: machine.id,
        };
        let state = AgentState::Remote(agent.clone());
        if let Err(err) = self.config.registry.log(&state) {
            best_effort(
                "destroy unregistered machine",
                self.client.destroy_machine(&agent.fly_machine_id),
            )
            .await;
            return Err(err.into());
        }

        if let Err(err) = self.wait_until_ready(&agent).await {
            warn!(
                container_name = %agent.container_name,
                machine_id = %agent.fly_machine_id,
                error = %err,
                "remote agent never became ready; destroying"
            );
            self.cleanup(&agent).await;
            return Err(err);
        }

        info!(
            container_name = %agent.container_name,
            machine_id = %agent.fly_machine_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "remote agent ready"
        );
        Ok(state)
    }

    pub async fn stop(&self, agent: &RemoteAgent) -> Result<()> {
        if agent.fly_app.trim().is_empty() || agent.fly_machine_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidState(format!(
                "{} has no fly app or machine id",
                agent.container_name
            )));
        }
        info!(
            container_name = %agent.container_name,
            machine_id = %agent.fly_machine_id,
            "stopping remote agent"
        );
        self.client
            .for_app(&agent.fly_app)
            .destroy_machine(&agent.fly_machine_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use shipyard_registry::Registry;
    use shipyard_test_utils::{spawn_one_shot_server, CapturedRequest, MockResponse, MockServer};

    use crate::readiness::PollPolicy;

    const MACHINE_JSON: &str = r#"{"id":"3d8d9e","name":"shipyard-x","state":"created"}"#;

    fn test_config(dir: &tempfile::TempDir, base_url: &str) -> ContainerConfig {
        let mut fly = FlyConfig::new("fly-token", "agents");
        fly.api_base_url = base_url.to_string();
        fly.graphql_url = format!("{base_url}/graphql");
        fly.public_url = Some(base_url.to_string());

        let mut config =
            ContainerConfig::new(dir.path(), Registry::at_root(dir.path())).with_fly(fly);
        config.timings.image_retry_delay = Duration::from_millis(10);
        config.timings.api_retry_delay = Duration::from_millis(10);
        config.timings.remote_started =
            PollPolicy::new(Duration::from_secs(5), Duration::from_millis(50));
        config.timings.remote_ready =
            PollPolicy::new(Duration::from_secs(5), Duration::from_millis(50));
        config
    }

    fn is_create(req: &CapturedRequest) -> bool {
        req.method == "POST" && req.path == "/v1/apps/agents/machines"
    }

    #[test]
    fn machine_request_has_expected_shape() {
        let mut env = BTreeMap::new();
        env.insert("PORT".to_string(), "8080".to_string());
        let request = build_create_machine_request("shipyard-a", "img:latest", env);
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["name"], "shipyard-a");
        assert_eq!(value["config"]["image"], "img:latest");
        assert_eq!(value["config"]["env"]["PORT"], "8080");
        assert_eq!(
            value["config"]["guest"],
            json!({"cpu_kind": "shared", "cpus": 4, "memory_mb": 4096})
        );
        assert_eq!(value["config"]["restart"]["policy"], "no");
        assert_eq!(
            value["config"]["services"][0],
            json!({
                "protocol": "tcp",
                "internal_port": 8080,
                "autostart": false,
                "autostop": false,
                "ports": [{"port": 443, "handlers": ["tls", "http"]}],
            })
        );
    }

    #[tokio::test]
    async fn manifest_unknown_is_retried_until_image_appears() {
        let dir = tempfile::tempdir().unwrap();
        let creates = AtomicUsize::new(0);
        let server = MockServer::start(move |req| {
            if is_create(req) {
                if creates.fetch_add(1, Ordering::SeqCst) < 2 {
                    return MockResponse::new(
                        "422 Unprocessable Entity",
                        r#"{"error":"failed to get manifest: MANIFEST_UNKNOWN"}"#,
                    );
                }
                return MockResponse::ok(MACHINE_JSON);
            }
            MockResponse::ok("ok")
        });
        let config = test_config(&dir, server.base_url());
        let http = HttpClient::new();

        let state = RemoteDriver::new(&config, &http)
            .unwrap()
            .start(&RepoOptions::default())
            .await
            .expect("remote agent ready");

        let requests = server.captured();
        assert_eq!(requests.iter().filter(|r| is_create(r)).count(), 3);
        let create = requests.iter().find(|r| is_create(r)).unwrap();
        assert_eq!(create.header("authorization"), Some("Bearer fly-token"));
        assert!(requests
            .iter()
            .any(|r| r.path == "/v1/apps/agents/machines/3d8d9e/wait?state=started&timeout=60"));
        let status = requests.iter().find(|r| r.path == "/status").unwrap();
        assert_eq!(status.header("fly-force-instance-id"), Some("3d8d9e"));

        let rows = config.registry.recent(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, state);
        assert!(!rows[0].is_stopped());
        match state {
            AgentState::Remote(agent) => {
                assert_eq!(agent.fly_app, "agents");
                assert_eq!(agent.fly_machine_id, "3d8d9e");
                assert_eq!(agent.port, 8080);
            }
            other => panic!("expected remote agent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_create_failures_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start(|_| {
            MockResponse::new("401 Unauthorized", r#"{"error":"unauthorized"}"#)
        });
        let config = test_config(&dir, server.base_url());
        let http = HttpClient::new();

        let err = RemoteDriver::new(&config, &http)
            .unwrap()
            .start(&RepoOptions::default())
            .await
            .expect_err("create fails");
        assert!(matches!(err, OrchestratorError::Launch(_)));
        assert_eq!(server.captured().len(), 1);
        assert!(config.registry.recent(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn readiness_timeout_destroys_machine_once() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start(|req| {
            if is_create(req) {
                return MockResponse::ok(MACHINE_JSON);
            }
            if req.path == "/status" {
                return MockResponse::new("503 Service Unavailable", "starting");
            }
            MockResponse::ok("")
        });
        let mut config = test_config(&dir, server.base_url());
        config.timings.remote_ready =
            PollPolicy::new(Duration::from_millis(1000), Duration::from_millis(100));
        let http = HttpClient::new();

        let started = Instant::now();
        let err = RemoteDriver::new(&config, &http)
            .unwrap()
            .start(&RepoOptions::default())
            .await
            .expect_err("never ready");
        let elapsed = started.elapsed();

        assert!(matches!(err, OrchestratorError::ReadinessTimeout { .. }));
        assert!(elapsed >= Duration::from_millis(1000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3000), "{elapsed:?}");

        let deletes: Vec<_> = server
            .captured()
            .into_iter()
            .filter(|r| r.method == "DELETE")
            .collect();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].path, "/v1/apps/agents/machines/3d8d9e?force=true");

        let rows = config.registry.recent(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_stopped());
    }

    #[tokio::test]
    async fn failed_destroy_leaves_row_open() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start(|req| {
            if is_create(req) {
                return MockResponse::ok(MACHINE_JSON);
            }
            if req.path == "/status" {
                return MockResponse::new("503 Service Unavailable", "starting");
            }
            if req.method == "DELETE" {
                return MockResponse::new("500 Internal Server Error", "boom");
            }
            MockResponse::ok("")
        });
        let mut config = test_config(&dir, server.base_url());
        config.timings.remote_ready =
            PollPolicy::new(Duration::from_millis(300), Duration::from_millis(50));
        let http = HttpClient::new();

        let err = RemoteDriver::new(&config, &http)
            .unwrap()
            .start(&RepoOptions::default())
            .await
            .expect_err("never ready");
        assert!(matches!(err, OrchestratorError::ReadinessTimeout { .. }));

        let deletes = server
            .captured()
            .into_iter()
            .filter(|r| r.method == "DELETE")
            .count();
        assert_eq!(deletes, 1 + config.timings.api_retries as usize);

        let rows = config.registry.recent(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].is_stopped());
    }

    #[tokio::test]
    async fn started_wait_errors_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let waits = AtomicUsize::new(0);
        let server = MockServer::start(move |req| {
            if is_create(req) {
                return MockResponse::ok(MACHINE_JSON);
            }
            if req.path.contains("/wait?state=started")
                && waits.fetch_add(1, Ordering::SeqCst) == 0
            {
                return MockResponse::new("500 Internal Server Error", "not yet");
            }
            MockResponse::ok("ok")
        });
        let config = test_config(&dir, server.base_url());
        let http = HttpClient::new();

        RemoteDriver::new(&config, &http)
            .unwrap()
            .start(&RepoOptions::default())
            .await
            .expect("ready after second wait");

        let requests = server.captured();
        let waits = requests
            .iter()
            .filter(|r| r.path.contains("/wait?state=started"))
            .count();
        assert_eq!(waits, 2);
        assert!(requests.iter().any(|r| r.path == "/status"));
        assert!(!config.registry.recent(10).unwrap()[0].is_stopped());
    }

    #[tokio::test]
    async fn destroy_treats_missing_machine_as_success() {
        let server = MockServer::start(|_| {
            MockResponse::new("404 Not Found", r#"{"error":"not found"}"#)
        });
        let mut fly = FlyConfig::new("tok", "agents");
        fly.api_base_url = server.base_url().to_string();
        FlyClient::new(HttpClient::new(), fly)
            .destroy_machine("gone")
            .await
            .expect("404 is fine");

        let requests = server.captured();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "DELETE");
        assert_eq!(requests[0].path, "/v1/apps/agents/machines/gone?force=true");
    }

    #[tokio::test]
    async fn stop_requires_machine_coordinates() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, "http://127.0.0.1:9");
        let http = HttpClient::new();
        let agent = RemoteAgent {
            container_name: "shipyard-a".to_string(),
            base_url: "https://agents.fly.dev".to_string(),
            port: 8080,
            fly_app: "agents".to_string(),
            fly_machine_id: " ".to_string(),
        };
        let err = RemoteDriver::new(&config, &http)
            .unwrap()
            .stop(&agent)
            .await
            .expect_err("no machine id");
        assert!(matches!(err, OrchestratorError::InvalidState(_)));
    }

    #[tokio::test]
    async fn stop_targets_the_recorded_app() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start(|_| MockResponse::ok(""));
        let config = test_config(&dir, server.base_url());
        let http = HttpClient::new();
        let agent = RemoteAgent {
            container_name: "shipyard-a".to_string(),
            base_url: "https://old-agents.fly.dev".to_string(),
            port: 8080,
            fly_app: "old-agents".to_string(),
            fly_machine_id: "m1".to_string(),
        };
        RemoteDriver::new(&config, &http)
            .unwrap()
            .stop(&agent)
            .await
            .unwrap();
        assert_eq!(
            server.captured()[0].path,
            "/v1/apps/old-agents/machines/m1?force=true"
        );
    }

    #[tokio::test]
    async fn provision_creates_app_and_allocates_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start(|req| {
            if req.path == "/graphql" {
                return MockResponse::ok(r#"{"data":{"allocateIpAddress":{"ipAddress":{}}}}"#);
            }
            MockResponse::new("201 Created", "")
        });
        let config = test_config(&dir, server.base_url());
        let client = FlyClient::new(HttpClient::new(), config.fly().unwrap().clone());
        client.provision_app().await.unwrap();

        let requests = server.captured();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].path, "/v1/apps");
        let app: Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(app, json!({"app_name": "agents", "org_slug": "personal"}));

        let kinds: Vec<String> = requests[1..]
            .iter()
            .map(|r| {
                let body: Value = serde_json::from_str(&r.body).unwrap();
                body["variables"]["input"]["type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(kinds, vec!["shared_v4", "v6"]);
    }

    #[tokio::test]
    async fn graphql_errors_fail_provisioning() {
        let (base_url, _rx) =
            spawn_one_shot_server("200 OK", r#"{"errors":[{"message":"not authorized"}]}"#);
        let mut fly = FlyConfig::new("tok", "agents");
        fly.graphql_url = base_url;
        let err = FlyClient::new(HttpClient::new(), fly)
            .allocate_ip("v6")
            .await
            .expect_err("graphql error");
        assert!(err.to_string().contains("not authorized"));
    }

    #[tokio::test]
    async fn list_machines_decodes_array() {
        let (base_url, rx) = spawn_one_shot_server(
            "200 OK",
            r#"[{"id":"a1","name":"shipyard-a","state":"started","region":"iad"}]"#,
        );
        let mut fly = FlyConfig::new("tok", "agents");
        fly.api_base_url = base_url;
        let machines = FlyClient::new(HttpClient::new(), fly)
            .list_machines()
            .await
            .unwrap();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].state, "started");
        assert_eq!(machines[0].region.as_deref(), Some("iad"));
        assert_eq!(rx.recv().unwrap().path, "/v1/apps/agents/machines");
    }
}
