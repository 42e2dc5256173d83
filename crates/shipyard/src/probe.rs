//! Liveness checks against an agent's `/status` endpoint.
//!
//! A probe is alive only when the endpoint answers 2xx and, if the body names
//! a container, the name is the one we expected. Remote agents share one
//! public hostname, so the instance header pins the request to one machine.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use shipyard_registry::{AgentState, RegistryEntry};
use tracing::debug;

use crate::http::{HttpClient, RequestOptions};
use crate::readiness::{ReadinessCheck, Tick};

pub const INSTANCE_HEADER: &str = "fly-force-instance-id";
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn status_url(base_url: &str) -> String {
    format!("{}/status", base_url.trim_end_matches('/'))
}

/// Single attempt, pinned to `instance_id` when given.
pub fn status_request(timeout: Duration, instance_id: Option<&str>) -> RequestOptions {
    let opts = RequestOptions::once().with_timeout(timeout);
    match instance_id {
        Some(id) => opts.with_header(INSTANCE_HEADER, id),
        None => opts,
    }
}

fn instance_id(state: &AgentState) -> Option<&str> {
    match state {
        AgentState::Local(_) => None,
        AgentState::Remote(agent) => Some(agent.fly_machine_id.as_str()),
    }
}

/// A JSON body naming another container means a sibling answered. Anything
/// else that came back 2xx counts.
/// A reported `containerName` must be the expected string. Null or absent
/// means the agent did not say.
fn identity_matches(body: &str, expected: &str) -> bool {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return true;
    };
    match value.get("containerName") {
        Some(Value::String(reported)) => reported == expected,
        Some(Value::Null) | None => true,
        Some(_) => false,
    }
}

async fn probe_status(
    http: &HttpClient,
    base_url: &str,
    container_name: &str,
    instance_id: Option<&str>,
    timeout: Duration,
) -> bool {
    let url = status_url(base_url);
    match http
        .get_text(&url, &status_request(timeout, instance_id))
        .await
    {
        Ok(body) => {
            let alive = identity_matches(&body, container_name);
            if !alive {
                debug!(%container_name, %url, "status answered by a different agent");
            }
            alive
        }
        Err(err) => {
            debug!(%container_name, error = %err, "status probe failed");
            false
        }
    }
}

/// Whether the agent behind `state` is reachable and is that agent.
pub async fn probe(http: &HttpClient, state: &AgentState) -> bool {
    probe_with_timeout(http, state, DEFAULT_PROBE_TIMEOUT).await
}

pub async fn probe_with_timeout(http: &HttpClient, state: &AgentState, timeout: Duration) -> bool {
    probe_status(
        http,
        state.base_url(),
        state.container_name(),
        instance_id(state),
        timeout,
    )
    .await
}

pub async fn probe_entry(http: &HttpClient, entry: &RegistryEntry) -> bool {
    probe(http, &entry.state).await
}

/// Readiness check that succeeds once `/status` answers for the expected agent.
#[derive(Clone, Debug)]
pub struct StatusEndpoint<'a> {
    pub http: &'a HttpClient,
    pub base_url: &'a str,
    pub container_name: &'a str,
    pub instance_id: Option<&'a str>,
    pub timeout: Duration,
}

#[async_trait]
impl ReadinessCheck for StatusEndpoint<'_> {
    fn label(&self) -> &str {
        "status endpoint"
    }

    async fn check(&self, remaining: Duration) -> Tick {
        let alive = probe_status(
            self.http,
            self.base_url,
            self.container_name,
            self.instance_id,
            self.timeout.min(remaining),
        )
        .await;
        if alive {
            Tick::Ready
        } else {
            Tick::Pending
        }
    }
}
