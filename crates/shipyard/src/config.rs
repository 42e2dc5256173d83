use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use shipyard_registry::Registry;

use crate::error::{OrchestratorError, Result};
use crate::http::{DEFAULT_RETRIES, DEFAULT_RETRY_DELAY};
use crate::readiness::PollPolicy;

pub const DEFAULT_FLY_API_BASE_URL: &str = "https://api.machines.dev";
pub const DEFAULT_FLY_GRAPHQL_URL: &str = "https://api.fly.io/graphql";
pub const DEFAULT_FLY_APP_NAME: &str = "shipyard-agents";
pub const DEFAULT_FLY_ORG_SLUG: &str = "personal";

pub const DEFAULT_DOCKER_BIN: &str = "docker";
pub const DEFAULT_DOCKER_IMAGE: &str = "shipyard-agent";
pub const DEFAULT_START_PORT: u16 = 3100;

/// Credentials and endpoints for the Fly Machines API.
#[derive(Clone)]
pub struct FlyConfig {
    pub api_token: String,
    pub app_name: String,
    pub org_slug: String,
    pub api_base_url: String,
    pub graphql_url: String,
    /// Where the app's public hostname is reached. Defaults to `https://<app>.fly.dev`.
    pub public_url: Option<String>,
}

impl fmt::Debug for FlyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlyConfig")
            .field("api_token", &"<redacted>")
            .field("app_name", &self.app_name)
            .field("org_slug", &self.org_slug)
            .field("api_base_url", &self.api_base_url)
            .field("graphql_url", &self.graphql_url)
            .field("public_url", &self.public_url)
            .finish()
    }
}

impl FlyConfig {
    pub fn new(api_token: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            api_token: api_token.into(),
            app_name: app_name.into(),
            org_slug: DEFAULT_FLY_ORG_SLUG.to_string(),
            api_base_url: DEFAULT_FLY_API_BASE_URL.to_string(),
            graphql_url: DEFAULT_FLY_GRAPHQL_URL.to_string(),
            public_url: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        let api_token = required_non_empty_env("FLY_API_TOKEN")?;
        Ok(Self {
            api_token,
            app_name: optional_non_empty_env("FLY_APP_NAME", DEFAULT_FLY_APP_NAME),
            org_slug: optional_non_empty_env("FLY_ORG_SLUG", DEFAULT_FLY_ORG_SLUG),
            api_base_url: optional_non_empty_env(
                "SHIPYARD_FLY_API_BASE_URL",
                DEFAULT_FLY_API_BASE_URL,
            ),
            graphql_url: optional_non_empty_env(
                "SHIPYARD_FLY_GRAPHQL_URL",
                DEFAULT_FLY_GRAPHQL_URL,
            ),
            public_url: env_opt("SHIPYARD_FLY_PUBLIC_URL"),
        })
    }

    pub fn public_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.fly.dev", self.app_name),
        }
    }
}

/// Local container engine settings.
#[derive(Clone, Debug)]
pub struct DockerConfig {
    pub bin: String,
    pub image: String,
    pub start_port: u16,
    /// Pinned host port. Skips the free-port scan when set.
    pub port: Option<u16>,
    pub host: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            bin: DEFAULT_DOCKER_BIN.to_string(),
            image: DEFAULT_DOCKER_IMAGE.to_string(),
            start_port: DEFAULT_START_PORT,
            port: None,
            host: "localhost".to_string(),
        }
    }
}

impl DockerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            bin: optional_non_empty_env("SHIPYARD_DOCKER_BIN", &defaults.bin),
            image: optional_non_empty_env("SHIPYARD_DOCKER_IMAGE", &defaults.image),
            start_port: env_parse("SHIPYARD_START_PORT")?.unwrap_or(defaults.start_port),
            port: env_parse("SHIPYARD_PORT")?,
            host: defaults.host,
        })
    }
}

/// Poll budgets and pauses used by the drivers.
#[derive(Clone, Debug)]
pub struct Timings {
    pub build_timeout: Duration,
    pub local_ready: PollPolicy,
    pub remote_started: PollPolicy,
    pub remote_ready: PollPolicy,
    pub probe_timeout: Duration,
    /// Server-side timeout passed to the machine `wait` endpoint.
    pub machine_wait_secs: u64,
    pub image_retry_attempts: u32,
    pub image_retry_delay: Duration,
    /// Transport retries for Fly API calls that are not single-shot.
    pub api_retries: u32,
    pub api_retry_delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            build_timeout: Duration::from_secs(600),
            local_ready: PollPolicy::new(Duration::from_secs(120), Duration::from_secs(1)),
            remote_started: PollPolicy::new(Duration::from_secs(180), Duration::from_secs(1)),
            remote_ready: PollPolicy::new(Duration::from_secs(180), Duration::from_secs(2)),
            probe_timeout: Duration::from_secs(5),
            machine_wait_secs: 60,
            image_retry_attempts: 5,
            image_retry_delay: Duration::from_secs(5),
            api_retries: DEFAULT_RETRIES,
            api_retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Everything a driver needs besides the repository coordinates.
#[derive(Clone, Debug)]
pub struct ContainerConfig {
    /// Build context for the local agent image.
    pub project_dir: PathBuf,
    /// Extra variables injected into every agent.
    pub env: BTreeMap<String, String>,
    pub registry: Registry,
    pub fly: Option<FlyConfig>,
    pub image_ref: Option<String>,
    pub webhook_url: Option<String>,
    pub docker: DockerConfig,
    pub timings: Timings,
}

impl ContainerConfig {
    pub fn new(project_dir: impl Into<PathBuf>, registry: Registry) -> Self {
        Self {
            project_dir: project_dir.into(),
            env: BTreeMap::new(),
            registry,
            fly: None,
            image_ref: None,
            webhook_url: None,
            docker: DockerConfig::default(),
            timings: Timings::default(),
        }
    }

    /// Fly settings are only loaded when `FLY_API_TOKEN` is present.
    pub fn from_env(project_dir: impl Into<PathBuf>, registry: Registry) -> Result<Self> {
        let fly = match env_opt("FLY_API_TOKEN") {
            Some(_) => Some(FlyConfig::from_env()?),
            None => None,
        };
        Ok(Self {
            fly,
            image_ref: env_opt("SHIPYARD_IMAGE_REF"),
            webhook_url: env_opt("SHIPYARD_WEBHOOK_URL"),
            docker: DockerConfig::from_env()?,
            ..Self::new(project_dir, registry)
        })
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_fly(mut self, fly: FlyConfig) -> Self {
        self.fly = Some(fly);
        self
    }

    pub fn with_image_ref(mut self, image_ref: impl Into<String>) -> Self {
        self.image_ref = Some(image_ref.into());
        self
    }

    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn with_docker(mut self, docker: DockerConfig) -> Self {
        self.docker = docker;
        self
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn fly(&self) -> Result<&FlyConfig> {
        self.fly.as_ref().ok_or_else(|| {
            OrchestratorError::Config("remote agents need FLY_API_TOKEN / fly settings".into())
        })
    }
}

fn required_non_empty_env(key: &str) -> Result<String> {
    let value = std::env::var(key)
        .map_err(|_| OrchestratorError::Config(format!("{key} must be set")))?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(OrchestratorError::Config(format!("{key} must be non-empty")));
    }
    Ok(trimmed.to_string())
}

fn optional_non_empty_env(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_opt(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| OrchestratorError::Config(format!("{key} has an invalid value: {raw}"))),
        None => Ok(None),
    }
}
