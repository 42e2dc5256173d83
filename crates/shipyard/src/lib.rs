//! Ephemeral agent orchestration.
//!
//! [`Orchestrator`] starts an agent either as a local container or as a Fly
//! machine, waits until its `/status` endpoint answers for that agent, records
//! it in the [`Registry`], and tears it down again on request.

pub mod agent_env;
pub mod config;
pub mod docker;
pub mod error;
pub mod fly;
pub mod http;
pub mod image;
pub mod orchestrator;
pub mod probe;
pub mod readiness;

pub use agent_env::{build_agent_env, generate_container_name, AgentIdentity, RepoOptions};
pub use config::{ContainerConfig, DockerConfig, FlyConfig, Timings};
pub use error::{HttpError, OrchestratorError, Result};
pub use fly::{FlyClient, Machine};
pub use http::{HttpClient, RequestOptions};
pub use image::{resolve_image_ref, DEFAULT_IMAGE_REF};
pub use orchestrator::{Orchestrator, ProbedEntry};
pub use probe::{probe, probe_entry};
pub use readiness::{best_effort, poll_until_ready, PollPolicy, ReadinessCheck, Tick};
pub use shipyard_registry::{
    AgentKind, AgentState, LocalAgent, Registry, RegistryEntry, RegistryError, RemoteAgent,
};
