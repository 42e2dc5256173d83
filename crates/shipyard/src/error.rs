use std::time::Duration;

use shipyard_registry::RegistryError;

/// Failure of a single transport call, after retries were exhausted.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },
    #[error("{method} {url} timed out")]
    Timeout { method: String, url: String },
    #[error("{method} {url} failed: {source}")]
    Request {
        method: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Status { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("image build failed for {image}: {stderr}")]
    Build { image: String, stderr: String },
    #[error("agent launch failed: {0}")]
    Launch(String),
    #[error("agent {name} exited before becoming ready{}", format_logs(.logs))]
    CrashedBeforeReady { name: String, logs: Option<String> },
    #[error("agent {name} not ready within {waited:?}")]
    ReadinessTimeout { name: String, waited: Duration },
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to run `{command}`: {source}")]
    EngineSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {code:?}: {stderr}")]
    EngineFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("invalid agent state: {0}")]
    InvalidState(String),
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

fn format_logs(logs: &Option<String>) -> String {
    match logs.as_deref().map(str::trim) {
        Some(logs) if !logs.is_empty() => format!("\n--- last container logs ---\n{logs}"),
        _ => " (no logs captured)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_error_includes_captured_logs() {
        let err = OrchestratorError::CrashedBeforeReady {
            name: "shipyard-1".to_string(),
            logs: Some("fatal: REPO_URL missing\n".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("shipyard-1 exited before becoming ready"));
        assert!(msg.contains("fatal: REPO_URL missing"));

        let err = OrchestratorError::CrashedBeforeReady {
            name: "shipyard-1".to_string(),
            logs: None,
        };
        assert!(err.to_string().ends_with("(no logs captured)"));
    }
}
