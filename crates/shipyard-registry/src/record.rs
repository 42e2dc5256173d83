use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Local,
    Remote,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// A running agent, either a container on this host or a Fly machine.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentState {
    Local(LocalAgent),
    Remote(RemoteAgent),
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalAgent {
    pub container_name: String,
    pub base_url: String,
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAgent {
    pub container_name: String,
    pub base_url: String,
    pub port: u16,
    pub fly_app: String,
    pub fly_machine_id: String,
}

impl AgentState {
    pub fn kind(&self) -> AgentKind {
        match self {
            Self::Local(_) => AgentKind::Local,
            Self::Remote(_) => AgentKind::Remote,
        }
    }

    pub fn container_name(&self) -> &str {
        match self {
            Self::Local(agent) => &agent.container_name,
            Self::Remote(agent) => &agent.container_name,
        }
    }

    pub fn base_url(&self) -> &str {
        match self {
            Self::Local(agent) => &agent.base_url,
            Self::Remote(agent) => &agent.base_url,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Local(agent) => agent.port,
            Self::Remote(agent) => agent.port,
        }
    }
}

/// One line of the registry file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    #[serde(flatten)]
    pub state: AgentState,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl RegistryEntry {
    pub fn new(state: AgentState, started_at: DateTime<Utc>) -> Self {
        Self {
            state,
            started_at,
            stopped_at: None,
        }
    }

    pub fn container_name(&self) -> &str {
        self.state.container_name()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_entry_uses_camel_case_wire_names() {
        let entry = RegistryEntry::new(
            AgentState::Remote(RemoteAgent {
                container_name: "shipyard-0badf00d".to_string(),
                base_url: "https://agents.fly.dev".to_string(),
                port: 8080,
                fly_app: "agents".to_string(),
                fly_machine_id: "148e21ea".to_string(),
            }),
            "2026-10-19T08:00:00Z".parse().unwrap(),
        );
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "remote");
        assert_eq!(value["containerName"], "shipyard-0badf00d");
        assert_eq!(value["flyMachineId"], "148e21ea");
        assert_eq!(value["startedAt"], "2026-10-19T08:00:00Z");
        assert!(value.get("stoppedAt").is_none());
    }

    #[test]
    fn local_entry_parses_with_stopped_at() {
        let line = json!({
            "type": "local",
            "containerName": "shipyard-1",
            "baseUrl": "http://localhost:3100",
            "port": 3100,
            "startedAt": "2026-10-19T08:00:00Z",
            "stoppedAt": "2026-10-19T09:00:00Z",
        });
        let entry: RegistryEntry = serde_json::from_value(line).unwrap();
        assert_eq!(entry.state.kind(), AgentKind::Local);
        assert_eq!(entry.state.port(), 3100);
        assert!(entry.is_stopped());
    }
}
