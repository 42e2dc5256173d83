use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

pub const CONTAINER_NAME_PREFIX: &str = "shipyard";
pub const GIT_IDENTITY_NAME: &str = "Shipyard Agent";
pub const GIT_IDENTITY_EMAIL: &str = "agent@shipyard.dev";
pub const BROWSER_EXECUTABLE_PATH: &str = "/usr/bin/chromium";

/// Repository coordinates handed to the agent verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoOptions {
    pub repo_url: String,
    pub clone_branch: String,
    pub push_branch: String,
}

/// Per-agent values that are only known once a name and port are chosen.
#[derive(Clone, Debug)]
pub struct AgentIdentity<'a> {
    pub container_name: &'a str,
    pub port: u16,
    pub webhook_url: Option<&'a str>,
}

/// Environment shared by local and remote agents. Later inserts win, so the
/// caller's `extra` can override the defaults but never the identity keys.
pub fn build_agent_env(
    repo: &RepoOptions,
    extra: &BTreeMap<String, String>,
    identity: &AgentIdentity<'_>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("REPO_URL".to_string(), repo.repo_url.clone());
    env.insert("CLONE_BRANCH".to_string(), repo.clone_branch.clone());
    env.insert("PUSH_BRANCH".to_string(), repo.push_branch.clone());
    for key in ["GIT_AUTHOR_NAME", "GIT_COMMITTER_NAME"] {
        env.insert(key.to_string(), GIT_IDENTITY_NAME.to_string());
    }
    for key in ["GIT_AUTHOR_EMAIL", "GIT_COMMITTER_EMAIL"] {
        env.insert(key.to_string(), GIT_IDENTITY_EMAIL.to_string());
    }
    env.insert(
        "PUPPETEER_EXECUTABLE_PATH".to_string(),
        BROWSER_EXECUTABLE_PATH.to_string(),
    );

    env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));

    env.insert("PORT".to_string(), identity.port.to_string());
    env.insert(
        "CONTAINER_NAME".to_string(),
        identity.container_name.to_string(),
    );
    if let Some(url) = identity.webhook_url.map(str::trim).filter(|u| !u.is_empty()) {
        env.insert("WEBHOOK_URL".to_string(), url.to_string());
    }
    env
}

/// `shipyard-` followed by 8 random hex digits.
pub fn generate_container_name() -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("{CONTAINER_NAME_PREFIX}-{suffix:08x}")
}
