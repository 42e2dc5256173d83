use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use shipyard::{ContainerConfig, Orchestrator, Registry, RepoOptions};

#[derive(Debug, Parser)]
#[command(name = "shipyard")]
#[command(about = "Start, track and stop ephemeral coding agents")]
struct Cli {
    /// Install root. The registry lives in <root>/.shipyard/containers.jsonl
    #[arg(long, env = "SHIPYARD_ROOT", default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start an agent and wait until it answers /status
    Start {
        /// Run on Fly Machines instead of the local container engine
        #[arg(long)]
        remote: bool,

        #[arg(long)]
        repo_url: String,

        #[arg(long)]
        clone_branch: String,

        #[arg(long)]
        push_branch: String,

        /// Extra agent environment, KEY=VALUE (repeatable)
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Build context for the local agent image (defaults to --root)
        #[arg(long)]
        project_dir: Option<PathBuf>,
    },

    /// Stop an agent by container name
    Stop { name: String },

    /// List recent registry rows
    Ps {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Probe each running row's /status endpoint
        #[arg(long)]
        probe: bool,
    },

    /// Create the Fly app and allocate its public addresses
    ProvisionApp,

    /// List machines in the Fly app
    Machines,

    /// Mark the newest running row (for NAME, if given) as stopped
    MarkStopped { name: Option<String> },

    /// Remove the stopped mark from the newest stopped row for NAME
    ClearStopped { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn,shipyard=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let registry = Registry::at_root(&cli.root);

    match &cli.cmd {
        Command::Start {
            remote,
            repo_url,
            clone_branch,
            push_branch,
            env,
            project_dir,
        } => {
            let project_dir = project_dir.clone().unwrap_or_else(|| cli.root.clone());
            let mut config = ContainerConfig::from_env(project_dir, registry)
                .context("load shipyard configuration")?;
            config.env.extend(env.iter().cloned());
            let repo = RepoOptions {
                repo_url: repo_url.clone(),
                clone_branch: clone_branch.clone(),
                push_branch: push_branch.clone(),
            };
            cmd_start(Orchestrator::new(config), &repo, *remote).await
        }
        Command::Stop { name } => {
            let orch = orchestrator(&cli, registry)?;
            orch.stop_by_name(name)
                .await
                .with_context(|| format!("stop {name}"))?;
            print(&json!({ "stopped": name }))
        }
        Command::Ps { limit, probe } => {
            if *probe {
                let rows = orchestrator(&cli, registry)?.probe_recent(*limit).await?;
                print(&rows)
            } else {
                print(&registry.recent(*limit)?)
            }
        }
        Command::ProvisionApp => {
            let orch = orchestrator(&cli, registry)?;
            orch.provision_remote_app()
                .await
                .context("provision fly app")?;
            let app = &orch.config().fly()?.app_name;
            print(&json!({ "app": app, "provisioned": true }))
        }
        Command::Machines => {
            let machines = orchestrator(&cli, registry)?.list_machines().await?;
            print(&machines)
        }
        Command::MarkStopped { name } => {
            let updated = registry.mark_stopped(name.as_deref())?;
            print(&json!({ "updated": updated }))
        }
        Command::ClearStopped { name } => {
            let updated = registry.clear_stopped(name)?;
            print(&json!({ "updated": updated }))
        }
    }
}

fn orchestrator(cli: &Cli, registry: Registry) -> anyhow::Result<Orchestrator> {
    let config =
        ContainerConfig::from_env(&cli.root, registry).context("load shipyard configuration")?;
    Ok(Orchestrator::new(config))
}

async fn cmd_start(orch: Orchestrator, repo: &RepoOptions, remote: bool) -> anyhow::Result<()> {
    let state = if remote {
        orch.start_remote_container(repo).await
    } else {
        orch.start_container(repo).await
    }
    .context("start agent")?;
    print(&state)
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in {raw}"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn print<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("encode output")?
    );
    Ok(())
}
