//! Enclave daemon.
//!
//! `enclaved serve` hosts the sandbox runtime and its maintenance loop until
//! interrupted. The remaining subcommands run one runtime operation against
//! the configured store and print the result as JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, Level};

use enclave_core::telemetry::init_tracing;
use enclave_core::{EnclaveConfig, SandboxRuntime, TaskNode, VERSION};
use enclave_state::{StateStore, StoreAuditSink, SurrealStateStore};

#[derive(Parser)]
#[command(name = "enclaved")]
#[command(version = VERSION)]
#[command(about = "Persistent execution sandboxes for agents", long_about = None)]
struct Cli {
    /// JSON config file (defaults apply when omitted)
    #[arg(short, long, global = true, env = "ENCLAVE_CONFIG")]
    config: Option<PathBuf>,

    /// SurrealDB endpoint, e.g. ws://localhost:8000 (in-memory when omitted)
    #[arg(long, global = true, env = "ENCLAVE_SURREAL_URL")]
    surreal_url: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Hydrate state and run the maintenance sweep until interrupted
    Serve,

    /// Deploy a sandbox for every catalog agent
    DeployAll,

    /// Run a blueprint (JSON array of tasks) and print the outcome
    Blueprint {
        /// Path to the blueprint file
        path: PathBuf,
    },

    /// Print an agent's budget ledger
    Ledger {
        /// Agent id
        agent: String,
    },

    /// List the agent catalog
    Agents,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;
    let store = open_store(cli.surreal_url.as_deref()).await?;
    let audit = Arc::new(StoreAuditSink::new(Arc::clone(&store)));
    let runtime = Arc::new(
        SandboxRuntime::from_config(config, store, audit).context("Failed to build runtime")?,
    );

    match cli.command {
        Commands::Serve => serve(runtime).await,
        command => {
            runtime.start().await;
            let output = run_once(&runtime, command).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EnclaveConfig> {
    match path {
        Some(path) => EnclaveConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(EnclaveConfig::default()),
    }
}

async fn open_store(url: Option<&str>) -> Result<Arc<dyn StateStore>> {
    let store = match url {
        Some(url) => SurrealStateStore::connect(url)
            .await
            .with_context(|| format!("Failed to connect to SurrealDB at {url}"))?,
        None => SurrealStateStore::in_memory()
            .await
            .context("Failed to start in-memory SurrealDB")?,
    };
    Ok(Arc::new(store))
}

fn load_blueprint(path: &Path) -> Result<Vec<TaskNode>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read blueprint {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse blueprint {}", path.display()))
}

async fn serve(runtime: Arc<SandboxRuntime>) -> Result<()> {
    let report = runtime.start().await;
    info!(
        version = VERSION,
        agents = runtime.registry().len(),
        expired = report.expired_sandboxes.len(),
        "enclaved started"
    );

    let maintenance = runtime.spawn_maintenance(runtime.config().sweep_interval());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    maintenance.abort();

    let report = runtime.sweep().await;
    info!(pending_writes = report.pending_writes, "enclaved stopped");
    Ok(())
}

async fn run_once(runtime: &SandboxRuntime, command: Commands) -> Result<Value> {
    let value = match command {
        Commands::Serve => anyhow::bail!("serve is not a one-shot command"),
        Commands::DeployAll => serde_json::to_value(runtime.deploy_all().await)?,
        Commands::Blueprint { path } => {
            let tasks = load_blueprint(&path)?;
            let outcome = runtime
                .execute_blueprint(tasks)
                .await
                .context("Blueprint rejected")?;
            serde_json::to_value(outcome)?
        }
        Commands::Ledger { agent } => {
            let ledger = runtime
                .get_budget_ledger(&agent)
                .await
                .with_context(|| format!("No ledger for {agent}"))?;
            serde_json::to_value(ledger)?
        }
        Commands::Agents => serde_json::to_value(runtime.registry().iter().collect::<Vec<_>>())?,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use enclave_state::fakes::{MemoryAuditSink, MemoryStateStore};
    use std::io::Write;

    fn runtime() -> SandboxRuntime {
        SandboxRuntime::from_config(
            EnclaveConfig::default(),
            Arc::new(MemoryStateStore::new()),
            Arc::new(MemoryAuditSink::new()),
        )
        .unwrap()
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "enclaved",
            "ledger",
            "engineer",
            "--surreal-url",
            "ws://localhost:8000",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.surreal_url.as_deref(), Some("ws://localhost:8000"));
        assert_eq!(
            cli.command,
            Commands::Ledger {
                agent: "engineer".into()
            }
        );
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = load_config(Some(Path::new("/no/such/enclave.json"))).unwrap_err();
        assert!(err.to_string().contains("Failed to load config"));
    }

    #[test]
    fn blueprint_file_parses_into_tasks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"id": "a", "tool": "engineer", "params": {{"code": "print(1)"}}}},
                {{"id": "b", "tool": "research.summarize", "params": {{"code": "print(2)"}}, "dependencies": ["a"]}}
            ]"#
        )
        .unwrap();
        let tasks = load_blueprint(file.path()).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].dependencies, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn deploy_all_falls_back_to_stub_without_backends() {
        let rt = runtime();
        let out = run_once(&rt, Commands::DeployAll).await.unwrap();
        let map = out.as_object().unwrap();
        assert_eq!(map.len(), rt.registry().len());
        assert!(map.values().all(|o| o["outcome"] == "deployed"));
    }

    #[tokio::test]
    async fn ledger_for_unknown_agent_fails() {
        let rt = runtime();
        let err = run_once(&rt, Commands::Ledger { agent: "ghost".into() })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn agents_lists_the_catalog() {
        let rt = runtime();
        let out = run_once(&rt, Commands::Agents).await.unwrap();
        assert_eq!(out.as_array().unwrap().len(), rt.registry().len());
    }
}
