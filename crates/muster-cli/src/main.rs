//! Command-line front end: validate, plan, run and inspect workloads.

mod workload;

use clap::{Parser, Subcommand};
use muster_orchestrator::{
    Coordinator, EngineConfig, EngineSnapshot, NoopExecutor, RunSummary, ShellExecutor,
    TaskFilter, TaskStatus,
};
use muster_store::{FileSnapshotStore, SnapshotStore};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use workload::Workload;

#[derive(Parser)]
#[command(name = "muster", about = "Muster: capability-aware task coordination for agent pools")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "muster.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workload file without running anything
    Validate {
        /// Agents and tasks, as TOML or JSON
        workload: PathBuf,
    },
    /// Run one scheduling cycle and print the assignments
    Plan { workload: PathBuf },
    /// Execute a workload to completion with shell commands
    Run {
        workload: PathBuf,
        /// Continue from the stored snapshot instead of starting fresh
        #[arg(long)]
        resume: bool,
    },
    /// Summarize a stored snapshot
    Inspect {
        /// Snapshot key; defaults to the configured one
        #[arg(long)]
        key: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct CliConfig {
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    #[serde(default)]
    log: LogConfig,
    #[serde(default)]
    engine: EngineConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log: LogConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogConfig {
    #[serde(default = "default_log_level")]
    level: String,
    #[serde(default)]
    json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_log_level() -> String {
    "info".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let (config, config_found) = load_config(&cli.config).await?;
    init_logging(&config.log, cli.json_logs || config.log.json);
    if !config_found {
        info!(path = %cli.config.display(), "No config file, using defaults");
    }

    match cli.command {
        Commands::Validate { workload } => validate(&config, &workload).await,
        Commands::Plan { workload } => plan(&config, &workload).await,
        Commands::Run { workload, resume } => run(&config, &workload, resume).await,
        Commands::Inspect { key } => inspect(&config, key).await,
    }
}

async fn load_config(path: &Path) -> anyhow::Result<(CliConfig, bool)> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok((CliConfig::default(), false));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
    let config: CliConfig = toml::from_str(&content)?;
    config.engine.validate()?;
    Ok((config, true))
}

fn init_logging(log: &LogConfig, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log.level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn open_store(config: &CliConfig) -> anyhow::Result<Arc<dyn SnapshotStore>> {
    let store = FileSnapshotStore::new(config.data_dir.join("snapshots")).await?;
    Ok(Arc::new(store))
}

async fn validate(config: &CliConfig, path: &Path) -> anyhow::Result<()> {
    let workload = Workload::load(path).await?;
    let coord = Coordinator::new(config.engine.clone(), Arc::new(NoopExecutor))?;
    let mut problems = workload.apply(&coord, false).await;

    for (task, dep) in workload.unknown_dependencies() {
        warn!(task_id = %task, dependency = %dep, "Dependency names no task in this workload");
        println!("warning: task '{task}' depends on unknown task '{dep}'");
    }
    if coord.has_cycle().await {
        problems.push("task dependencies contain a cycle".to_string());
    }

    println!(
        "{}: {} agent(s), {} task(s)",
        path.display(),
        workload.agents.len(),
        workload.tasks.len()
    );
    if problems.is_empty() {
        println!("OK");
        return Ok(());
    }
    for problem in &problems {
        println!("error: {problem}");
    }
    anyhow::bail!("{} problem(s) found in {}", problems.len(), path.display())
}

async fn plan(config: &CliConfig, path: &Path) -> anyhow::Result<()> {
    let workload = Workload::load(path).await?;
    let coord = Coordinator::new(config.engine.clone(), Arc::new(NoopExecutor))?;
    let problems = workload.apply(&coord, false).await;
    if !problems.is_empty() {
        for problem in &problems {
            println!("error: {problem}");
        }
        anyhow::bail!("workload {} is invalid", path.display());
    }

    let report = coord.run_cycle().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run(config: &CliConfig, path: &Path, resume: bool) -> anyhow::Result<()> {
    let workload = Workload::load(path).await?;
    let timeout = config
        .engine
        .execution_timeout()
        .unwrap_or(Duration::from_secs(30));
    let coord = Coordinator::new(config.engine.clone(), Arc::new(ShellExecutor::new(timeout)))?
        .with_store(open_store(config).await?);

    if resume {
        if coord.restore_from_store().await {
            info!(key = %config.engine.snapshot_key, "Resumed from snapshot");
        } else {
            warn!(key = %config.engine.snapshot_key, "No usable snapshot, starting fresh");
        }
    }

    let problems = workload.apply(&coord, resume).await;
    for problem in &problems {
        warn!(problem = %problem, "Skipped workload entry");
        println!("skipped: {problem}");
    }

    info!(
        agents = workload.agents.len(),
        tasks = workload.tasks.len(),
        "Running workload"
    );
    let summary = coord.run_until_idle().await;
    coord.persist().await;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    check_finished(&coord, &summary).await
}

/// Fail unless every task reached a terminal state without an unreplaced failure.
async fn check_finished(coord: &Coordinator, summary: &RunSummary) -> anyhow::Result<()> {
    // Failures that a retry already replaced do not count against the run.
    let failed: Vec<_> = coord
        .list_tasks(&TaskFilter::status(TaskStatus::Failed))
        .await
        .into_iter()
        .filter(|t| t.superseded_by.is_none())
        .collect();
    for task in &failed {
        println!("failed: {} {}", task.id, task.error.as_deref().unwrap_or(""));
    }
    let pending = coord.list_tasks(&TaskFilter::status(TaskStatus::Pending)).await;
    for task in &pending {
        println!("pending: {}", task.id);
    }

    if !failed.is_empty() || !summary.blocked.is_empty() || summary.counts.pending > 0 {
        anyhow::bail!(
            "{} task(s) failed, {} blocked, {} still pending",
            failed.len(),
            summary.blocked.len(),
            summary.counts.pending
        );
    }
    Ok(())
}

async fn inspect(config: &CliConfig, key: Option<String>) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let key = key.unwrap_or_else(|| config.engine.snapshot_key.clone());
    let Some(bytes) = store.get(&key).await? else {
        anyhow::bail!("No snapshot '{}' in {}", key, config.data_dir.display());
    };
    let snapshot = EngineSnapshot::from_bytes(&bytes)?;

    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    for task in &snapshot.tasks {
        *by_status.entry(task.status.to_string()).or_default() += 1;
    }

    println!(
        "Coordinator:  {} ({})",
        snapshot.coordinator_name, snapshot.coordinator_id
    );
    println!("Saved at:     {}", snapshot.saved_at.to_rfc3339());
    println!("Version:      {}", snapshot.version);
    println!("Running:      {}", snapshot.is_running);
    println!("Tasks:        {}", snapshot.tasks.len());
    for (status, count) in &by_status {
        println!("  {status:<12}{count}");
    }
    println!("Agents:       {}", snapshot.agents.len());
    for agent in &snapshot.agents {
        let caps: Vec<String> = agent
            .capabilities
            .iter()
            .map(|c| format!("{}:{}", c.kind, c.level))
            .collect();
        println!(
            "  {:<16}{:<12}cpu {}/{}  [{}]",
            agent.id,
            agent.state(),
            agent.resources.available.cpu,
            agent.resources.total.cpu,
            caps.join(", ")
        );
    }
    if !snapshot.shared_state.is_empty() {
        let keys: Vec<&str> = snapshot.shared_state.keys().map(String::as_str).collect();
        println!("Shared keys:  {}", keys.join(", "));
    }
    Ok(())
}
