use anyhow::{bail, Context};
use autotrader::agent::{AgentRegistry, AgentSpec, RegistrySettings};
use autotrader::config::AppConfig;
use autotrader::coordination::{wait_for_os_signal, ShutdownSignal};
use autotrader::decision::JsonFileAuditSink;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

const STATUS_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "autotrader")]
#[command(version)]
#[command(about = "Automated futures trading agents driven by an external decision provider", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every enabled agent until Ctrl-C / SIGTERM
    Run {
        /// Directory holding default.toml and environment overlays
        #[arg(short, long, env = "AUTOTRADER_CONFIG_DIR", default_value = "config")]
        config_dir: PathBuf,
    },
    /// Load and validate configuration, then exit
    CheckConfig {
        #[arg(short, long, env = "AUTOTRADER_CONFIG_DIR", default_value = "config")]
        config_dir: PathBuf,
    },
    /// Show the most recent audit records of one agent
    Audit {
        #[arg(short, long, env = "AUTOTRADER_CONFIG_DIR", default_value = "config")]
        config_dir: PathBuf,
        /// Agent id
        #[arg(short, long)]
        agent: String,
        #[arg(short = 'n', long, default_value = "5")]
        last: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config_dir } => run(&config_dir).await,
        Commands::CheckConfig { config_dir } => {
            init_logging_simple();
            check_config(&config_dir)
        }
        Commands::Audit {
            config_dir,
            agent,
            last,
        } => {
            init_logging_simple();
            show_audit(&config_dir, &agent, last).await
        }
    }
}

fn load_config(config_dir: &Path) -> anyhow::Result<AppConfig> {
    AppConfig::load_from(config_dir)
        .with_context(|| format!("failed to load configuration from {}", config_dir.display()))
}

async fn run(config_dir: &Path) -> anyhow::Result<()> {
    let config = load_config(config_dir)?;
    init_logging(&config.logging);

    if let Err(problems) = config.validate() {
        for problem in &problems {
            error!(%problem, "invalid configuration");
        }
        bail!("configuration has {} problem(s)", problems.len());
    }

    let registry = AgentRegistry::new(RegistrySettings::from(&config));
    for agent in config.enabled_agents() {
        let spec = AgentSpec::from_config(agent.clone())
            .with_context(|| format!("cannot build agent {}", agent.id))?;
        registry.add(spec).await?;
    }

    if registry.ids().await.is_empty() {
        warn!("no enabled agents configured, nothing to run");
        return Ok(());
    }

    let started = registry.start_all().await;
    info!(started, "agents running");
    registry.prune_audit().await;

    let mut status_tick = tokio::time::interval(STATUS_INTERVAL);
    status_tick.tick().await;
    let shutdown = wait_for_os_signal();
    tokio::pin!(shutdown);
    let signal = loop {
        tokio::select! {
            signal = &mut shutdown => break signal?,
            _ = status_tick.tick() => {
                registry.prune_audit().await;
                for status in registry.list().await {
                    info!(
                        agent = %status.id,
                        running = status.running,
                        connector = ?status.connector,
                        cycles = status.cycles_run,
                        open_positions = status.open_positions,
                        last = ?status.last_cycle.as_ref().map(|c| c.status),
                        "agent status"
                    );
                }
            }
        }
    };

    match signal {
        ShutdownSignal::Graceful => info!("shutdown requested, letting in-flight cycles finish"),
        ShutdownSignal::Urgent => warn!("urgent shutdown requested"),
    }
    registry.stop_all().await;

    for status in registry.list().await {
        info!(
            agent = %status.id,
            cycles = status.cycles_run,
            open_positions = status.open_positions,
            "agent final state"
        );
    }
    Ok(())
}

fn check_config(config_dir: &Path) -> anyhow::Result<()> {
    let config = load_config(config_dir)?;

    let mut problems = config.validate().err().unwrap_or_default();
    for agent in config.enabled_agents() {
        if let Err(e) = AgentSpec::from_config(agent.clone()) {
            problems.push(format!("agent {}: {}", agent.id, e));
        }
    }

    if problems.is_empty() {
        println!(
            "Configuration OK: {} agent(s), {} enabled",
            config.agents.len(),
            config.enabled_agents().count()
        );
        for agent in &config.agents {
            println!(
                "  {} ({}) exchange={} enabled={}",
                agent.id,
                agent.display_name(),
                agent.exchange.kind,
                agent.enabled
            );
        }
        return Ok(());
    }

    for problem in &problems {
        println!("  ✗ {}", problem);
    }
    bail!("configuration has {} problem(s)", problems.len())
}

async fn show_audit(config_dir: &Path, agent: &str, last: usize) -> anyhow::Result<()> {
    let config = load_config(config_dir)?;
    let Some(audit_dir) = config.storage.audit_dir.as_ref() else {
        bail!("storage.audit_dir is not configured");
    };

    let sink = JsonFileAuditSink::new(audit_dir, agent);
    let records = sink.latest(last).await?;
    if records.is_empty() {
        println!("No audit records for {} under {}", agent, sink.dir().display());
        return Ok(());
    }

    for record in records {
        println!(
            "cycle {:>5}  {}  {:<9}  executed={} rejected={} trades={}{}",
            record.cycle,
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            record.status.to_string(),
            record.executed(),
            record.rejected(),
            record.trades.len(),
            record
                .error
                .as_deref()
                .map(|e| format!("  error: {}", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}
