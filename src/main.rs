mod agent;
mod config;
mod error;
mod executor;
mod heartbeat;
mod jobs;
mod notify;
mod runs;
mod scheduler;

use agent::{BackupAgent, HttpAgentClient, JobBackupsMapping, JobBackupsRequest};
use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::AppConfig;
use executor::JobExecutor;
use heartbeat::HeartbeatStore;
use jobs::store::JobStore;
use notify::LogNotifier;
use runs::RunStore;
use scheduler::Scheduler;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "backplane", version, about = "backup orchestration control plane")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduling daemon.
    Run,
    /// Execute one job immediately, outside its schedule.
    Trigger {
        #[arg(long)]
        id: String,
    },
    Status,
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
    Runs {
        #[command(subcommand)]
        command: RunCommands,
    },
    Agents {
        #[command(subcommand)]
        command: AgentCommands,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    List,
    /// Ask the job's agent which physical backups exist for its mappings.
    Backups {
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum RunCommands {
    List {
        #[arg(long)]
        job: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum AgentCommands {
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run().await,
        Commands::Trigger { id } => trigger(&id).await,
        Commands::Status => status().await,
        Commands::Jobs { command } => handle_jobs(command).await,
        Commands::Runs { command } => handle_runs(command),
        Commands::Agents { command } => handle_agents(command),
    }
}

fn build_scheduler(cfg: &AppConfig) -> Scheduler {
    let agent = Arc::new(HttpAgentClient::new(
        cfg.agent_fs_timeout_secs,
        cfg.agent_backup_timeout_secs,
    ));
    let executor = JobExecutor::new(cfg.clone(), agent, Arc::new(LogNotifier));
    let store = JobStore::new(cfg.data_dir.clone());
    Scheduler::new(
        store,
        executor,
        cfg.idle_sleep_secs,
        cfg.min_check_interval_secs,
        cfg.wake_anticipation_secs,
    )
}

async fn run() -> Result<()> {
    let cfg = AppConfig::load()?;
    let scheduler = build_scheduler(&cfg);
    scheduler.start().await;
    info!("backplane running, data dir {}", cfg.data_dir.display());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

async fn trigger(job_id: &str) -> Result<()> {
    let cfg = AppConfig::load()?;
    let scheduler = build_scheduler(&cfg);
    match scheduler.run_job_now(job_id).await {
        Ok(run) => {
            println!("Run {} finished: {}", run.run_id, run.status.as_str());
            println!(
                "  {} mapping(s), {} bytes, {}s",
                run.mappings.len(),
                run.bytes_processed,
                run.duration_secs().unwrap_or(0)
            );
            for mapping in &run.mappings {
                println!("  [{}] {}", status_word(mapping.status), mapping.label);
                for warning in &mapping.warnings {
                    println!("      warning: {warning}");
                }
                for error in &mapping.errors {
                    println!("      error: {error}");
                }
            }
        }
        Err(err) => println!("Run failed to start: {err}"),
    }
    Ok(())
}

fn status_word(status: executor::types::MappingStatus) -> &'static str {
    match status {
        executor::types::MappingStatus::Success => "ok",
        executor::types::MappingStatus::Partial => "partial",
        executor::types::MappingStatus::Failed => "failed",
    }
}

async fn status() -> Result<()> {
    let cfg = AppConfig::load()?;
    let scheduler = build_scheduler(&cfg);
    scheduler.reload().await?;
    let status = scheduler.status().await?;
    println!("Jobs: {}", status.jobs);
    println!("Scheduled jobs: {}", status.scheduled_jobs);
    println!(
        "Next wake: {}",
        status
            .next_wake
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "N/A".to_string())
    );
    Ok(())
}

async fn handle_jobs(cmd: JobCommands) -> Result<()> {
    let cfg = AppConfig::load()?;
    let store = JobStore::new(cfg.data_dir.clone());
    match cmd {
        JobCommands::List => {
            let all = store.load_all()?;
            if all.is_empty() {
                println!("No jobs defined.");
                return Ok(());
            }
            let now = Utc::now();
            println!(
                "{:<14} {:<20} {:<16} {:<9} {:<25}",
                "ID", "Name", "Host", "Enabled", "Next Run"
            );
            println!("{:-<86}", "");
            for job in all {
                let next = jobs::schedule::next_run(&job.schedule, now)
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "N/A".to_string());
                println!(
                    "{:<14} {:<20} {:<16} {:<9} {:<25}",
                    job.job_id,
                    job.name,
                    job.client_hostname,
                    if job.enabled { "yes" } else { "no" },
                    next
                );
            }
        }
        JobCommands::Backups { id } => {
            let Some(job) = store.load(&id)? else {
                println!("Job not found.");
                return Ok(());
            };
            let heartbeats = HeartbeatStore::new(cfg.data_dir.clone());
            let Some(hb) = heartbeats.load(&job.client_hostname)? else {
                println!("No heartbeat known for {}.", job.client_hostname);
                return Ok(());
            };
            if !hb.is_online(Utc::now(), cfg.heartbeat_ttl_secs) {
                println!("Agent on {} is offline.", job.client_hostname);
                return Ok(());
            }
            let client =
                HttpAgentClient::new(cfg.agent_fs_timeout_secs, cfg.agent_backup_timeout_secs);
            let request = JobBackupsRequest {
                job_id: job.job_id.clone(),
                mappings: job
                    .mappings
                    .iter()
                    .map(|m| JobBackupsMapping {
                        label: m.label.clone(),
                        destination: m.destination_path.clone(),
                        credentials: m.credentials.clone(),
                    })
                    .collect(),
            };
            match client.list_job_backups(&hb.endpoint(), &request).await {
                Ok(backups) if backups.is_empty() => println!("No backups reported."),
                Ok(backups) => {
                    for backup in backups {
                        println!(
                            "{:<12} {:<50} {:>14} {}",
                            backup.label.as_deref().unwrap_or("-"),
                            backup.path,
                            backup
                                .size
                                .map(|s| s.to_string())
                                .unwrap_or_else(|| "?".to_string()),
                            backup
                                .modified
                                .map(|m| m.to_rfc3339())
                                .unwrap_or_else(|| "?".to_string())
                        );
                    }
                }
                Err(err) => println!("Agent listing failed: {err}"),
            }
        }
    }
    Ok(())
}

fn handle_runs(cmd: RunCommands) -> Result<()> {
    let cfg = AppConfig::load()?;
    let store = RunStore::new(cfg.data_dir.clone());
    match cmd {
        RunCommands::List { job, limit } => {
            let runs = store.list_recent(limit, job.as_deref())?;
            if runs.is_empty() {
                println!("No runs recorded.");
                return Ok(());
            }
            println!(
                "{:<38} {:<14} {:<9} {:>14} {:>7} {:<25}",
                "Run", "Job", "Status", "Bytes", "Secs", "Started"
            );
            println!("{:-<110}", "");
            for run in runs {
                println!(
                    "{:<38} {:<14} {:<9} {:>14} {:>7} {:<25}",
                    run.run_id,
                    run.job_id,
                    run.status.as_str(),
                    run.bytes_processed,
                    run.duration_secs()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    run.start.to_rfc3339()
                );
            }
        }
    }
    Ok(())
}

fn handle_agents(cmd: AgentCommands) -> Result<()> {
    let cfg = AppConfig::load()?;
    let store = HeartbeatStore::new(cfg.data_dir.clone());
    match cmd {
        AgentCommands::List => {
            let all = store.load_all()?;
            if all.is_empty() {
                println!("No agents have reported in.");
                return Ok(());
            }
            let now = Utc::now();
            println!(
                "{:<18} {:<9} {:<25} {:<12}",
                "Host", "State", "Last Seen", "Last Backup"
            );
            println!("{:-<66}", "");
            for hb in all {
                let state = if hb.is_online(now, cfg.heartbeat_ttl_secs) {
                    "online"
                } else {
                    "offline"
                };
                let last_backup = hb
                    .backup_status
                    .map(|phase| phase.as_str())
                    .unwrap_or("-");
                println!(
                    "{:<18} {:<9} {:<25} {:<12}",
                    hb.hostname,
                    state,
                    hb.timestamp.to_rfc3339(),
                    last_backup
                );
            }
        }
    }
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
