//! `loom`: the bootstrap/driver binary for the orchestration fleet.
//!
//! Mirrors the reference `main.py`'s responsibilities (flush prior state,
//! seed governance and reference data, spawn agents and the orchestrator,
//! submit the first plan) but exposes each step as its own subcommand too,
//! using a `clap` `Parser`/`Subcommand` derive shape.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use loom_broker::{Broker, BrokerConfig, InMemoryBroker, RedisBroker};
use loom_core::{
    build_demo_plan, new_job_id, run_agent_loop, start_job, EchoAgent, Governance, Orchestrator,
    TaskHandler, UpperAgent,
};

/// Keys flushed at bootstrap, before any agents or the orchestrator start.
const FLUSH_PATTERNS: &[&str] = &["job:*", "tasks:*", "results:*", "errors:*"];
const FLUSH_KEYS: &[&str] = &["registered_agents", "gov:permissions", "policies"];

/// The built-in demo agent roles this binary knows how to run standalone.
const BUILT_IN_AGENTS: &[&str] = &["echo", "upper"];

#[derive(Parser)]
#[command(name = "loom", about = "Broker-native DAG orchestration for fleets of task agents")]
struct Cli {
    /// Redis host (overrides REDIS_HOST env var)
    #[arg(long, global = true)]
    redis_host: Option<String>,
    /// Redis port (overrides REDIS_PORT env var)
    #[arg(long, global = true)]
    redis_port: Option<u16>,
    /// Redis password (overrides REDIS_PASSWORD env var)
    #[arg(long, global = true)]
    redis_password: Option<String>,
    /// Use an in-process broker instead of connecting to Redis, for local
    /// exercise without a running server. Only meaningful for `demo`, whose
    /// agents and orchestrator share the same process.
    #[arg(long, global = true)]
    in_memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full bootstrap sequence and a self-contained demo job
    /// in-process: flush state, seed governance, start the `echo`/`upper`
    /// agents and the orchestrator, submit a demo plan, and print the
    /// terminal job report.
    Demo {
        /// Text the demo plan's `echo` task should echo and `upper` uppercase.
        #[arg(long, default_value = "hello from loom")]
        text: String,
    },
    /// Run a single built-in agent's consumer loop standalone.
    Agent {
        /// Built-in agent name: "echo" or "upper".
        name: String,
    },
    /// Run the orchestrator loop standalone.
    Orchestrator {
        /// Agent names to fall back to if no result/error streams exist yet.
        #[arg(long, value_delimiter = ',', default_value = "echo,upper")]
        default_agents: Vec<String>,
    },
    /// Parse a plan JSON document from disk and persist it via the
    /// planner's intake path, printing the assigned job id. Does not
    /// dispatch -- run `orchestrator` separately to pick up the job.
    Submit {
        /// Path to a plan JSON document (see the `Plan` type).
        plan_file: PathBuf,
    },
    /// Print every job hash field except `plan` for the given job id.
    Status {
        job_id: String,
    },
    /// Flush prior run state from the broker (the bootstrap key-flush step
    /// in isolation), for resetting between exercises.
    Flush,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("unknown built-in agent {0:?}, expected one of {BUILT_IN_AGENTS:?}")]
    UnknownAgent(String),
}

async fn build_broker(cli: &Cli) -> anyhow::Result<Arc<dyn Broker>> {
    if cli.in_memory {
        return Ok(Arc::new(InMemoryBroker::new()));
    }
    let config = BrokerConfig::resolve(
        cli.redis_host.as_deref(),
        cli.redis_port,
        cli.redis_password.as_deref(),
    );
    let broker = RedisBroker::connect(&config)
        .await
        .with_context(|| format!("failed to connect to broker at {}:{}", config.host, config.port))?;
    Ok(Arc::new(broker))
}

fn built_in_agent(name: &str) -> anyhow::Result<Arc<dyn TaskHandler>> {
    match name {
        "echo" => Ok(Arc::new(EchoAgent)),
        "upper" => Ok(Arc::new(UpperAgent)),
        other => Err(CliError::UnknownAgent(other.to_string()).into()),
    }
}

/// Flush every key under the job/task/result/error prefixes plus the fixed
/// registration and governance keys, so a fresh run starts from empty state.
async fn flush(broker: &Arc<dyn Broker>) -> anyhow::Result<()> {
    for pattern in FLUSH_PATTERNS {
        for key in broker.scan_keys(pattern).await? {
            broker.delete(&key).await?;
        }
    }
    for key in FLUSH_KEYS {
        broker.delete(key).await?;
    }
    Ok(())
}

/// Print every `job:{job_id}` hash field except `plan`.
async fn print_status(broker: &Arc<dyn Broker>, job_id: &str) -> anyhow::Result<()> {
    let state = broker.hgetall(&format!("job:{job_id}")).await?;
    let mut fields: Vec<(&String, &String)> = state.iter().filter(|(k, _)| k.as_str() != "plan").collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));

    println!("job {job_id}:");
    for (field, value) in fields {
        println!("  {field}: {value}");
    }
    Ok(())
}

async fn run_demo(broker: Arc<dyn Broker>, text: String) -> anyhow::Result<()> {
    flush(&broker).await.context("flushing prior run state")?;

    let governance = Governance::new(broker.clone());
    governance
        .register_tool_access("echo", &["echo".to_string()])
        .await
        .context("registering echo's tool access")?;
    governance
        .register_tool_access("upper", &["upper".to_string()])
        .await
        .context("registering upper's tool access")?;

    // Seed a placeholder entry in the opaque domain reference-data hash.
    // Never read by this demo's agents, just present so the namespace is
    // populated the way a real deployment's would be.
    broker
        .hset("policies", "demo", "{'note': 'no domain policies in the built-in demo fleet'}")
        .await
        .context("seeding reference data")?;

    let cancel = CancellationToken::new();
    let agent_names: Vec<String> = BUILT_IN_AGENTS.iter().map(|s| s.to_string()).collect();
    let mut agent_handles = Vec::new();
    for name in BUILT_IN_AGENTS {
        let handler = built_in_agent(name)?;
        let broker = broker.clone();
        let cancel = cancel.clone();
        agent_handles.push(tokio::spawn(async move {
            let _ = run_agent_loop(broker, handler, cancel).await;
        }));
    }

    let orchestrator = Arc::new(
        Orchestrator::new(broker.clone(), &agent_names)
            .await
            .context("starting orchestrator")?,
    );

    let plan = build_demo_plan(new_job_id(), text);
    let job_id = plan.job_id.clone();
    orchestrator
        .start_job(&plan)
        .await
        .context("submitting demo plan")?;
    println!("submitted job {job_id}, waiting for completion...");

    let loop_orchestrator = orchestrator.clone();
    let orchestrator_cancel = cancel.clone();
    let orchestrator_handle = tokio::spawn(async move {
        let _ = loop_orchestrator.run(orchestrator_cancel).await;
    });

    let terminal = tokio::select! {
        status = poll_terminal_status(&broker, &job_id, Duration::from_secs(30)) => status,
        _ = tokio::signal::ctrl_c() => {
            println!("interrupted, shutting down (press Ctrl-C again to force)");
            None
        }
    };

    cancel.cancel();
    tokio::select! {
        _ = drain(orchestrator_handle, agent_handles) => {}
        _ = tokio::signal::ctrl_c() => {
            eprintln!("second interrupt, exiting immediately");
            std::process::exit(130);
        }
    }

    match terminal {
        Some(status) => {
            println!("job {job_id} reached terminal status: {status}");
            print_status(&broker, &job_id).await?;
        }
        None => println!("job {job_id} did not reach a terminal status before shutdown"),
    }

    Ok(())
}

/// Await every spawned loop's join handle after cancellation, so a clean
/// shutdown does not tear down the process while a handler is mid-task.
async fn drain(orchestrator_handle: tokio::task::JoinHandle<()>, agent_handles: Vec<tokio::task::JoinHandle<()>>) {
    let _ = orchestrator_handle.await;
    for handle in agent_handles {
        let _ = handle.await;
    }
}

async fn poll_terminal_status(broker: &Arc<dyn Broker>, job_id: &str, timeout: Duration) -> Option<String> {
    let key = format!("job:{job_id}");
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Some(status)) = broker.hget(&key, "status").await {
            if status == "completed" || status == "failed" {
                return Some(status);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Run `handle` until it finishes or `ctrl_c` arrives, in which case `cancel`
/// is fired and `handle` is awaited so the loop exits cleanly. A second
/// `ctrl_c` before that drain finishes forces an immediate process exit.
async fn run_until_interrupted(cancel: CancellationToken, mut handle: tokio::task::JoinHandle<anyhow::Result<()>>) -> anyhow::Result<()> {
    let mut cancelled = false;
    loop {
        tokio::select! {
            result = &mut handle => return result.context("task panicked")?,
            _ = tokio::signal::ctrl_c() => {
                if cancelled {
                    eprintln!("second interrupt, exiting immediately");
                    std::process::exit(130);
                }
                println!("interrupted, shutting down (press Ctrl-C again to force)");
                cancel.cancel();
                cancelled = true;
            }
        }
    }
}

async fn run_agent_cmd(broker: Arc<dyn Broker>, name: &str) -> anyhow::Result<()> {
    let handler = built_in_agent(name)?;
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        run_agent_loop(broker, handler, loop_cancel)
            .await
            .context("agent loop exited")
    });
    run_until_interrupted(cancel, handle).await
}

async fn run_orchestrator_cmd(broker: Arc<dyn Broker>, default_agents: Vec<String>) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::new(broker, &default_agents)
        .await
        .context("starting orchestrator")?;
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        orchestrator
            .run(loop_cancel)
            .await
            .context("orchestrator loop exited")
    });
    run_until_interrupted(cancel, handle).await
}

async fn run_submit(broker: Arc<dyn Broker>, plan_file: &PathBuf) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(plan_file)
        .with_context(|| format!("reading plan file {}", plan_file.display()))?;
    let plan: loom_core::Plan =
        serde_json::from_str(&contents).with_context(|| format!("parsing plan file {}", plan_file.display()))?;
    let job_id = plan.job_id.clone();
    start_job(&broker, &plan).await.context("submitting plan")?;
    println!("{job_id}");
    Ok(())
}

async fn run_status_cmd(broker: Arc<dyn Broker>, job_id: &str) -> anyhow::Result<()> {
    print_status(&broker, job_id).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let broker = build_broker(&cli).await?;

    let result = match cli.command {
        Commands::Demo { text } => run_demo(broker, text).await,
        Commands::Agent { name } => run_agent_cmd(broker, &name).await,
        Commands::Orchestrator { default_agents } => run_orchestrator_cmd(broker, default_agents).await,
        Commands::Submit { plan_file } => run_submit(broker, &plan_file).await,
        Commands::Status { job_id } => run_status_cmd(broker, &job_id).await,
        Commands::Flush => flush(&broker).await,
    };

    if let Err(err) = &result {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
    Ok(())
}
