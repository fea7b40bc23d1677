//! `costguard` CLI: inspect and operate the shared cost ledger, circuit
//! breakers and fallback queue.
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); command output goes to
//! stdout. Budget rejections exit with 3, open circuits with 4.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use costguard::breaker::BreakerRegistry;
use costguard::budget::{
    BudgetError, CostEntry, CostExceededError, CostMetadata, CostTracker, WindowBounds,
};
use costguard::config::Config;
use costguard::fallback::{DrainWorker, FallbackQueue, JobStatus, NewJob};
use costguard::guard::CostGuard;
use costguard::replay::CommandReplayer;
use costguard::store::Store;
use costguard::{CircuitOpenError, EXIT_BUDGET, EXIT_FAILURE, EXIT_UNAVAILABLE};

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser)]
#[command(name = "costguard", version, about = "Spending caps, circuit breakers and a fallback queue for paid API calls")]
struct Cli {
    /// YAML config file (defaults apply when omitted)
    #[arg(long, global = true, env = "COSTGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Database path, overriding the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show spend, remaining budget, breakers and queue backlog
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Check whether a call fits the budget (nothing is reserved)
    Check {
        service: String,
        operation: String,
        /// Estimated cost in USD; the cost table is used when omitted
        #[arg(long)]
        cost: Option<f64>,
    },

    /// Record a cost in the ledger
    Record {
        service: String,
        operation: String,
        amount_usd: f64,
        #[arg(long)]
        doc_slug: Option<String>,
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        user: Option<String>,
        /// Idempotency key; a repeated key is recorded once
        #[arg(long)]
        key: Option<String>,
    },

    /// Defer a job to the fallback queue
    Enqueue {
        #[arg(value_name = "TYPE")]
        job_type: String,
        /// Job payload as JSON
        payload: String,
    },

    /// List fallback jobs
    Jobs {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show one fallback job
    Job { id: Uuid },

    /// Replay queued jobs through the gated call path
    Drain {
        /// Run a single pass instead of polling until interrupted
        #[arg(long)]
        once: bool,
    },

    /// Return jobs stuck in processing to the queue, failing those out of attempts
    RequeueStale,

    /// Force a circuit breaker closed
    ResetBreaker { name: String },
}

// =============================================================================
// Entry point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code(&e);
            if code == EXIT_BUDGET {
                tracing::warn!("Refused by budget: {}", e);
            } else if code == EXIT_UNAVAILABLE {
                tracing::warn!("Refused by open circuit: {}", e);
            } else {
                tracing::error!("{:#}", e);
            }
            eprintln!("error: {:#}", e);
            ExitCode::from(code as u8)
        }
    }
}

fn exit_code(e: &anyhow::Error) -> i32 {
    if e.downcast_ref::<CostExceededError>().is_some()
        || e
            .downcast_ref::<BudgetError>()
            .and_then(BudgetError::as_exceeded)
            .is_some()
    {
        EXIT_BUDGET
    } else if e.downcast_ref::<CircuitOpenError>().is_some() {
        EXIT_UNAVAILABLE
    } else {
        EXIT_FAILURE
    }
}

struct App {
    config: Config,
    tracker: CostTracker,
    breakers: Arc<BreakerRegistry>,
    queue: FallbackQueue,
}

impl App {
    async fn open(cli: &Cli) -> Result<Self> {
        let mut config = Config::load(cli.config.as_deref()).context("Failed to load config")?;
        if let Some(db) = &cli.db {
            config.db_path = db.clone();
        }

        let store = Store::open(&config.db_path)
            .await
            .with_context(|| format!("Failed to open {}", config.db_path.display()))?;
        let tracker = CostTracker::from_config(store.clone(), &config)?;
        let breakers = Arc::new(BreakerRegistry::from_config(store.clone(), &config));
        let queue = FallbackQueue::new(store);

        Ok(Self {
            config,
            tracker,
            breakers,
            queue,
        })
    }
}

async fn run(cli: Cli) -> Result<()> {
    let app = App::open(&cli).await?;

    match cli.command {
        Command::Status { json } => status(&app, json).await,
        Command::Check {
            service,
            operation,
            cost,
        } => check(&app, &service, &operation, cost).await,
        Command::Record {
            service,
            operation,
            amount_usd,
            doc_slug,
            run_id,
            user,
            key,
        } => {
            let metadata = CostMetadata {
                doc_slug,
                run_id,
                user,
            };
            let mut entry = CostEntry::new(service, operation, amount_usd).with_metadata(metadata);
            if let Some(key) = key {
                entry = entry.with_idempotency_key(key);
            }
            let record = app.tracker.record(entry).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::Enqueue { job_type, payload } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("PAYLOAD must be valid JSON")?;
            let id = app.queue.enqueue(NewJob::new(job_type, payload)).await?;
            println!("{}", id);
            Ok(())
        }
        Command::Jobs { status, limit } => {
            for job in app.queue.list(status, limit).await? {
                println!("{}", serde_json::to_string(&job)?);
            }
            Ok(())
        }
        Command::Job { id } => {
            let job = app
                .queue
                .get(id)
                .await?
                .with_context(|| format!("Job {} not found", id))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Command::Drain { once } => drain(app, once).await,
        Command::RequeueStale => {
            let stale = app
                .queue
                .requeue_stale(
                    app.config.queue.processing_lease(),
                    app.config.queue.max_attempts,
                )
                .await?;
            println!("{}", serde_json::to_string(&stale)?);
            Ok(())
        }
        Command::ResetBreaker { name } => {
            app.breakers.get(&name).await.reset().await?;
            println!("{} CLOSED", name);
            Ok(())
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn status(app: &App, as_json: bool) -> Result<()> {
    let window = app.tracker.get_window().await?;
    let caps = app.tracker.caps();
    let month_start = WindowBounds::month(Utc::now(), app.config.offset()?).start;
    let by_service = app.tracker.spend_by_service(month_start).await?;
    let breakers = app.breakers.snapshots().await?;
    let queue = app.queue.get_stats().await?;

    let remaining_daily = (caps.daily_usd - window.daily_spend - window.reserved).max(0.0);
    let remaining_monthly = (caps.monthly_usd - window.monthly_spend - window.reserved).max(0.0);

    if as_json {
        let report = json!({
            "window": window,
            "caps": caps,
            "remaining": {"daily": remaining_daily, "monthly": remaining_monthly},
            "spend_by_service": by_service,
            "breakers": breakers,
            "queue": queue,
            "cost_table": app
                .tracker
                .cost_table()
                .entries()
                .map(|(service, operation, usd)| {
                    json!({"service": service, "operation": operation, "usd": usd})
                })
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "daily    ${:.2} of ${:.2} (remaining ${:.2})",
        window.daily_spend, caps.daily_usd, remaining_daily
    );
    println!(
        "monthly  ${:.2} of ${:.2} (remaining ${:.2})",
        window.monthly_spend, caps.monthly_usd, remaining_monthly
    );
    if window.reserved > 0.0 {
        println!("reserved ${:.2}", window.reserved);
    }

    if !by_service.is_empty() {
        println!("\nthis month:");
        for row in &by_service {
            println!(
                "  {:<20} {:<20} {:>6} calls  ${:.2}",
                row.service, row.operation, row.calls, row.total_usd
            );
        }
    }

    if !breakers.is_empty() {
        println!("\nbreakers:");
        for b in &breakers {
            if b.remaining_ms > 0 {
                println!(
                    "  {:<20} {:<9} failures={} retry in {}s",
                    b.name,
                    b.state,
                    b.failure_count,
                    b.remaining_ms.div_ceil(1000)
                );
            } else {
                println!("  {:<20} {:<9} failures={}", b.name, b.state, b.failure_count);
            }
        }
    }

    let table = app.tracker.cost_table();
    if !table.is_empty() {
        println!("\ncost table:");
        for (service, operation, usd) in table.entries() {
            println!("  {:<20} {:<20} ${:.4}", service, operation, usd);
        }
    }

    println!(
        "\nqueue: {} total, {} queued, {} processing, {} completed, {} failed",
        queue.total, queue.queued, queue.processing, queue.completed, queue.failed
    );
    Ok(())
}

async fn check(app: &App, service: &str, operation: &str, cost: Option<f64>) -> Result<()> {
    let grant = match cost {
        Some(cost) => app.tracker.check_budget(service, operation, cost).await?,
        None => app.tracker.check_budget_estimated(service, operation).await?,
    };
    // Dry run: give the reservation straight back
    app.tracker.release(&grant).await?;

    let breaker = app.breakers.get(service).await;
    let remaining = breaker.get_remaining_time().await?;
    if !remaining.is_zero() {
        return Err(CircuitOpenError {
            name: service.to_string(),
            remaining,
        }
        .into());
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "allowed": true,
            "estimated_cost_usd": grant.reserved_usd,
            "remaining": grant.remaining,
        }))?
    );
    Ok(())
}

async fn drain(app: App, once: bool) -> Result<()> {
    let guard = CostGuard::new(app.tracker, app.breakers, app.queue.clone());
    let worker = DrainWorker::new(
        app.queue,
        Arc::new(CommandReplayer::new(guard)),
        app.config.queue.clone(),
    );

    if once {
        let report = worker.drain_once().await?;
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping drain");
            on_signal.cancel();
        }
    });
    worker.run(cancel).await;
    Ok(())
}
