//! stageq CLI: run queue workers and inspect the queue.

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use stagequeue::config::{Config, WorkerConfig};
use stagequeue::db::Db;
use stagequeue::handler::LogDelivery;
use stagequeue::intake::IntakeBuffer;
use stagequeue::model::MessageId;
use stagequeue::store::QueueStore;
use stagequeue::telemetry::{TelemetryConfig, init_telemetry};
use stagequeue::worker::WorkerGroup;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "stageq", about = "Durable multi-stage work queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run queue workers until Ctrl-C
    Serve {
        /// Number of concurrent workers
        #[arg(long, default_value_t = 1)]
        workers: usize,
        /// TOML file with worker settings
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Queue inspection and direct submission
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Persist payloads directly, at the Uploaded stage
    Submit {
        /// Payloads (stored as UTF-8 bytes)
        #[arg(required = true)]
        payloads: Vec<String>,
    },
    /// Show one message
    Show {
        /// Message ID
        id: i64,
    },
    /// Message counts per stage
    Stats,
    /// Print Done messages as JSON lines, oldest first. Payloads are
    /// base64-encoded.
    Done {
        /// Only messages with an ID greater than this
        #[arg(long, default_value_t = 0)]
        after: i64,
        /// Maximum messages to print
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { workers, config } => cmd_serve(workers, config).await,
        Command::Queue { action } => {
            let config = Config::from_env()?;
            let db = Db::connect(config.database_url.expose_secret()).await?;
            db.migrate().await?;

            match action {
                QueueAction::Submit { payloads } => cmd_submit(&db, payloads).await,
                QueueAction::Show { id } => cmd_show(&db, MessageId(id)).await,
                QueueAction::Stats => cmd_stats(&db).await,
                QueueAction::Done { after, limit } => {
                    cmd_done(&db, MessageId(after), limit).await
                }
            }
        }
    }
}

async fn cmd_serve(workers: usize, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "stagequeue"))?;

    let worker_config = match config_path {
        Some(path) => WorkerConfig::from_toml_file(&path)?,
        None => WorkerConfig::default(),
    };

    let pool_size = u32::try_from(workers.max(1)).unwrap_or(u32::MAX).saturating_add(1);
    let db = Db::connect_with(config.database_url.expose_secret(), pool_size).await?;
    db.migrate().await?;

    let intake = Arc::new(IntakeBuffer::new(worker_config.max_insert_attempts));
    let group = WorkerGroup::spawn(
        workers.max(1),
        Arc::new(db),
        Arc::clone(&intake),
        Arc::new(LogDelivery),
        worker_config,
    );
    info!(workers = group.ids().len(), "workers started");

    let token = group.shutdown_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        token.cancel();
    });

    let result = group.join().await;

    let dead = intake.take_dead_letters();
    if !dead.is_empty() {
        error!(count = dead.len(), "payloads were dead-lettered");
    }
    let unflushed = intake.drain_all();
    if !unflushed.is_empty() {
        error!(count = unflushed.len(), "payloads still buffered at exit were not persisted");
    }

    result?;
    Ok(())
}

async fn cmd_submit(db: &Db, payloads: Vec<String>) -> anyhow::Result<()> {
    for payload in payloads {
        let id = db.insert(payload.as_bytes()).await?;
        println!("Inserted: {id}");
    }
    Ok(())
}

async fn cmd_show(db: &Db, id: MessageId) -> anyhow::Result<()> {
    let msg = db.get_message(id).await?;

    println!("ID:         {}", msg.id);
    println!("Stage:      {}", msg.stage);
    println!(
        "Owner:      {}",
        msg.owner.as_ref().map(|o| o.as_str()).unwrap_or("-")
    );
    if let Some(claimed_at) = msg.claimed_at {
        println!("Claimed:    {claimed_at}");
    }
    println!("Created:    {}", msg.created_at);
    println!("Bytes:      {}", msg.payload.len());
    // Lossy: for reading only. `queue done` has the exact bytes.
    println!("Payload:    {}", String::from_utf8_lossy(&msg.payload));
    Ok(())
}

async fn cmd_stats(db: &Db) -> anyhow::Result<()> {
    let counts = db.stage_counts().await?;

    println!("{:<10}  COUNT", "STAGE");
    println!("{}", "-".repeat(20));
    for (stage, n) in &counts {
        println!("{:<10}  {}", stage, n);
    }
    let total: i64 = counts.iter().map(|(_, n)| n).sum();
    println!("\n{total} message(s)");
    Ok(())
}

async fn cmd_done(db: &Db, after: MessageId, limit: i64) -> anyhow::Result<()> {
    for msg in db.done_after(after, limit).await? {
        let line = serde_json::json!({
            "id": msg.id,
            "created_at": msg.created_at,
            "payload": msg.payload_base64(),
        });
        println!("{}", serde_json::to_string(&line)?);
    }
    Ok(())
}
