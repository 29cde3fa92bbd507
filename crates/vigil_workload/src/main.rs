//! Continuous-writes workload generator.
//!
//! Writes a strictly increasing integer sequence into the cluster through
//! one SQL endpoint, forever or for a fixed duration. Duplicate-key errors
//! advance to the next number (another writer already committed it);
//! connection loss reconnects and retries the same number, so the sequence
//! never skips a value that was not committed. The verification harness
//! only observes the committed table; it never drives this process.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::time::Instant;
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;
use tracing::{info, warn};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "vigil-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// SQL endpoint host of any cluster member routing to the primary.
    #[arg(long)]
    host: String,

    #[arg(long, default_value_t = 5432)]
    port: u16,

    #[arg(long)]
    user: String,

    #[arg(long)]
    password: String,

    #[arg(long, default_value = "postgres")]
    dbname: String,

    /// Schema holding the writes table.
    #[arg(long, default_value = "continuous_writes")]
    schema: String,

    /// Table receiving the integer sequence.
    #[arg(long, default_value = "data")]
    table: String,

    /// First number to write. Zero resumes from MAX(number)+1.
    #[arg(long, default_value_t = 0)]
    starting_number: i64,

    /// Total runtime. Omit to run until interrupted.
    #[arg(long)]
    duration: Option<humantime::Duration>,

    /// Pause between reconnect attempts after a dropped connection.
    #[arg(long, default_value = "250ms")]
    reconnect_backoff: humantime::Duration,

    /// Write a JSON run summary to this path on exit.
    #[arg(long, default_value = ".tmp/vigil/workload-summary.json")]
    out: PathBuf,
}

/// Run summary serialized on exit for post-mortem inspection.
#[derive(serde::Serialize, Debug)]
struct RunSummary {
    endpoint: String,
    table: String,
    started_at_number: i64,
    last_written: i64,
    inserted: u64,
    duplicate_skips: u64,
    reconnects: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

async fn connect(args: &RunArgs) -> anyhow::Result<tokio_postgres::Client> {
    let conn = format!(
        "host={} port={} user={} password={} dbname={}",
        args.host, args.port, args.user, args.password, args.dbname
    );
    let (client, connection) = tokio_postgres::connect(&conn, NoTls)
        .await
        .with_context(|| format!("connect to {}:{}", args.host, args.port))?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

/// Connects and creates the writes table, retrying while the endpoint or a
/// fresh primary is still coming up.
async fn connect_and_ensure_table(args: &RunArgs) -> anyhow::Result<tokio_postgres::Client> {
    let qualified = format!("{}.{}", args.schema, args.table);
    let ddl = format!(
        "CREATE SCHEMA IF NOT EXISTS {}; \
         CREATE TABLE IF NOT EXISTS {qualified} (number BIGINT PRIMARY KEY);",
        args.schema
    );
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        match connect(args).await {
            Ok(client) => match client.batch_execute(&ddl).await {
                Ok(()) => return Ok(client),
                Err(err) if Instant::now() >= deadline => {
                    return Err(err).context("create writes table");
                }
                Err(err) => warn!(error = %err, "table bootstrap failed, retrying"),
            },
            Err(err) if Instant::now() >= deadline => return Err(err),
            Err(err) => warn!(error = %err, "endpoint not ready, retrying"),
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let qualified = format!("{}.{}", args.schema, args.table);
    let insert = format!("INSERT INTO {qualified} (number) VALUES ($1)");
    let deadline = args
        .duration
        .map(|d| Instant::now() + Into::<Duration>::into(d));

    let mut client = connect_and_ensure_table(&args).await?;

    // Resume after the highest committed value unless told otherwise.
    let mut next = if args.starting_number > 0 {
        args.starting_number
    } else {
        let resume = format!("SELECT COALESCE(MAX(number), 0) FROM {qualified}");
        let row = client
            .query_one(resume.as_str(), &[])
            .await
            .context("read resume point")?;
        row.try_get::<_, i64>(0)? + 1
    };
    let started_at = next;
    info!(endpoint = %args.host, table = %qualified, next, "workload starting");

    let mut inserted = 0u64;
    let mut duplicate_skips = 0u64;
    let mut reconnects = 0u64;

    loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                break;
            }
        }

        let params: [&(dyn tokio_postgres::types::ToSql + Sync); 1] = [&next];
        let outcome = tokio::select! {
            result = client.execute(insert.as_str(), &params) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
        };

        match outcome {
            Ok(_) => {
                inserted += 1;
                next += 1;
            }
            Err(err) if err.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                // Another writer (or a previous run) committed this value.
                duplicate_skips += 1;
                next += 1;
            }
            Err(err) if client.is_closed() || err.code().is_none() => {
                // Primary failover or network blip: reconnect and retry the
                // same number so nothing uncommitted is skipped.
                warn!(error = %err, next, "connection lost, reconnecting");
                reconnects += 1;
                tokio::time::sleep(args.reconnect_backoff.into()).await;
                client = connect_and_ensure_table(&args).await?;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("insert value {next}"));
            }
        }
    }

    let summary = RunSummary {
        endpoint: format!("{}:{}", args.host, args.port),
        table: qualified,
        started_at_number: started_at,
        last_written: next - 1,
        inserted,
        duplicate_skips,
        reconnects,
    };
    write_summary(&args.out, &summary)?;
    info!(?summary, "workload finished");
    Ok(())
}

fn write_summary(path: &PathBuf, summary: &RunSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(summary).context("serialize summary")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
