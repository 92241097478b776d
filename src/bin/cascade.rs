//! Cascade CLI: change-data-capture relay.
//!
//! Usage:
//!   cascade relay [--db path] [--schema tcs]
//!   cascade inspect [--db path]

use cascade::{
    ChangeRecord, ChangeRouter, ChannelRequester, EntityKind, OpenStore, OrderedEmitter,
    RecordStore, ReferenceResolver, RelayContext, SqliteStore, WriterChannel,
};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "cascade",
    version,
    about = "Change-data-capture relay with enrichment, aggregation, and ordered emission"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay inbound change records (NDJSON on stdin) to delivery
    /// envelopes (NDJSON on stdout)
    Relay {
        /// Path to SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
        /// Schema tag stamped on fetch-request envelopes
        #[arg(long, default_value = "tcs")]
        schema: String,
        /// Request-dedup suppression window, in seconds
        #[arg(long, default_value_t = 300)]
        request_ttl_secs: u64,
        /// Tombstone retention window, in seconds
        #[arg(long, default_value_t = 60)]
        tombstone_ttl_secs: u64,
    },
    /// Show stored record counts per entity type
    Inspect {
        /// Path to SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

/// Get the default database path (~/.local/share/cascade/cascade.db)
fn default_db_path() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    let cascade_dir = data_dir.join("cascade");
    std::fs::create_dir_all(&cascade_dir).ok();
    cascade_dir.join("cascade.db")
}

fn open_store(db: Option<PathBuf>) -> Result<SqliteStore, String> {
    let db_path = db.unwrap_or_else(default_db_path);
    SqliteStore::open(&db_path).map_err(|e| format!("Failed to open database: {}", e))
}

async fn cmd_relay(
    db: Option<PathBuf>,
    schema: String,
    request_ttl_secs: u64,
    tombstone_ttl_secs: u64,
) -> i32 {
    let store = match open_store(db) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    // Envelopes go to stdout; logs go to stderr.
    let channel = Arc::new(WriterChannel::new(std::io::stdout()));
    let requester = Arc::new(ChannelRequester::new(schema, channel.clone()));
    let resolver = Arc::new(ReferenceResolver::new(
        store.clone(),
        Duration::from_secs(request_ttl_secs),
        requester,
    ));
    let cx = RelayContext::new(store, resolver, OrderedEmitter::new(channel));
    let router = ChangeRouter::with_default_hooks(cx, Duration::from_secs(tombstone_ttl_secs));

    let mut routed = 0usize;
    let mut failed = 0usize;
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                eprintln!("Error: failed to read stdin: {}", e);
                return 1;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let record = match ChangeRecord::from_json(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!(%e, "skipping malformed change record");
                failed += 1;
                continue;
            }
        };

        match router.route(record).await {
            Ok(outcome) => {
                routed += 1;
                if outcome.deferred > 0 {
                    info!(
                        emitted = outcome.emitted,
                        deferred = outcome.deferred,
                        "change processed with deferrals"
                    );
                }
            }
            Err(e) => {
                error!(%e, "failed to route change record");
                failed += 1;
            }
        }
    }

    info!(routed, failed, "relay drained stdin");
    if failed > 0 {
        1
    } else {
        0
    }
}

fn cmd_inspect(db: Option<PathBuf>) -> i32 {
    let store = match open_store(db) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    println!("{:<24}  {:>8}", "ENTITY", "RECORDS");
    println!("{}", "-".repeat(34));
    for kind in EntityKind::ALL {
        match store.count(kind) {
            Ok(count) => println!("{:<24}  {:>8}", kind.table(), count),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    }
    0
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Relay {
            db,
            schema,
            request_ttl_secs,
            tombstone_ttl_secs,
        } => cmd_relay(db, schema, request_ttl_secs, tombstone_ttl_secs).await,
        Commands::Inspect { db } => cmd_inspect(db),
    };
    std::process::exit(code);
}
