//! # tally-agent
//!
//! Command-line host: one worker, fed from stdin.
//!
//! ## Input Format
//! ```text
//! {"event": "Button Clicked", "properties": {"time": 1000}}
//! {"event": "$app_open", "automatic": true}
//! {"profile": {"$set": {"plan": "pro"}}}
//! ```
//!
//! Each line may carry its own `"token"`; otherwise `--token` is used.
//! Blank lines are skipped and malformed lines are logged and skipped.
//! On EOF (or Ctrl+C) the agent flushes, waits for the worker to drain its
//! mailbox, and exits.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tally_db::{Database, DbConfig};
use tally_sync::{Dispatcher, RemoteConfigCheck, TallyConfig, WorkerBuilder};

#[derive(Parser, Debug)]
#[command(name = "tally-agent", version, about = "Queue and deliver events read from stdin")]
struct Args {
    /// Path to tally.toml (defaults to the platform config directory).
    #[arg(short, long, env = "TALLY_CONFIG")]
    config: Option<PathBuf>,

    /// Project token for lines without their own.
    #[arg(short, long, env = "TALLY_TOKEN")]
    token: String,

    /// Queue only; never contact the collector.
    #[arg(long)]
    offline: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputLine {
    Profile {
        profile: Value,
        #[serde(default)]
        token: Option<String>,
    },
    Event {
        event: String,
        #[serde(default)]
        properties: Map<String, Value>,
        #[serde(default)]
        automatic: bool,
        #[serde(default)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();

    let mut config = TallyConfig::load(args.config.clone()).context("loading configuration")?;
    if args.offline {
        config.client.offline = true;
    }

    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }

    let db = Database::new(DbConfig::new(&db_path))
        .await
        .with_context(|| format!("opening database {}", db_path.display()))?;
    info!(path = %db_path.display(), "Database ready");

    let has_remote_config = config.delivery.remote_config_endpoint.is_some();
    let dispatcher = WorkerBuilder::new(config)
        .with_database(db.clone())
        .spawn()
        .context("starting worker")?;

    if has_remote_config {
        install_remote_config_check(&dispatcher, &args.token);
    }

    let lines = tokio::select! {
        result = pump_stdin(&dispatcher, &args.token) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, flushing");
            0
        }
    };

    dispatcher.request_flush(args.token.clone(), true);
    if !dispatcher.barrier().await {
        bail!("worker terminated before the queue was flushed");
    }

    let status = dispatcher.status().await;
    info!(
        lines,
        failures = status.failure_count,
        dropped_automatic = status.dropped_automatic_events,
        "Done"
    );
    if let Some(backoff) = status.last_backoff {
        warn!(retry_in_secs = backoff.as_secs(), "Undelivered records stay queued");
    }

    db.close().await;
    Ok(())
}

/// Initializes the tracing subscriber. `RUST_LOG` overrides the default.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn install_remote_config_check(dispatcher: &Dispatcher, token: &str) {
    let check = RemoteConfigCheck::new(token);
    let mut decisions = check.subscribe();

    tokio::spawn(async move {
        while decisions.changed().await.is_ok() {
            let decision = decisions.borrow_and_update().clone();
            info!(
                automatic = ?decision.should_track_automatic,
                "Remote config decision received"
            );
        }
    });

    dispatcher.install_remote_config_check(check);
}

/// Forwards stdin lines until EOF. Returns the number of accepted lines.
async fn pump_stdin(dispatcher: &Dispatcher, default_token: &str) -> anyhow::Result<u64> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut accepted = 0u64;
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<InputLine>(line) {
            Ok(InputLine::Event {
                event,
                properties,
                automatic,
                token,
            }) => {
                let token = token.unwrap_or_else(|| default_token.to_string());
                debug!(line = line_no, event = %event, token = %token, "Event");
                dispatcher.enqueue_event(event, properties, token, automatic);
                accepted += 1;
            }
            Ok(InputLine::Profile { profile, token }) => {
                let token = token.unwrap_or_else(|| default_token.to_string());
                debug!(line = line_no, token = %token, "Profile update");
                dispatcher.enqueue_profile_update(profile, token);
                accepted += 1;
            }
            Err(e) => warn!(line = line_no, error = %e, "Skipping unreadable line"),
        }
    }

    Ok(accepted)
}
