//! Wordpot operational backend.
//!
//! Binary entrypoint: wires the SQLite stores, the treasury payment channel
//! and identity resolver, spawns the settlement and dead-day background
//! loops, and serves the admin API.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wordpot_backend::api::{create_router, AppState};
use wordpot_backend::chain::{FarcasterResolver, TreasuryClient};
use wordpot_backend::config::{resolve_data_path, Config};
use wordpot_backend::db::Db;
use wordpot_backend::error::OpsError;
use wordpot_backend::lock::LockStore;
use wordpot_backend::ops::OpsStore;
use wordpot_backend::refunds::{RefundLedger, SettlementWorker};
use wordpot_backend::rounds::{RoundCoordinator, RoundStore};

#[derive(Parser, Debug)]
#[command(name = "wordpot", about = "Wordpot operational backend")]
struct Cli {
    /// SQLite database path. Relative paths resolve against the crate dir.
    #[arg(long, env = "DB_PATH")]
    db_path: Option<String>,

    /// Listen address for the admin API.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3001")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();

    info!("🎰 Wordpot ops backend starting");

    let config = Config::from_env();

    // IMPORTANT: This defaults to the crate directory so running from the repo
    // root doesn't accidentally create a new empty DB somewhere else.
    let db_path = resolve_data_path(cli.db_path, "wordpot.db");
    let db = Db::open(&db_path)?;
    info!("📊 Database initialized at: {}", db_path);

    let ops = OpsStore::new(db.clone());
    let rounds = RoundStore::new(db.clone());
    let locks = LockStore::new(db.clone());
    let ledger = RefundLedger::new(db.clone(), rounds.clone(), ops.clone());

    let channel = Arc::new(
        TreasuryClient::new(
            config.treasury_url.clone(),
            config.treasury_api_key.clone(),
            config.external_call_timeout,
        )
        .context("Failed to build treasury client")?,
    );
    let resolver = Arc::new(
        FarcasterResolver::new(
            config.identity_url.clone(),
            config.identity_api_key.clone(),
            config.external_call_timeout,
        )
        .context("Failed to build identity resolver")?,
    );

    let worker = SettlementWorker::new(
        ledger.clone(),
        rounds.clone(),
        ops.clone(),
        locks,
        channel.clone(),
        resolver.clone(),
        config.external_call_timeout,
    );
    let coordinator = RoundCoordinator::new(
        rounds.clone(),
        ops.clone(),
        ledger.clone(),
        channel,
        resolver,
        config.external_call_timeout,
    );

    let state = AppState {
        ops: ops.clone(),
        rounds,
        ledger: ledger.clone(),
        worker: worker.clone(),
        coordinator,
    };

    // Background: drive pending refunds to a terminal state.
    tokio::spawn(settlement_polling(
        ledger,
        worker,
        config.settlement_poll,
    ));

    // Background: auto-disable dead day once its scheduled reopen passes.
    tokio::spawn(reopen_polling(ops, config.reopen_poll));

    let app = create_router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&cli.bind).await?;
    info!("🎯 Admin API listening on {}", cli.bind);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

/// Sweep rounds with pending refunds and run the settlement worker on each.
/// Lock contention is expected when an operator triggered a manual run; the
/// sweep just picks the round up again on the next tick.
async fn settlement_polling(
    ledger: RefundLedger,
    worker: SettlementWorker,
    poll: std::time::Duration,
) {
    info!("💸 Settlement sweep every {}s", poll.as_secs());
    let mut ticker = interval(poll);

    loop {
        ticker.tick().await;

        let round_ids = match ledger.rounds_with_pending_refunds().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("settlement sweep query failed: {}", e);
                continue;
            }
        };

        for round_id in round_ids {
            match worker.process_refunds(round_id).await {
                Ok(outcome) => {
                    if outcome.total_processed > 0 {
                        info!(
                            "💸 Round {}: {} sent, {} failed",
                            round_id, outcome.sent_count, outcome.failed_count
                        );
                    }
                }
                Err(OpsError::LockContention(msg)) => {
                    debug!("round {}: {}", round_id, msg);
                }
                Err(e) => {
                    warn!("round {} settlement failed: {}", round_id, e);
                }
            }
        }
    }
}

async fn reopen_polling(ops: OpsStore, poll: std::time::Duration) {
    let mut ticker = interval(poll);

    loop {
        ticker.tick().await;

        if let Err(e) = ops.check_dead_day_scheduled_reopen(Utc::now().timestamp()).await {
            warn!("dead-day reopen check failed: {}", e);
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wordpot_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), plus the crate and repo-root
    // .env so --manifest-path runs from elsewhere still pick it up.
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];
    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}
