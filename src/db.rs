//! Shared SQLite handle and schema bootstrap.
//!
//! One database file holds rounds, purchases, refunds, operational state, the
//! append-only audit log, and the named-lock table. Domain stores clone `Db`
//! and serialize access through the inner tokio mutex. Wei amounts are stored
//! as TEXT and parsed to u128 - never as floats - so ledger arithmetic is
//! exact.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open wordpot db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory db")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS rounds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status TEXT NOT NULL DEFAULT 'active',
                prize_pool_wei TEXT NOT NULL DEFAULT '0',
                winner_fid INTEGER,
                resolved_at INTEGER,
                payout_ref TEXT,
                cancelled_at INTEGER,
                cancelled_reason TEXT,
                cancelled_by TEXT,
                refunds_started_at INTEGER,
                refunds_completed_at INTEGER,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rounds_status ON rounds(status)",
            [],
        )?;

        // Written by the purchasing flow (out of scope here); read-only input
        // to refund aggregation.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS purchases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                round_id INTEGER NOT NULL,
                payer_fid INTEGER NOT NULL,
                amount_wei TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_purchases_round ON purchases(round_id, payer_fid)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS refunds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                round_id INTEGER NOT NULL,
                payer_fid INTEGER NOT NULL,
                amount_wei TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                sent_at INTEGER,
                settlement_ref TEXT,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                source_purchase_ids TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                UNIQUE(round_id, payer_fid)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_refunds_round_status ON refunds(round_id, status)",
            [],
        )?;

        // Singleton row (id = 1), created implicitly on first write.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS ops_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                kill_enabled INTEGER NOT NULL DEFAULT 0,
                kill_activated_at INTEGER,
                kill_reason TEXT,
                kill_round_id INTEGER,
                kill_activated_by TEXT,
                dead_enabled INTEGER NOT NULL DEFAULT 0,
                dead_activated_at INTEGER,
                dead_reason TEXT,
                dead_reopen_at INTEGER,
                dead_applies_after_round_id INTEGER,
                dead_activated_by TEXT,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        // Append-only: rows are inserted and never updated or deleted.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS ops_events (
                id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                reason TEXT,
                round_id INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_ops_events_ts ON ops_events(ts DESC)",
            [],
        )?;

        // Winner payout allocations, persisted before any transfer so stuck
        // resolutions can be re-driven.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS payouts (
                round_id INTEGER NOT NULL,
                rank INTEGER NOT NULL,
                fid INTEGER NOT NULL,
                amount_wei TEXT NOT NULL,
                settlement_ref TEXT,
                sent_at INTEGER,
                PRIMARY KEY (round_id, rank)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS locks (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(())
    }
}

/// Parse a wei amount stored as TEXT.
pub fn parse_wei(raw: &str) -> Result<u128> {
    raw.trim()
        .parse::<u128>()
        .with_context(|| format!("invalid wei amount: {raw:?}"))
}

/// Display-only conversion; never used for ledger arithmetic.
pub fn wei_to_eth(wei: u128) -> f64 {
    wei as f64 / 1e18
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_bootstrap_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        Db::init_schema(&conn).unwrap();
        Db::init_schema(&conn).unwrap();
    }

    #[test]
    fn file_backed_db_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wordpot.db");
        let path = path.to_str().unwrap();

        {
            let db = Db::open(path).unwrap();
            let conn = db.conn.try_lock().unwrap();
            conn.execute(
                "INSERT INTO rounds (status, prize_pool_wei, created_at) VALUES ('active', '100', 0)",
                [],
            )
            .unwrap();
        }

        let db = Db::open(path).unwrap();
        let conn = db.conn.try_lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM rounds", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn wei_text_round_trips() {
        let wei = 1_234_567_890_123_456_789u128;
        assert_eq!(parse_wei(&wei.to_string()).unwrap(), wei);
        assert!(parse_wei("not-a-number").is_err());
        assert!(parse_wei("-5").is_err());
    }

    #[test]
    fn wei_to_eth_is_display_scale() {
        assert_eq!(wei_to_eth(1_000_000_000_000_000_000), 1.0);
        assert_eq!(wei_to_eth(0), 0.0);
    }
}
