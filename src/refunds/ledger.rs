//! Refund ledger.
//!
//! Aggregates a cancelled round's purchases into one refund record per payer.
//! Creation is idempotent: the UNIQUE(round_id, payer_fid) index plus
//! INSERT OR IGNORE means re-running it (retried admin action, overlapping
//! trigger) inserts nothing the second time. Records are mutated only through
//! the worker's status transitions and the explicit retry action; never
//! deleted.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::info;

use crate::db::{parse_wei, wei_to_eth, Db};
use crate::error::{OpsError, OpsResult};
use crate::ops::OpsStore;
use crate::rounds::{RoundStatus, RoundStore};

/// Stored error messages are truncated to this many characters.
pub const MAX_ERROR_LEN: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Processing => "processing",
            RefundStatus::Sent => "sent",
            RefundStatus::Failed => "failed",
        }
    }

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(RefundStatus::Pending),
            "processing" => Ok(RefundStatus::Processing),
            "sent" => Ok(RefundStatus::Sent),
            "failed" => Ok(RefundStatus::Failed),
            other => anyhow::bail!("unknown refund status: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRecord {
    pub id: i64,
    pub round_id: i64,
    pub payer_fid: u64,
    pub amount_wei: u128,
    pub status: RefundStatus,
    pub sent_at: Option<i64>,
    pub settlement_ref: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub source_purchase_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundCreation {
    pub created: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundPreviewEntry {
    pub payer_fid: u64,
    pub amount_wei: u128,
    pub amount_eth: f64,
    pub purchase_count: usize,
    pub already_created: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefundSummary {
    pub pending: usize,
    pub processing: usize,
    pub sent: usize,
    pub failed: usize,
    pub total_count: usize,
    pub total_wei: u128,
    pub sent_wei: u128,
}

/// Per-payer aggregation of a round's purchases.
struct PayerTotal {
    amount_wei: u128,
    purchase_ids: Vec<i64>,
}

#[derive(Clone)]
pub struct RefundLedger {
    db: Db,
    rounds: RoundStore,
    ops: OpsStore,
}

impl RefundLedger {
    pub fn new(db: Db, rounds: RoundStore, ops: OpsStore) -> Self {
        Self { db, rounds, ops }
    }

    /// Materialize refund records for a cancelled round. Idempotent: payers
    /// that already have a record are skipped and counted.
    pub async fn create_refunds_for_round(
        &self,
        round_id: i64,
        actor: &str,
    ) -> OpsResult<RefundCreation> {
        let round = self
            .rounds
            .get_round(round_id)
            .await?
            .ok_or_else(|| OpsError::NotFound(format!("round {round_id}")))?;
        if round.status != RoundStatus::Cancelled {
            return Err(OpsError::precondition(format!(
                "round {round_id} is {:?}, refunds require a cancelled round",
                round.status
            )));
        }

        let totals = self.aggregate_purchases(round_id).await?;
        let existing = self.existing_payers(round_id).await?;

        let now = Utc::now().timestamp();
        let mut created = 0usize;
        let mut skipped = 0usize;
        {
            let conn = self.db.conn();
            let conn = conn.lock().await;
            for (payer_fid, total) in &totals {
                if existing.contains(payer_fid) {
                    skipped += 1;
                    continue;
                }
                let ids_json = serde_json::to_string(&total.purchase_ids)
                    .context("serialize purchase ids")
                    .map_err(OpsError::Internal)?;
                let changed = conn
                    .execute(
                        "INSERT OR IGNORE INTO refunds
                         (round_id, payer_fid, amount_wei, status, source_purchase_ids, created_at)
                         VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
                        params![
                            round_id,
                            *payer_fid as i64,
                            total.amount_wei.to_string(),
                            ids_json,
                            now
                        ],
                    )
                    .context("insert refund record")
                    .map_err(OpsError::Internal)?;
                if changed > 0 {
                    created += 1;
                } else {
                    skipped += 1;
                }
            }
        }

        if created > 0 && round.refunds_started_at.is_none() {
            self.rounds.stamp_refunds_started(round_id, now).await?;
        }

        if created > 0 {
            self.ops
                .append_event(
                    actor,
                    "refunds_created",
                    Some(&format!("{created} refund records materialized")),
                    Some(round_id),
                )
                .await?;
        }
        info!(round_id, created, skipped, "📒 Refund ledger creation done");

        Ok(RefundCreation { created, skipped })
    }

    /// Read-only aggregation for admin display before committing.
    pub async fn refund_preview(&self, round_id: i64) -> OpsResult<Vec<RefundPreviewEntry>> {
        self.rounds
            .get_round(round_id)
            .await?
            .ok_or_else(|| OpsError::NotFound(format!("round {round_id}")))?;

        let totals = self.aggregate_purchases(round_id).await?;
        let existing = self.existing_payers(round_id).await?;

        Ok(totals
            .into_iter()
            .map(|(payer_fid, total)| RefundPreviewEntry {
                payer_fid,
                amount_wei: total.amount_wei,
                amount_eth: wei_to_eth(total.amount_wei),
                purchase_count: total.purchase_ids.len(),
                already_created: existing.contains(&payer_fid),
            })
            .collect())
    }

    pub async fn refund_summary(&self, round_id: i64) -> Result<RefundSummary> {
        let records = self.list_refunds(round_id).await?;
        let mut summary = RefundSummary::default();
        for r in &records {
            match r.status {
                RefundStatus::Pending => summary.pending += 1,
                RefundStatus::Processing => summary.processing += 1,
                RefundStatus::Sent => {
                    summary.sent += 1;
                    summary.sent_wei += r.amount_wei;
                }
                RefundStatus::Failed => summary.failed += 1,
            }
            summary.total_wei += r.amount_wei;
        }
        summary.total_count = records.len();
        Ok(summary)
    }

    /// Administrative retry: failed records go back to pending. The worker
    /// itself never does this.
    pub async fn retry_failed_refunds(&self, round_id: i64, actor: &str) -> OpsResult<usize> {
        let reset = {
            let conn = self.db.conn();
            let conn = conn.lock().await;
            conn.execute(
                "UPDATE refunds SET status = 'pending', error_message = NULL
                 WHERE round_id = ?1 AND status = 'failed'",
                params![round_id],
            )
            .context("reset failed refunds")
            .map_err(OpsError::Internal)?
        };

        if reset > 0 {
            self.ops
                .append_event(
                    actor,
                    "refunds_retry_failed",
                    Some(&format!("{reset} failed refunds reset to pending")),
                    Some(round_id),
                )
                .await?;
            info!(round_id, reset, actor, "🔁 Failed refunds reset to pending");
        }
        Ok(reset)
    }

    pub async fn list_refunds(&self, round_id: i64) -> Result<Vec<RefundRecord>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, round_id, payer_fid, amount_wei, status, sent_at, settlement_ref,
                    error_message, retry_count, source_purchase_ids
             FROM refunds WHERE round_id = ?1 ORDER BY payer_fid ASC",
        )?;
        let rows = stmt.query_map(params![round_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, round_id, payer_fid, wei, status, sent_at, sref, err, retries, ids) = row?;
            out.push(RefundRecord {
                id,
                round_id,
                payer_fid: payer_fid as u64,
                amount_wei: parse_wei(&wei)?,
                status: RefundStatus::from_str(&status)?,
                sent_at,
                settlement_ref: sref,
                error_message: err,
                retry_count: retries,
                source_purchase_ids: serde_json::from_str(&ids).unwrap_or_default(),
            });
        }
        Ok(out)
    }

    pub async fn pending_refunds(&self, round_id: i64) -> Result<Vec<RefundRecord>> {
        let all = self.list_refunds(round_id).await?;
        Ok(all
            .into_iter()
            .filter(|r| r.status == RefundStatus::Pending)
            .collect())
    }

    /// Cancelled rounds that still have pending refunds; the settlement tick
    /// walks these.
    pub async fn rounds_with_pending_refunds(&self) -> Result<Vec<i64>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT round_id FROM refunds WHERE status = 'pending' ORDER BY round_id",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Every round that has any refund records; the status endpoint reports
    /// a summary per round.
    pub async fn rounds_with_refunds(&self) -> Result<Vec<i64>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT DISTINCT round_id FROM refunds ORDER BY round_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Claim a pending record for settlement. Returns false when the record
    /// is no longer pending, which means a different run took it after this
    /// run's batch snapshot (stolen lock) or it already reached a terminal
    /// state. Callers must not settle a record they failed to claim.
    pub(crate) async fn mark_processing(&self, refund_id: i64) -> Result<bool> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE refunds SET status = 'processing' WHERE id = ?1 AND status = 'pending'",
                params![refund_id],
            )
            .context("mark refund processing")?;
        Ok(changed > 0)
    }

    /// Ownership-guarded: only the run holding the record in `processing` may
    /// finalize it. Returns false when the claim was lost underneath us; a
    /// terminal record's settlement ref is never overwritten.
    pub(crate) async fn mark_sent(
        &self,
        refund_id: i64,
        settlement_ref: &str,
        sent_at: i64,
    ) -> Result<bool> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE refunds SET status = 'sent', settlement_ref = ?2, sent_at = ?3,
                        error_message = NULL
                 WHERE id = ?1 AND status = 'processing'",
                params![refund_id, settlement_ref, sent_at],
            )
            .context("mark refund sent")?;
        Ok(changed > 0)
    }

    /// Ownership-guarded like [`Self::mark_sent`].
    pub(crate) async fn mark_failed(&self, refund_id: i64, error: &str) -> Result<bool> {
        let truncated: String = error.chars().take(MAX_ERROR_LEN).collect();
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE refunds SET status = 'failed', error_message = ?2,
                        retry_count = retry_count + 1
                 WHERE id = ?1 AND status = 'processing'",
                params![refund_id, truncated],
            )
            .context("mark refund failed")?;
        Ok(changed > 0)
    }

    async fn aggregate_purchases(&self, round_id: i64) -> Result<BTreeMap<u64, PayerTotal>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, payer_fid, amount_wei FROM purchases WHERE round_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![round_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        // BTreeMap for deterministic payer ordering.
        let mut totals: BTreeMap<u64, PayerTotal> = BTreeMap::new();
        for row in rows {
            let (id, payer_fid, wei) = row?;
            let amount = parse_wei(&wei)?;
            let entry = totals.entry(payer_fid as u64).or_insert(PayerTotal {
                amount_wei: 0,
                purchase_ids: Vec::new(),
            });
            entry.amount_wei += amount;
            entry.purchase_ids.push(id);
        }
        Ok(totals)
    }

    async fn existing_payers(&self, round_id: i64) -> Result<HashSet<u64>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT payer_fid FROM refunds WHERE round_id = ?1")?;
        let rows = stmt.query_map(params![round_id], |row| row.get::<_, i64>(0))?;
        let mut out = HashSet::new();
        for r in rows {
            out.insert(r? as u64);
        }
        Ok(out)
    }
}
