//! Round store and lifecycle coordinator.
//!
//! A round is `active` until it is either cancelled (kill-switch path,
//! terminal, triggers refunds) or resolved (normal win, triggers payouts).
//! A crash between recording the winner and confirming settlement leaves a
//! stuck round: winner recorded with no completed resolution. Stuck rounds
//! are exited only through explicit recovery, which re-drives the winner
//! settlement and then enables dead day so no new round silently starts
//! before an operator has reviewed the recovered state.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::chain::{IdentityResolver, PaymentChannel};
use crate::db::{parse_wei, Db};
use crate::error::{OpsError, OpsResult};
use crate::ops::{validate_reason, OpsStore, SYSTEM_ACTOR};
use crate::payout::{calculate_payouts, PayoutAllocation};
use crate::refunds::ledger::RefundLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Active,
    Resolved,
    Cancelled,
}

impl RoundStatus {
    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "active" => Ok(RoundStatus::Active),
            "resolved" => Ok(RoundStatus::Resolved),
            "cancelled" => Ok(RoundStatus::Cancelled),
            other => anyhow::bail!("unknown round status: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: i64,
    pub status: RoundStatus,
    pub prize_pool_wei: u128,
    pub winner_fid: Option<u64>,
    pub resolved_at: Option<i64>,
    pub payout_ref: Option<String>,
    pub cancelled_at: Option<i64>,
    pub cancelled_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub refunds_started_at: Option<i64>,
    pub refunds_completed_at: Option<i64>,
    pub created_at: i64,
}

/// A persisted winner allocation, written before any transfer.
#[derive(Debug, Clone, Serialize)]
pub struct PayoutRow {
    pub rank: i64,
    pub fid: u64,
    pub amount_wei: u128,
    pub settlement_ref: Option<String>,
    pub sent_at: Option<i64>,
}

#[derive(Clone)]
pub struct RoundStore {
    db: Db,
}

impl RoundStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Open a new round. Rejected while another round is active.
    pub async fn create_round(&self, prize_pool_wei: u128) -> OpsResult<i64> {
        if self.active_round().await?.is_some() {
            return Err(OpsError::precondition("a round is already active"));
        }
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT INTO rounds (status, prize_pool_wei, created_at) VALUES ('active', ?1, ?2)",
            params![prize_pool_wei.to_string(), Utc::now().timestamp()],
        )
        .context("create round")
        .map_err(OpsError::Internal)?;
        Ok(conn.last_insert_rowid())
    }

    /// Written by the purchasing flow; exposed here so that flow (and tests)
    /// have a single insert path.
    pub async fn record_purchase(
        &self,
        round_id: i64,
        payer_fid: u64,
        amount_wei: u128,
    ) -> Result<i64> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT INTO purchases (round_id, payer_fid, amount_wei, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                round_id,
                payer_fid as i64,
                amount_wei.to_string(),
                Utc::now().timestamp()
            ],
        )
        .context("record purchase")?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_round(&self, round_id: i64) -> Result<Option<Round>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, status, prize_pool_wei, winner_fid, resolved_at, payout_ref,
                    cancelled_at, cancelled_reason, cancelled_by,
                    refunds_started_at, refunds_completed_at, created_at
             FROM rounds WHERE id = ?1",
        )?;
        let row = stmt
            .query_row(params![round_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<i64>>(9)?,
                    row.get::<_, Option<i64>>(10)?,
                    row.get::<_, i64>(11)?,
                ))
            })
            .optional()?;

        let Some((id, status, pool, winner, resolved_at, payout_ref, c_at, c_reason, c_by, r_started, r_completed, created_at)) = row
        else {
            return Ok(None);
        };
        Ok(Some(Round {
            id,
            status: RoundStatus::from_str(&status)?,
            prize_pool_wei: parse_wei(&pool)?,
            winner_fid: winner.map(|w| w as u64),
            resolved_at,
            payout_ref,
            cancelled_at: c_at,
            cancelled_reason: c_reason,
            cancelled_by: c_by,
            refunds_started_at: r_started,
            refunds_completed_at: r_completed,
            created_at,
        }))
    }

    pub async fn active_round(&self) -> Result<Option<Round>> {
        let id = {
            let conn = self.db.conn();
            let conn = conn.lock().await;
            conn.query_row(
                "SELECT id FROM rounds WHERE status = 'active' ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        };
        match id {
            Some(id) => self.get_round(id).await,
            None => Ok(None),
        }
    }

    /// active -> cancelled. Returns false when the round was not active.
    pub async fn mark_cancelled(
        &self,
        round_id: i64,
        actor: &str,
        reason: &str,
        now: i64,
    ) -> Result<bool> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE rounds SET status = 'cancelled', cancelled_at = ?2,
                        cancelled_reason = ?3, cancelled_by = ?4
                 WHERE id = ?1 AND status = 'active'",
                params![round_id, now, reason, actor],
            )
            .context("mark round cancelled")?;
        Ok(changed > 0)
    }

    pub async fn record_winner(&self, round_id: i64, winner_fid: u64) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE rounds SET winner_fid = ?2 WHERE id = ?1",
            params![round_id, winner_fid as i64],
        )
        .context("record winner")?;
        Ok(())
    }

    pub async fn mark_resolved(&self, round_id: i64, payout_ref: &str, now: i64) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE rounds SET status = 'resolved', resolved_at = ?2, payout_ref = ?3
             WHERE id = ?1",
            params![round_id, now, payout_ref],
        )
        .context("mark round resolved")?;
        Ok(())
    }

    pub async fn stamp_refunds_started(&self, round_id: i64, now: i64) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE rounds SET refunds_started_at = ?2
             WHERE id = ?1 AND refunds_started_at IS NULL",
            params![round_id, now],
        )
        .context("stamp refunds started")?;
        Ok(())
    }

    /// Returns true only on the run that actually set the stamp.
    pub async fn stamp_refunds_completed(&self, round_id: i64, now: i64) -> Result<bool> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE rounds SET refunds_completed_at = ?2
                 WHERE id = ?1 AND refunds_completed_at IS NULL",
                params![round_id, now],
            )
            .context("stamp refunds completed")?;
        Ok(changed > 0)
    }

    /// Persist allocations idempotently; rows that already exist are kept.
    pub async fn insert_payout_allocations(
        &self,
        round_id: i64,
        allocations: &[PayoutAllocation],
    ) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        for (i, alloc) in allocations.iter().enumerate() {
            conn.execute(
                "INSERT OR IGNORE INTO payouts (round_id, rank, fid, amount_wei)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    round_id,
                    (i + 1) as i64,
                    alloc.fid as i64,
                    alloc.amount_wei.to_string()
                ],
            )
            .context("insert payout allocation")?;
        }
        Ok(())
    }

    pub async fn payout_rows(&self, round_id: i64) -> Result<Vec<PayoutRow>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT rank, fid, amount_wei, settlement_ref, sent_at
             FROM payouts WHERE round_id = ?1 ORDER BY rank ASC",
        )?;
        let rows = stmt.query_map(params![round_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<i64>>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (rank, fid, wei, settlement_ref, sent_at) = row?;
            out.push(PayoutRow {
                rank,
                fid: fid as u64,
                amount_wei: parse_wei(&wei)?,
                settlement_ref,
                sent_at,
            });
        }
        Ok(out)
    }

    pub async fn mark_payout_sent(
        &self,
        round_id: i64,
        rank: i64,
        settlement_ref: &str,
        now: i64,
    ) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE payouts SET settlement_ref = ?3, sent_at = ?4
             WHERE round_id = ?1 AND rank = ?2",
            params![round_id, rank, settlement_ref, now],
        )
        .context("mark payout sent")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StuckDiagnosis {
    pub is_stuck: bool,
    pub reason: Option<String>,
}

/// Orchestrates cancellation, resolution, and stuck-round recovery. All round
/// state changes funnel through here so audit logging and precondition checks
/// cannot be bypassed.
#[derive(Clone)]
pub struct RoundCoordinator {
    rounds: RoundStore,
    ops: OpsStore,
    ledger: RefundLedger,
    channel: Arc<dyn PaymentChannel>,
    resolver: Arc<dyn IdentityResolver>,
    call_timeout: Duration,
}

impl RoundCoordinator {
    pub fn new(
        rounds: RoundStore,
        ops: OpsStore,
        ledger: RefundLedger,
        channel: Arc<dyn PaymentChannel>,
        resolver: Arc<dyn IdentityResolver>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            rounds,
            ops,
            ledger,
            channel,
            resolver,
            call_timeout,
        }
    }

    /// Emergency cancellation: mark the active round cancelled, flip the kill
    /// switch, and materialize the refund ledger.
    pub async fn cancel_active_round(&self, actor: &str, reason: &str) -> OpsResult<i64> {
        validate_reason(reason)?;

        let state = self.ops.state().await?;
        if state.kill_switch.enabled {
            return Err(OpsError::precondition(
                "kill switch is already enabled; the active round was already cancelled",
            ));
        }
        let round = self
            .rounds
            .active_round()
            .await?
            .ok_or_else(|| OpsError::precondition("no active round to cancel"))?;

        let now = Utc::now().timestamp();
        let cancelled = self
            .rounds
            .mark_cancelled(round.id, actor, reason, now)
            .await?;
        if !cancelled {
            // Lost a race with another cancellation.
            return Err(OpsError::precondition(format!(
                "round {} is no longer active",
                round.id
            )));
        }

        self.ops
            .enable_kill_switch(actor, reason, Some(round.id))
            .await?;
        let creation = self.ledger.create_refunds_for_round(round.id, actor).await?;

        info!(
            round_id = round.id,
            actor,
            reason,
            refunds_created = creation.created,
            "🛑 Active round cancelled"
        );
        Ok(round.id)
    }

    /// Normal-win resolution: record the winner, persist the tiered payout
    /// allocations, settle them over the payment channel, mark resolved.
    pub async fn resolve_round(
        &self,
        round_id: i64,
        ranked_fids: &[u64],
        actor: &str,
    ) -> OpsResult<Vec<PayoutAllocation>> {
        let round = self
            .rounds
            .get_round(round_id)
            .await?
            .ok_or_else(|| OpsError::NotFound(format!("round {round_id}")))?;
        if round.status != RoundStatus::Active {
            return Err(OpsError::precondition(format!(
                "round {round_id} is {:?}, only an active round can resolve",
                round.status
            )));
        }

        let allocations = calculate_payouts(ranked_fids, round.prize_pool_wei)?;

        // Winner first, allocations second: a crash after this point leaves a
        // diagnosable stuck round instead of silent loss.
        self.rounds.record_winner(round_id, ranked_fids[0]).await?;
        self.rounds
            .insert_payout_allocations(round_id, &allocations)
            .await?;

        let winner_ref = self.settle_payouts(round_id).await?;
        self.rounds
            .mark_resolved(round_id, &winner_ref, Utc::now().timestamp())
            .await?;
        self.ops
            .append_event(
                actor,
                "round_resolved",
                Some(&format!("{} winners paid", allocations.len())),
                Some(round_id),
            )
            .await?;
        info!(round_id, winner_fid = ranked_fids[0], "🏆 Round resolved");

        Ok(allocations)
    }

    pub async fn diagnose_stuck_round(&self, round_id: i64) -> OpsResult<StuckDiagnosis> {
        let round = self
            .rounds
            .get_round(round_id)
            .await?
            .ok_or_else(|| OpsError::NotFound(format!("round {round_id}")))?;

        if round.winner_fid.is_some() && round.resolved_at.is_none() {
            return Ok(StuckDiagnosis {
                is_stuck: true,
                reason: Some(
                    "winner recorded but resolution never completed (crashed before settlement)"
                        .to_string(),
                ),
            });
        }
        if round.resolved_at.is_some() && round.payout_ref.is_none() {
            return Ok(StuckDiagnosis {
                is_stuck: true,
                reason: Some("resolved without a settlement reference".to_string()),
            });
        }
        Ok(StuckDiagnosis {
            is_stuck: false,
            reason: None,
        })
    }

    /// Re-drive a stuck round's winner settlement to completion and enable
    /// dead day so the game stays paused until an operator reviews.
    pub async fn recover_stuck_round(&self, round_id: i64, actor: &str) -> OpsResult<()> {
        let diagnosis = self.diagnose_stuck_round(round_id).await?;
        if !diagnosis.is_stuck {
            return Err(OpsError::precondition(format!(
                "round {round_id} is not stuck"
            )));
        }

        let round = self
            .rounds
            .get_round(round_id)
            .await?
            .ok_or_else(|| OpsError::NotFound(format!("round {round_id}")))?;
        let winner_fid = round
            .winner_fid
            .ok_or_else(|| OpsError::precondition("stuck round has no recorded winner"))?;

        // Crash windows before allocations were persisted fall back to a
        // single full-pool allocation to the recorded winner.
        if self.rounds.payout_rows(round_id).await?.is_empty() {
            self.rounds
                .insert_payout_allocations(
                    round_id,
                    &[PayoutAllocation {
                        fid: winner_fid,
                        amount_wei: round.prize_pool_wei,
                    }],
                )
                .await?;
        }

        let winner_ref = self.settle_payouts(round_id).await?;
        self.rounds
            .mark_resolved(round_id, &winner_ref, Utc::now().timestamp())
            .await?;
        self.ops
            .append_event(actor, "round_recovered", None, Some(round_id))
            .await?;

        // Safety default: keep the game paused after a recovery. Already
        // enabled counts as done.
        match self
            .ops
            .enable_dead_day(SYSTEM_ACTOR, "auto after recovery", None, Some(round_id))
            .await
        {
            Ok(()) | Err(OpsError::Precondition(_)) => {}
            Err(e) => return Err(e),
        }

        info!(round_id, actor, "🩹 Stuck round recovered, dead day enabled");
        Ok(())
    }

    /// Pay every unsettled allocation, in rank order, and return the rank-1
    /// settlement reference. Stops at the first failure so retries resume
    /// exactly where the last attempt died.
    async fn settle_payouts(&self, round_id: i64) -> OpsResult<String> {
        let rows = self.rounds.payout_rows(round_id).await?;
        let mut winner_ref: Option<String> = None;

        for row in rows {
            if let Some(existing) = row.settlement_ref {
                if row.rank == 1 {
                    winner_ref = Some(existing);
                }
                continue;
            }
            if row.amount_wei == 0 {
                self.rounds
                    .mark_payout_sent(round_id, row.rank, "zero-amount", Utc::now().timestamp())
                    .await?;
                if row.rank == 1 {
                    winner_ref = Some("zero-amount".to_string());
                }
                continue;
            }

            let resolution = timeout(self.call_timeout, self.resolver.resolve(row.fid))
                .await
                .map_err(|_| {
                    OpsError::Resolution(format!("identity resolution timed out for fid {}", row.fid))
                })??;
            let destination = match (resolution.valid, resolution.destination) {
                (true, Some(destination)) => destination,
                _ => {
                    return Err(OpsError::Resolution(resolution.error.unwrap_or_else(|| {
                        format!("winner fid {} unresolvable", row.fid)
                    })))
                }
            };

            let receipt = timeout(
                self.call_timeout,
                self.channel.transfer(&destination, row.amount_wei),
            )
            .await
            .map_err(|_| {
                OpsError::settlement(format!("winner transfer to {destination} timed out"))
            })??;
            if !receipt.confirmed {
                warn!(round_id, rank = row.rank, "winner transfer unconfirmed");
                return Err(OpsError::settlement(format!(
                    "winner transfer not confirmed (ref {})",
                    receipt.reference
                )));
            }

            self.rounds
                .mark_payout_sent(round_id, row.rank, &receipt.reference, Utc::now().timestamp())
                .await?;
            if row.rank == 1 {
                winner_ref = Some(receipt.reference);
            }
        }

        winner_ref.ok_or_else(|| {
            OpsError::Internal(anyhow::anyhow!(
                "round {round_id} has no rank-1 payout allocation"
            ))
        })
    }
}
