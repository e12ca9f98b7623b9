//! Settlement worker.
//!
//! Walks a round's pending refund records and executes each as an external
//! payment, strictly one at a time. A named TTL lock serializes invocations
//! per round: an overlapping cron tick or manual trigger returns immediately
//! with a lock-contention error and zero side effects. Per-record failures
//! (unresolvable payer, rejected or unconfirmed transfer, balance shortfall)
//! mark that record failed and move on; failed records are only retried
//! through the explicit admin retry action. Each record is claimed
//! pending -> processing before any money moves, so a batch resumed after
//! its lock expired cannot re-settle records a newer run already took; a
//! run that loses a claimed record mid-settlement aborts its batch.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::chain::{IdentityResolver, PaymentChannel};
use crate::error::{OpsError, OpsResult};
use crate::lock::{LockStore, SETTLEMENT_LOCK_TTL};
use crate::ops::OpsStore;
use crate::refunds::ledger::{RefundLedger, RefundRecord};
use crate::rounds::RoundStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub total_processed: usize,
    pub sent_count: usize,
    pub failed_count: usize,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct SettlementWorker {
    ledger: RefundLedger,
    rounds: RoundStore,
    ops: OpsStore,
    locks: LockStore,
    channel: Arc<dyn PaymentChannel>,
    resolver: Arc<dyn IdentityResolver>,
    /// Bound on each external call so a hung dependency cannot wedge the
    /// lock past its expiry.
    call_timeout: Duration,
}

impl SettlementWorker {
    pub fn new(
        ledger: RefundLedger,
        rounds: RoundStore,
        ops: OpsStore,
        locks: LockStore,
        channel: Arc<dyn PaymentChannel>,
        resolver: Arc<dyn IdentityResolver>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            rounds,
            ops,
            locks,
            channel,
            resolver,
            call_timeout,
        }
    }

    /// Process all pending refunds for a round under the settlement lock.
    pub async fn process_refunds(&self, round_id: i64) -> OpsResult<BatchOutcome> {
        let lock_name = format!("refunds:{round_id}");
        let acquired = self.locks.acquire(&lock_name, SETTLEMENT_LOCK_TTL).await?;
        if !acquired {
            return Err(OpsError::LockContention(format!(
                "another settlement run holds {lock_name}; skipped with zero work done"
            )));
        }

        // Release on every exit path.
        let result = self.run_batch(round_id).await;
        if let Err(e) = self.locks.release(&lock_name).await {
            error!(round_id, error = %e, "failed to release settlement lock");
        }
        result
    }

    async fn run_batch(&self, round_id: i64) -> OpsResult<BatchOutcome> {
        let pending = self.ledger.pending_refunds(round_id).await?;
        let mut outcome = BatchOutcome::default();

        if pending.is_empty() {
            info!(round_id, "no pending refunds to settle");
            self.maybe_stamp_completed(round_id).await?;
            return Ok(outcome);
        }

        // Best-effort balance pre-check so shortfalls fail fast with the
        // distinguished hint instead of burning channel calls.
        let mut known_balance = match timeout(self.call_timeout, self.channel.operator_balance()).await {
            Ok(Ok(balance)) => Some(balance),
            Ok(Err(e)) => {
                warn!(round_id, error = %e, "operator balance unavailable, relying on channel errors");
                None
            }
            Err(_) => {
                warn!(round_id, "operator balance query timed out");
                None
            }
        };

        info!(round_id, count = pending.len(), "⚙️ Settling pending refunds");

        for record in pending {
            // Claim the record before any money moves. A failed claim means
            // the record left `pending` after this batch's snapshot, i.e. a
            // newer run stole the expired lock and owns it now.
            if !self.ledger.mark_processing(record.id).await? {
                warn!(
                    refund_id = record.id,
                    payer_fid = record.payer_fid,
                    "refund claimed by another run since this batch started, skipping"
                );
                continue;
            }
            outcome.total_processed += 1;
            match self.settle_one(&record, &mut known_balance).await {
                Ok(()) => outcome.sent_count += 1,
                // Losing a record we claimed means the lock itself was lost.
                // Stop here rather than race the new holder record by record.
                Err(e @ OpsError::LockContention(_)) => return Err(e),
                Err(e) => {
                    outcome.failed_count += 1;
                    outcome
                        .errors
                        .push(format!("payer {}: {e}", record.payer_fid));
                }
            }
        }

        self.maybe_stamp_completed(round_id).await?;

        info!(
            round_id,
            sent = outcome.sent_count,
            failed = outcome.failed_count,
            "⚙️ Settlement batch finished"
        );
        Ok(outcome)
    }

    /// Settle a single record the caller already claimed. Any error here has
    /// been written to the record as `failed`, except `LockContention`, which
    /// reports the claim itself was lost and must abort the batch.
    async fn settle_one(
        &self,
        record: &RefundRecord,
        known_balance: &mut Option<u128>,
    ) -> OpsResult<()> {
        if let Some(balance) = known_balance {
            if *balance < record.amount_wei {
                let err = OpsError::balance_shortfall(format!(
                    "operator balance {balance} wei below refund of {} wei",
                    record.amount_wei
                ));
                return Err(self.fail_record(record, err).await);
            }
        }

        let destination = match timeout(self.call_timeout, self.resolver.resolve(record.payer_fid))
            .await
        {
            Ok(Ok(resolution)) if resolution.valid => match resolution.destination {
                Some(destination) => destination,
                None => {
                    let err = OpsError::Resolution(format!(
                        "resolver returned valid but no destination for fid {}",
                        record.payer_fid
                    ));
                    return Err(self.fail_record(record, err).await);
                }
            },
            Ok(Ok(resolution)) => {
                let err = OpsError::Resolution(
                    resolution
                        .error
                        .unwrap_or_else(|| format!("fid {} unresolvable", record.payer_fid)),
                );
                return Err(self.fail_record(record, err).await);
            }
            Ok(Err(e)) => {
                return Err(self.fail_record(record, e).await);
            }
            Err(_) => {
                let err = OpsError::Resolution(format!(
                    "identity resolution timed out for fid {}",
                    record.payer_fid
                ));
                return Err(self.fail_record(record, err).await);
            }
        };

        let receipt = match timeout(
            self.call_timeout,
            self.channel.transfer(&destination, record.amount_wei),
        )
        .await
        {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => {
                return Err(self.fail_record(record, e).await);
            }
            Err(_) => {
                let err = OpsError::settlement(format!(
                    "transfer to {destination} timed out after {:?}",
                    self.call_timeout
                ));
                return Err(self.fail_record(record, err).await);
            }
        };

        // Unconfirmed or reverted is failure, not success.
        if !receipt.confirmed {
            let err = OpsError::settlement(format!(
                "transfer to {destination} not confirmed (ref {})",
                receipt.reference
            ));
            return Err(self.fail_record(record, err).await);
        }

        if let Some(balance) = known_balance {
            *balance = balance.saturating_sub(record.amount_wei);
        }

        if !self
            .ledger
            .mark_sent(record.id, &receipt.reference, Utc::now().timestamp())
            .await?
        {
            return Err(Self::ownership_lost(record));
        }
        info!(
            payer_fid = record.payer_fid,
            amount_wei = record.amount_wei,
            settlement_ref = %receipt.reference,
            "✅ Refund sent"
        );
        Ok(())
    }

    /// Write a failure outcome to a claimed record. A zero-row write means the
    /// record changed status underneath us and the batch no longer owns it.
    async fn fail_record(&self, record: &RefundRecord, err: OpsError) -> OpsError {
        match self.ledger.mark_failed(record.id, &err.to_string()).await {
            Ok(true) => err,
            Ok(false) => Self::ownership_lost(record),
            Err(store_err) => store_err.into(),
        }
    }

    fn ownership_lost(record: &RefundRecord) -> OpsError {
        error!(
            refund_id = record.id,
            payer_fid = record.payer_fid,
            "lost ownership of claimed refund, settlement lock was stolen"
        );
        OpsError::LockContention(format!(
            "lost ownership of refund {} mid-settlement; aborting this batch",
            record.id
        ))
    }

    /// Once nothing remains pending or processing, stamp the round and emit
    /// the completion audit event. Safe to call repeatedly.
    async fn maybe_stamp_completed(&self, round_id: i64) -> OpsResult<()> {
        let summary = self.ledger.refund_summary(round_id).await?;
        if summary.total_count == 0 || summary.pending > 0 || summary.processing > 0 {
            return Ok(());
        }

        let stamped = self
            .rounds
            .stamp_refunds_completed(round_id, Utc::now().timestamp())
            .await?;
        if stamped {
            self.ops
                .append_event(
                    "system",
                    "refunds_completed",
                    Some(&format!(
                        "{} sent, {} failed, {} wei settled",
                        summary.sent, summary.failed, summary.sent_wei
                    )),
                    Some(round_id),
                )
                .await?;
            info!(round_id, sent = summary.sent, failed = summary.failed, "🏁 Refunds completed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{MockPaymentChannel, MockResolver};
    use crate::db::Db;
    use crate::refunds::ledger::RefundStatus;
    use crate::rounds::test_support::cancelled_round_with_purchases;

    const ETH: u128 = 1_000_000_000_000_000_000;

    struct Fixture {
        db: Db,
        ledger: RefundLedger,
        channel: Arc<MockPaymentChannel>,
        resolver: Arc<MockResolver>,
        worker: SettlementWorker,
        round_id: i64,
    }

    async fn fixture(purchases: &[(u64, u128)], balance_wei: u128) -> Fixture {
        let db = Db::open_in_memory().unwrap();
        let round_id = cancelled_round_with_purchases(&db, purchases).await;

        let rounds = RoundStore::new(db.clone());
        let ops = OpsStore::new(db.clone());
        let ledger = RefundLedger::new(db.clone(), rounds.clone(), ops.clone());
        ledger
            .create_refunds_for_round(round_id, "admin:alice")
            .await
            .unwrap();

        let fids: Vec<u64> = purchases.iter().map(|(fid, _)| *fid).collect();
        let channel = Arc::new(MockPaymentChannel::with_balance(balance_wei));
        let resolver = Arc::new(MockResolver::with_fids(&fids));
        let worker = SettlementWorker::new(
            ledger.clone(),
            rounds,
            ops,
            LockStore::new(db.clone()),
            channel.clone(),
            resolver.clone(),
            Duration::from_secs(5),
        );

        Fixture {
            db,
            ledger,
            channel,
            resolver,
            worker,
            round_id,
        }
    }

    #[tokio::test]
    async fn happy_path_sends_all_and_stamps_completion() {
        let fx = fixture(&[(101, ETH), (202, 2 * ETH)], 10 * ETH).await;

        let outcome = fx.worker.process_refunds(fx.round_id).await.unwrap();
        assert_eq!(outcome.total_processed, 2);
        assert_eq!(outcome.sent_count, 2);
        assert_eq!(outcome.failed_count, 0);
        assert!(outcome.errors.is_empty());

        let records = fx.ledger.list_refunds(fx.round_id).await.unwrap();
        assert!(records.iter().all(|r| r.status == RefundStatus::Sent));
        assert!(records.iter().all(|r| r.settlement_ref.is_some()));
        assert_eq!(fx.channel.sent().len(), 2);

        let round = RoundStore::new(fx.db.clone())
            .get_round(fx.round_id)
            .await
            .unwrap()
            .unwrap();
        assert!(round.refunds_completed_at.is_some());
    }

    #[tokio::test]
    async fn unresolvable_payer_fails_that_record_and_continues() {
        let fx = fixture(&[(101, ETH), (202, 2 * ETH)], 10 * ETH).await;
        fx.resolver.forget(101);

        let outcome = fx.worker.process_refunds(fx.round_id).await.unwrap();
        assert_eq!(outcome.sent_count, 1);
        assert_eq!(outcome.failed_count, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("101"));

        let records = fx.ledger.list_refunds(fx.round_id).await.unwrap();
        assert_eq!(records[0].status, RefundStatus::Failed);
        assert_eq!(records[0].retry_count, 1);
        assert!(records[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("no verified address"));
        assert_eq!(records[1].status, RefundStatus::Sent);

        // Mixed outcome: the batch resolved every record, so the round still
        // counts as refunds-complete (nothing pending or processing).
        let round = RoundStore::new(fx.db.clone())
            .get_round(fx.round_id)
            .await
            .unwrap()
            .unwrap();
        assert!(round.refunds_completed_at.is_some());
    }

    #[tokio::test]
    async fn failed_records_are_never_auto_retried() {
        let fx = fixture(&[(101, ETH)], 10 * ETH).await;
        fx.resolver.forget(101);

        fx.worker.process_refunds(fx.round_id).await.unwrap();
        let after_first = fx.ledger.list_refunds(fx.round_id).await.unwrap();
        assert_eq!(after_first[0].status, RefundStatus::Failed);
        assert_eq!(after_first[0].retry_count, 1);

        // A later run must not touch the failed record.
        let outcome = fx.worker.process_refunds(fx.round_id).await.unwrap();
        assert_eq!(outcome.total_processed, 0);
        let after_second = fx.ledger.list_refunds(fx.round_id).await.unwrap();
        assert_eq!(after_second[0].retry_count, 1);

        // Only the explicit admin action brings it back.
        fx.ledger
            .retry_failed_refunds(fx.round_id, "admin:alice")
            .await
            .unwrap();
        let outcome = fx.worker.process_refunds(fx.round_id).await.unwrap();
        assert_eq!(outcome.total_processed, 1);
    }

    #[tokio::test]
    async fn unconfirmed_transfer_is_failure() {
        let fx = fixture(&[(101, ETH)], 10 * ETH).await;
        fx.channel.unconfirm_destination(&format!("0xaddr{:040}", 101u64));

        let outcome = fx.worker.process_refunds(fx.round_id).await.unwrap();
        assert_eq!(outcome.failed_count, 1);
        let record = &fx.ledger.list_refunds(fx.round_id).await.unwrap()[0];
        assert_eq!(record.status, RefundStatus::Failed);
        assert!(record.error_message.as_deref().unwrap().contains("not confirmed"));
    }

    #[tokio::test]
    async fn balance_shortfall_carries_the_distinguished_hint() {
        // Enough for the first refund, not the second.
        let fx = fixture(&[(101, ETH), (202, 5 * ETH)], 2 * ETH).await;

        let outcome = fx.worker.process_refunds(fx.round_id).await.unwrap();
        assert_eq!(outcome.sent_count, 1);
        assert_eq!(outcome.failed_count, 1);

        let records = fx.ledger.list_refunds(fx.round_id).await.unwrap();
        assert_eq!(records[1].status, RefundStatus::Failed);
        assert!(records[1]
            .error_message
            .as_deref()
            .unwrap()
            .contains("top up the operator wallet"));
        // The shortfall never reached the channel.
        assert_eq!(fx.channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn lock_contention_skips_the_batch_with_zero_side_effects() {
        let fx = fixture(&[(101, ETH)], 10 * ETH).await;

        // Simulate a concurrent run holding the lock.
        let other = LockStore::new(fx.db.clone());
        assert!(other
            .acquire(&format!("refunds:{}", fx.round_id), Duration::from_secs(300))
            .await
            .unwrap());

        let err = fx.worker.process_refunds(fx.round_id).await.unwrap_err();
        assert!(matches!(err, OpsError::LockContention(_)));
        assert!(fx.channel.sent().is_empty());
        let records = fx.ledger.list_refunds(fx.round_id).await.unwrap();
        assert_eq!(records[0].status, RefundStatus::Pending);

        // After the holder releases, the worker proceeds.
        other
            .release(&format!("refunds:{}", fx.round_id))
            .await
            .unwrap();
        let outcome = fx.worker.process_refunds(fx.round_id).await.unwrap();
        assert_eq!(outcome.sent_count, 1);
    }

    #[tokio::test]
    async fn concurrent_invocations_do_exactly_one_batch_of_work() {
        let fx = fixture(&[(101, ETH), (202, ETH)], 10 * ETH).await;

        let a = fx.worker.clone();
        let b = fx.worker.clone();
        let round_id = fx.round_id;
        let (ra, rb) = tokio::join!(a.process_refunds(round_id), b.process_refunds(round_id));

        let outcomes = [ra, rb];
        let ok: Vec<_> = outcomes.iter().filter(|r| r.is_ok()).collect();
        let contended: Vec<_> = outcomes
            .iter()
            .filter(|r| matches!(r, Err(OpsError::LockContention(_))))
            .collect();
        // One invocation does the work; depending on interleaving the other
        // either hits the lock or finds nothing left to do.
        assert!(!ok.is_empty());
        assert_eq!(ok.len() + contended.len(), 2);
        assert_eq!(fx.channel.sent().len(), 2);
    }

    /// Payment channel that parks transfers to one destination until released,
    /// standing in for a transfer stalled past the settlement lock TTL.
    struct GatedChannel {
        inner: MockPaymentChannel,
        gate: tokio::sync::Semaphore,
        gated: String,
    }

    #[async_trait::async_trait]
    impl PaymentChannel for GatedChannel {
        async fn transfer(
            &self,
            destination: &str,
            amount_wei: u128,
        ) -> OpsResult<crate::chain::TransferReceipt> {
            if destination == self.gated {
                let _permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|_| OpsError::settlement("gate closed"))?;
            }
            self.inner.transfer(destination, amount_wei).await
        }

        async fn operator_balance(&self) -> OpsResult<u128> {
            self.inner.operator_balance().await
        }
    }

    #[tokio::test]
    async fn stale_batch_cannot_resettle_records_taken_after_lock_expiry() {
        let db = Db::open_in_memory().unwrap();
        let round_id =
            cancelled_round_with_purchases(&db, &[(101, ETH), (202, 2 * ETH)]).await;
        let rounds = RoundStore::new(db.clone());
        let ops = OpsStore::new(db.clone());
        let ledger = RefundLedger::new(db.clone(), rounds.clone(), ops.clone());
        ledger
            .create_refunds_for_round(round_id, "admin:alice")
            .await
            .unwrap();

        let gated = Arc::new(GatedChannel {
            inner: MockPaymentChannel::with_balance(10 * ETH),
            gate: tokio::sync::Semaphore::new(0),
            gated: format!("0xaddr{:040}", 101u64),
        });
        let fresh_channel = Arc::new(MockPaymentChannel::with_balance(10 * ETH));
        let resolver = Arc::new(MockResolver::with_fids(&[101, 202]));

        let stale = SettlementWorker::new(
            ledger.clone(),
            rounds.clone(),
            ops.clone(),
            LockStore::new(db.clone()),
            gated.clone(),
            resolver.clone(),
            Duration::from_secs(60),
        );
        let fresh = SettlementWorker::new(
            ledger.clone(),
            rounds,
            ops,
            LockStore::new(db.clone()),
            fresh_channel.clone(),
            resolver,
            Duration::from_secs(60),
        );

        // The first run claims payer 101 and stalls inside the transfer, with
        // payer 202 still pending in its batch snapshot.
        let stale_run = tokio::spawn(async move { stale.process_refunds(round_id).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let conn = db.conn();
            let conn = conn.lock().await;
            conn.execute("UPDATE locks SET expires_at = 0", []).unwrap();
        }

        // A second run steals the expired lock and settles what is still
        // pending. Payer 101 is mid-flight elsewhere and stays untouched.
        let outcome = fresh.process_refunds(round_id).await.unwrap();
        assert_eq!(outcome.sent_count, 1);
        assert_eq!(fresh_channel.sent().len(), 1);
        assert_eq!(fresh_channel.sent()[0].0, format!("0xaddr{:040}", 202u64));

        // The stalled transfer finishes. The first run keeps the record it
        // claimed but must skip payer 202, already settled by the second run.
        gated.gate.add_permits(1);
        let outcome = stale_run.await.unwrap().unwrap();
        assert_eq!(outcome.total_processed, 1);
        assert_eq!(outcome.sent_count, 1);
        assert_eq!(gated.inner.sent().len(), 1);
        assert_eq!(gated.inner.sent()[0].0, format!("0xaddr{:040}", 101u64));

        // Exactly one transfer per payer across both runs.
        let records = ledger.list_refunds(round_id).await.unwrap();
        assert!(records.iter().all(|r| r.status == RefundStatus::Sent));
        let round = RoundStore::new(db.clone())
            .get_round(round_id)
            .await
            .unwrap()
            .unwrap();
        assert!(round.refunds_completed_at.is_some());
    }

    #[tokio::test]
    async fn sent_plus_outstanding_reconciles_to_total_liability() {
        let fx = fixture(&[(101, ETH), (202, 2 * ETH), (303, 3 * ETH)], 10 * ETH).await;
        fx.resolver.forget(202);

        let liability: u128 = 6 * ETH;

        let before = fx.ledger.refund_summary(fx.round_id).await.unwrap();
        assert_eq!(before.total_wei, liability);

        fx.worker.process_refunds(fx.round_id).await.unwrap();
        let after = fx.ledger.refund_summary(fx.round_id).await.unwrap();
        // Wei sent plus wei still pending/failed always equals the liability.
        let outstanding = after.total_wei - after.sent_wei;
        assert_eq!(after.sent_wei + outstanding, liability);
        assert_eq!(after.sent_wei, 4 * ETH);
        assert_eq!(after.failed, 1);
    }
}
