//! Operational state store.
//!
//! Two persisted global flags behind a single mutation contract:
//! - kill switch: emergency halt, set when the active round is cancelled
//! - dead day: let the current round finish, but start no new round
//!
//! Enabling dead day while the kill switch is active is rejected, as is
//! re-enabling an already-enabled flag. Every successful write appends an
//! audit event to the append-only `ops_events` log - the only source of truth
//! for who did what when.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::Db;
use crate::error::{OpsError, OpsResult};

/// Admin-supplied reasons shorter than this are rejected.
pub const MIN_REASON_LEN: usize = 10;
/// Actor recorded for scheduled (non-human) writes.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub enabled: bool,
    pub activated_at: Option<i64>,
    pub reason: Option<String>,
    pub round_id: Option<i64>,
    pub activated_by: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadDayState {
    pub enabled: bool,
    pub activated_at: Option<i64>,
    pub reason: Option<String>,
    pub reopen_at: Option<i64>,
    pub applies_after_round_id: Option<i64>,
    pub activated_by: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationalState {
    pub kill_switch: KillSwitchState,
    pub dead_day: DeadDayState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationalStatus {
    Normal,
    KillSwitchActive,
    DeadDayActive,
    PausedBetweenRounds,
}

/// Pure status derivation; the store feeds it the active-round check.
pub fn derive_status(state: &OperationalState, round_active: bool) -> OperationalStatus {
    if state.kill_switch.enabled {
        OperationalStatus::KillSwitchActive
    } else if state.dead_day.enabled {
        if round_active {
            OperationalStatus::DeadDayActive
        } else {
            OperationalStatus::PausedBetweenRounds
        }
    } else {
        OperationalStatus::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsEvent {
    pub id: String,
    pub ts: i64,
    pub actor: String,
    pub action: String,
    pub reason: Option<String>,
    pub round_id: Option<i64>,
}

#[derive(Clone)]
pub struct OpsStore {
    db: Db,
}

impl OpsStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn state(&self) -> Result<OperationalState> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT kill_enabled, kill_activated_at, kill_reason, kill_round_id, kill_activated_by,
                    dead_enabled, dead_activated_at, dead_reason, dead_reopen_at,
                    dead_applies_after_round_id, dead_activated_by
             FROM ops_state WHERE id = 1",
        )?;
        let state = stmt
            .query_row([], |row| {
                Ok(OperationalState {
                    kill_switch: KillSwitchState {
                        enabled: row.get::<_, i64>(0)? != 0,
                        activated_at: row.get(1)?,
                        reason: row.get(2)?,
                        round_id: row.get(3)?,
                        activated_by: row.get(4)?,
                    },
                    dead_day: DeadDayState {
                        enabled: row.get::<_, i64>(5)? != 0,
                        activated_at: row.get(6)?,
                        reason: row.get(7)?,
                        reopen_at: row.get(8)?,
                        applies_after_round_id: row.get(9)?,
                        activated_by: row.get(10)?,
                    },
                })
            })
            .optional()?;
        // Implicit creation: no row yet means both flags are clear.
        Ok(state.unwrap_or_default())
    }

    /// Derived status; consults the rounds table for the active-round check.
    pub async fn status(&self) -> Result<OperationalStatus> {
        let state = self.state().await?;
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM rounds WHERE status = 'active'",
            [],
            |row| row.get(0),
        )?;
        Ok(derive_status(&state, active > 0))
    }

    pub async fn enable_kill_switch(
        &self,
        actor: &str,
        reason: &str,
        round_id: Option<i64>,
    ) -> OpsResult<()> {
        validate_reason(reason)?;

        // Conditional upsert: the precondition rides inside the write, so two
        // racing enables cannot both pass a separate check. Zero changed rows
        // means some other enable already won.
        let now = Utc::now().timestamp();
        let changed = {
            let conn = self.db.conn();
            let conn = conn.lock().await;
            conn.execute(
                "INSERT INTO ops_state (id, kill_enabled, kill_activated_at, kill_reason,
                                        kill_round_id, kill_activated_by, updated_at)
                 VALUES (1, 1, ?1, ?2, ?3, ?4, ?1)
                 ON CONFLICT(id) DO UPDATE SET
                    kill_enabled = 1,
                    kill_activated_at = ?1,
                    kill_reason = ?2,
                    kill_round_id = ?3,
                    kill_activated_by = ?4,
                    updated_at = ?1
                 WHERE ops_state.kill_enabled = 0",
                params![now, reason, round_id, actor],
            )
            .context("enable kill switch")?
        };
        if changed == 0 {
            return Err(OpsError::precondition("kill switch is already enabled"));
        }

        self.append_event(actor, "kill_switch_enabled", Some(reason), round_id)
            .await?;
        info!(actor, reason, round_id, "🛑 Kill switch ENABLED");
        Ok(())
    }

    pub async fn disable_kill_switch(&self, actor: &str) -> OpsResult<()> {
        let now = Utc::now().timestamp();
        // Round id is read under the same connection guard as the clearing
        // write, before the write nulls it out for the audit trail.
        let (changed, round_id) = {
            let conn = self.db.conn();
            let conn = conn.lock().await;
            let round_id: Option<i64> = conn
                .query_row("SELECT kill_round_id FROM ops_state WHERE id = 1", [], |row| {
                    row.get(0)
                })
                .optional()
                .context("read kill switch round")?
                .flatten();
            let changed = conn
                .execute(
                    "UPDATE ops_state SET kill_enabled = 0, kill_activated_at = NULL,
                            kill_reason = NULL, kill_round_id = NULL, kill_activated_by = NULL,
                            updated_at = ?1
                     WHERE id = 1 AND kill_enabled = 1",
                    params![now],
                )
                .context("disable kill switch")?;
            (changed, round_id)
        };
        if changed == 0 {
            return Err(OpsError::precondition("kill switch is not enabled"));
        }

        self.append_event(actor, "kill_switch_disabled", None, round_id)
            .await?;
        info!(actor, "✅ Kill switch disabled");
        Ok(())
    }

    pub async fn enable_dead_day(
        &self,
        actor: &str,
        reason: &str,
        reopen_at: Option<i64>,
        applies_after_round_id: Option<i64>,
    ) -> OpsResult<()> {
        validate_reason(reason)?;

        // Both preconditions ride inside the write, as in
        // [`Self::enable_kill_switch`]. A fresh row trivially satisfies them.
        let now = Utc::now().timestamp();
        let changed = {
            let conn = self.db.conn();
            let conn = conn.lock().await;
            conn.execute(
                "INSERT INTO ops_state (id, dead_enabled, dead_activated_at, dead_reason,
                                        dead_reopen_at, dead_applies_after_round_id,
                                        dead_activated_by, updated_at)
                 VALUES (1, 1, ?1, ?2, ?3, ?4, ?5, ?1)
                 ON CONFLICT(id) DO UPDATE SET
                    dead_enabled = 1,
                    dead_activated_at = ?1,
                    dead_reason = ?2,
                    dead_reopen_at = ?3,
                    dead_applies_after_round_id = ?4,
                    dead_activated_by = ?5,
                    updated_at = ?1
                 WHERE ops_state.dead_enabled = 0 AND ops_state.kill_enabled = 0",
                params![now, reason, reopen_at, applies_after_round_id, actor],
            )
            .context("enable dead day")?
        };
        if changed == 0 {
            // Refused; re-read only to pick the right message.
            let state = self.state().await?;
            if state.kill_switch.enabled {
                return Err(OpsError::precondition(
                    "cannot enable dead day while the kill switch is active",
                ));
            }
            return Err(OpsError::precondition("dead day is already enabled"));
        }

        self.append_event(actor, "dead_day_enabled", Some(reason), applies_after_round_id)
            .await?;
        info!(actor, reason, reopen_at, "⏸️ Dead day ENABLED");
        Ok(())
    }

    pub async fn disable_dead_day(&self, actor: &str) -> OpsResult<()> {
        let now = Utc::now().timestamp();
        let changed = {
            let conn = self.db.conn();
            let conn = conn.lock().await;
            conn.execute(
                "UPDATE ops_state SET dead_enabled = 0, dead_activated_at = NULL,
                        dead_reason = NULL, dead_reopen_at = NULL,
                        dead_applies_after_round_id = NULL, dead_activated_by = NULL,
                        updated_at = ?1
                 WHERE id = 1 AND dead_enabled = 1",
                params![now],
            )
            .context("disable dead day")?
        };
        if changed == 0 {
            return Err(OpsError::precondition("dead day is not enabled"));
        }

        self.append_event(actor, "dead_day_disabled", None, None).await?;
        info!(actor, "▶️ Dead day disabled");
        Ok(())
    }

    /// Scheduled check: once `reopen_at` has passed, disable dead day as the
    /// system actor. Safe to call repeatedly; a no-op once disabled.
    pub async fn check_dead_day_scheduled_reopen(&self, now: i64) -> OpsResult<bool> {
        let state = self.state().await?;
        if !state.dead_day.enabled {
            return Ok(false);
        }
        let Some(reopen_at) = state.dead_day.reopen_at else {
            return Ok(false);
        };
        if now < reopen_at {
            return Ok(false);
        }

        match self.disable_dead_day(SYSTEM_ACTOR).await {
            Ok(()) => {
                info!(reopen_at, "⏰ Dead day reopened on schedule");
                Ok(true)
            }
            // Someone disabled it between our read and the write.
            Err(OpsError::Precondition(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn append_event(
        &self,
        actor: &str,
        action: &str,
        reason: Option<&str>,
        round_id: Option<i64>,
    ) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT INTO ops_events (id, ts, actor, action, reason, round_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                Utc::now().timestamp(),
                actor,
                action,
                reason,
                round_id,
            ],
        )
        .context("append ops event")?;
        Ok(())
    }

    pub async fn recent_events(&self, limit: usize) -> Result<Vec<OpsEvent>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, ts, actor, action, reason, round_id
             FROM ops_events ORDER BY ts DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(OpsEvent {
                id: row.get(0)?,
                ts: row.get(1)?,
                actor: row.get(2)?,
                action: row.get(3)?,
                reason: row.get(4)?,
                round_id: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

pub(crate) fn validate_reason(reason: &str) -> OpsResult<()> {
    if reason.trim().len() < MIN_REASON_LEN {
        return Err(OpsError::validation(format!(
            "reason must be at least {MIN_REASON_LEN} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> OpsStore {
        OpsStore::new(Db::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn state_defaults_to_clear_before_first_write() {
        let ops = store();
        let state = ops.state().await.unwrap();
        assert!(!state.kill_switch.enabled);
        assert!(!state.dead_day.enabled);
        assert_eq!(ops.status().await.unwrap(), OperationalStatus::Normal);
    }

    #[tokio::test]
    async fn kill_switch_enable_is_rejected_when_already_enabled() {
        let ops = store();
        ops.enable_kill_switch("admin:alice", "contract exploit suspected", Some(7))
            .await
            .unwrap();
        let err = ops
            .enable_kill_switch("admin:bob", "duplicate trigger attempt", None)
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::Precondition(_)));

        let state = ops.state().await.unwrap();
        assert_eq!(state.kill_switch.activated_by.as_deref(), Some("admin:alice"));
        assert_eq!(state.kill_switch.round_id, Some(7));
    }

    #[tokio::test]
    async fn dead_day_is_rejected_while_kill_switch_active() {
        let ops = store();
        ops.enable_kill_switch("admin:alice", "halting for investigation", None)
            .await
            .unwrap();
        let err = ops
            .enable_dead_day("admin:alice", "scheduled maintenance", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::Precondition(_)));
    }

    #[tokio::test]
    async fn simultaneous_enables_admit_exactly_one_winner() {
        let ops = store();
        let a = ops.clone();
        let b = ops.clone();
        let (ra, rb) = tokio::join!(
            a.enable_kill_switch("admin:alice", "first emergency trigger", Some(1)),
            b.enable_kill_switch("admin:bob", "competing emergency trigger", Some(2)),
        );
        assert!(ra.is_ok() ^ rb.is_ok());
        let loser = if ra.is_ok() { rb } else { ra };
        assert!(matches!(loser.unwrap_err(), OpsError::Precondition(_)));

        // One winner, one audit event, and the winner's fields intact.
        let events = ops.recent_events(10).await.unwrap();
        assert_eq!(
            events.iter().filter(|e| e.action == "kill_switch_enabled").count(),
            1
        );
        let state = ops.state().await.unwrap();
        let winner = events.first().unwrap();
        assert_eq!(state.kill_switch.activated_by.as_deref(), Some(winner.actor.as_str()));
        assert_eq!(state.kill_switch.round_id, winner.round_id);
    }

    #[tokio::test]
    async fn simultaneous_dead_day_enables_admit_exactly_one_winner() {
        let ops = store();
        let a = ops.clone();
        let b = ops.clone();
        let (ra, rb) = tokio::join!(
            a.enable_dead_day("admin:alice", "maintenance window tonight", None, None),
            b.enable_dead_day("admin:bob", "competing maintenance window", None, None),
        );
        assert!(ra.is_ok() ^ rb.is_ok());

        let events = ops.recent_events(10).await.unwrap();
        assert_eq!(
            events.iter().filter(|e| e.action == "dead_day_enabled").count(),
            1
        );
        let state = ops.state().await.unwrap();
        assert_eq!(
            state.dead_day.activated_by.as_deref(),
            Some(events.first().unwrap().actor.as_str())
        );
    }

    #[tokio::test]
    async fn simultaneous_disables_admit_exactly_one_winner() {
        let ops = store();
        ops.enable_kill_switch("admin:alice", "contract exploit suspected", Some(7))
            .await
            .unwrap();

        let a = ops.clone();
        let b = ops.clone();
        let (ra, rb) = tokio::join!(
            a.disable_kill_switch("admin:alice"),
            b.disable_kill_switch("admin:bob"),
        );
        assert!(ra.is_ok() ^ rb.is_ok());

        let events = ops.recent_events(10).await.unwrap();
        assert_eq!(
            events.iter().filter(|e| e.action == "kill_switch_disabled").count(),
            1
        );
        assert!(!ops.state().await.unwrap().kill_switch.enabled);
    }

    #[tokio::test]
    async fn short_reason_is_a_validation_error() {
        let ops = store();
        let err = ops.enable_kill_switch("admin:alice", "bad", None).await.unwrap_err();
        assert!(matches!(err, OpsError::Validation(_)));
        assert!(!ops.state().await.unwrap().kill_switch.enabled);
    }

    #[tokio::test]
    async fn disable_without_enable_is_a_precondition_error() {
        let ops = store();
        assert!(matches!(
            ops.disable_kill_switch("admin:alice").await.unwrap_err(),
            OpsError::Precondition(_)
        ));
        assert!(matches!(
            ops.disable_dead_day("admin:alice").await.unwrap_err(),
            OpsError::Precondition(_)
        ));
    }

    #[tokio::test]
    async fn status_distinguishes_dead_day_with_and_without_active_round() {
        let ops = store();
        ops.enable_dead_day("admin:alice", "maintenance window tonight", None, None)
            .await
            .unwrap();
        // No active round in the table.
        assert_eq!(
            ops.status().await.unwrap(),
            OperationalStatus::PausedBetweenRounds
        );

        {
            let conn = ops.db.conn();
            let conn = conn.lock().await;
            conn.execute(
                "INSERT INTO rounds (status, created_at) VALUES ('active', 0)",
                [],
            )
            .unwrap();
        }
        assert_eq!(ops.status().await.unwrap(), OperationalStatus::DeadDayActive);
    }

    #[tokio::test]
    async fn scheduled_reopen_disables_once_and_is_then_a_noop() {
        let ops = store();
        let reopen_at = Utc::now().timestamp() - 60;
        ops.enable_dead_day("admin:alice", "pause until tomorrow", Some(reopen_at), None)
            .await
            .unwrap();

        assert!(ops.check_dead_day_scheduled_reopen(Utc::now().timestamp()).await.unwrap());
        assert!(!ops.state().await.unwrap().dead_day.enabled);

        // Repeat calls do nothing.
        assert!(!ops.check_dead_day_scheduled_reopen(Utc::now().timestamp()).await.unwrap());
        assert!(!ops.check_dead_day_scheduled_reopen(Utc::now().timestamp()).await.unwrap());
    }

    #[tokio::test]
    async fn reopen_in_the_future_does_not_fire() {
        let ops = store();
        let reopen_at = Utc::now().timestamp() + 3600;
        ops.enable_dead_day("admin:alice", "pause until tomorrow", Some(reopen_at), None)
            .await
            .unwrap();
        assert!(!ops.check_dead_day_scheduled_reopen(Utc::now().timestamp()).await.unwrap());
        assert!(ops.state().await.unwrap().dead_day.enabled);
    }

    #[tokio::test]
    async fn every_write_appends_an_audit_event() {
        let ops = store();
        ops.enable_kill_switch("admin:alice", "contract exploit suspected", Some(3))
            .await
            .unwrap();
        ops.disable_kill_switch("admin:bob").await.unwrap();
        ops.enable_dead_day("admin:bob", "maintenance window tonight", None, None)
            .await
            .unwrap();
        ops.disable_dead_day("admin:alice").await.unwrap();

        let events = ops.recent_events(10).await.unwrap();
        assert_eq!(events.len(), 4);
        let actions: Vec<&str> = events.iter().map(|e| e.action.as_str()).collect();
        assert!(actions.contains(&"kill_switch_enabled"));
        assert!(actions.contains(&"kill_switch_disabled"));
        assert!(actions.contains(&"dead_day_enabled"));
        assert!(actions.contains(&"dead_day_disabled"));

        let enabled = events
            .iter()
            .find(|e| e.action == "kill_switch_enabled")
            .unwrap();
        assert_eq!(enabled.actor, "admin:alice");
        assert_eq!(enabled.round_id, Some(3));
    }
}
