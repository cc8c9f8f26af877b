use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Tier;

/// Persistence layer for accounts, the append-only transaction log,
/// reservations, usage events, BYOK key rows and provider health.
///
/// Every balance mutation happens inside a sqlite transaction with a
/// conditional update, so correctness does not depend on in-process
/// locking and holds across multiple service instances sharing the file.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("insufficient credits: required={required_micros} available={available_micros}")]
    InsufficientCredits {
        required_micros: u64,
        available_micros: u64,
    },
    #[error("unknown account: {user_id}")]
    UnknownAccount { user_id: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonthlyCap {
    Unlimited,
    Limited(u64),
}

impl MonthlyCap {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, MonthlyCap::Unlimited)
    }

    fn to_column(self) -> Option<i64> {
        match self {
            MonthlyCap::Unlimited => None,
            MonthlyCap::Limited(v) => Some(u64_to_i64(v)),
        }
    }

    fn from_column(raw: Option<i64>) -> Self {
        match raw {
            None => MonthlyCap::Unlimited,
            Some(v) => MonthlyCap::Limited(i64_to_u64(v)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreditAccount {
    pub user_id: String,
    pub credits_remaining_micros: u64,
    pub credits_allocated_micros: u64,
    pub tier: Tier,
    pub monthly_cap: MonthlyCap,
    pub last_reset_period: Option<String>,
    pub updated_at_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Allocation,
    Deduction,
    Refund,
    Bonus,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Allocation => "allocation",
            TransactionKind::Deduction => "deduction",
            TransactionKind::Refund => "refund",
            TransactionKind::Bonus => "bonus",
        }
    }

    fn parse(raw: &str) -> TransactionKind {
        match raw {
            "allocation" => TransactionKind::Allocation,
            "refund" => TransactionKind::Refund,
            "bonus" => TransactionKind::Bonus,
            _ => TransactionKind::Deduction,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub provider_cost_micros: u64,
    pub markup_micros: u64,
}

impl CostBreakdown {
    pub fn total_micros(&self) -> u64 {
        self.provider_cost_micros.saturating_add(self.markup_micros)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: i64,
    pub user_id: String,
    pub amount_micros: i64,
    pub balance_after_micros: u64,
    pub kind: TransactionKind,
    pub service: String,
    pub model: String,
    pub cost_breakdown: CostBreakdown,
    pub metadata: serde_json::Value,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageEvent {
    pub user_id: String,
    pub service: String,
    pub model: String,
    pub provider: String,
    pub tokens_used: u32,
    pub provider_cost_micros: u64,
    pub platform_markup_micros: u64,
    pub total_cost_micros: u64,
    pub is_free_tier: bool,
    pub metadata: serde_json::Value,
    pub created_at_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyTestStatus {
    Unverified,
    Passed,
    Failed,
}

impl KeyTestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyTestStatus::Unverified => "unverified",
            KeyTestStatus::Passed => "passed",
            KeyTestStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> KeyTestStatus {
        match raw {
            "passed" => KeyTestStatus::Passed,
            "failed" => KeyTestStatus::Failed,
            _ => KeyTestStatus::Unverified,
        }
    }
}

/// Envelope-encrypted BYOK key row. The secret column only ever holds
/// ciphertext; decryption lives in the vault.
#[derive(Clone, Serialize, Deserialize)]
pub struct ByokKeyRow {
    pub user_id: String,
    pub provider: String,
    pub encrypted_secret: String,
    pub enabled: bool,
    pub last_tested_at_ms: Option<u64>,
    pub test_status: KeyTestStatus,
}

impl std::fmt::Debug for ByokKeyRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByokKeyRow")
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("encrypted_secret", &"<redacted>")
            .field("enabled", &self.enabled)
            .field("last_tested_at_ms", &self.last_tested_at_ms)
            .field("test_status", &self.test_status)
            .finish()
    }
}

/// Result of settling a reservation. `transaction` is `None` when the
/// actual cost matched the estimate exactly (no adjustment row needed).
#[derive(Clone, Debug)]
pub struct SettleOutcome {
    pub reserved_micros: u64,
    pub actual_micros: u64,
    pub transaction: Option<CreditTransaction>,
}

/// Replay audit over one user's transaction log.
#[derive(Clone, Debug)]
pub struct LedgerAudit {
    pub transaction_count: usize,
    pub replayed_sum_micros: i128,
    pub balance_micros: u64,
    pub outstanding_reserved_micros: u64,
    pub consistent: bool,
}

/// Persisted provider health row, upserted by the monitor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderHealthRow {
    pub provider_id: String,
    pub status: String,
    pub consecutive_failures: u32,
    pub last_probe_at_ms: u64,
    pub last_success_at_ms: Option<u64>,
    pub latency_ewma_ms: Option<f64>,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    pub async fn get_account(&self, user_id: &str) -> Result<Option<CreditAccount>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<CreditAccount>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            read_account(&conn, &user_id)
        })
        .await?
    }

    /// Idempotent monthly allocation. Creates the account on first call;
    /// a repeat call within the same billing period is a no-op.
    pub async fn allocate(
        &self,
        user_id: &str,
        tier: Tier,
        quota_micros: u64,
        monthly_cap: MonthlyCap,
        period: &str,
    ) -> Result<Option<CreditTransaction>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let period = period.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<Option<CreditTransaction>, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            // Immediate: take the write lock up front so a concurrent
            // writer blocks on busy_timeout instead of failing a deferred
            // lock upgrade.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let existing = read_account_tx(&tx, &user_id)?;
            if let Some(account) = &existing {
                if account.last_reset_period.as_deref() == Some(period.as_str()) {
                    return Ok(None);
                }
            }

            let old_remaining = existing
                .as_ref()
                .map(|a| a.credits_remaining_micros)
                .unwrap_or(0);
            let delta = i128::from(quota_micros) - i128::from(old_remaining);

            tx.execute(
                "INSERT INTO credit_accounts
                     (user_id, credits_remaining, credits_allocated, tier, monthly_cap,
                      last_reset_period, updated_at_ms)
                 VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id) DO UPDATE SET
                     credits_remaining = excluded.credits_remaining,
                     credits_allocated = excluded.credits_allocated,
                     tier = excluded.tier,
                     monthly_cap = excluded.monthly_cap,
                     last_reset_period = excluded.last_reset_period,
                     updated_at_ms = excluded.updated_at_ms",
                rusqlite::params![
                    user_id,
                    u64_to_i64(quota_micros),
                    tier.as_str(),
                    monthly_cap.to_column(),
                    period,
                    ts_ms
                ],
            )?;

            let transaction = insert_transaction(
                &tx,
                &user_id,
                clamp_i128(delta),
                quota_micros,
                TransactionKind::Allocation,
                "platform",
                "",
                CostBreakdown::default(),
                serde_json::json!({ "period": period }),
                ts_ms,
            )?;

            tx.commit()?;
            Ok(Some(transaction))
        })
        .await?
    }

    pub async fn grant_bonus(
        &self,
        user_id: &str,
        amount_micros: u64,
        reason: &str,
    ) -> Result<CreditTransaction, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let reason = reason.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<CreditTransaction, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let account = read_account_tx(&tx, &user_id)?
                .ok_or_else(|| StoreError::UnknownAccount {
                    user_id: user_id.clone(),
                })?;
            let new_remaining = account
                .credits_remaining_micros
                .saturating_add(amount_micros);

            tx.execute(
                "UPDATE credit_accounts
                 SET credits_remaining = ?2, updated_at_ms = ?3
                 WHERE user_id = ?1",
                rusqlite::params![user_id, u64_to_i64(new_remaining), ts_ms],
            )?;

            let transaction = insert_transaction(
                &tx,
                &user_id,
                u64_to_i64(amount_micros),
                new_remaining,
                TransactionKind::Bonus,
                "platform",
                "",
                CostBreakdown::default(),
                serde_json::json!({ "reason": reason }),
                ts_ms,
            )?;

            tx.commit()?;
            Ok(transaction)
        })
        .await?
    }

    /// Atomic pre-authorization: conditional decrement plus a
    /// provisional deduction row, in one transaction. Two concurrent
    /// calls for the same user can never jointly overdraw the account.
    ///
    /// Unlimited-cap accounts skip the sufficiency check and do not
    /// touch the balance; their authoritative (zero-amount) transaction
    /// is written at settlement.
    pub async fn reserve_credits(
        &self,
        reservation_id: &str,
        user_id: &str,
        amount_micros: u64,
        service: &str,
        model: &str,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        let reservation_id = reservation_id.to_string();
        let user_id = user_id.to_string();
        let service = service.to_string();
        let model = model.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let account = read_account_tx(&tx, &user_id)?
                .ok_or_else(|| StoreError::UnknownAccount {
                    user_id: user_id.clone(),
                })?;

            let unlimited = account.monthly_cap.is_unlimited();
            if !unlimited {
                let changed = tx.execute(
                    "UPDATE credit_accounts
                     SET credits_remaining = credits_remaining - ?2,
                         updated_at_ms = ?3
                     WHERE user_id = ?1 AND credits_remaining >= ?2",
                    rusqlite::params![user_id, u64_to_i64(amount_micros), ts_ms],
                )?;
                if changed == 0 {
                    // The failed check itself is not a transaction.
                    return Err(StoreError::InsufficientCredits {
                        required_micros: amount_micros,
                        available_micros: account.credits_remaining_micros,
                    });
                }
            }

            tx.execute(
                "INSERT INTO credit_reservations
                     (reservation_id, user_id, amount, unlimited, service, model, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    reservation_id,
                    user_id,
                    u64_to_i64(amount_micros),
                    unlimited as i64,
                    service,
                    model,
                    ts_ms
                ],
            )?;

            if !unlimited {
                let remaining = account.credits_remaining_micros.saturating_sub(amount_micros);
                insert_transaction(
                    &tx,
                    &user_id,
                    -u64_to_i64(amount_micros),
                    remaining,
                    TransactionKind::Deduction,
                    &service,
                    &model,
                    CostBreakdown::default(),
                    serde_json::json!({
                        "reservation_id": reservation_id,
                        "provisional": true,
                    }),
                    ts_ms,
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await?
    }

    /// Settles a reservation to the actual cost, writing the adjustment
    /// row for the estimate/actual delta. Idempotent: a reservation that
    /// was already settled or refunded returns `None` with no further
    /// ledger effect.
    pub async fn settle_reservation(
        &self,
        reservation_id: &str,
        actual_micros: u64,
        breakdown: CostBreakdown,
        metadata: serde_json::Value,
    ) -> Result<Option<SettleOutcome>, StoreError> {
        let path = self.path.clone();
        let reservation_id = reservation_id.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<Option<SettleOutcome>, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(reservation) = take_reservation(&tx, &reservation_id)? else {
                return Ok(None);
            };

            let account = read_account_tx(&tx, &reservation.user_id)?
                .ok_or_else(|| StoreError::UnknownAccount {
                    user_id: reservation.user_id.clone(),
                })?;

            if reservation.unlimited {
                let transaction = insert_transaction(
                    &tx,
                    &reservation.user_id,
                    0,
                    account.credits_remaining_micros,
                    TransactionKind::Deduction,
                    &reservation.service,
                    &reservation.model,
                    breakdown,
                    merge_reservation_metadata(metadata, &reservation_id, actual_micros),
                    ts_ms,
                )?;
                tx.commit()?;
                return Ok(Some(SettleOutcome {
                    reserved_micros: reservation.amount_micros,
                    actual_micros,
                    transaction: Some(transaction),
                }));
            }

            let reserved = reservation.amount_micros;
            let transaction = if actual_micros == reserved {
                None
            } else if actual_micros < reserved {
                let giveback = reserved - actual_micros;
                let new_remaining = account.credits_remaining_micros.saturating_add(giveback);
                tx.execute(
                    "UPDATE credit_accounts
                     SET credits_remaining = ?2, updated_at_ms = ?3
                     WHERE user_id = ?1",
                    rusqlite::params![reservation.user_id, u64_to_i64(new_remaining), ts_ms],
                )?;
                Some(insert_transaction(
                    &tx,
                    &reservation.user_id,
                    u64_to_i64(giveback),
                    new_remaining,
                    TransactionKind::Refund,
                    &reservation.service,
                    &reservation.model,
                    breakdown,
                    merge_reservation_metadata(metadata, &reservation_id, actual_micros),
                    ts_ms,
                )?)
            } else {
                // Actual exceeded the estimate. Deduct the overage, but
                // never push the balance below zero.
                let overage = actual_micros - reserved;
                let applied = overage.min(account.credits_remaining_micros);
                let new_remaining = account.credits_remaining_micros - applied;
                tx.execute(
                    "UPDATE credit_accounts
                     SET credits_remaining = ?2, updated_at_ms = ?3
                     WHERE user_id = ?1",
                    rusqlite::params![reservation.user_id, u64_to_i64(new_remaining), ts_ms],
                )?;
                let mut metadata =
                    merge_reservation_metadata(metadata, &reservation_id, actual_micros);
                if applied < overage {
                    metadata["uncollected_micros"] =
                        serde_json::json!(overage - applied);
                }
                Some(insert_transaction(
                    &tx,
                    &reservation.user_id,
                    -u64_to_i64(applied),
                    new_remaining,
                    TransactionKind::Deduction,
                    &reservation.service,
                    &reservation.model,
                    breakdown,
                    metadata,
                    ts_ms,
                )?)
            };

            tx.commit()?;
            Ok(Some(SettleOutcome {
                reserved_micros: reserved,
                actual_micros,
                transaction,
            }))
        })
        .await?
    }

    /// Releases a reservation in full, compensating the provisional
    /// deduction. Returns `None` when the reservation no longer exists
    /// (already settled or refunded), so the compensation runs at most
    /// once.
    pub async fn refund_reservation(
        &self,
        reservation_id: &str,
        reason: &str,
    ) -> Result<Option<CreditTransaction>, StoreError> {
        let path = self.path.clone();
        let reservation_id = reservation_id.to_string();
        let reason = reason.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<Option<CreditTransaction>, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(reservation) = take_reservation(&tx, &reservation_id)? else {
                return Ok(None);
            };

            if reservation.unlimited {
                // Nothing was deducted at pre-authorization.
                tx.commit()?;
                return Ok(None);
            }

            let account = read_account_tx(&tx, &reservation.user_id)?
                .ok_or_else(|| StoreError::UnknownAccount {
                    user_id: reservation.user_id.clone(),
                })?;
            let new_remaining = account
                .credits_remaining_micros
                .saturating_add(reservation.amount_micros);

            tx.execute(
                "UPDATE credit_accounts
                 SET credits_remaining = ?2, updated_at_ms = ?3
                 WHERE user_id = ?1",
                rusqlite::params![reservation.user_id, u64_to_i64(new_remaining), ts_ms],
            )?;

            let transaction = insert_transaction(
                &tx,
                &reservation.user_id,
                u64_to_i64(reservation.amount_micros),
                new_remaining,
                TransactionKind::Refund,
                &reservation.service,
                &reservation.model,
                CostBreakdown::default(),
                serde_json::json!({
                    "reservation_id": reservation_id,
                    "reason": reason,
                }),
                ts_ms,
            )?;

            tx.commit()?;
            Ok(Some(transaction))
        })
        .await?
    }

    pub async fn list_transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        tokio::task::spawn_blocking(move || -> Result<Vec<CreditTransaction>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, amount, balance_after, kind, service, model,
                        cost_breakdown_json, metadata_json, created_at_ms
                 FROM credit_transactions
                 WHERE user_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id, limit], row_to_transaction)?;
            collect_transactions(rows)
        })
        .await?
    }

    /// Replays the full transaction log for one user and checks it
    /// against the live balance. Reservations write their provisional
    /// deduction row at reserve time, so the replayed sum must match
    /// the balance directly; the open-reservation total is reported
    /// alongside for operators.
    pub async fn verify_user_ledger(&self, user_id: &str) -> Result<LedgerAudit, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<LedgerAudit, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let account = read_account(&conn, &user_id)?
                .ok_or_else(|| StoreError::UnknownAccount {
                    user_id: user_id.clone(),
                })?;

            let mut stmt = conn.prepare(
                "SELECT id, user_id, amount, balance_after, kind, service, model,
                        cost_breakdown_json, metadata_json, created_at_ms
                 FROM credit_transactions
                 WHERE user_id = ?1
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id], row_to_transaction)?;
            let transactions = collect_transactions(rows)?;

            let mut running: i128 = 0;
            let mut rows_consistent = true;
            for transaction in &transactions {
                running += i128::from(transaction.amount_micros);
                if running < 0 || i128::from(transaction.balance_after_micros) != running {
                    rows_consistent = false;
                }
            }

            let outstanding: i64 = conn.query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM credit_reservations
                 WHERE user_id = ?1 AND unlimited = 0",
                rusqlite::params![user_id],
                |row| row.get(0),
            )?;
            let outstanding = i64_to_u64(outstanding);

            let consistent =
                rows_consistent && running == i128::from(account.credits_remaining_micros);

            Ok(LedgerAudit {
                transaction_count: transactions.len(),
                replayed_sum_micros: running,
                balance_micros: account.credits_remaining_micros,
                outstanding_reserved_micros: outstanding,
                consistent,
            })
        })
        .await?
    }

    pub async fn insert_usage(&self, event: &UsageEvent) -> Result<i64, StoreError> {
        let path = self.path.clone();
        let event = event.clone();
        let metadata_json = serde_json::to_string(&event.metadata)?;
        tokio::task::spawn_blocking(move || -> Result<i64, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO usage_events
                     (user_id, service, model, provider, tokens_used, provider_cost,
                      platform_markup, total_cost, is_free_tier, metadata_json, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    event.user_id,
                    event.service,
                    event.model,
                    event.provider,
                    event.tokens_used,
                    u64_to_i64(event.provider_cost_micros),
                    u64_to_i64(event.platform_markup_micros),
                    u64_to_i64(event.total_cost_micros),
                    event.is_free_tier as i64,
                    metadata_json,
                    event.created_at_ms as i64,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await?
    }

    pub async fn list_usage(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageEvent>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        tokio::task::spawn_blocking(move || -> Result<Vec<UsageEvent>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT user_id, service, model, provider, tokens_used, provider_cost,
                        platform_markup, total_cost, is_free_tier, metadata_json, created_at_ms
                 FROM usage_events
                 WHERE user_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id, limit], row_to_usage)?;
            let mut out = Vec::new();
            for row in rows {
                let (event, metadata_json) = row?;
                let metadata = serde_json::from_str(&metadata_json)?;
                out.push(UsageEvent { metadata, ..event });
            }
            Ok(out)
        })
        .await?
    }

    /// Aggregate for the external reporting layer: event count and total
    /// billed cost for one model.
    pub async fn model_usage_totals(&self, model: &str) -> Result<(u64, u64), StoreError> {
        let path = self.path.clone();
        let model = model.to_string();
        tokio::task::spawn_blocking(move || -> Result<(u64, u64), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let (count, total): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(total_cost), 0)
                 FROM usage_events WHERE model = ?1",
                rusqlite::params![model],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok((i64_to_u64(count), i64_to_u64(total)))
        })
        .await?
    }

    pub async fn upsert_byok_key(&self, row: &ByokKeyRow) -> Result<(), StoreError> {
        let path = self.path.clone();
        let row = row.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO byok_keys
                     (user_id, provider, encrypted_secret, enabled, last_tested_at_ms, test_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id, provider) DO UPDATE SET
                     encrypted_secret = excluded.encrypted_secret,
                     enabled = excluded.enabled,
                     last_tested_at_ms = excluded.last_tested_at_ms,
                     test_status = excluded.test_status",
                rusqlite::params![
                    row.user_id,
                    row.provider,
                    row.encrypted_secret,
                    row.enabled as i64,
                    row.last_tested_at_ms.map(|v| v as i64),
                    row.test_status.as_str(),
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn get_byok_key(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<ByokKeyRow>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let provider = provider.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<ByokKeyRow>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.query_row(
                "SELECT user_id, provider, encrypted_secret, enabled, last_tested_at_ms, test_status
                 FROM byok_keys WHERE user_id = ?1 AND provider = ?2",
                rusqlite::params![user_id, provider],
                row_to_byok,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await?
    }

    pub async fn list_byok_keys(&self, user_id: &str) -> Result<Vec<ByokKeyRow>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<ByokKeyRow>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT user_id, provider, encrypted_secret, enabled, last_tested_at_ms, test_status
                 FROM byok_keys WHERE user_id = ?1 ORDER BY provider",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id], row_to_byok)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }

    pub async fn set_byok_test_status(
        &self,
        user_id: &str,
        provider: &str,
        status: KeyTestStatus,
        tested_at_ms: u64,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let provider = provider.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "UPDATE byok_keys SET test_status = ?3, last_tested_at_ms = ?4
                 WHERE user_id = ?1 AND provider = ?2",
                rusqlite::params![user_id, provider, status.as_str(), tested_at_ms as i64],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn delete_byok_key(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let provider = provider.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let changed = conn.execute(
                "DELETE FROM byok_keys WHERE user_id = ?1 AND provider = ?2",
                rusqlite::params![user_id, provider],
            )?;
            Ok(changed > 0)
        })
        .await?
    }

    pub async fn upsert_provider_health(&self, row: &ProviderHealthRow) -> Result<(), StoreError> {
        let path = self.path.clone();
        let row = row.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO provider_health
                     (provider_id, status, consecutive_failures, last_probe_at_ms,
                      last_success_at_ms, latency_ewma_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(provider_id) DO UPDATE SET
                     status = excluded.status,
                     consecutive_failures = excluded.consecutive_failures,
                     last_probe_at_ms = excluded.last_probe_at_ms,
                     last_success_at_ms = excluded.last_success_at_ms,
                     latency_ewma_ms = excluded.latency_ewma_ms",
                rusqlite::params![
                    row.provider_id,
                    row.status,
                    row.consecutive_failures,
                    row.last_probe_at_ms as i64,
                    row.last_success_at_ms.map(|v| v as i64),
                    row.latency_ewma_ms,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn load_provider_health(&self) -> Result<Vec<ProviderHealthRow>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ProviderHealthRow>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT provider_id, status, consecutive_failures, last_probe_at_ms,
                        last_success_at_ms, latency_ewma_ms
                 FROM provider_health ORDER BY provider_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ProviderHealthRow {
                    provider_id: row.get(0)?,
                    status: row.get(1)?,
                    consecutive_failures: row.get(2)?,
                    last_probe_at_ms: i64_to_u64(row.get(3)?),
                    last_success_at_ms: row.get::<_, Option<i64>>(4)?.map(i64_to_u64),
                    latency_ewma_ms: row.get(5)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }
}

struct ReservationRow {
    user_id: String,
    amount_micros: u64,
    unlimited: bool,
    service: String,
    model: String,
}

fn take_reservation(
    tx: &rusqlite::Transaction<'_>,
    reservation_id: &str,
) -> Result<Option<ReservationRow>, StoreError> {
    let row = tx
        .query_row(
            "SELECT user_id, amount, unlimited, service, model
             FROM credit_reservations WHERE reservation_id = ?1",
            rusqlite::params![reservation_id],
            |row| {
                Ok(ReservationRow {
                    user_id: row.get(0)?,
                    amount_micros: i64_to_u64(row.get(1)?),
                    unlimited: row.get::<_, i64>(2)? != 0,
                    service: row.get(3)?,
                    model: row.get(4)?,
                })
            },
        )
        .optional()?;
    if row.is_some() {
        tx.execute(
            "DELETE FROM credit_reservations WHERE reservation_id = ?1",
            rusqlite::params![reservation_id],
        )?;
    }
    Ok(row)
}

#[allow(clippy::too_many_arguments)]
fn insert_transaction(
    tx: &rusqlite::Transaction<'_>,
    user_id: &str,
    amount_micros: i64,
    balance_after_micros: u64,
    kind: TransactionKind,
    service: &str,
    model: &str,
    breakdown: CostBreakdown,
    metadata: serde_json::Value,
    ts_ms: i64,
) -> Result<CreditTransaction, StoreError> {
    let breakdown_json = serde_json::to_string(&breakdown)?;
    let metadata_json = serde_json::to_string(&metadata)?;
    tx.execute(
        "INSERT INTO credit_transactions
             (user_id, amount, balance_after, kind, service, model,
              cost_breakdown_json, metadata_json, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            user_id,
            amount_micros,
            u64_to_i64(balance_after_micros),
            kind.as_str(),
            service,
            model,
            breakdown_json,
            metadata_json,
            ts_ms
        ],
    )?;
    Ok(CreditTransaction {
        id: tx.last_insert_rowid(),
        user_id: user_id.to_string(),
        amount_micros,
        balance_after_micros,
        kind,
        service: service.to_string(),
        model: model.to_string(),
        cost_breakdown: breakdown,
        metadata,
        created_at_ms: ts_ms as u64,
    })
}

fn merge_reservation_metadata(
    mut metadata: serde_json::Value,
    reservation_id: &str,
    actual_micros: u64,
) -> serde_json::Value {
    if !metadata.is_object() {
        metadata = serde_json::json!({});
    }
    metadata["reservation_id"] = serde_json::json!(reservation_id);
    metadata["settled_micros"] = serde_json::json!(actual_micros);
    metadata
}

fn read_account(
    conn: &rusqlite::Connection,
    user_id: &str,
) -> Result<Option<CreditAccount>, StoreError> {
    conn.query_row(
        "SELECT user_id, credits_remaining, credits_allocated, tier, monthly_cap,
                last_reset_period, updated_at_ms
         FROM credit_accounts WHERE user_id = ?1",
        rusqlite::params![user_id],
        row_to_account,
    )
    .optional()
    .map_err(StoreError::from)
}

fn read_account_tx(
    tx: &rusqlite::Transaction<'_>,
    user_id: &str,
) -> Result<Option<CreditAccount>, StoreError> {
    tx.query_row(
        "SELECT user_id, credits_remaining, credits_allocated, tier, monthly_cap,
                last_reset_period, updated_at_ms
         FROM credit_accounts WHERE user_id = ?1",
        rusqlite::params![user_id],
        row_to_account,
    )
    .optional()
    .map_err(StoreError::from)
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<CreditAccount> {
    let tier_raw: String = row.get(3)?;
    Ok(CreditAccount {
        user_id: row.get(0)?,
        credits_remaining_micros: i64_to_u64(row.get(1)?),
        credits_allocated_micros: i64_to_u64(row.get(2)?),
        tier: Tier::parse(&tier_raw).unwrap_or(Tier::Trial),
        monthly_cap: MonthlyCap::from_column(row.get(4)?),
        last_reset_period: row.get(5)?,
        updated_at_ms: i64_to_u64(row.get(6)?),
    })
}

type TransactionParts = (i64, String, i64, i64, String, String, String, String, String, i64);

fn row_to_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransactionParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn collect_transactions(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<TransactionParts>>,
) -> Result<Vec<CreditTransaction>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        let (id, user_id, amount, balance_after, kind, service, model, breakdown_json, metadata_json, ts) =
            row?;
        out.push(CreditTransaction {
            id,
            user_id,
            amount_micros: amount,
            balance_after_micros: i64_to_u64(balance_after),
            kind: TransactionKind::parse(&kind),
            service,
            model,
            cost_breakdown: serde_json::from_str(&breakdown_json)?,
            metadata: serde_json::from_str(&metadata_json)?,
            created_at_ms: i64_to_u64(ts),
        });
    }
    Ok(out)
}

fn row_to_usage(row: &rusqlite::Row<'_>) -> rusqlite::Result<(UsageEvent, String)> {
    let metadata_json: String = row.get(9)?;
    let event = UsageEvent {
        user_id: row.get(0)?,
        service: row.get(1)?,
        model: row.get(2)?,
        provider: row.get(3)?,
        tokens_used: row.get(4)?,
        provider_cost_micros: i64_to_u64(row.get(5)?),
        platform_markup_micros: i64_to_u64(row.get(6)?),
        total_cost_micros: i64_to_u64(row.get(7)?),
        is_free_tier: row.get::<_, i64>(8)? != 0,
        metadata: serde_json::Value::Null,
        created_at_ms: i64_to_u64(row.get(10)?),
    };
    Ok((event, metadata_json))
}

fn row_to_byok(row: &rusqlite::Row<'_>) -> rusqlite::Result<ByokKeyRow> {
    let status_raw: String = row.get(5)?;
    Ok(ByokKeyRow {
        user_id: row.get(0)?,
        provider: row.get(1)?,
        encrypted_secret: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        last_tested_at_ms: row.get::<_, Option<i64>>(4)?.map(i64_to_u64),
        test_status: KeyTestStatus::parse(&status_raw),
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS credit_accounts (
            user_id TEXT PRIMARY KEY NOT NULL,
            credits_remaining INTEGER NOT NULL DEFAULT 0,
            credits_allocated INTEGER NOT NULL DEFAULT 0,
            tier TEXT NOT NULL,
            monthly_cap INTEGER,
            last_reset_period TEXT,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS credit_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            balance_after INTEGER NOT NULL,
            kind TEXT NOT NULL,
            service TEXT NOT NULL,
            model TEXT NOT NULL,
            cost_breakdown_json TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_credit_transactions_user_created
            ON credit_transactions(user_id, created_at_ms);

        CREATE TABLE IF NOT EXISTS credit_reservations (
            reservation_id TEXT PRIMARY KEY NOT NULL,
            user_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            unlimited INTEGER NOT NULL DEFAULT 0,
            service TEXT NOT NULL,
            model TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_credit_reservations_user
            ON credit_reservations(user_id);

        CREATE TABLE IF NOT EXISTS usage_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            service TEXT NOT NULL,
            model TEXT NOT NULL,
            provider TEXT NOT NULL,
            tokens_used INTEGER NOT NULL,
            provider_cost INTEGER NOT NULL,
            platform_markup INTEGER NOT NULL,
            total_cost INTEGER NOT NULL,
            is_free_tier INTEGER NOT NULL DEFAULT 0,
            metadata_json TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_events_user_created
            ON usage_events(user_id, created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_usage_events_model
            ON usage_events(model, created_at_ms);

        CREATE TABLE IF NOT EXISTS byok_keys (
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            encrypted_secret TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_tested_at_ms INTEGER,
            test_status TEXT NOT NULL DEFAULT 'unverified',
            PRIMARY KEY (user_id, provider)
        );

        CREATE TABLE IF NOT EXISTS provider_health (
            provider_id TEXT PRIMARY KEY NOT NULL,
            status TEXT NOT NULL,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            last_probe_at_ms INTEGER NOT NULL,
            last_success_at_ms INTEGER,
            latency_ewma_ms REAL
        );",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

fn clamp_i128(value: i128) -> i64 {
    if value > i128::from(i64::MAX) {
        i64::MAX
    } else if value < i128::from(i64::MIN) {
        i64::MIN
    } else {
        value as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("metering.sqlite"));
        store.init().await.expect("init");
        (dir, store)
    }

    #[tokio::test]
    async fn allocation_is_idempotent_per_period() {
        let (_dir, store) = store().await;

        let first = store
            .allocate("u1", Tier::Starter, 10_000_000, MonthlyCap::Limited(10_000_000), "2026-08")
            .await
            .expect("allocate");
        assert!(first.is_some());

        let repeat = store
            .allocate("u1", Tier::Starter, 10_000_000, MonthlyCap::Limited(10_000_000), "2026-08")
            .await
            .expect("allocate again");
        assert!(repeat.is_none());

        let transactions = store.list_transactions("u1", 10).await.expect("list");
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].kind, TransactionKind::Allocation);
        assert_eq!(transactions[0].amount_micros, 10_000_000);

        let next_period = store
            .allocate("u1", Tier::Starter, 10_000_000, MonthlyCap::Limited(10_000_000), "2026-09")
            .await
            .expect("allocate next period");
        assert!(next_period.is_some());
    }

    #[tokio::test]
    async fn reserve_fails_without_touching_ledger_when_insufficient() {
        let (_dir, store) = store().await;
        store
            .allocate("u1", Tier::Starter, 10_000, MonthlyCap::Limited(10_000), "2026-08")
            .await
            .expect("allocate");

        let err = store
            .reserve_credits("r1", "u1", 50_000, "chat", "m1")
            .await;
        assert!(matches!(
            err,
            Err(StoreError::InsufficientCredits {
                required_micros: 50_000,
                available_micros: 10_000,
            })
        ));

        // Only the allocation row exists; the failed check is not a transaction.
        let transactions = store.list_transactions("u1", 10).await.expect("list");
        assert_eq!(transactions.len(), 1);
        let account = store.get_account("u1").await.expect("account").expect("some");
        assert_eq!(account.credits_remaining_micros, 10_000);
    }

    #[tokio::test]
    async fn settle_with_no_delta_leaves_single_deduction() {
        let (_dir, store) = store().await;
        store
            .allocate("u1", Tier::Starter, 10_000_000, MonthlyCap::Limited(10_000_000), "2026-08")
            .await
            .expect("allocate");

        store
            .reserve_credits("r1", "u1", 75_000, "chat", "gpt-4o-mini")
            .await
            .expect("reserve");

        let outcome = store
            .settle_reservation("r1", 75_000, CostBreakdown::default(), serde_json::json!({}))
            .await
            .expect("settle")
            .expect("present");
        assert!(outcome.transaction.is_none());

        let account = store.get_account("u1").await.expect("account").expect("some");
        assert_eq!(account.credits_remaining_micros, 9_925_000);

        let transactions = store.list_transactions("u1", 10).await.expect("list");
        let deductions: Vec<_> = transactions
            .iter()
            .filter(|t| t.kind == TransactionKind::Deduction)
            .collect();
        assert_eq!(deductions.len(), 1);
        assert_eq!(deductions[0].amount_micros, -75_000);
    }

    #[tokio::test]
    async fn settle_is_idempotent() {
        let (_dir, store) = store().await;
        store
            .allocate("u1", Tier::Starter, 1_000_000, MonthlyCap::Limited(1_000_000), "2026-08")
            .await
            .expect("allocate");
        store
            .reserve_credits("r1", "u1", 100_000, "chat", "m1")
            .await
            .expect("reserve");

        let first = store
            .settle_reservation("r1", 60_000, CostBreakdown::default(), serde_json::json!({}))
            .await
            .expect("settle");
        assert!(first.is_some());
        let balance_after_first = store
            .get_account("u1")
            .await
            .expect("account")
            .expect("some")
            .credits_remaining_micros;

        let second = store
            .settle_reservation("r1", 60_000, CostBreakdown::default(), serde_json::json!({}))
            .await
            .expect("settle twice");
        assert!(second.is_none());
        let balance_after_second = store
            .get_account("u1")
            .await
            .expect("account")
            .expect("some")
            .credits_remaining_micros;
        assert_eq!(balance_after_first, balance_after_second);
    }

    #[tokio::test]
    async fn settle_cheaper_than_estimate_refunds_delta() {
        let (_dir, store) = store().await;
        store
            .allocate("u1", Tier::Starter, 1_000_000, MonthlyCap::Limited(1_000_000), "2026-08")
            .await
            .expect("allocate");
        store
            .reserve_credits("r1", "u1", 100_000, "chat", "m1")
            .await
            .expect("reserve");

        let outcome = store
            .settle_reservation("r1", 40_000, CostBreakdown::default(), serde_json::json!({}))
            .await
            .expect("settle")
            .expect("present");
        let adjustment = outcome.transaction.expect("adjustment row");
        assert_eq!(adjustment.kind, TransactionKind::Refund);
        assert_eq!(adjustment.amount_micros, 60_000);

        let account = store.get_account("u1").await.expect("account").expect("some");
        assert_eq!(account.credits_remaining_micros, 960_000);
    }

    #[tokio::test]
    async fn settle_dearer_than_estimate_deducts_overage() {
        let (_dir, store) = store().await;
        store
            .allocate("u1", Tier::Starter, 1_000_000, MonthlyCap::Limited(1_000_000), "2026-08")
            .await
            .expect("allocate");
        store
            .reserve_credits("r1", "u1", 100_000, "chat", "m1")
            .await
            .expect("reserve");

        let outcome = store
            .settle_reservation("r1", 130_000, CostBreakdown::default(), serde_json::json!({}))
            .await
            .expect("settle")
            .expect("present");
        let adjustment = outcome.transaction.expect("adjustment row");
        assert_eq!(adjustment.kind, TransactionKind::Deduction);
        assert_eq!(adjustment.amount_micros, -30_000);

        let account = store.get_account("u1").await.expect("account").expect("some");
        assert_eq!(account.credits_remaining_micros, 870_000);

        let audit = store.verify_user_ledger("u1").await.expect("audit");
        assert!(audit.consistent);
    }

    #[tokio::test]
    async fn refund_runs_exactly_once() {
        let (_dir, store) = store().await;
        store
            .allocate("u1", Tier::Starter, 1_000_000, MonthlyCap::Limited(1_000_000), "2026-08")
            .await
            .expect("allocate");
        store
            .reserve_credits("r1", "u1", 100_000, "chat", "m1")
            .await
            .expect("reserve");

        let refund = store
            .refund_reservation("r1", "all providers exhausted")
            .await
            .expect("refund");
        let refund = refund.expect("refund row");
        assert_eq!(refund.kind, TransactionKind::Refund);
        assert_eq!(refund.amount_micros, 100_000);

        let again = store
            .refund_reservation("r1", "all providers exhausted")
            .await
            .expect("refund twice");
        assert!(again.is_none());

        let account = store.get_account("u1").await.expect("account").expect("some");
        assert_eq!(account.credits_remaining_micros, 1_000_000);

        let audit = store.verify_user_ledger("u1").await.expect("audit");
        assert!(audit.consistent);
    }

    #[tokio::test]
    async fn concurrent_reservations_never_overdraw() {
        let (_dir, store) = store().await;
        store
            .allocate("u1", Tier::Starter, 100_000, MonthlyCap::Limited(100_000), "2026-08")
            .await
            .expect("allocate");

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .reserve_credits(&format!("r{i}"), "u1", 30_000, "chat", "m1")
                    .await
            }));
        }

        let mut granted = 0u64;
        for handle in handles {
            if handle.await.expect("join").is_ok() {
                granted += 30_000;
            }
        }
        assert!(granted <= 100_000, "reserved {granted} of 100000");
        assert_eq!(granted, 90_000);

        let account = store.get_account("u1").await.expect("account").expect("some");
        assert_eq!(account.credits_remaining_micros, 100_000 - granted);
    }

    #[tokio::test]
    async fn unlimited_account_skips_balance_but_logs_settlement() {
        let (_dir, store) = store().await;
        store
            .allocate("ent", Tier::Enterprise, 0, MonthlyCap::Unlimited, "2026-08")
            .await
            .expect("allocate");

        store
            .reserve_credits("r1", "ent", 500_000, "chat", "m1")
            .await
            .expect("reserve");

        let outcome = store
            .settle_reservation(
                "r1",
                420_000,
                CostBreakdown {
                    provider_cost_micros: 420_000,
                    markup_micros: 0,
                },
                serde_json::json!({}),
            )
            .await
            .expect("settle")
            .expect("present");
        let row = outcome.transaction.expect("audit row");
        assert_eq!(row.amount_micros, 0);
        assert_eq!(row.cost_breakdown.provider_cost_micros, 420_000);

        let account = store.get_account("ent").await.expect("account").expect("some");
        assert_eq!(account.credits_remaining_micros, 0);

        let audit = store.verify_user_ledger("ent").await.expect("audit");
        assert!(audit.consistent);
    }

    #[tokio::test]
    async fn ledger_replay_detects_consistency() {
        let (_dir, store) = store().await;
        store
            .allocate("u1", Tier::Professional, 5_000_000, MonthlyCap::Limited(5_000_000), "2026-08")
            .await
            .expect("allocate");
        store.grant_bonus("u1", 250_000, "signup promo").await.expect("bonus");
        store
            .reserve_credits("r1", "u1", 75_000, "chat", "m1")
            .await
            .expect("reserve");
        store
            .settle_reservation("r1", 80_000, CostBreakdown::default(), serde_json::json!({}))
            .await
            .expect("settle");

        let audit = store.verify_user_ledger("u1").await.expect("audit");
        assert!(audit.consistent);
        assert_eq!(audit.outstanding_reserved_micros, 0);
        assert_eq!(audit.balance_micros, 5_000_000 + 250_000 - 80_000);

        // An open reservation already holds its provisional deduction in
        // the log, so the replayed sum tracks the balance directly and the
        // hold is only surfaced as outstanding.
        store
            .reserve_credits("r2", "u1", 10_000, "chat", "m1")
            .await
            .expect("reserve open");
        let audit = store.verify_user_ledger("u1").await.expect("audit");
        assert!(audit.consistent);
        assert_eq!(audit.outstanding_reserved_micros, 10_000);
        assert_eq!(audit.balance_micros, 5_000_000 + 250_000 - 80_000 - 10_000);
        assert_eq!(audit.replayed_sum_micros, i128::from(audit.balance_micros));
    }

    #[tokio::test]
    async fn byok_rows_round_trip_and_revoke() {
        let (_dir, store) = store().await;
        let row = ByokKeyRow {
            user_id: "u1".to_string(),
            provider: "openai".to_string(),
            encrypted_secret: "enc1:abcd".to_string(),
            enabled: true,
            last_tested_at_ms: None,
            test_status: KeyTestStatus::Unverified,
        };
        store.upsert_byok_key(&row).await.expect("upsert");

        let loaded = store
            .get_byok_key("u1", "openai")
            .await
            .expect("get")
            .expect("some");
        assert_eq!(loaded.encrypted_secret, "enc1:abcd");
        assert_eq!(loaded.test_status, KeyTestStatus::Unverified);

        store
            .set_byok_test_status("u1", "openai", KeyTestStatus::Passed, 123)
            .await
            .expect("status");
        let loaded = store
            .get_byok_key("u1", "openai")
            .await
            .expect("get")
            .expect("some");
        assert_eq!(loaded.test_status, KeyTestStatus::Passed);
        assert_eq!(loaded.last_tested_at_ms, Some(123));

        assert!(store.delete_byok_key("u1", "openai").await.expect("delete"));
        assert!(!store.delete_byok_key("u1", "openai").await.expect("delete again"));
    }

    #[tokio::test]
    async fn byok_row_debug_redacts_secret() {
        let row = ByokKeyRow {
            user_id: "u1".to_string(),
            provider: "openai".to_string(),
            encrypted_secret: "enc1:topsecret".to_string(),
            enabled: true,
            last_tested_at_ms: None,
            test_status: KeyTestStatus::Unverified,
        };
        let rendered = format!("{row:?}");
        assert!(!rendered.contains("topsecret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn usage_events_append_and_aggregate() {
        let (_dir, store) = store().await;
        let event = UsageEvent {
            user_id: "u1".to_string(),
            service: "chat".to_string(),
            model: "gpt-4o-mini".to_string(),
            provider: "openai".to_string(),
            tokens_used: 420,
            provider_cost_micros: 50_000,
            platform_markup_micros: 25_000,
            total_cost_micros: 75_000,
            is_free_tier: false,
            metadata: serde_json::json!({"request_id": "req-1"}),
            created_at_ms: 1,
        };
        store.insert_usage(&event).await.expect("insert");
        let mut free = event.clone();
        free.total_cost_micros = 0;
        free.platform_markup_micros = 0;
        free.is_free_tier = true;
        store.insert_usage(&free).await.expect("insert free");

        let listed = store.list_usage("u1", 10).await.expect("list");
        assert_eq!(listed.len(), 2);
        assert!(listed[0].is_free_tier);

        let (count, total) = store
            .model_usage_totals("gpt-4o-mini")
            .await
            .expect("totals");
        assert_eq!(count, 2);
        assert_eq!(total, 75_000);
    }
}
