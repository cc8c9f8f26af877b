use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::error::EngineError;
use crate::store::{
    CostBreakdown, CreditAccount, CreditTransaction, LedgerAudit, MonthlyCap, SettleOutcome,
    SqliteStore, StoreError,
};
use crate::types::Tier;

static RESERVATION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Time-ordered, collision-free reservation id.
fn generate_reservation_id() -> String {
    let ts_ms = crate::store::now_millis();
    let seq = RESERVATION_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("res-{ts_ms:x}-{seq:04x}")
}

/// Current billing period in `YYYY-MM` form, UTC.
pub fn current_period() -> String {
    let now = time::OffsetDateTime::now_utc();
    format!("{:04}-{:02}", now.year(), u8::from(now.month()))
}

/// Open pre-authorization handle. Exactly one of settle or refund closes
/// it; the second call is a no-op at the storage layer.
#[derive(Clone, Debug)]
pub struct PreAuth {
    pub reservation_id: String,
    pub reserved_micros: u64,
}

/// Domain layer over the ledger tables. Owns reservation ids and the
/// monthly allocation cycle; arithmetic and atomicity live in the store.
#[derive(Clone, Debug)]
pub struct CreditLedger {
    store: SqliteStore,
}

impl CreditLedger {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub async fn account(&self, user_id: &str) -> Result<CreditAccount, EngineError> {
        self.store
            .get_account(user_id)
            .await?
            .ok_or_else(|| EngineError::UnknownAccount {
                user_id: user_id.to_string(),
            })
    }

    pub async fn balance(&self, user_id: &str) -> Result<u64, EngineError> {
        Ok(self.account(user_id).await?.credits_remaining_micros)
    }

    /// Grants the tier's monthly quota for the current period. Calling it
    /// again within the same period is a no-op, so it is safe to run on
    /// every request path.
    pub async fn ensure_allocation(
        &self,
        user_id: &str,
        tier: Tier,
        quota_micros: u64,
        monthly_cap: MonthlyCap,
    ) -> Result<Option<CreditTransaction>, EngineError> {
        let period = current_period();
        let granted = self
            .store
            .allocate(user_id, tier, quota_micros, monthly_cap, &period)
            .await?;
        if let Some(tx) = &granted {
            info!(user_id, %period, amount_micros = tx.amount_micros, "monthly credits allocated");
        }
        Ok(granted)
    }

    pub async fn grant_bonus(
        &self,
        user_id: &str,
        amount_micros: u64,
        reason: &str,
    ) -> Result<CreditTransaction, EngineError> {
        let tx = self.store.grant_bonus(user_id, amount_micros, reason).await?;
        info!(user_id, amount_micros, reason, "bonus credits granted");
        Ok(tx)
    }

    /// Reserves the estimated cost before any provider call. The balance
    /// check and decrement are a single conditional update, so concurrent
    /// requests cannot jointly overdraw.
    pub async fn pre_authorize(
        &self,
        user_id: &str,
        estimated_micros: u64,
        service: &str,
        model: &str,
    ) -> Result<PreAuth, EngineError> {
        let reservation_id = generate_reservation_id();
        match self
            .store
            .reserve_credits(&reservation_id, user_id, estimated_micros, service, model)
            .await
        {
            Ok(()) => {
                debug!(user_id, %reservation_id, estimated_micros, "credits reserved");
                Ok(PreAuth {
                    reservation_id,
                    reserved_micros: estimated_micros,
                })
            }
            Err(StoreError::InsufficientCredits {
                required_micros,
                available_micros,
            }) => Err(EngineError::InsufficientCredits {
                required_micros,
                available_micros,
            }),
            Err(StoreError::UnknownAccount { user_id }) => {
                Err(EngineError::UnknownAccount { user_id })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Replaces the estimate with the actual metered cost. Returns `None`
    /// when the reservation was already settled or refunded.
    pub async fn settle(
        &self,
        preauth: &PreAuth,
        actual_micros: u64,
        breakdown: CostBreakdown,
        metadata: serde_json::Value,
    ) -> Result<Option<SettleOutcome>, EngineError> {
        let outcome = self
            .store
            .settle_reservation(&preauth.reservation_id, actual_micros, breakdown, metadata)
            .await?;
        if let Some(outcome) = &outcome {
            debug!(
                reservation_id = %preauth.reservation_id,
                reserved_micros = outcome.reserved_micros,
                actual_micros = outcome.actual_micros,
                "reservation settled"
            );
        }
        Ok(outcome)
    }

    /// Returns the full reserved amount after a terminal failure. Exactly
    /// once per reservation; later calls return `None`.
    pub async fn refund(
        &self,
        preauth: &PreAuth,
        reason: &str,
    ) -> Result<Option<CreditTransaction>, EngineError> {
        let refunded = self
            .store
            .refund_reservation(&preauth.reservation_id, reason)
            .await?;
        if refunded.is_some() {
            info!(
                reservation_id = %preauth.reservation_id,
                reserved_micros = preauth.reserved_micros,
                reason,
                "reservation refunded"
            );
        }
        Ok(refunded)
    }

    pub async fn transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, EngineError> {
        Ok(self.store.list_transactions(user_id, limit).await?)
    }

    /// Replays the transaction log against the live balance.
    pub async fn verify(&self, user_id: &str) -> Result<LedgerAudit, EngineError> {
        match self.store.verify_user_ledger(user_id).await {
            Ok(audit) => Ok(audit),
            Err(StoreError::UnknownAccount { user_id }) => {
                Err(EngineError::UnknownAccount { user_id })
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TransactionKind;

    async fn ledger() -> (CreditLedger, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("metering.sqlite"));
        store.init().await.expect("init");
        (CreditLedger::new(store), dir)
    }

    #[test]
    fn reservation_ids_are_unique() {
        let a = generate_reservation_id();
        let b = generate_reservation_id();
        assert_ne!(a, b);
        assert!(a.starts_with("res-"));
    }

    #[test]
    fn period_is_year_month() {
        let period = current_period();
        assert_eq!(period.len(), 7);
        assert_eq!(&period[4..5], "-");
    }

    #[tokio::test]
    async fn allocation_is_idempotent_within_a_period() {
        let (ledger, _dir) = ledger().await;
        let first = ledger
            .ensure_allocation("u1", Tier::Starter, 1_000_000, MonthlyCap::Limited(1_000_000))
            .await
            .expect("allocate");
        assert!(first.is_some());

        let second = ledger
            .ensure_allocation("u1", Tier::Starter, 1_000_000, MonthlyCap::Limited(1_000_000))
            .await
            .expect("allocate again");
        assert!(second.is_none());
        assert_eq!(ledger.balance("u1").await.expect("balance"), 1_000_000);
    }

    #[tokio::test]
    async fn pre_authorize_maps_shortfall_to_billing_error() {
        let (ledger, _dir) = ledger().await;
        ledger
            .ensure_allocation("u1", Tier::Trial, 10_000, MonthlyCap::Limited(10_000))
            .await
            .expect("allocate");

        let err = ledger
            .pre_authorize("u1", 50_000, "chat", "gpt-4o")
            .await
            .expect_err("short");
        assert!(matches!(
            err,
            EngineError::InsufficientCredits {
                required_micros: 50_000,
                available_micros: 10_000,
            }
        ));
    }

    #[tokio::test]
    async fn unknown_user_cannot_reserve() {
        let (ledger, _dir) = ledger().await;
        let err = ledger
            .pre_authorize("ghost", 1, "chat", "gpt-4o")
            .await
            .expect_err("unknown");
        assert!(matches!(err, EngineError::UnknownAccount { .. }));
    }

    #[tokio::test]
    async fn settle_cheaper_than_estimate_returns_the_difference() {
        let (ledger, _dir) = ledger().await;
        ledger
            .ensure_allocation("u1", Tier::Starter, 100_000, MonthlyCap::Limited(100_000))
            .await
            .expect("allocate");

        let preauth = ledger
            .pre_authorize("u1", 30_000, "chat", "gpt-4o")
            .await
            .expect("reserve");
        assert_eq!(ledger.balance("u1").await.expect("balance"), 70_000);

        let outcome = ledger
            .settle(
                &preauth,
                12_000,
                CostBreakdown {
                    provider_cost_micros: 10_000,
                    markup_micros: 2_000,
                },
                serde_json::Value::Null,
            )
            .await
            .expect("settle")
            .expect("open reservation");
        assert_eq!(outcome.actual_micros, 12_000);
        assert_eq!(ledger.balance("u1").await.expect("balance"), 88_000);

        // Second settle is a no-op.
        let again = ledger
            .settle(&preauth, 12_000, CostBreakdown::default(), serde_json::Value::Null)
            .await
            .expect("settle again");
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn refund_restores_the_full_reservation_once() {
        let (ledger, _dir) = ledger().await;
        ledger
            .ensure_allocation("u1", Tier::Starter, 100_000, MonthlyCap::Limited(100_000))
            .await
            .expect("allocate");
        let preauth = ledger
            .pre_authorize("u1", 40_000, "chat", "gpt-4o")
            .await
            .expect("reserve");

        let refunded = ledger
            .refund(&preauth, "provider failure")
            .await
            .expect("refund")
            .expect("open reservation");
        assert_eq!(refunded.kind, TransactionKind::Refund);
        assert_eq!(ledger.balance("u1").await.expect("balance"), 100_000);

        let again = ledger.refund(&preauth, "retry").await.expect("refund again");
        assert!(again.is_none());

        let audit = ledger.verify("u1").await.expect("verify");
        assert!(audit.consistent);
    }
}
