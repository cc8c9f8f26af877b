use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::access::apply_markup;
use crate::config::{ConfigHandle, ConfigSnapshot, EngineConfig};
use crate::error::EngineError;
use crate::health::{HealthMonitor, ProviderHealthState};
use crate::ledger::{CreditLedger, PreAuth};
use crate::provider::{HttpProvider, Provider};
use crate::router::{Candidate, DispatchOutcome, Router};
use crate::store::{CostBreakdown, SqliteStore, UsageEvent};
use crate::types::{
    BillingMode, NormalizedRequest, RouteRequest, RouteResponse, TokenUsage,
};
use crate::vault::ByokVault;

const SERVICE_CHAT: &str = "chat";

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

fn generate_request_id() -> String {
    let ts_ms = crate::store::now_millis();
    let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("req-{ts_ms:x}-{seq:04x}")
}

/// Keeps the ledger honest when the caller disappears: if the request
/// future is dropped while a reservation is open, the refund still runs
/// on the runtime. Disarmed once settlement or an explicit refund owns
/// the reservation.
struct RefundGuard {
    ledger: CreditLedger,
    preauth: Option<PreAuth>,
}

impl RefundGuard {
    fn new(ledger: CreditLedger, preauth: Option<PreAuth>) -> Self {
        Self { ledger, preauth }
    }

    fn disarm(&mut self) -> Option<PreAuth> {
        self.preauth.take()
    }
}

impl Drop for RefundGuard {
    fn drop(&mut self) {
        if let Some(preauth) = self.preauth.take() {
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                warn!(reservation_id = %preauth.reservation_id, "reservation orphaned at shutdown");
                return;
            };
            let ledger = self.ledger.clone();
            handle.spawn(async move {
                if let Err(err) = ledger.refund(&preauth, "request cancelled").await {
                    warn!(
                        reservation_id = %preauth.reservation_id,
                        error = %err,
                        "cancellation refund failed"
                    );
                }
            });
        }
    }
}

/// Lifecycle phase of one routed request, in the order phases are
/// reached. Used for structured tracing only; control flow is the
/// `route` body itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Received,
    AccessChecked,
    CreditReserved,
    Routed,
    ProviderCalling,
    Settled,
    Logged,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::Received => "received",
            Phase::AccessChecked => "access_checked",
            Phase::CreditReserved => "credit_reserved",
            Phase::Routed => "routed",
            Phase::ProviderCalling => "provider_calling",
            Phase::Settled => "settled",
            Phase::Logged => "logged",
        }
    }
}

/// Top-level engine. Owns the config handle, ledger, key vault, health
/// monitor and router, and drives each request through the full
/// reserve/dispatch/settle cycle.
pub struct Engine {
    config: ConfigHandle,
    ledger: CreditLedger,
    vault: ByokVault,
    router: Router,
    health: HealthMonitor,
}

impl Engine {
    /// Builds an engine with HTTP adapters for every enabled provider in
    /// the config.
    pub fn new(
        config: EngineConfig,
        store: SqliteStore,
        vault: ByokVault,
    ) -> Result<Self, EngineError> {
        let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
        let attempt_timeout = Duration::from_millis(config.retry.attempt_timeout_ms);
        for pc in config.providers.iter().filter(|p| p.enabled) {
            let api_key = (!pc.api_key.is_empty()).then(|| pc.api_key.clone());
            let provider = HttpProvider::new(&pc.id, &pc.base_url, api_key, attempt_timeout)
                .map_err(|err| EngineError::InvalidRequest {
                    reason: format!("provider {} init failed: {err}", pc.id),
                })?
                .with_headers(pc.headers.clone());
            providers.push(Arc::new(provider));
        }
        Ok(Self::with_providers(config, store, vault, providers))
    }

    /// Same as [`Engine::new`] but with caller-supplied adapters.
    pub fn with_providers(
        config: EngineConfig,
        store: SqliteStore,
        vault: ByokVault,
        providers: Vec<Arc<dyn Provider>>,
    ) -> Self {
        let health = HealthMonitor::new(config.breaker.clone()).with_store(store.clone());
        let retry = config.retry.to_policy();
        let router = Router::new(providers, health.clone(), retry);
        Self {
            config: ConfigHandle::new(config),
            ledger: CreditLedger::new(store),
            vault,
            router,
            health,
        }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn vault(&self) -> &ByokVault {
        &self.vault
    }

    pub fn health_snapshot(&self) -> Vec<ProviderHealthState> {
        self.health.snapshot()
    }

    /// Starts the background health probe loop over the engine's
    /// providers.
    pub fn spawn_health_probes(&self) -> tokio::task::JoinHandle<()> {
        let providers: Vec<Arc<dyn Provider>> = self.router.providers().cloned().collect();
        self.health.spawn(providers)
    }

    /// Runs one health probe pass synchronously. Useful for startup
    /// checks and admin tooling; the background loop does the same thing
    /// on its interval.
    pub async fn probe_providers_once(&self) {
        let providers: Vec<Arc<dyn Provider>> = self.router.providers().cloned().collect();
        self.health.probe_cycle(&providers).await;
    }

    /// Routes one request end to end. On success the actual cost has
    /// been settled and a usage event written; on failure any open
    /// reservation has been refunded in full.
    pub async fn route(&self, request: RouteRequest) -> Result<RouteResponse, EngineError> {
        let request_id = generate_request_id();
        let snapshot = self.config.snapshot();
        let mut phase = Phase::Received;
        debug!(%request_id, user_id = %request.user_id, phase = phase.as_str(), "request received");

        validate(&request)?;

        // Access control against the pinned config snapshot.
        if !snapshot.access.is_allowed(request.tier, &request.model_id) {
            return Err(EngineError::AccessDenied {
                model_id: request.model_id.clone(),
            });
        }
        phase = Phase::AccessChecked;
        debug!(%request_id, phase = phase.as_str(), model_id = %request.model_id, "access granted");

        self.ensure_monthly_allocation(&snapshot, &request).await?;

        let byok_keys = match self.vault.usable_keys(&request.user_id).await {
            Ok(keys) => keys,
            Err(err) => {
                // Degrade to platform billing rather than fail the request.
                warn!(%request_id, error = %err, "byok key lookup failed");
                Vec::new()
            }
        };

        let candidates = self
            .router
            .select_candidates(&snapshot.access, &request, &byok_keys)?;

        // Reserve only when platform billing is possible. A pure-BYOK
        // candidate list touches no credits and needs no account. The
        // candidate list is ranked first because the reservation estimate
        // depends on it, but the route is only committed afterwards.
        let (preauth, unlimited_account) = match platform_estimate(&candidates, &request) {
            Some(estimate) => {
                let account = self.ledger.account(&request.user_id).await?;
                let preauth = self
                    .ledger
                    .pre_authorize(&request.user_id, estimate, SERVICE_CHAT, &request.model_id)
                    .await?;
                phase = Phase::CreditReserved;
                debug!(
                    %request_id,
                    phase = phase.as_str(),
                    reservation_id = %preauth.reservation_id,
                    estimate_micros = estimate,
                    "credits reserved"
                );
                (Some(preauth), account.monthly_cap.is_unlimited())
            }
            None => (None, false),
        };
        phase = Phase::Routed;
        debug!(%request_id, phase = phase.as_str(), candidates = candidates.len(), "route committed");

        // From here until settlement the reservation must be refunded even
        // if the caller drops the request future mid-dispatch.
        let mut guard = RefundGuard::new(self.ledger.clone(), preauth);

        let secrets = self.decrypt_secrets(&request, &candidates).await;
        let normalized = normalize(&request, &candidates);

        phase = Phase::ProviderCalling;
        debug!(%request_id, phase = phase.as_str(), "dispatching");
        let outcome = match self.router.dispatch(&candidates, &normalized, &secrets).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Some(preauth) = guard.disarm() {
                    self.compensate(&request_id, &preauth, &err).await;
                }
                return Err(err);
            }
        };

        let billed = self
            .settle(&request_id, &request, &snapshot, guard.disarm(), &outcome)
            .await?;
        phase = Phase::Settled;
        debug!(%request_id, phase = phase.as_str(), billed_micros = billed.total_micros(), "settled");

        self.log_usage(&request, &outcome, &billed, unlimited_account)
            .await?;
        phase = Phase::Logged;
        info!(
            %request_id,
            phase = phase.as_str(),
            user_id = %request.user_id,
            provider = %outcome.candidate.provider_id,
            model_id = %outcome.candidate.model_id,
            attempts = outcome.attempts,
            latency_ms = outcome.latency_ms,
            billed_micros = billed.total_micros(),
            "request complete"
        );

        Ok(RouteResponse {
            request_id,
            content: outcome.response.content,
            model_id: outcome.candidate.model_id,
            provider: outcome.candidate.provider_id,
            billing_mode: outcome.candidate.billing_mode,
            usage: outcome.response.usage,
            finish_reason: outcome.response.finish_reason,
            billed_micros: billed.total_micros(),
        })
    }

    async fn ensure_monthly_allocation(
        &self,
        snapshot: &ConfigSnapshot,
        request: &RouteRequest,
    ) -> Result<(), EngineError> {
        if let Some(quota) = snapshot.config.quota_for(request.tier) {
            let amount = quota.monthly_credit_micros.unwrap_or(0);
            self.ledger
                .ensure_allocation(&request.user_id, request.tier, amount, quota.monthly_cap())
                .await?;
        }
        Ok(())
    }

    async fn decrypt_secrets(
        &self,
        request: &RouteRequest,
        candidates: &[Candidate],
    ) -> HashMap<String, String> {
        let mut secrets = HashMap::new();
        for candidate in candidates {
            if candidate.billing_mode != BillingMode::Byok {
                continue;
            }
            match self
                .vault
                .get_secret(&request.user_id, &candidate.provider_id)
                .await
            {
                Ok(secret) => {
                    secrets.insert(candidate.provider_id.clone(), secret);
                }
                Err(err) => {
                    warn!(
                        user_id = %request.user_id,
                        provider = %candidate.provider_id,
                        error = %err,
                        "byok secret unavailable, candidate skipped"
                    );
                }
            }
        }
        secrets
    }

    /// Closes the reservation after a successful call. BYOK wins release
    /// the full reservation; platform wins settle the metered cost.
    async fn settle(
        &self,
        request_id: &str,
        request: &RouteRequest,
        snapshot: &ConfigSnapshot,
        preauth: Option<PreAuth>,
        outcome: &DispatchOutcome,
    ) -> Result<CostBreakdown, EngineError> {
        let breakdown = cost_of(&outcome.candidate, outcome.response.usage);
        match outcome.candidate.billing_mode {
            BillingMode::Byok => {
                if let Some(preauth) = &preauth {
                    self.ledger.refund(preauth, "served via user key").await?;
                }
                Ok(CostBreakdown::default())
            }
            BillingMode::Platform => {
                let preauth = match preauth {
                    Some(preauth) => preauth,
                    None => {
                        // Candidate set looked pure-BYOK at selection but a
                        // platform candidate served it. Should not happen;
                        // bill nothing rather than invent a reservation.
                        warn!(%request_id, "platform win without reservation");
                        return Ok(CostBreakdown::default());
                    }
                };
                let metadata = json!({
                    "request_id": request_id,
                    "provider": outcome.candidate.provider_id,
                    "config_version": snapshot.version,
                    "tier": request.tier.as_str(),
                });
                self.ledger
                    .settle(&preauth, breakdown.total_micros(), breakdown, metadata)
                    .await?;
                Ok(breakdown)
            }
        }
    }

    async fn compensate(&self, request_id: &str, preauth: &PreAuth, err: &EngineError) {
        let reason = match err {
            EngineError::AllProvidersExhausted { .. } => "all providers exhausted",
            EngineError::ProviderFatal { .. } => "provider rejected request",
            _ => "dispatch failed",
        };
        match self.ledger.refund(preauth, reason).await {
            Ok(Some(_)) => {
                debug!(%request_id, reservation_id = %preauth.reservation_id, "reservation refunded");
            }
            Ok(None) => {}
            Err(refund_err) => {
                // The reservation stays open; the audit trail still shows
                // it as outstanding rather than silently lost.
                warn!(
                    %request_id,
                    reservation_id = %preauth.reservation_id,
                    error = %refund_err,
                    "refund failed after dispatch error"
                );
            }
        }
    }

    async fn log_usage(
        &self,
        request: &RouteRequest,
        outcome: &DispatchOutcome,
        billed: &CostBreakdown,
        unlimited_account: bool,
    ) -> Result<(), EngineError> {
        let event = UsageEvent {
            user_id: request.user_id.clone(),
            service: SERVICE_CHAT.to_string(),
            model: outcome.candidate.model_id.clone(),
            provider: outcome.candidate.provider_id.clone(),
            tokens_used: outcome.response.usage.total(),
            provider_cost_micros: billed.provider_cost_micros,
            platform_markup_micros: billed.markup_micros,
            total_cost_micros: billed.total_micros(),
            is_free_tier: billed.total_micros() == 0,
            metadata: json!({
                "billing_mode": outcome.candidate.billing_mode,
                "power_level": request.power_level,
                "attempts": outcome.attempts,
                "latency_ms": outcome.latency_ms,
                "input_tokens": outcome.response.usage.input_tokens,
                "output_tokens": outcome.response.usage.output_tokens,
                "unlimited_account": unlimited_account,
            }),
            created_at_ms: crate::store::now_millis() as u64,
        };
        self.ledger.store().insert_usage(&event).await?;
        Ok(())
    }
}

fn validate(request: &RouteRequest) -> Result<(), EngineError> {
    if request.user_id.is_empty() {
        return Err(EngineError::InvalidRequest {
            reason: "user_id must not be empty".to_string(),
        });
    }
    if request.model_id.is_empty() {
        return Err(EngineError::InvalidRequest {
            reason: "model_id must not be empty".to_string(),
        });
    }
    if request.messages.is_empty() {
        return Err(EngineError::InvalidRequest {
            reason: "messages must not be empty".to_string(),
        });
    }
    if request.max_tokens == 0 {
        return Err(EngineError::InvalidRequest {
            reason: "max_tokens must be > 0".to_string(),
        });
    }
    Ok(())
}

fn normalize(request: &RouteRequest, candidates: &[Candidate]) -> NormalizedRequest {
    // All candidates share the resolved model id.
    let model_id = candidates
        .first()
        .map(|c| c.model_id.clone())
        .unwrap_or_else(|| request.model_id.clone());
    NormalizedRequest {
        model_id,
        messages: request.messages.clone(),
        max_tokens: request.max_tokens,
        options: Default::default(),
    }
}

/// Worst-case marked-up cost across the platform-billed candidates, or
/// `None` when every candidate bills through a user key.
fn platform_estimate(candidates: &[Candidate], request: &RouteRequest) -> Option<u64> {
    candidates
        .iter()
        .filter(|c| c.billing_mode == BillingMode::Platform)
        .map(|c| {
            let raw = c
                .pricing
                .cost_micros(request.estimated_input_tokens(), request.max_tokens);
            apply_markup(raw, c.markup_percent)
        })
        .max()
}

/// Actual metered cost of the winning call. BYOK pays no markup and is
/// billed zero by the caller.
fn cost_of(candidate: &Candidate, usage: TokenUsage) -> CostBreakdown {
    let provider_cost_micros = candidate
        .pricing
        .cost_micros(usage.input_tokens, usage.output_tokens);
    let with_markup = apply_markup(provider_cost_micros, candidate.markup_percent);
    CostBreakdown {
        provider_cost_micros,
        markup_micros: with_markup.saturating_sub(provider_cost_micros),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{ModelAccessRule, ModelPricing};
    use crate::config::{ProviderConfig, TierQuota};
    use crate::provider::{ProbeReport, ProviderError};
    use crate::types::{FinishReason, Message, PowerLevel, Role, Tier};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct FixedProvider {
        id: String,
        replies: Mutex<Vec<Result<crate::types::NormalizedResponse, ProviderError>>>,
        seen_auth: Mutex<Vec<bool>>,
    }

    impl FixedProvider {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                replies: Mutex::new(Vec::new()),
                seen_auth: Mutex::new(Vec::new()),
            })
        }

        fn failing(id: &str, err: ProviderError) -> Arc<Self> {
            let p = Self::new(id);
            p.replies.lock().expect("lock").push(Err(err));
            p
        }

        fn saw_byok_auth(&self) -> bool {
            self.seen_auth.lock().expect("lock").iter().any(|b| *b)
        }
    }

    #[async_trait]
    impl Provider for FixedProvider {
        fn id(&self) -> &str {
            &self.id
        }

        async fn call(
            &self,
            _request: &NormalizedRequest,
            auth: crate::provider::ProviderAuth<'_>,
        ) -> Result<crate::types::NormalizedResponse, ProviderError> {
            self.seen_auth
                .lock()
                .expect("lock")
                .push(matches!(auth, crate::provider::ProviderAuth::Byok(_)));
            let mut replies = self.replies.lock().expect("lock");
            if replies.is_empty() {
                Ok(crate::types::NormalizedResponse {
                    content: format!("reply from {}", self.id),
                    usage: TokenUsage {
                        input_tokens: 1_000,
                        output_tokens: 1_000,
                    },
                    finish_reason: FinishReason::Stop,
                })
            } else {
                replies.remove(0)
            }
        }

        async fn probe(
            &self,
            _auth: crate::provider::ProviderAuth<'_>,
        ) -> Result<ProbeReport, ProviderError> {
            Ok(ProbeReport { latency_ms: 1 })
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            providers: vec![ProviderConfig {
                id: "p1".to_string(),
                base_url: "http://localhost".to_string(),
                api_key: "platform-key".to_string(),
                headers: BTreeMap::new(),
                enabled: true,
            }],
            models: vec![ModelAccessRule {
                model_id: "gpt-4o".to_string(),
                provider: "p1".to_string(),
                tier_access: vec![Tier::Starter, Tier::Professional, Tier::Enterprise],
                // 1.5x markup for starter.
                tier_markup: BTreeMap::from([(Tier::Starter, 150u32)]),
                pricing: ModelPricing {
                    input_micros_per_1k: 1_000,
                    output_micros_per_1k: 2_000,
                },
                enabled: true,
                context_length: 128_000,
                capabilities: Default::default(),
                quality: 8,
                deprecated_replacement: None,
            }],
            tiers: BTreeMap::from([
                (
                    Tier::Starter,
                    TierQuota {
                        monthly_credit_micros: Some(1_000_000),
                    },
                ),
                (
                    Tier::Enterprise,
                    TierQuota {
                        monthly_credit_micros: None,
                    },
                ),
            ]),
            retry: Default::default(),
            breaker: Default::default(),
        }
    }

    async fn engine_with(providers: Vec<Arc<dyn Provider>>) -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("metering.sqlite"));
        store.init().await.expect("init");
        let vault = ByokVault::new([7u8; 32], store.clone());
        let engine = Engine::with_providers(test_config(), store, vault, providers);
        (engine, dir)
    }

    fn request() -> RouteRequest {
        RouteRequest {
            user_id: "u1".to_string(),
            tier: Tier::Starter,
            model_id: "gpt-4o".to_string(),
            power_level: PowerLevel::Balanced,
            messages: vec![Message {
                role: Role::User,
                content: "hello".to_string(),
            }],
            max_tokens: 2_000,
            provider_preference: Vec::new(),
            byok_override: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn happy_path_bills_actual_cost_with_markup() {
        let (engine, _dir) = engine_with(vec![FixedProvider::new("p1")]).await;

        let response = engine.route(request()).await.expect("route");
        assert_eq!(response.provider, "p1");
        assert_eq!(response.billing_mode, BillingMode::Platform);
        // 1000 in + 1000 out at 1000/2000 micros per 1k = 3000, x1.5 = 4500.
        assert_eq!(response.billed_micros, 4_500);

        let balance = engine.ledger().balance("u1").await.expect("balance");
        assert_eq!(balance, 1_000_000 - 4_500);

        let audit = engine.ledger().verify("u1").await.expect("verify");
        assert!(audit.consistent);

        let usage = engine
            .ledger()
            .store()
            .list_usage("u1", 10)
            .await
            .expect("usage");
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].total_cost_micros, 4_500);
        assert_eq!(usage[0].platform_markup_micros, 1_500);
        assert!(!usage[0].is_free_tier);
    }

    #[tokio::test]
    async fn dispatch_failure_refunds_the_reservation() {
        let (engine, _dir) = engine_with(vec![FixedProvider::failing(
            "p1",
            ProviderError::Fatal {
                message: "bad request".to_string(),
            },
        )])
        .await;

        let err = engine.route(request()).await.expect_err("fatal");
        assert!(matches!(err, EngineError::ProviderFatal { .. }));

        // Full refund: balance back at the monthly allocation.
        let balance = engine.ledger().balance("u1").await.expect("balance");
        assert_eq!(balance, 1_000_000);
        let audit = engine.ledger().verify("u1").await.expect("verify");
        assert!(audit.consistent);
        assert_eq!(audit.outstanding_reserved_micros, 0);

        // No usage event for a failed request.
        let usage = engine
            .ledger()
            .store()
            .list_usage("u1", 10)
            .await
            .expect("usage");
        assert!(usage.is_empty());
    }

    #[tokio::test]
    async fn byok_request_is_billed_zero_and_uses_the_user_key() {
        let provider = FixedProvider::new("p1");
        let (engine, _dir) = engine_with(vec![provider.clone()]).await;
        engine
            .vault()
            .store_key("u1", "p1", "sk-user-secret")
            .await
            .expect("store key");

        let response = engine.route(request()).await.expect("route");
        assert_eq!(response.billing_mode, BillingMode::Byok);
        assert_eq!(response.billed_micros, 0);
        assert!(provider.saw_byok_auth());

        // Monthly allocation happened but nothing was spent.
        let balance = engine.ledger().balance("u1").await.expect("balance");
        assert_eq!(balance, 1_000_000);
        let audit = engine.ledger().verify("u1").await.expect("verify");
        assert!(audit.consistent);

        let usage = engine
            .ledger()
            .store()
            .list_usage("u1", 10)
            .await
            .expect("usage");
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].total_cost_micros, 0);
        assert!(usage[0].is_free_tier);
    }

    #[tokio::test]
    async fn trial_tier_without_access_is_denied() {
        let (engine, _dir) = engine_with(vec![FixedProvider::new("p1")]).await;
        let mut req = request();
        req.tier = Tier::Trial;

        let err = engine.route(req).await.expect_err("denied");
        assert!(matches!(err, EngineError::AccessDenied { .. }));
    }

    #[tokio::test]
    async fn empty_messages_are_rejected_before_any_billing() {
        let (engine, _dir) = engine_with(vec![FixedProvider::new("p1")]).await;
        let mut req = request();
        req.messages.clear();

        let err = engine.route(req).await.expect_err("invalid");
        assert!(matches!(err, EngineError::InvalidRequest { .. }));
        // No account was created along the way.
        assert!(engine.ledger().account("u1").await.is_err());
    }

    #[tokio::test]
    async fn insufficient_credits_block_the_call() {
        let (engine, _dir) = engine_with(vec![FixedProvider::new("p1")]).await;
        let mut req = request();
        // Estimate far beyond the monthly allocation.
        req.max_tokens = 400_000;
        req.messages[0].content = "x".repeat(4_000);

        let err = engine.route(req).await.expect_err("broke");
        assert!(matches!(err, EngineError::InsufficientCredits { .. }));
    }

    #[tokio::test]
    async fn unlimited_account_usage_is_metered_not_free() {
        let (engine, _dir) = engine_with(vec![FixedProvider::new("p1")]).await;
        let mut req = request();
        req.tier = Tier::Enterprise;

        let response = engine.route(req).await.expect("route");
        // No enterprise markup configured: metered at provider cost.
        assert_eq!(response.billed_micros, 3_000);

        let usage = engine
            .ledger()
            .store()
            .list_usage("u1", 10)
            .await
            .expect("usage");
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].total_cost_micros, 3_000);
        // Unmetered cap, but the traffic itself is not free-tier.
        assert!(!usage[0].is_free_tier);
        assert_eq!(usage[0].metadata["unlimited_account"], serde_json::json!(true));
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("log lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn phases_are_logged_in_lifecycle_order() {
        let (engine, _dir) = engine_with(vec![FixedProvider::new("p1")]).await;

        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        engine.route(request()).await.expect("route");

        let logs = String::from_utf8(buffer.0.lock().expect("log lock").clone()).expect("utf8");
        let positions = [
            "request received",
            "access granted",
            "credits reserved",
            "route committed",
            "dispatching",
            "settled",
            "request complete",
        ]
        .map(|marker| {
            logs.find(marker)
                .unwrap_or_else(|| panic!("missing log marker: {marker}"))
        });
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn request_ids_are_unique() {
        assert_ne!(generate_request_id(), generate_request_id());
    }
}
