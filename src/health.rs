use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::provider::{Provider, ProviderAuth};
use crate::store::{ProviderHealthRow, SqliteStore};

const EWMA_ALPHA: f64 = 0.2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    CircuitOpen,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::CircuitOpen => "circuit_open",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderHealthState {
    pub provider_id: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_probe_at_ms: u64,
    pub last_success_at_ms: Option<u64>,
    pub latency_ewma_ms: Option<f64>,
    /// When the open circuit becomes eligible for its half-open probe.
    pub cooldown_until_ms: Option<u64>,
}

impl ProviderHealthState {
    fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_probe_at_ms: 0,
            last_success_at_ms: None,
            latency_ewma_ms: None,
            cooldown_until_ms: None,
        }
    }

    fn to_row(&self) -> ProviderHealthRow {
        ProviderHealthRow {
            provider_id: self.provider_id.clone(),
            status: self.status.as_str().to_string(),
            consecutive_failures: self.consecutive_failures,
            last_probe_at_ms: self.last_probe_at_ms,
            last_success_at_ms: self.last_success_at_ms,
            latency_ewma_ms: self.latency_ewma_ms,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
    pub probe_interval_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_seconds: 30,
            probe_interval_seconds: 10,
        }
    }
}

/// Single-writer circuit-breaker registry. The probe loop is the only
/// writer; the router reads last-known state and tolerates one cycle of
/// staleness, so no per-read locking is needed beyond the RwLock.
#[derive(Clone)]
pub struct HealthMonitor {
    states: Arc<RwLock<HashMap<String, ProviderHealthState>>>,
    config: BreakerConfig,
    store: Option<SqliteStore>,
}

impl HealthMonitor {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
            config,
            store: None,
        }
    }

    /// Persists each state change so health survives restarts.
    pub fn with_store(mut self, store: SqliteStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Whether the router may send traffic to this provider. Open
    /// circuits receive no routed traffic; recovery happens only through
    /// the monitor's half-open probe.
    pub fn is_routable(&self, provider_id: &str) -> bool {
        self.states
            .read()
            .map(|states| {
                states
                    .get(provider_id)
                    .map(|s| s.status != HealthStatus::CircuitOpen)
                    .unwrap_or(true)
            })
            .unwrap_or(true)
    }

    pub fn latency_ewma_ms(&self, provider_id: &str) -> Option<f64> {
        self.states
            .read()
            .ok()
            .and_then(|states| states.get(provider_id).and_then(|s| s.latency_ewma_ms))
    }

    pub fn state(&self, provider_id: &str) -> Option<ProviderHealthState> {
        self.states
            .read()
            .ok()
            .and_then(|states| states.get(provider_id).cloned())
    }

    pub fn snapshot(&self) -> Vec<ProviderHealthState> {
        let mut out: Vec<ProviderHealthState> = self
            .states
            .read()
            .map(|states| states.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        out
    }

    pub async fn record_probe_success(&self, provider_id: &str, latency_ms: u64, now_ms: u64) {
        let row = {
            let mut states = match self.states.write() {
                Ok(states) => states,
                Err(_) => return,
            };
            let state = states
                .entry(provider_id.to_string())
                .or_insert_with(|| ProviderHealthState::new(provider_id));

            if state.status != HealthStatus::Healthy {
                debug!(provider_id, from = state.status.as_str(), "provider recovered");
            }
            state.status = HealthStatus::Healthy;
            state.consecutive_failures = 0;
            state.cooldown_until_ms = None;
            state.last_probe_at_ms = now_ms;
            state.last_success_at_ms = Some(now_ms);
            state.latency_ewma_ms = Some(match state.latency_ewma_ms {
                Some(prev) => prev * (1.0 - EWMA_ALPHA) + latency_ms as f64 * EWMA_ALPHA,
                None => latency_ms as f64,
            });
            state.to_row()
        };
        self.persist(&row).await;
    }

    pub async fn record_probe_failure(&self, provider_id: &str, now_ms: u64) {
        let row = {
            let mut states = match self.states.write() {
                Ok(states) => states,
                Err(_) => return,
            };
            let state = states
                .entry(provider_id.to_string())
                .or_insert_with(|| ProviderHealthState::new(provider_id));

            state.last_probe_at_ms = now_ms;
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);

            match state.status {
                HealthStatus::Healthy => {
                    state.status = HealthStatus::Degraded;
                }
                HealthStatus::Degraded => {
                    if state.consecutive_failures >= self.config.failure_threshold {
                        state.status = HealthStatus::CircuitOpen;
                        state.cooldown_until_ms =
                            Some(now_ms.saturating_add(self.config.cooldown_seconds * 1000));
                        warn!(provider_id, failures = state.consecutive_failures, "circuit opened");
                    }
                }
                HealthStatus::CircuitOpen => {
                    // Failed half-open probe: restart the cooldown.
                    state.cooldown_until_ms =
                        Some(now_ms.saturating_add(self.config.cooldown_seconds * 1000));
                }
            }
            state.to_row()
        };
        self.persist(&row).await;
    }

    /// Whether this probe cycle should touch the provider at all. A
    /// circuit_open provider is probed only once per elapsed cooldown
    /// (the half-open probe).
    fn should_probe(&self, provider_id: &str, now_ms: u64) -> bool {
        self.states
            .read()
            .map(|states| match states.get(provider_id) {
                Some(state) if state.status == HealthStatus::CircuitOpen => state
                    .cooldown_until_ms
                    .is_none_or(|until| now_ms >= until),
                _ => true,
            })
            .unwrap_or(true)
    }

    /// Runs one probe cycle over the given providers.
    pub async fn probe_cycle(&self, providers: &[Arc<dyn Provider>]) {
        for provider in providers {
            let now_ms = crate::store::now_millis() as u64;
            if !self.should_probe(provider.id(), now_ms) {
                continue;
            }
            match provider.probe(ProviderAuth::Platform).await {
                Ok(report) => {
                    self.record_probe_success(provider.id(), report.latency_ms, now_ms)
                        .await;
                }
                Err(err) => {
                    debug!(provider_id = provider.id(), error = %err, "probe failed");
                    self.record_probe_failure(provider.id(), now_ms).await;
                }
            }
        }
    }

    /// Spawns the background probe loop. Fully decoupled from request
    /// handling: requests only ever read the last-known state.
    pub fn spawn(&self, providers: Vec<Arc<dyn Provider>>) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        let interval = Duration::from_secs(monitor.config.probe_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.probe_cycle(&providers).await;
            }
        })
    }

    async fn persist(&self, row: &ProviderHealthRow) {
        if let Some(store) = &self.store {
            if let Err(err) = store.upsert_provider_health(row).await {
                warn!(provider_id = %row.provider_id, error = %err, "health persist failed");
            }
        }
    }
}
