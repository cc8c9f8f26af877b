use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::access::{AccessTable, ModelPricing, MARKUP_NONE};
use crate::error::EngineError;
use crate::health::HealthMonitor;
use crate::provider::{Provider, ProviderAuth, ProviderError};
use crate::store::{ByokKeyRow, KeyTestStatus};
use crate::types::{BillingMode, NormalizedRequest, NormalizedResponse, PowerLevel, RouteRequest};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts across all candidates before giving up.
    pub max_attempts: u32,
    /// Attempts against one candidate before falling through to the next.
    pub max_per_provider: u32,
    pub base_backoff_ms: u64,
    pub attempt_timeout_ms: u64,
    pub overall_deadline_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_per_provider: 2,
            base_backoff_ms: 250,
            attempt_timeout_ms: 30_000,
            overall_deadline_ms: 60_000,
        }
    }
}

/// One routable (provider, billing) option for a request, in dispatch
/// order after ranking.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub provider_id: String,
    /// Model after deprecation aliases are resolved.
    pub model_id: String,
    pub billing_mode: BillingMode,
    /// BYOK key present but never validated against the provider.
    pub unverified_byok: bool,
    pub markup_percent: u32,
    pub pricing: ModelPricing,
    pub quality: u8,
    pub context_length: u32,
}

impl Candidate {
    /// Per-1K rate after markup, the eco ranking key.
    fn effective_rate(&self) -> u64 {
        crate::access::apply_markup(self.pricing.blended_micros_per_1k(), self.markup_percent)
    }
}

#[derive(Debug)]
pub struct DispatchOutcome {
    pub candidate: Candidate,
    pub response: NormalizedResponse,
    pub attempts: u32,
    pub latency_ms: u64,
}

pub struct Router {
    providers: HashMap<String, Arc<dyn Provider>>,
    health: HealthMonitor,
    retry: RetryPolicy,
}

impl Router {
    pub fn new(
        providers: Vec<Arc<dyn Provider>>,
        health: HealthMonitor,
        retry: RetryPolicy,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| (p.id().to_string(), p))
            .collect();
        Self {
            providers,
            health,
            retry,
        }
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.values()
    }

    /// Builds the ranked candidate list for a request. Access has already
    /// been granted for the resolved model; this narrows to providers that
    /// are registered and routable, decides billing per provider, and
    /// orders by the request's power level.
    pub fn select_candidates(
        &self,
        access: &AccessTable,
        request: &RouteRequest,
        byok_keys: &[ByokKeyRow],
    ) -> Result<Vec<Candidate>, EngineError> {
        let resolved = access
            .resolve(&request.model_id)
            .ok_or_else(|| EngineError::AccessDenied {
                model_id: request.model_id.clone(),
            })?
            .to_string();

        let rules = access.rules_for(request.tier, &resolved);
        if rules.is_empty() {
            return Err(EngineError::AccessDenied {
                model_id: request.model_id.clone(),
            });
        }

        let byok_enabled = request.byok_override.unwrap_or(true);
        let key_status: HashMap<&str, KeyTestStatus> = if byok_enabled {
            byok_keys
                .iter()
                .map(|k| (k.provider.as_str(), k.test_status))
                .collect()
        } else {
            HashMap::new()
        };

        let mut candidates = Vec::new();
        let mut skipped_unhealthy = 0usize;
        for rule in rules {
            if !self.providers.contains_key(&rule.provider) {
                continue;
            }
            if !self.health.is_routable(&rule.provider) {
                skipped_unhealthy += 1;
                continue;
            }
            let status = key_status.get(rule.provider.as_str()).copied();
            let (billing_mode, markup_percent, unverified_byok) = match status {
                Some(status) => (
                    BillingMode::Byok,
                    MARKUP_NONE,
                    status == KeyTestStatus::Unverified,
                ),
                None => (
                    BillingMode::Platform,
                    access.markup_for(request.tier, &resolved, &rule.provider, false),
                    false,
                ),
            };
            candidates.push(Candidate {
                provider_id: rule.provider.clone(),
                model_id: resolved.clone(),
                billing_mode,
                unverified_byok,
                markup_percent,
                pricing: rule.pricing,
                quality: rule.quality,
                context_length: rule.context_length,
            });
        }

        if candidates.is_empty() {
            if skipped_unhealthy > 0 {
                return Err(EngineError::AllProvidersExhausted {
                    model_id: request.model_id.clone(),
                    attempts: 0,
                });
            }
            return Err(EngineError::AccessDenied {
                model_id: request.model_id.clone(),
            });
        }

        self.rank(&mut candidates, request);
        Ok(candidates)
    }

    fn rank(&self, candidates: &mut [Candidate], request: &RouteRequest) {
        let latency = |c: &Candidate| -> u64 {
            self.health
                .latency_ewma_ms(&c.provider_id)
                .map(|l| l as u64)
                .unwrap_or(u64::MAX)
        };
        match request.power_level {
            PowerLevel::Eco => {
                candidates.sort_by(|a, b| {
                    a.effective_rate()
                        .cmp(&b.effective_rate())
                        .then_with(|| latency(a).cmp(&latency(b)))
                });
            }
            PowerLevel::Balanced => {
                // Equal-weight score over cost and latency, each normalized
                // against the worst candidate. Unknown latency scores as
                // worst so never-probed providers do not jump the queue.
                let max_rate = candidates
                    .iter()
                    .map(Candidate::effective_rate)
                    .max()
                    .unwrap_or(0)
                    .max(1);
                let max_latency = candidates
                    .iter()
                    .filter_map(|c| self.health.latency_ewma_ms(&c.provider_id))
                    .fold(1.0f64, f64::max);
                let score = |c: &Candidate| -> f64 {
                    let cost = c.effective_rate() as f64 / max_rate as f64;
                    let lat = self
                        .health
                        .latency_ewma_ms(&c.provider_id)
                        .map(|l| l / max_latency)
                        .unwrap_or(1.0);
                    cost + lat
                };
                candidates.sort_by(|a, b| {
                    score(a)
                        .total_cmp(&score(b))
                        .then_with(|| a.effective_rate().cmp(&b.effective_rate()))
                });
            }
            PowerLevel::Precision => {
                candidates.sort_by(|a, b| {
                    b.quality
                        .cmp(&a.quality)
                        .then_with(|| b.context_length.cmp(&a.context_length))
                        .then_with(|| a.effective_rate().cmp(&b.effective_rate()))
                });
            }
            PowerLevel::Custom => {
                let position = |c: &Candidate| -> usize {
                    request
                        .provider_preference
                        .iter()
                        .position(|p| p == &c.provider_id)
                        .unwrap_or(usize::MAX)
                };
                candidates.sort_by(|a, b| match position(a).cmp(&position(b)) {
                    Ordering::Equal => latency(a)
                        .cmp(&latency(b))
                        .then_with(|| a.effective_rate().cmp(&b.effective_rate())),
                    other => other,
                });
            }
        }
        // BYOK keys that never passed a live test go last regardless of
        // ranking; the sort above is stable so relative order survives.
        candidates.sort_by_key(|c| c.unverified_byok);
    }

    /// Walks the ranked candidates with the retry budget. Retries with
    /// backoff stay on the same provider; moving to the next candidate
    /// starts fresh. Fatal provider errors abort the whole walk.
    pub async fn dispatch(
        &self,
        candidates: &[Candidate],
        request: &NormalizedRequest,
        byok_secrets: &HashMap<String, String>,
    ) -> Result<DispatchOutcome, EngineError> {
        let started = Instant::now();
        let deadline = Duration::from_millis(self.retry.overall_deadline_ms);
        let mut attempts = 0u32;

        for candidate in candidates {
            let provider = match self.providers.get(&candidate.provider_id) {
                Some(provider) => provider,
                None => continue,
            };
            let secret = match candidate.billing_mode {
                BillingMode::Byok => byok_secrets.get(&candidate.provider_id).map(String::as_str),
                BillingMode::Platform => None,
            };
            if candidate.billing_mode == BillingMode::Byok && secret.is_none() {
                // Key disappeared between selection and dispatch.
                continue;
            }

            for provider_attempt in 0..self.retry.max_per_provider {
                if attempts >= self.retry.max_attempts {
                    return Err(EngineError::AllProvidersExhausted {
                        model_id: request.model_id.clone(),
                        attempts,
                    });
                }
                if started.elapsed() >= deadline {
                    warn!(model_id = %request.model_id, attempts, "routing deadline exceeded");
                    return Err(EngineError::AllProvidersExhausted {
                        model_id: request.model_id.clone(),
                        attempts,
                    });
                }
                if provider_attempt > 0 {
                    let backoff = self
                        .retry
                        .base_backoff_ms
                        .saturating_mul(1u64 << provider_attempt.saturating_sub(1).min(16));
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                attempts += 1;

                let auth = match secret {
                    Some(secret) => ProviderAuth::Byok(secret),
                    None => ProviderAuth::Platform,
                };
                // The attempt may not outlive the overall deadline; an
                // in-flight call is cancelled when the clamped timeout fires.
                let attempt_timeout = Duration::from_millis(self.retry.attempt_timeout_ms)
                    .min(deadline.saturating_sub(started.elapsed()));
                let attempt_started = Instant::now();
                let call = provider.call(request, auth);
                let result = match tokio::time::timeout(attempt_timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout {
                        timeout_ms: attempt_timeout.as_millis() as u64,
                    }),
                };

                match result {
                    Ok(response) => {
                        return Ok(DispatchOutcome {
                            candidate: candidate.clone(),
                            response,
                            attempts,
                            latency_ms: attempt_started.elapsed().as_millis() as u64,
                        });
                    }
                    Err(err) if err.is_transient() => {
                        debug!(
                            provider_id = %candidate.provider_id,
                            attempts,
                            error = %err,
                            "transient provider failure"
                        );
                    }
                    Err(err) => {
                        warn!(provider_id = %candidate.provider_id, error = %err, "fatal provider failure");
                        return Err(EngineError::ProviderFatal {
                            provider: candidate.provider_id.clone(),
                            message: err.to_string(),
                        });
                    }
                }
            }
        }

        Err(EngineError::AllProvidersExhausted {
            model_id: request.model_id.clone(),
            attempts,
        })
    }
}
