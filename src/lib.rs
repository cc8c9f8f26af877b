//! Credit-metered LLM routing engine.
//!
//! Sits between a request-handling layer and upstream model providers:
//! checks tier access, reserves credits before each call, ranks and
//! retries providers by power level and observed health, supports
//! user-supplied (BYOK) provider keys held encrypted at rest, and
//! settles the actual metered cost afterwards.

pub mod access;
pub mod config;
mod error;
pub mod health;
pub mod ledger;
pub mod orchestrator;
pub mod provider;
pub mod router;
pub mod store;
pub mod types;
pub mod vault;

pub use access::{AccessTable, Capabilities, ModelAccessRule, ModelPricing, apply_markup};
pub use config::{ConfigError, ConfigHandle, ConfigSnapshot, EngineConfig, ProviderConfig, TierQuota};
pub use error::{EngineError, ErrorCode};
pub use health::{BreakerConfig, HealthMonitor, HealthStatus, ProviderHealthState};
pub use ledger::{CreditLedger, PreAuth, current_period};
pub use orchestrator::Engine;
pub use provider::{HttpProvider, ProbeReport, Provider, ProviderAuth, ProviderError};
pub use router::{Candidate, DispatchOutcome, RetryPolicy, Router};
pub use store::{
    ByokKeyRow, CostBreakdown, CreditAccount, CreditTransaction, KeyTestStatus, LedgerAudit,
    MonthlyCap, SettleOutcome, SqliteStore, StoreError, TransactionKind, UsageEvent,
};
pub use types::{
    BillingMode, FinishReason, Message, NormalizedRequest, NormalizedResponse, PowerLevel, Role,
    RouteRequest, RouteResponse, TokenUsage, Tier,
};
pub use vault::{ByokVault, VaultError};
