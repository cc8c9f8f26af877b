use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Subscription tier. The derived ordering is the billing hierarchy:
/// access-chain validation relies on `Trial < Starter < Professional <
/// Enterprise`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Trial,
    Starter,
    Professional,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 4] = [
        Tier::Trial,
        Tier::Starter,
        Tier::Professional,
        Tier::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Trial => "trial",
            Tier::Starter => "starter",
            Tier::Professional => "professional",
            Tier::Enterprise => "enterprise",
        }
    }

    pub fn parse(raw: &str) -> Option<Tier> {
        match raw {
            "trial" => Some(Tier::Trial),
            "starter" => Some(Tier::Starter),
            "professional" => Some(Tier::Professional),
            "enterprise" => Some(Tier::Enterprise),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing preference trading off cost, latency and quality.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerLevel {
    Eco,
    #[default]
    Balanced,
    Precision,
    /// Caller supplies an explicit provider order via
    /// `RouteRequest::provider_preference`.
    Custom,
}

/// How the selected provider call is billed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingMode {
    /// Platform credentials; cost is metered against the user's credits
    /// with the tier markup applied.
    Platform,
    /// User-supplied provider key; the user pays the provider directly
    /// and is exempt from platform markup.
    Byok,
}

/// Inbound request from the console's request-handling layer. Session
/// validation has already happened upstream.
#[derive(Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    pub user_id: String,
    pub tier: Tier,
    pub model_id: String,
    #[serde(default)]
    pub power_level: PowerLevel,
    pub messages: Vec<Message>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Provider order for `PowerLevel::Custom`; ignored otherwise.
    #[serde(default)]
    pub provider_preference: Vec<String>,
    /// Forces BYOK billing off for this request even when a key exists.
    #[serde(default)]
    pub byok_override: Option<bool>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_max_tokens() -> u32 {
    1024
}

impl std::fmt::Debug for RouteRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteRequest")
            .field("user_id", &self.user_id)
            .field("tier", &self.tier)
            .field("model_id", &self.model_id)
            .field("power_level", &self.power_level)
            .field("messages", &format_args!("<{} messages>", self.messages.len()))
            .field("max_tokens", &self.max_tokens)
            .field("provider_preference", &self.provider_preference)
            .field("byok_override", &self.byok_override)
            .finish()
    }
}

impl RouteRequest {
    /// Rough input-token estimate used for pre-authorization. Four bytes
    /// per token is the usual planning heuristic; settlement uses the
    /// provider-reported counts.
    pub fn estimated_input_tokens(&self) -> u32 {
        let bytes: usize = self.messages.iter().map(|m| m.content.len()).sum();
        let tokens = bytes / 4 + 1;
        u32::try_from(tokens).unwrap_or(u32::MAX)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Provider-neutral outbound call shape. Each adapter maps this onto its
/// own wire protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NormalizedRequest {
    pub model_id: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NormalizedResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Other,
}

/// What the orchestrator hands back to the caller on success.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteResponse {
    pub request_id: String,
    pub content: String,
    pub model_id: String,
    pub provider: String,
    pub billing_mode: BillingMode,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
    /// Total platform-billed cost in credit micros; zero for BYOK and
    /// free-tier traffic.
    pub billed_micros: u64,
}
