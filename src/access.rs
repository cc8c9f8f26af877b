use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::types::Tier;

/// Markup is a per-cent multiplier: 100 means 1.0x, 150 means 1.5x.
pub const MARKUP_NONE: u32 = 100;

const MAX_DEPRECATION_HOPS: usize = 8;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelAccessRule {
    pub model_id: String,
    pub provider: String,
    #[serde(default)]
    pub tier_access: Vec<Tier>,
    /// Tier -> markup percent. A tier missing from the map pays no markup.
    #[serde(default)]
    pub tier_markup: BTreeMap<Tier, u32>,
    pub pricing: ModelPricing,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub context_length: u32,
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Declared quality rank used by precision routing; higher is better.
    #[serde(default)]
    pub quality: u8,
    #[serde(default)]
    pub deprecated_replacement: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Credit micros per 1K input tokens, before markup.
    pub input_micros_per_1k: u64,
    /// Credit micros per 1K output tokens, before markup.
    pub output_micros_per_1k: u64,
}

impl ModelPricing {
    pub fn cost_micros(&self, input_tokens: u32, output_tokens: u32) -> u64 {
        let input = u64::from(input_tokens)
            .saturating_mul(self.input_micros_per_1k)
            / 1000;
        let output = u64::from(output_tokens)
            .saturating_mul(self.output_micros_per_1k)
            / 1000;
        input.saturating_add(output)
    }

    /// Combined per-1K rate used for cost ranking.
    pub fn blended_micros_per_1k(&self) -> u64 {
        self.input_micros_per_1k
            .saturating_add(self.output_micros_per_1k)
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub function_calling: bool,
    #[serde(default)]
    pub streaming: bool,
}

/// Applies a per-cent markup with integer arithmetic, rounding half up.
pub fn apply_markup(cost_micros: u64, markup_percent: u32) -> u64 {
    let scaled = u128::from(cost_micros) * u128::from(markup_percent);
    let rounded = (scaled + 50) / 100;
    u64::try_from(rounded).unwrap_or(u64::MAX)
}

impl ModelAccessRule {
    pub fn allows(&self, tier: Tier) -> bool {
        self.enabled && self.tier_access.contains(&tier)
    }

    pub fn markup_percent(&self, tier: Tier) -> u32 {
        self.tier_markup.get(&tier).copied().unwrap_or(MARKUP_NONE)
    }
}

/// Immutable view over the loaded rule set. Built once per config
/// snapshot and shared read-only across requests.
#[derive(Clone, Debug, Default)]
pub struct AccessTable {
    rules: HashMap<String, Vec<ModelAccessRule>>,
}

impl AccessTable {
    /// Builds the table and returns load-time validation warnings. A
    /// rule set whose `tier_access` is not upward-closed over the tier
    /// ordering is legal but almost always a misconfiguration.
    pub fn load(rules: Vec<ModelAccessRule>) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();
        let mut by_model: HashMap<String, Vec<ModelAccessRule>> = HashMap::new();

        for rule in rules {
            if let Some(gap) = tier_chain_gap(&rule.tier_access) {
                warnings.push(format!(
                    "rule {}/{}: tier_access includes {} but omits higher tier {}",
                    rule.model_id, rule.provider, gap.0, gap.1
                ));
            }
            by_model.entry(rule.model_id.clone()).or_default().push(rule);
        }

        for (model_id, model_rules) in &by_model {
            let deprecated = model_rules.iter().all(|r| !r.enabled);
            let replacement = model_rules
                .iter()
                .find_map(|r| r.deprecated_replacement.as_deref());
            if deprecated {
                if let Some(target) = replacement {
                    if !by_model.contains_key(target) {
                        warnings.push(format!(
                            "model {model_id}: deprecated_replacement {target} has no rules"
                        ));
                    }
                } else {
                    warnings.push(format!(
                        "model {model_id}: all rules disabled and no replacement configured"
                    ));
                }
            }
        }

        (Self { rules: by_model }, warnings)
    }

    /// Follows deprecation forwarding to the model that should actually
    /// serve the request. Fails closed (`None`) when the chain is
    /// broken, cyclic, or ends on a model with no enabled rules.
    pub fn resolve(&self, model_id: &str) -> Option<&str> {
        let mut current = model_id;
        let mut seen: HashSet<&str> = HashSet::new();

        for _ in 0..MAX_DEPRECATION_HOPS {
            if !seen.insert(current) {
                return None;
            }
            let (resolved, rules) = self.rules.get_key_value(current)?;
            if rules.iter().any(|r| r.enabled) {
                return Some(resolved.as_str());
            }
            current = rules
                .iter()
                .find_map(|r| r.deprecated_replacement.as_deref())?;
        }
        None
    }

    pub fn is_allowed(&self, tier: Tier, model_id: &str) -> bool {
        let Some(resolved) = self.resolve(model_id) else {
            return false;
        };
        self.rules
            .get(resolved)
            .is_some_and(|rules| rules.iter().any(|r| r.allows(tier)))
    }

    /// Enabled rules for the resolved model that admit `tier`.
    pub fn rules_for(&self, tier: Tier, model_id: &str) -> Vec<&ModelAccessRule> {
        let Some(resolved) = self.resolve(model_id) else {
            return Vec::new();
        };
        self.rules
            .get(resolved)
            .map(|rules| rules.iter().filter(|r| r.allows(tier)).collect())
            .unwrap_or_default()
    }

    /// Markup percent for one (tier, model, provider) triple. BYOK
    /// callers pay the provider directly and are exempt from markup.
    pub fn markup_for(&self, tier: Tier, model_id: &str, provider: &str, byok: bool) -> u32 {
        if byok {
            return MARKUP_NONE;
        }
        self.rules_for(tier, model_id)
            .iter()
            .find(|r| r.provider == provider)
            .map(|r| r.markup_percent(tier))
            .unwrap_or(MARKUP_NONE)
    }

    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(|s| s.as_str())
    }
}

/// Returns the first (included, omitted-above) pair that breaks the
/// non-decreasing access chain. Access is tier-additive by convention:
/// every tier above the lowest included one should also be included.
fn tier_chain_gap(tier_access: &[Tier]) -> Option<(Tier, Tier)> {
    let lowest = tier_access.iter().copied().min()?;
    Tier::ALL
        .into_iter()
        .filter(|t| *t > lowest)
        .find(|t| !tier_access.contains(t))
        .map(|t| (lowest, t))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(model: &str, provider: &str, tiers: &[Tier]) -> ModelAccessRule {
        ModelAccessRule {
            model_id: model.to_string(),
            provider: provider.to_string(),
            tier_access: tiers.to_vec(),
            tier_markup: BTreeMap::new(),
            pricing: ModelPricing {
                input_micros_per_1k: 100,
                output_micros_per_1k: 300,
            },
            enabled: true,
            context_length: 128_000,
            capabilities: Capabilities::default(),
            quality: 2,
            deprecated_replacement: None,
        }
    }

    #[test]
    fn markup_rounds_half_up() {
        assert_eq!(apply_markup(100, 150), 150);
        assert_eq!(apply_markup(75, 150), 113);
        assert_eq!(apply_markup(0, 200), 0);
        assert_eq!(apply_markup(100, 100), 100);
    }

    #[test]
    fn pricing_scales_per_1k_tokens() {
        let pricing = ModelPricing {
            input_micros_per_1k: 150,
            output_micros_per_1k: 600,
        };
        assert_eq!(pricing.cost_micros(1000, 1000), 750);
        assert_eq!(pricing.cost_micros(500, 0), 75);
        assert_eq!(pricing.cost_micros(0, 0), 0);
    }

    #[test]
    fn tier_gap_in_access_chain_warns_at_load() {
        let bad = rule("m1", "p1", &[Tier::Trial, Tier::Enterprise]);
        let (_, warnings) = AccessTable::load(vec![bad]);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("omits higher tier"));

        let good = rule("m1", "p1", &[Tier::Starter, Tier::Professional, Tier::Enterprise]);
        let (_, warnings) = AccessTable::load(vec![good]);
        assert!(warnings.is_empty());
    }

    #[test]
    fn disabled_rule_is_never_selectable() {
        let mut disabled = rule("m1", "p1", &[Tier::Starter]);
        disabled.enabled = false;
        let (table, _) = AccessTable::load(vec![disabled]);
        assert!(!table.is_allowed(Tier::Starter, "m1"));
        assert!(table.rules_for(Tier::Starter, "m1").is_empty());
    }

    #[test]
    fn deprecation_chain_forwards_to_replacement() {
        let mut old = rule("m-old", "p1", &[Tier::Starter]);
        old.enabled = false;
        old.deprecated_replacement = Some("m-new".to_string());
        let new = rule("m-new", "p1", &[Tier::Starter]);

        let (table, _) = AccessTable::load(vec![old, new]);
        assert_eq!(table.resolve("m-old"), Some("m-new"));
        assert!(table.is_allowed(Tier::Starter, "m-old"));
    }

    #[test]
    fn resolved_name_borrows_from_the_table() {
        let mut old = rule("m-old", "p1", &[Tier::Starter]);
        old.enabled = false;
        old.deprecated_replacement = Some("m-new".to_string());
        let new = rule("m-new", "p1", &[Tier::Starter]);
        let (table, _) = AccessTable::load(vec![old, new]);

        // The returned name stays valid after the queried id is dropped.
        let resolved = {
            let alias = String::from("m-old");
            table.resolve(&alias)
        };
        assert_eq!(resolved, Some("m-new"));
    }

    #[test]
    fn cyclic_deprecation_chain_fails_closed() {
        let mut a = rule("m-a", "p1", &[Tier::Starter]);
        a.enabled = false;
        a.deprecated_replacement = Some("m-b".to_string());
        let mut b = rule("m-b", "p1", &[Tier::Starter]);
        b.enabled = false;
        b.deprecated_replacement = Some("m-a".to_string());

        let (table, _) = AccessTable::load(vec![a, b]);
        assert_eq!(table.resolve("m-a"), None);
        assert!(!table.is_allowed(Tier::Enterprise, "m-a"));
    }

    #[test]
    fn broken_deprecation_chain_fails_closed() {
        let mut old = rule("m-old", "p1", &[Tier::Starter]);
        old.enabled = false;
        old.deprecated_replacement = Some("m-missing".to_string());
        let (table, warnings) = AccessTable::load(vec![old]);
        assert_eq!(table.resolve("m-old"), None);
        assert!(warnings.iter().any(|w| w.contains("m-missing")));
    }

    #[test]
    fn byok_markup_is_exactly_none() {
        let mut r = rule("m1", "p1", &[Tier::Trial]);
        r.tier_markup.insert(Tier::Trial, 200);
        let (table, _) = AccessTable::load(vec![r]);
        assert_eq!(table.markup_for(Tier::Trial, "m1", "p1", false), 200);
        assert_eq!(table.markup_for(Tier::Trial, "m1", "p1", true), MARKUP_NONE);
    }
}
