use serde::{Deserialize, Serialize};

use crate::config::{ModelPricingOverride, PricingConfig};

/// Events carry a single token delta, so cost is estimated with a blended
/// rate that assumes this share of the tokens are output tokens.
const OUTPUT_TOKEN_SHARE: f64 = 0.2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub fn blended_per_million(self) -> f64 {
        self.input_per_million * (1.0 - OUTPUT_TOKEN_SHARE)
            + self.output_per_million * OUTPUT_TOKEN_SHARE
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PricingSource {
    Exact,
    Alias,
    Override,
    #[default]
    Fallback,
}

#[derive(Debug, Clone)]
pub struct PricingResolution {
    pub pricing: ModelPricing,
    pub source: PricingSource,
    pub resolved_model: String,
}

#[derive(Debug, Clone)]
pub struct CostEstimate {
    pub resolution: PricingResolution,
    pub tokens: u64,
    pub cost_usd: f64,
}

pub fn estimate_cost(model_id: &str, tokens: u64, pricing_config: &PricingConfig) -> CostEstimate {
    let resolution = resolve_model_pricing(model_id, pricing_config);
    let cost_usd = (tokens as f64 / 1_000_000.0) * resolution.pricing.blended_per_million();
    CostEstimate {
        resolution,
        tokens,
        cost_usd,
    }
}

pub fn resolve_model_pricing(model_id: &str, pricing_config: &PricingConfig) -> PricingResolution {
    let key = normalize_model_key(model_id);

    if let Some(override_pricing) = lookup_override(&key, pricing_config) {
        return PricingResolution {
            pricing: override_pricing,
            source: PricingSource::Override,
            resolved_model: key,
        };
    }

    if let Some(alias_target) = pricing_config
        .aliases
        .get(&key)
        .map(|target| normalize_model_key(target))
    {
        if let Some(override_pricing) = lookup_override(&alias_target, pricing_config) {
            return PricingResolution {
                pricing: override_pricing,
                source: PricingSource::Override,
                resolved_model: alias_target,
            };
        }
        if let Some(pricing) = default_model_pricing(&alias_target) {
            return PricingResolution {
                pricing,
                source: PricingSource::Alias,
                resolved_model: alias_target,
            };
        }
    }

    if let Some(pricing) = default_model_pricing(&key) {
        return PricingResolution {
            pricing,
            source: PricingSource::Exact,
            resolved_model: key,
        };
    }

    if let Some(undated) = strip_date_suffix(&key)
        && let Some(pricing) = default_model_pricing(undated)
    {
        return PricingResolution {
            pricing,
            source: PricingSource::Alias,
            resolved_model: undated.to_string(),
        };
    }

    PricingResolution {
        pricing: fallback_pricing(),
        source: PricingSource::Fallback,
        resolved_model: "claude-sonnet-4".to_string(),
    }
}

fn lookup_override(model_key: &str, pricing_config: &PricingConfig) -> Option<ModelPricing> {
    let ModelPricingOverride {
        input_per_million,
        output_per_million,
    } = *pricing_config.overrides.get(model_key)?;
    let valid = |rate: f64| rate.is_finite() && rate >= 0.0;
    if !valid(input_per_million) || !valid(output_per_million) {
        return None;
    }
    Some(ModelPricing {
        input_per_million,
        output_per_million,
    })
}

pub fn normalize_model_key(model: &str) -> String {
    model.trim().to_ascii_lowercase()
}

/// `claude-sonnet-4-20250514` -> `claude-sonnet-4`.
fn strip_date_suffix(model: &str) -> Option<&str> {
    let (base, suffix) = model.rsplit_once('-')?;
    (suffix.len() == 8 && suffix.bytes().all(|byte| byte.is_ascii_digit())).then_some(base)
}

fn fallback_pricing() -> ModelPricing {
    ModelPricing {
        input_per_million: 3.0,
        output_per_million: 15.0,
    }
}

fn default_model_pricing(model: &str) -> Option<ModelPricing> {
    let (input_per_million, output_per_million) = match model {
        "claude-opus-4" | "claude-opus-4-1" => (15.0, 75.0),
        "claude-sonnet-4" | "claude-sonnet-4-5" | "claude-3-7-sonnet" | "claude-3-5-sonnet" => {
            (3.0, 15.0)
        }
        "claude-haiku-4-5" => (1.0, 5.0),
        "claude-3-5-haiku" => (0.8, 4.0),
        "gpt-5" | "gpt-5-codex" | "gpt-5.1" | "gpt-5.1-codex" => (1.25, 10.0),
        "gpt-5-mini" | "gpt-5.1-codex-mini" => (0.25, 2.0),
        "gpt-5-nano" => (0.05, 0.4),
        "gemini-2.5-pro" => (1.25, 10.0),
        "gemini-2.5-flash" => (0.30, 2.5),
        "gemini-2.5-flash-lite" => (0.10, 0.4),
        _ => return None,
    };
    Some(ModelPricing {
        input_per_million,
        output_per_million,
    })
}
