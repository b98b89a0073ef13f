//! Cost calculation from per-million token prices.
//!
//! Prices are held in micro-dollars per million tokens and costs are
//! returned in micro-dollars, so a run's total is an exact integer sum.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use shinobi_core::usage::{TokenUsage, Usage};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingTier {
    pub input_micros_per_million: u64,
    pub output_micros_per_million: u64,
}

impl PricingTier {
    /// Tier from USD-per-million prices.
    pub fn usd(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_micros_per_million: (input_per_million * 1_000_000.0).round() as u64,
            output_micros_per_million: (output_per_million * 1_000_000.0).round() as u64,
        }
    }

    pub fn cost_micros(&self, usage: &TokenUsage) -> u64 {
        let input = u128::from(usage.prompt_tokens) * u128::from(self.input_micros_per_million);
        let output =
            u128::from(usage.completion_tokens) * u128::from(self.output_micros_per_million);
        // round half up to the nearest micro-dollar
        let micros = (input + output + 500_000) / 1_000_000;
        u64::try_from(micros).unwrap_or(u64::MAX)
    }
}

const SONNET: PricingTier = PricingTier {
    input_micros_per_million: 3_000_000,
    output_micros_per_million: 15_000_000,
};
const OPUS: PricingTier = PricingTier {
    input_micros_per_million: 15_000_000,
    output_micros_per_million: 75_000_000,
};
const HAIKU: PricingTier = PricingTier {
    input_micros_per_million: 1_000_000,
    output_micros_per_million: 5_000_000,
};
const GPT_4O: PricingTier = PricingTier {
    input_micros_per_million: 2_500_000,
    output_micros_per_million: 10_000_000,
};
const GPT_4O_MINI: PricingTier = PricingTier {
    input_micros_per_million: 150_000,
    output_micros_per_million: 600_000,
};
const GEMINI_PRO: PricingTier = PricingTier {
    input_micros_per_million: 1_250_000,
    output_micros_per_million: 5_000_000,
};
const GEMINI_FLASH: PricingTier = PricingTier {
    input_micros_per_million: 75_000,
    output_micros_per_million: 300_000,
};

/// Model id to pricing tier. Exact entries win over family patterns.
#[derive(Clone, Debug, Default)]
pub struct PriceTable {
    exact: HashMap<String, PricingTier>,
    families: bool,
}

impl PriceTable {
    /// Table with no prices; every lookup misses.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Table that recognises the common model families by substring.
    pub fn with_defaults() -> Self {
        Self {
            exact: HashMap::new(),
            families: true,
        }
    }

    pub fn insert(&mut self, model: impl Into<String>, tier: PricingTier) -> &mut Self {
        let _ = self.exact.insert(model.into(), tier);
        self
    }

    #[must_use]
    pub fn with(mut self, model: impl Into<String>, tier: PricingTier) -> Self {
        let _ = self.insert(model, tier);
        self
    }

    /// Returns `None` for unknown models; there is no fallback price.
    pub fn tier(&self, model: &str) -> Option<PricingTier> {
        if let Some(tier) = self.exact.get(model) {
            return Some(*tier);
        }
        if !self.families {
            return None;
        }
        let lower = model.to_lowercase();
        let tier = if lower.contains("opus") {
            OPUS
        } else if lower.contains("sonnet") {
            SONNET
        } else if lower.contains("haiku") {
            HAIKU
        } else if lower.contains("gpt-4o-mini") {
            GPT_4O_MINI
        } else if lower.contains("gpt-4o") {
            GPT_4O
        } else if lower.contains("gemini") && lower.contains("pro") {
            GEMINI_PRO
        } else if lower.contains("gemini") {
            GEMINI_FLASH
        } else {
            return None;
        };
        Some(tier)
    }

    pub fn cost_micros(&self, model: &str, usage: &TokenUsage) -> Option<u64> {
        self.tier(model).map(|tier| tier.cost_micros(usage))
    }

    /// Usage for one model call, flagged approximate when the provider sent
    /// no counters or the model has no price.
    pub fn usage_for(&self, model: &str, tokens: Option<TokenUsage>) -> Usage {
        let cost = match tokens {
            Some(ref t) => self.cost_micros(model, t),
            None => None,
        };
        Usage::from_call(tokens, cost)
    }
}
