//! Token and cost accounting.
//!
//! Cost is carried as integer micro-dollars so that combining usage is exact
//! and associative. Counters saturate instead of wrapping; saturating sums of
//! non-negative integers stay associative.

use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Raw counters reported by the gateway for one model call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Aggregated usage across any number of model calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_micros: u64,
    pub model_calls: u64,
    /// Set when any contributing call reported no usage or had no known price.
    pub approximate: bool,
}

impl Usage {
    /// Usage for a single model call. Missing counters or cost count as zero
    /// and mark the result approximate.
    pub fn from_call(tokens: Option<TokenUsage>, cost_micros: Option<u64>) -> Self {
        let approximate = tokens.is_none() || cost_micros.is_none();
        let tokens = tokens.unwrap_or_default();
        let total = if tokens.total_tokens == 0 {
            u64::from(tokens.prompt_tokens) + u64::from(tokens.completion_tokens)
        } else {
            u64::from(tokens.total_tokens)
        };
        Self {
            prompt_tokens: u64::from(tokens.prompt_tokens),
            completion_tokens: u64::from(tokens.completion_tokens),
            total_tokens: total,
            cost_micros: cost_micros.unwrap_or(0),
            model_calls: 1,
            approximate,
        }
    }

    #[must_use]
    pub fn combine(self, other: Usage) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens.saturating_add(other.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(other.completion_tokens),
            total_tokens: self.total_tokens.saturating_add(other.total_tokens),
            cost_micros: self.cost_micros.saturating_add(other.cost_micros),
            model_calls: self.model_calls.saturating_add(other.model_calls),
            approximate: self.approximate || other.approximate,
        }
    }

    pub fn aggregate<I>(items: I) -> Usage
    where
        I: IntoIterator<Item = Usage>,
    {
        items.into_iter().fold(Usage::default(), Usage::combine)
    }

    pub fn cost_usd(&self) -> f64 {
        self.cost_micros as f64 / 1_000_000.0
    }

    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0 && self.cost_micros == 0 && self.model_calls == 0
    }
}

impl Add for Usage {
    type Output = Usage;
    fn add(self, rhs: Usage) -> Usage {
        self.combine(rhs)
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = self.combine(rhs);
    }
}

impl Sum for Usage {
    fn sum<I: Iterator<Item = Usage>>(iter: I) -> Usage {
        Usage::aggregate(iter)
    }
}

impl<'a> Sum<&'a Usage> for Usage {
    fn sum<I: Iterator<Item = &'a Usage>>(iter: I) -> Usage {
        Usage::aggregate(iter.copied())
    }
}

/// Anything that carries billable usage (results, nested results).
pub trait UsageSource {
    fn usage(&self) -> Usage;
}

impl UsageSource for Usage {
    fn usage(&self) -> Usage {
        *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(p: u32, c: u32, cost: u64) -> Usage {
        Usage::from_call(Some(TokenUsage::new(p, c)), Some(cost))
    }

    #[test]
    fn aggregation_is_associative() {
        let a = call(100, 20, 350);
        let b = call(7, 3, 11);
        let c = Usage::from_call(None, None);

        let left = Usage::aggregate([Usage::aggregate([a, b]), c]);
        let right = Usage::aggregate([a, Usage::aggregate([b, c])]);
        let flat = Usage::aggregate([a, b, c]);
        assert_eq!(left, right);
        assert_eq!(left, flat);
        assert_eq!(flat.total_tokens, 130);
        assert_eq!(flat.cost_micros, 361);
        assert_eq!(flat.model_calls, 3);
    }

    #[test]
    fn order_does_not_matter() {
        let items = [call(1, 2, 3), call(10, 0, 5), call(0, 9, 0)];
        let forward: Usage = items.iter().sum();
        let backward: Usage = items.iter().rev().sum();
        assert_eq!(forward, backward);
    }

    #[test]
    fn missing_usage_is_zero_and_approximate() {
        let u = Usage::from_call(None, Some(0));
        assert_eq!(u.total_tokens, 0);
        assert_eq!(u.model_calls, 1);
        assert!(u.approximate);

        let combined = call(5, 5, 1) + u;
        assert!(combined.approximate);
        assert_eq!(combined.total_tokens, 10);
    }

    #[test]
    fn unknown_price_flags_approximate() {
        let u = Usage::from_call(Some(TokenUsage::new(10, 10)), None);
        assert!(u.approximate);
        assert_eq!(u.cost_micros, 0);
    }

    #[test]
    fn saturates_instead_of_wrapping() {
        let big = Usage {
            total_tokens: u64::MAX - 1,
            ..Usage::default()
        };
        let sum = big + call(5, 5, 0);
        assert_eq!(sum.total_tokens, u64::MAX);
    }

    #[test]
    fn provider_total_wins_over_sum() {
        let u = Usage::from_call(
            Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 18,
            }),
            Some(0),
        );
        assert_eq!(u.total_tokens, 18);
        assert!((call(0, 0, 2_500_000).cost_usd() - 2.5).abs() < f64::EPSILON);
    }
}
