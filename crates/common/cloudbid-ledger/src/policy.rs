use serde::{Deserialize, Serialize};

/// How much a renter is charged when a compute phase ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementPolicy {
    /// The full quote, `amount * duration`, regardless of elapsed time.
    #[default]
    FullQuote,
    /// `amount` per started minute of compute, capped at the quote.
    Elapsed,
    /// A single minute's `amount`. Kept for compatibility with older deployments.
    PerMinuteRate,
}

impl SettlementPolicy {
    /// Credits owed for a bid of `amount` per minute quoted for `duration`
    /// minutes, after `elapsed_minutes` of compute.
    pub fn charge(self, amount: f64, duration: i32, elapsed_minutes: f64) -> f64 {
        let quote = amount * f64::from(duration);
        match self {
            SettlementPolicy::FullQuote => quote,
            SettlementPolicy::Elapsed => {
                let started = elapsed_minutes.max(0.0).ceil();
                (amount * started).min(quote)
            }
            SettlementPolicy::PerMinuteRate => amount.min(quote),
        }
    }
}
