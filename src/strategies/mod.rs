pub mod signal_engine;

pub use signal_engine::SignalEngine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ml::{ForecastResult, RegimeState, StateProbabilities};
use crate::types::Signal;

/// Rows of the decision table, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    Danger,
    Long,
    Sell,
    Wait,
}

impl Rule {
    /// First match wins.
    pub const ORDER: [Rule; 4] = [Rule::Danger, Rule::Long, Rule::Sell, Rule::Wait];

    pub fn signal(&self) -> Signal {
        match self {
            Rule::Danger => Signal::Danger,
            Rule::Long => Signal::Long,
            Rule::Sell => Signal::Sell,
            Rule::Wait => Signal::Wait,
        }
    }
}

/// Which SELL clause fired. Clauses are checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SellTrigger {
    /// Negative confidence while the high-volatility state is elevated.
    ConfidenceReversal,
    /// Interval reaches below zero with weak confidence.
    DownsideRisk,
    /// Confidence collapsed and the medium state is fading.
    MomentumCollapse,
}

impl SellTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SellTrigger::ConfidenceReversal => "confidence reversal in elevated volatility",
            SellTrigger::DownsideRisk => "prediction interval below zero",
            SellTrigger::MomentumCollapse => "momentum collapse with weakening regime",
        }
    }
}

impl fmt::Display for SellTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one pass through the decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub signal: Signal,
    pub rule: Rule,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sell_trigger: Option<SellTrigger>,
    pub dominant_state: usize,
}

/// One emitted signal with everything that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub timestamp: DateTime<Utc>,
    pub signal: Signal,
    pub rule: Rule,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sell_trigger: Option<SellTrigger>,
    pub probabilities: StateProbabilities,
    pub forecast: ForecastResult,
    pub dominant_state: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regime: Option<RegimeState>,
}

impl SignalRecord {
    pub fn reason(&self) -> String {
        match (self.rule, self.sell_trigger) {
            (Rule::Sell, Some(trigger)) => format!("SELL: {}", trigger),
            (Rule::Danger, _) => "high-volatility regime dominates".to_string(),
            (Rule::Long, _) => "favorable regime with confident upside forecast".to_string(),
            _ => "no rule matched".to_string(),
        }
    }
}
