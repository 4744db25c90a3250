pub mod gaussian_hmm;
pub mod training;
pub mod features;
pub mod regime_detector;

pub use gaussian_hmm::{
    log_sum_exp, FitSummary, GaussianHmm, HmmParameters, Posteriors, ViterbiPath, EURUSD_TRANSITION_PRIOR,
};
pub use training::{BaumWelch, FitReport, TrainedModel};
pub use features::{extract_regime_observations, RegimeObservations};
pub use regime_detector::{OnlineFilter, RegimeDetector};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Volatility regimes of a 3-state model, in ascending emission-mean order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegimeState {
    Low = 0,
    Medium = 1,
    High = 2,
}

impl RegimeState {
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(RegimeState::Low),
            1 => Some(RegimeState::Medium),
            2 => Some(RegimeState::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RegimeState::Low => "Low volatility",
            RegimeState::Medium => "Medium volatility",
            RegimeState::High => "High volatility",
        }
    }
}

impl fmt::Display for RegimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Posterior distribution over hidden states for one bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateProbabilities(Vec<f64>);

impl StateProbabilities {
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, state: usize) -> Option<f64> {
        self.0.get(state).copied()
    }

    pub fn sum(&self) -> f64 {
        self.0.iter().sum()
    }

    /// Most probable state; ties go to the lower index.
    pub fn dominant(&self) -> usize {
        dominant_state(&self.0)
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

impl From<Vec<f64>> for StateProbabilities {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

impl AsRef<[f64]> for StateProbabilities {
    fn as_ref(&self) -> &[f64] {
        &self.0
    }
}

/// Index of the largest entry; ties go to the lower index.
pub fn dominant_state(probabilities: &[f64]) -> usize {
    let mut best = 0;
    for (i, &p) in probabilities.iter().enumerate() {
        if p > probabilities[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regime_state_from_index() {
        assert_eq!(RegimeState::from_index(0), Some(RegimeState::Low));
        assert_eq!(RegimeState::from_index(2), Some(RegimeState::High));
        assert_eq!(RegimeState::from_index(3), None);
        assert_eq!(RegimeState::Medium.to_string(), "Medium volatility");
    }

    #[test]
    fn test_dominant_state_ties_to_lower_index() {
        assert_eq!(dominant_state(&[0.4, 0.4, 0.2]), 0);
        assert_eq!(dominant_state(&[0.1, 0.45, 0.45]), 1);
        assert_eq!(StateProbabilities::from(vec![0.2, 0.3, 0.5]).dominant(), 2);
    }

    #[test]
    fn test_state_probabilities_serialize_as_array() {
        let probs = StateProbabilities::from(vec![0.25, 0.75]);
        assert_eq!(serde_json::to_string(&probs).unwrap(), "[0.25,0.75]");
        assert_eq!(probs.get(1), Some(0.75));
        assert_eq!(probs.get(2), None);
    }
}
