use serde::{Deserialize, Serialize};

use crate::indicators::{RdcFormula, WindowKind};

/// Complete engine configuration: extractor, regime model and decision policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dc: DcSettings,
    pub hmm: HmmSettings,
    pub signal: SignalThresholds,
    pub roles: StateRoles,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dc: DcSettings::default(),
            hmm: HmmSettings::default(),
            signal: SignalThresholds::default(),
            roles: StateRoles::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.dc.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.hmm.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.signal.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.roles.validate(self.hmm.num_states) {
            errors.extend(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Directional-change detection and RDC index settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DcSettings {
    /// Fractional reversal threshold.
    pub theta: f64,
    /// RDC window in bars; also the warm-up length.
    pub window: usize,
    pub window_kind: WindowKind,
    pub formula: RdcFormula,
    pub count_weight: f64,
    pub overshoot_weight: f64,
}

impl Default for DcSettings {
    fn default() -> Self {
        Self {
            theta: 0.001,
            window: 60,
            window_kind: WindowKind::Simple,
            formula: RdcFormula::Activity,
            count_weight: 0.5,
            overshoot_weight: 0.5,
        }
    }
}

impl DcSettings {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.theta.is_finite() || self.theta <= 0.0 || self.theta >= 1.0 {
            errors.push("dc.theta must be in (0, 1)".to_string());
        }
        if self.window == 0 {
            errors.push("dc.window must be > 0".to_string());
        }
        if !self.count_weight.is_finite() || self.count_weight < 0.0 {
            errors.push("dc.count_weight must be >= 0".to_string());
        }
        if !self.overshoot_weight.is_finite() || self.overshoot_weight < 0.0 {
            errors.push("dc.overshoot_weight must be >= 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Baum-Welch training settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HmmSettings {
    pub num_states: usize,
    pub em_tolerance: f64,
    pub em_max_iterations: usize,
    pub em_restarts: usize,
    pub min_observations: usize,
    pub variance_floor: f64,
    pub seed: u64,
    /// Optional transition matrix used to seed the first restart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_transition: Option<Vec<Vec<f64>>>,
}

impl Default for HmmSettings {
    fn default() -> Self {
        Self {
            num_states: 3,
            em_tolerance: 1e-4,
            em_max_iterations: 100,
            em_restarts: 5,
            min_observations: 50,
            variance_floor: 1e-6,
            seed: 42,
            initial_transition: None,
        }
    }
}

impl HmmSettings {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.num_states < 2 {
            errors.push("hmm.num_states must be >= 2".to_string());
        }
        if !self.em_tolerance.is_finite() || self.em_tolerance <= 0.0 {
            errors.push("hmm.em_tolerance must be > 0".to_string());
        }
        if self.em_max_iterations == 0 {
            errors.push("hmm.em_max_iterations must be > 0".to_string());
        }
        if self.em_restarts == 0 {
            errors.push("hmm.em_restarts must be > 0".to_string());
        }
        if self.min_observations < 2 {
            errors.push("hmm.min_observations must be >= 2".to_string());
        }
        if !self.variance_floor.is_finite() || self.variance_floor <= 0.0 {
            errors.push("hmm.variance_floor must be > 0".to_string());
        }
        if let Some(matrix) = &self.initial_transition {
            let square = matrix.len() == self.num_states
                && matrix.iter().all(|row| row.len() == self.num_states);
            if !square {
                errors.push("hmm.initial_transition must be num_states x num_states".to_string());
            } else if matrix.iter().any(|row| {
                row.iter().any(|p| !p.is_finite() || *p < 0.0)
                    || (row.iter().sum::<f64>() - 1.0).abs() > 1e-6
            }) {
                errors.push("hmm.initial_transition rows must be probability distributions".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Decision policy thresholds. Comparison direction is part of the policy:
/// see `strategies::signal_engine` for which bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalThresholds {
    pub danger_threshold: f64,
    pub regime_threshold: f64,
    pub signal_threshold: f64,
    pub min_predicted_pips: f64,
    pub interval_width_threshold: f64,
    pub allow_state0: bool,
    pub sell_state_threshold: f64,
    pub sell_confidence_ceiling: f64,
    pub momentum_collapse_threshold: f64,
    pub state_weakening_threshold: f64,
    pub probability_tolerance: f64,
}

impl Default for SignalThresholds {
    fn default() -> Self {
        Self {
            danger_threshold: 0.65,
            regime_threshold: 0.55,
            signal_threshold: 0.35,
            min_predicted_pips: 35.0,
            interval_width_threshold: 0.015,
            allow_state0: false,
            sell_state_threshold: 0.45,
            sell_confidence_ceiling: 0.10,
            momentum_collapse_threshold: 0.10,
            state_weakening_threshold: 0.40,
            probability_tolerance: 1e-6,
        }
    }
}

impl SignalThresholds {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let probabilities = [
            ("danger_threshold", self.danger_threshold),
            ("regime_threshold", self.regime_threshold),
            ("sell_state_threshold", self.sell_state_threshold),
            ("state_weakening_threshold", self.state_weakening_threshold),
        ];
        for (name, value) in probabilities {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                errors.push(format!("signal.{} must be between 0 and 1", name));
            }
        }

        let confidences = [
            ("signal_threshold", self.signal_threshold),
            ("sell_confidence_ceiling", self.sell_confidence_ceiling),
            ("momentum_collapse_threshold", self.momentum_collapse_threshold),
        ];
        for (name, value) in confidences {
            if !value.is_finite() || !(-1.0..=1.0).contains(&value) {
                errors.push(format!("signal.{} must be between -1 and 1", name));
            }
        }

        if !self.min_predicted_pips.is_finite() {
            errors.push("signal.min_predicted_pips must be finite".to_string());
        }
        if !self.interval_width_threshold.is_finite() || self.interval_width_threshold <= 0.0 {
            errors.push("signal.interval_width_threshold must be > 0".to_string());
        }
        if self.sell_state_threshold >= self.danger_threshold {
            errors.push("signal.sell_state_threshold must be < danger_threshold".to_string());
        }
        if self.momentum_collapse_threshold >= self.signal_threshold {
            errors.push("signal.momentum_collapse_threshold must be < signal_threshold".to_string());
        }
        if !self.probability_tolerance.is_finite() || self.probability_tolerance <= 0.0 {
            errors.push("signal.probability_tolerance must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Which fitted states play the low / medium / high volatility roles.
/// States are ordered by ascending emission mean after fitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateRoles {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
}

impl Default for StateRoles {
    fn default() -> Self {
        Self::for_states(3)
    }
}

impl StateRoles {
    /// Low = 0, medium = 1, high = last state.
    pub fn for_states(num_states: usize) -> Self {
        Self {
            low: 0,
            medium: 1.min(num_states.saturating_sub(1)),
            high: num_states.saturating_sub(1),
        }
    }

    pub fn validate(&self, num_states: usize) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (name, idx) in [("low", self.low), ("medium", self.medium), ("high", self.high)] {
            if idx >= num_states {
                errors.push(format!("roles.{} = {} is not a state below {}", name, idx, num_states));
            }
        }
        if self.medium == self.high || self.low == self.high {
            errors.push("roles.high must differ from roles.low and roles.medium".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
