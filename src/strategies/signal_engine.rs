//! Per-bar decision table fusing regime probabilities with a forecast.
//!
//! | order | rule   | fires when                                                   |
//! |-------|--------|--------------------------------------------------------------|
//! | 1     | DANGER | P(high) >= danger_threshold                                  |
//! | 2     | LONG   | P(medium) >= regime, confidence >= signal, pips >= minimum,  |
//! |       |        | interval width <= limit, low state not dominant (unless allowed) |
//! | 3     | SELL   | any SELL clause (see [`SellTrigger`])                        |
//! | 4     | WAIT   | always                                                       |

use chrono::{DateTime, Utc};

use super::{Decision, Rule, SellTrigger, SignalRecord};
use crate::config::{SignalThresholds, StateRoles};
use crate::error::{EngineError, InputError};
use crate::ml::hmm::dominant_state;
use crate::ml::{ForecastResult, RegimeState, StateProbabilities};

#[derive(Debug, Clone)]
pub struct SignalEngine {
    thresholds: SignalThresholds,
    roles: StateRoles,
    num_states: usize,
}

impl SignalEngine {
    pub fn new(thresholds: SignalThresholds, roles: StateRoles, num_states: usize) -> Result<Self, EngineError> {
        let mut errors = Vec::new();
        if num_states < 2 {
            errors.push("signal engine needs at least 2 states".to_string());
        }
        if let Err(e) = thresholds.validate() {
            errors.extend(e);
        }
        if let Err(e) = roles.validate(num_states) {
            errors.extend(e);
        }
        if !errors.is_empty() {
            return Err(EngineError::Config(errors));
        }
        Ok(Self { thresholds, roles, num_states })
    }

    pub fn thresholds(&self) -> &SignalThresholds {
        &self.thresholds
    }

    pub fn roles(&self) -> StateRoles {
        self.roles
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    fn validate_probabilities(&self, probabilities: &[f64]) -> Result<(), InputError> {
        if probabilities.len() != self.num_states {
            return Err(InputError::ProbabilityLength {
                expected: self.num_states,
                got: probabilities.len(),
            });
        }
        for (state, &value) in probabilities.iter().enumerate() {
            if !value.is_finite() || value < 0.0 {
                return Err(InputError::InvalidProbability { state, value });
            }
        }
        let sum: f64 = probabilities.iter().sum();
        let tolerance = self.thresholds.probability_tolerance;
        if (sum - 1.0).abs() > tolerance {
            return Err(InputError::ProbabilitySum { sum, tolerance });
        }
        Ok(())
    }

    /// Whether `rule` holds for already validated inputs, independent of the
    /// rules ahead of it.
    pub fn rule_matches(&self, rule: Rule, probabilities: &[f64], forecast: &ForecastResult) -> bool {
        match rule {
            Rule::Danger => self.is_danger(probabilities),
            Rule::Long => self.is_long(probabilities, forecast),
            Rule::Sell => self.sell_trigger(probabilities, forecast).is_some(),
            Rule::Wait => true,
        }
    }

    fn is_danger(&self, probabilities: &[f64]) -> bool {
        probabilities[self.roles.high] >= self.thresholds.danger_threshold
    }

    fn is_long(&self, probabilities: &[f64], forecast: &ForecastResult) -> bool {
        let t = &self.thresholds;
        probabilities[self.roles.medium] >= t.regime_threshold
            && forecast.confidence >= t.signal_threshold
            && forecast.point_forecast_pips >= t.min_predicted_pips
            && forecast.interval_width() <= t.interval_width_threshold
            && (t.allow_state0 || dominant_state(probabilities) != self.roles.low)
    }

    /// First SELL clause that holds, if any.
    pub fn sell_trigger(&self, probabilities: &[f64], forecast: &ForecastResult) -> Option<SellTrigger> {
        let t = &self.thresholds;
        let p_high = probabilities[self.roles.high];
        let p_medium = probabilities[self.roles.medium];

        if forecast.confidence < 0.0 && p_high > t.sell_state_threshold {
            Some(SellTrigger::ConfidenceReversal)
        } else if forecast.lower_bound < 0.0 && forecast.confidence < t.sell_confidence_ceiling {
            Some(SellTrigger::DownsideRisk)
        } else if forecast.confidence < t.momentum_collapse_threshold && p_medium < t.state_weakening_threshold {
            Some(SellTrigger::MomentumCollapse)
        } else {
            None
        }
    }

    /// Run the table. Malformed inputs are rejected, never defaulted.
    pub fn decide(&self, probabilities: &[f64], forecast: &ForecastResult) -> Result<Decision, InputError> {
        self.validate_probabilities(probabilities)?;
        forecast.validate()?;

        let rule = Rule::ORDER
            .iter()
            .copied()
            .find(|&rule| self.rule_matches(rule, probabilities, forecast))
            .unwrap_or(Rule::Wait);
        let sell_trigger = match rule {
            Rule::Sell => self.sell_trigger(probabilities, forecast),
            _ => None,
        };

        Ok(Decision {
            signal: rule.signal(),
            rule,
            sell_trigger,
            dominant_state: dominant_state(probabilities),
        })
    }

    pub fn evaluate(
        &self,
        timestamp: DateTime<Utc>,
        probabilities: &StateProbabilities,
        forecast: &ForecastResult,
    ) -> Result<SignalRecord, InputError> {
        let decision = self.decide(probabilities.as_slice(), forecast)?;
        let regime = if self.num_states == 3 {
            RegimeState::from_index(decision.dominant_state)
        } else {
            None
        };

        Ok(SignalRecord {
            timestamp,
            signal: decision.signal,
            rule: decision.rule,
            sell_trigger: decision.sell_trigger,
            probabilities: probabilities.clone(),
            forecast: *forecast,
            dominant_state: decision.dominant_state,
            regime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Signal;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn engine() -> SignalEngine {
        SignalEngine::new(SignalThresholds::default(), StateRoles::default(), 3).unwrap()
    }

    fn engine_with(thresholds: SignalThresholds) -> SignalEngine {
        SignalEngine::new(thresholds, StateRoles::default(), 3).unwrap()
    }

    fn bullish() -> ForecastResult {
        ForecastResult::new(50.0, 0.01, 0.02, 0.5)
    }

    fn signal(engine: &SignalEngine, probs: &[f64], forecast: ForecastResult) -> Signal {
        engine.decide(probs, &forecast).unwrap().signal
    }

    #[test]
    fn test_danger_boundary_is_inclusive() {
        let engine = engine();
        assert_eq!(signal(&engine, &[0.05, 0.30, 0.65], bullish()), Signal::Danger);
        assert_ne!(signal(&engine, &[0.05, 0.3001, 0.6499], bullish()), Signal::Danger);
    }

    #[test]
    fn test_high_regime_overrides_bullish_forecast() {
        let decision = engine().decide(&[0.10, 0.20, 0.70], &bullish()).unwrap();
        assert_eq!(decision.signal, Signal::Danger);
        assert_eq!(decision.rule, Rule::Danger);
        assert_eq!(decision.dominant_state, 2);
    }

    #[test]
    fn test_danger_beats_long_when_both_hold() {
        let thresholds = SignalThresholds { regime_threshold: 0.2, ..SignalThresholds::default() };
        let engine = engine_with(thresholds);
        let probs = [0.05, 0.25, 0.70];
        assert!(engine.rule_matches(Rule::Long, &probs, &bullish()));
        assert!(engine.rule_matches(Rule::Danger, &probs, &bullish()));
        assert_eq!(signal(&engine, &probs, bullish()), Signal::Danger);
    }

    #[test]
    fn test_long_at_exact_thresholds() {
        let engine = engine();
        let forecast = ForecastResult::new(35.0, 0.0, 0.015, 0.35);
        assert_eq!(signal(&engine, &[0.25, 0.55, 0.20], forecast), Signal::Long);
    }

    #[test]
    fn test_long_requires_every_condition() {
        let engine = engine();
        let probs = [0.10, 0.80, 0.10];
        assert_eq!(signal(&engine, &probs, bullish()), Signal::Long);

        let weak_regime = [0.25, 0.54, 0.21];
        assert_ne!(signal(&engine, &weak_regime, bullish()), Signal::Long);

        let low_confidence = ForecastResult { confidence: 0.34, ..bullish() };
        assert_ne!(signal(&engine, &probs, low_confidence), Signal::Long);

        let small_move = ForecastResult { point_forecast_pips: 34.9, ..bullish() };
        assert_ne!(signal(&engine, &probs, small_move), Signal::Long);

        let wide_interval = ForecastResult { lower_bound: 0.0, upper_bound: 0.016, ..bullish() };
        assert_ne!(signal(&engine, &probs, wide_interval), Signal::Long);
    }

    #[test]
    fn test_long_blocked_when_low_state_dominates() {
        let thresholds = SignalThresholds { regime_threshold: 0.40, ..SignalThresholds::default() };
        let probs = [0.45, 0.45, 0.10];

        let blocked = engine_with(thresholds.clone());
        assert_eq!(signal(&blocked, &probs, bullish()), Signal::Wait);

        let allowed = engine_with(SignalThresholds { allow_state0: true, ..thresholds });
        assert_eq!(signal(&allowed, &probs, bullish()), Signal::Long);
    }

    #[test]
    fn test_sell_confidence_reversal() {
        let forecast = ForecastResult::new(-10.0, 0.001, 0.01, -0.2);
        let decision = engine().decide(&[0.05, 0.45, 0.50], &forecast).unwrap();
        assert_eq!(decision.signal, Signal::Sell);
        assert_eq!(decision.sell_trigger, Some(SellTrigger::ConfidenceReversal));
    }

    #[test]
    fn test_sell_downside_risk() {
        let forecast = ForecastResult::new(5.0, -0.01, 0.01, 0.05);
        let decision = engine().decide(&[0.30, 0.60, 0.10], &forecast).unwrap();
        assert_eq!(decision.signal, Signal::Sell);
        assert_eq!(decision.sell_trigger, Some(SellTrigger::DownsideRisk));
    }

    #[test]
    fn test_sell_momentum_collapse() {
        let forecast = ForecastResult::new(5.0, 0.001, 0.01, 0.05);
        let decision = engine().decide(&[0.50, 0.30, 0.20], &forecast).unwrap();
        assert_eq!(decision.signal, Signal::Sell);
        assert_eq!(decision.sell_trigger, Some(SellTrigger::MomentumCollapse));
    }

    #[test]
    fn test_sell_clause_boundaries_are_strict() {
        let engine = engine();
        // P(high) exactly at the SELL threshold does not trigger clause (a).
        let forecast = ForecastResult::new(-10.0, 0.001, 0.01, -0.2);
        assert_eq!(engine.sell_trigger(&[0.10, 0.45, 0.45], &forecast), None);
        // Confidence exactly at the ceiling does not trigger clause (b).
        let forecast = ForecastResult::new(5.0, -0.01, 0.01, 0.10);
        assert_eq!(engine.sell_trigger(&[0.30, 0.60, 0.10], &forecast), None);
    }

    #[test]
    fn test_wait_when_nothing_matches() {
        let forecast = ForecastResult::new(20.0, 0.001, 0.01, 0.2);
        let decision = engine().decide(&[0.30, 0.50, 0.20], &forecast).unwrap();
        assert_eq!(decision.signal, Signal::Wait);
        assert_eq!(decision.rule, Rule::Wait);
        assert_eq!(decision.sell_trigger, None);
    }

    #[test]
    fn test_bearish_forecast_in_medium_regime_sells() {
        let forecast = ForecastResult::new(-20.0, -0.01, 0.005, -0.3);
        assert_eq!(signal(&engine(), &[0.10, 0.80, 0.10], forecast), Signal::Sell);
    }

    #[test]
    fn test_rejects_malformed_probabilities() {
        let engine = engine();
        assert_eq!(
            engine.decide(&[0.5, 0.5], &bullish()).unwrap_err(),
            InputError::ProbabilityLength { expected: 3, got: 2 }
        );
        assert!(matches!(
            engine.decide(&[0.5, f64::NAN, 0.5], &bullish()),
            Err(InputError::InvalidProbability { state: 1, .. })
        ));
        assert!(matches!(
            engine.decide(&[1.1, -0.1, 0.0], &bullish()),
            Err(InputError::InvalidProbability { state: 1, .. })
        ));
        assert!(matches!(
            engine.decide(&[0.3, 0.3, 0.3], &bullish()),
            Err(InputError::ProbabilitySum { .. })
        ));
    }

    #[test]
    fn test_rejects_malformed_forecast() {
        let engine = engine();
        let forecast = ForecastResult { confidence: 1.2, ..bullish() };
        assert_eq!(
            engine.decide(&[0.1, 0.8, 0.1], &forecast).unwrap_err(),
            InputError::ConfidenceOutOfRange(1.2)
        );
        let forecast = ForecastResult { lower_bound: f64::NEG_INFINITY, ..bullish() };
        assert!(engine.decide(&[0.1, 0.8, 0.1], &forecast).is_err());
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let thresholds = SignalThresholds { sell_state_threshold: 0.8, ..SignalThresholds::default() };
        assert!(matches!(
            SignalEngine::new(thresholds, StateRoles::default(), 3),
            Err(EngineError::Config(_))
        ));
        assert!(SignalEngine::new(SignalThresholds::default(), StateRoles::default(), 2).is_err());
        assert!(SignalEngine::new(SignalThresholds::default(), StateRoles::for_states(2), 2).is_err());
    }

    #[test]
    fn test_custom_roles_for_larger_models() {
        let roles = StateRoles::for_states(4);
        let engine = SignalEngine::new(SignalThresholds::default(), roles, 4).unwrap();
        assert_eq!(engine.decide(&[0.0, 0.1, 0.2, 0.7], &bullish()).unwrap().signal, Signal::Danger);
        assert_eq!(engine.decide(&[0.1, 0.6, 0.2, 0.1], &bullish()).unwrap().signal, Signal::Long);
    }

    #[test]
    fn test_evaluate_builds_record() {
        let timestamp = Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap();
        let probs = StateProbabilities::from(vec![0.10, 0.80, 0.10]);
        let record = engine().evaluate(timestamp, &probs, &bullish()).unwrap();
        assert_eq!(record.signal, Signal::Long);
        assert_eq!(record.regime, Some(RegimeState::Medium));
        assert_eq!(record.timestamp, timestamp);
        assert_eq!(record.probabilities, probs);
    }

    proptest! {
        #[test]
        fn prop_danger_iff_high_state_reaches_threshold(
            weights in proptest::collection::vec(0.01f64..1.0, 3),
            confidence in -1.0f64..1.0,
            pips in -100.0f64..100.0,
            lower in -0.02f64..0.02,
            width in 0.0f64..0.03,
        ) {
            let total: f64 = weights.iter().sum();
            let probs: Vec<f64> = weights.iter().map(|w| w / total).collect();
            let forecast = ForecastResult::new(pips, lower, lower + width, confidence);

            let engine = engine();
            let decision = engine.decide(&probs, &forecast).unwrap();
            prop_assert_eq!(decision.signal == Signal::Danger, probs[2] >= 0.65);
            prop_assert_eq!(decision, engine.decide(&probs, &forecast).unwrap());
            if decision.signal == Signal::Wait {
                prop_assert!(Rule::ORDER[..3].iter().all(|&r| !engine.rule_matches(r, &probs, &forecast)));
            }
        }
    }
}
