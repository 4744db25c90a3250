use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

use super::gaussian_hmm::{log_sum_exp, GaussianHmm};
use super::training::{BaumWelch, FitReport};
use super::{RegimeState, StateProbabilities};
use crate::error::{FittingError, InputError, NumericalWarning};

/// Incremental forward filter. Keeps the normalized log forward vector so the
/// output for the newest bar matches full-sequence smoothing at that bar.
#[derive(Debug, Clone)]
pub struct OnlineFilter {
    hmm: Arc<GaussianHmm>,
    log_transition: Vec<Vec<f64>>,
    log_alpha: Option<Vec<f64>>,
    steps: usize,
    warnings: Vec<NumericalWarning>,
}

impl OnlineFilter {
    pub fn new(hmm: Arc<GaussianHmm>) -> Self {
        let log_transition = hmm
            .params()
            .transition()
            .rows()
            .into_iter()
            .map(|row| row.iter().map(|p| p.ln()).collect())
            .collect();
        Self { hmm, log_transition, log_alpha: None, steps: 0, warnings: Vec::new() }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn warnings(&self) -> &[NumericalWarning] {
        &self.warnings
    }

    pub fn reset(&mut self) {
        self.log_alpha = None;
        self.steps = 0;
        self.warnings.clear();
    }

    /// Filter one observation. On error the filter state is unchanged.
    pub fn update(&mut self, x: f64) -> Result<StateProbabilities, InputError> {
        if !x.is_finite() {
            return Err(InputError::NonFiniteObservation { index: self.steps, value: x });
        }

        let k = self.hmm.n_states();
        let predicted: Vec<f64> = match &self.log_alpha {
            None => self.hmm.params().start_prob().iter().map(|p| p.ln()).collect(),
            Some(prev) => {
                let mut terms = vec![0.0; k];
                (0..k)
                    .map(|j| {
                        for i in 0..k {
                            terms[i] = prev[i] + self.log_transition[i][j];
                        }
                        log_sum_exp(&terms)
                    })
                    .collect()
            }
        };

        let log_b = self.hmm.log_emission_vector(x);
        let mut joint: Vec<f64> = predicted.iter().zip(&log_b).map(|(p, b)| p + b).collect();
        let mut log_norm = log_sum_exp(&joint);

        if !log_norm.is_finite() {
            let warning = NumericalWarning::LikelihoodSaturated { index: self.steps };
            warn!("{}", warning);
            self.warnings.push(warning);
            joint = predicted;
            log_norm = log_sum_exp(&joint);
            if !log_norm.is_finite() {
                return Err(InputError::ZeroLikelihood);
            }
        }

        let log_alpha: Vec<f64> = joint.iter().map(|v| v - log_norm).collect();
        let probs: Vec<f64> = log_alpha.iter().map(|v| v.exp()).collect();
        let total: f64 = probs.iter().sum();

        self.log_alpha = Some(log_alpha);
        self.steps += 1;
        Ok(StateProbabilities::from(probs.into_iter().map(|p| p / total).collect::<Vec<_>>()))
    }
}

/// Streaming regime detector around a shared trained model.
pub struct RegimeDetector {
    hmm: Arc<GaussianHmm>,
    filter: OnlineFilter,
    history: VecDeque<f64>,
    history_capacity: usize,
    current: Option<StateProbabilities>,
    min_confidence: f64,
}

impl RegimeDetector {
    pub fn new(hmm: GaussianHmm, history_capacity: usize) -> Self {
        Self::from_shared(Arc::new(hmm), history_capacity)
    }

    pub fn from_shared(hmm: Arc<GaussianHmm>, history_capacity: usize) -> Self {
        Self {
            filter: OnlineFilter::new(Arc::clone(&hmm)),
            hmm,
            history: VecDeque::with_capacity(history_capacity),
            history_capacity,
            current: None,
            min_confidence: 0.6,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn model(&self) -> Arc<GaussianHmm> {
        Arc::clone(&self.hmm)
    }

    pub fn history(&self) -> &VecDeque<f64> {
        &self.history
    }

    pub fn current(&self) -> Option<&StateProbabilities> {
        self.current.as_ref()
    }

    pub fn warnings(&self) -> &[NumericalWarning] {
        self.filter.warnings()
    }

    /// Filter one RDC observation and remember it for replay.
    pub fn observe(&mut self, x: f64) -> Result<StateProbabilities, InputError> {
        let probs = self.filter.update(x)?;
        if self.history_capacity > 0 {
            if self.history.len() == self.history_capacity {
                self.history.pop_front();
            }
            self.history.push_back(x);
        }
        self.current = Some(probs.clone());
        Ok(probs)
    }

    /// Most probable state at the latest bar and its probability.
    pub fn detect_regime(&self) -> Option<(usize, f64)> {
        let probs = self.current.as_ref()?;
        let state = probs.dominant();
        Some((state, probs.as_slice()[state]))
    }

    /// Named regime for 3-state models, only above the confidence floor.
    pub fn detect_regime_confident(&self) -> Option<RegimeState> {
        let (state, confidence) = self.detect_regime()?;
        if confidence >= self.min_confidence {
            RegimeState::from_index(state)
        } else {
            None
        }
    }

    /// Swap in a new model and replay the retained history through it.
    pub fn swap_model(&mut self, hmm: GaussianHmm) -> Result<(), InputError> {
        self.swap_shared(Arc::new(hmm))
    }

    fn swap_shared(&mut self, hmm: Arc<GaussianHmm>) -> Result<(), InputError> {
        let mut filter = OnlineFilter::new(Arc::clone(&hmm));
        let mut current = None;
        for &x in &self.history {
            current = Some(filter.update(x)?);
        }

        info!(
            "Regime model swapped ({} states), replayed {} observations",
            hmm.n_states(),
            self.history.len()
        );
        self.hmm = hmm;
        self.filter = filter;
        self.current = current;
        Ok(())
    }

    /// Retrain on `observations`; the live model is replaced only on success.
    pub fn retrain(&mut self, trainer: &BaumWelch, observations: &[f64]) -> Result<FitReport, FittingError> {
        let trained = match trainer.fit(observations) {
            Ok(trained) => trained,
            Err(e) => {
                warn!("Retraining failed, keeping current model: {}", e);
                return Err(e);
            }
        };

        let hmm = Arc::new(trained.model);
        if let Err(e) = self.swap_shared(Arc::clone(&hmm)) {
            warn!("History replay failed under the retrained model, starting from an empty history: {}", e);
            self.filter = OnlineFilter::new(Arc::clone(&hmm));
            self.hmm = hmm;
            self.history.clear();
            self.current = None;
        }
        Ok(trained.report)
    }

    /// Smoothed posteriors over the retained history.
    pub fn smoothed_history(&self) -> Result<Vec<StateProbabilities>, InputError> {
        let history: Vec<f64> = self.history.iter().copied().collect();
        self.hmm.state_probabilities(&history)
    }

    pub fn reset(&mut self) {
        self.filter.reset();
        self.history.clear();
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HmmSettings;
    use crate::ml::hmm::gaussian_hmm::tests::three_state_params;
    use crate::ml::hmm::HmmParameters;
    use crate::ml::hmm::training::tests::scenario_observations;
    use approx::assert_relative_eq;

    fn detector(capacity: usize) -> RegimeDetector {
        RegimeDetector::new(GaussianHmm::new(three_state_params()), capacity)
    }

    #[test]
    fn test_filter_matches_smoothing_at_last_bar() {
        let hmm = Arc::new(GaussianHmm::new(three_state_params()));
        let obs = vec![0.02, -0.05, 0.1, 0.45, 0.52, 0.61, 0.48, 1.1, 0.95, 1.3, 0.9, 0.4];
        let mut filter = OnlineFilter::new(Arc::clone(&hmm));

        for t in 0..obs.len() {
            let online = filter.update(obs[t]).unwrap();
            let smoothed = hmm.state_probabilities(&obs[..=t]).unwrap();
            let last = smoothed.last().unwrap();
            for k in 0..3 {
                assert_relative_eq!(online.as_slice()[k], last.as_slice()[k], epsilon = 1e-9);
            }
        }
        assert_eq!(filter.steps(), obs.len());
    }

    #[test]
    fn test_filter_rejects_non_finite_without_advancing() {
        let mut filter = OnlineFilter::new(Arc::new(GaussianHmm::new(three_state_params())));
        filter.update(0.1).unwrap();
        assert!(matches!(filter.update(f64::NAN), Err(InputError::NonFiniteObservation { index: 1, .. })));
        assert_eq!(filter.steps(), 1);
    }

    #[test]
    fn test_filter_saturation_falls_back_to_prediction() {
        let mut filter = OnlineFilter::new(Arc::new(GaussianHmm::new(three_state_params())));
        let probs = filter.update(1e300).unwrap();
        assert_relative_eq!(probs.sum(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(probs.as_slice()[0], 0.5, epsilon = 1e-12);
        assert_eq!(filter.warnings(), &[NumericalWarning::LikelihoodSaturated { index: 0 }]);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut detector = detector(3);
        for x in [0.0, 0.1, 0.5, 0.9, 1.0] {
            detector.observe(x).unwrap();
        }
        assert_eq!(detector.history().iter().copied().collect::<Vec<_>>(), vec![0.5, 0.9, 1.0]);
        assert_eq!(detector.detect_regime().unwrap().0, 2);
    }

    #[test]
    fn test_detect_regime_confident() {
        let mut detector = detector(10).with_min_confidence(0.6);
        assert_eq!(detector.detect_regime_confident(), None);
        for _ in 0..5 {
            detector.observe(0.5).unwrap();
        }
        assert_eq!(detector.detect_regime_confident(), Some(RegimeState::Medium));
    }

    #[test]
    fn test_swap_model_replays_history() {
        let mut detector = detector(50);
        let obs = [0.0, 0.05, 0.5, 0.55, 0.95];
        for x in obs {
            detector.observe(x).unwrap();
        }

        let replacement = HmmParameters::from_vecs(
            vec![0.6, 0.3, 0.1],
            vec![vec![0.7, 0.2, 0.1], vec![0.2, 0.6, 0.2], vec![0.1, 0.2, 0.7]],
            vec![0.1, 0.6, 1.2],
            vec![0.02, 0.03, 0.04],
        )
        .unwrap();
        let new_model = GaussianHmm::new(replacement.clone());
        let expected = new_model.state_probabilities(&obs).unwrap();

        detector.swap_model(GaussianHmm::new(replacement)).unwrap();
        let current = detector.current().unwrap();
        for k in 0..3 {
            assert_relative_eq!(current.as_slice()[k], expected[4].as_slice()[k], epsilon = 1e-9);
        }
    }

    #[test]
    fn test_failed_retrain_keeps_model() {
        let mut detector = detector(50);
        detector.observe(0.2).unwrap();
        let before = detector.model();
        let current_before = detector.current().cloned();

        let trainer = BaumWelch::new(HmmSettings::default()).unwrap();
        let err = detector.retrain(&trainer, &[0.1; 10]).unwrap_err();

        assert_eq!(err, FittingError::InsufficientData { len: 10, minimum: 50 });
        assert!(Arc::ptr_eq(&before, &detector.model()));
        assert_eq!(detector.current().cloned(), current_before);
    }

    #[test]
    fn test_successful_retrain_swaps_model() {
        let mut detector = detector(500);
        let observations = scenario_observations(4);
        for &x in &observations {
            detector.observe(x).unwrap();
        }
        let before = detector.model();

        let trainer = BaumWelch::new(HmmSettings::default()).unwrap();
        let report = detector.retrain(&trainer, &observations).unwrap();

        assert!(report.log_likelihood.is_finite());
        assert!(!Arc::ptr_eq(&before, &detector.model()));
        // Last scenario block sits in the middle state.
        assert_eq!(detector.detect_regime().unwrap().0, 1);
        assert_eq!(detector.smoothed_history().unwrap().len(), observations.len());
    }

    #[test]
    fn test_retrain_installs_model_when_replay_fails() {
        let mut detector = detector(500);
        let observations = scenario_observations(4);
        for &x in &observations[..20] {
            detector.observe(x).unwrap();
        }
        detector.history.push_back(f64::NAN);
        let before = detector.model();

        let trainer = BaumWelch::new(HmmSettings::default()).unwrap();
        detector.retrain(&trainer, &observations).unwrap();

        assert!(!Arc::ptr_eq(&before, &detector.model()));
        assert!(detector.history().is_empty());
        assert!(detector.current().is_none());
        assert_eq!(detector.filter.steps(), 0);
        detector.observe(observations[0]).unwrap();
        assert_eq!(detector.history().len(), 1);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut detector = detector(5);
        detector.observe(0.3).unwrap();
        detector.reset();
        assert!(detector.current().is_none());
        assert!(detector.history().is_empty());
    }
}
