use anyhow::{anyhow, Context, Result};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::path::Path;

use super::StateProbabilities;
use crate::error::InputError;

/// Tolerance for a probability vector to count as normalized.
pub const PARAM_TOLERANCE: f64 = 1e-6;

/// EUR/USD 3-state transition prior (low / medium / high volatility).
pub const EURUSD_TRANSITION_PRIOR: [[f64; 3]; 3] = [
    [0.662, 0.335, 0.003],
    [0.662, 0.329, 0.009],
    [0.001, 0.006, 0.993],
];

/// Parameters of a K-state HMM with scalar Gaussian emissions.
/// Always a valid model: every constructor validates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawParameters")]
pub struct HmmParameters {
    start_prob: Array1<f64>,
    transition: Array2<f64>,
    means: Array1<f64>,
    variances: Array1<f64>,
}

#[derive(Deserialize)]
struct RawParameters {
    start_prob: Array1<f64>,
    transition: Array2<f64>,
    means: Array1<f64>,
    variances: Array1<f64>,
}

impl TryFrom<RawParameters> for HmmParameters {
    type Error = InputError;

    fn try_from(raw: RawParameters) -> Result<Self, Self::Error> {
        HmmParameters::new(raw.start_prob, raw.transition, raw.means, raw.variances)
    }
}

fn is_distribution<'a>(values: impl IntoIterator<Item = &'a f64>) -> bool {
    let mut sum = 0.0;
    for &p in values {
        if !p.is_finite() || p < 0.0 {
            return false;
        }
        sum += p;
    }
    (sum - 1.0).abs() <= PARAM_TOLERANCE
}

impl HmmParameters {
    pub fn new(
        start_prob: Array1<f64>,
        transition: Array2<f64>,
        means: Array1<f64>,
        variances: Array1<f64>,
    ) -> Result<Self, InputError> {
        let k = start_prob.len();
        if k == 0 {
            return Err(InputError::InvalidParameters("model needs at least one state".to_string()));
        }
        if transition.dim() != (k, k) || means.len() != k || variances.len() != k {
            return Err(InputError::InvalidParameters(format!(
                "shape mismatch: {} start probabilities, {:?} transition, {} means, {} variances",
                k,
                transition.dim(),
                means.len(),
                variances.len()
            )));
        }
        if !is_distribution(start_prob.iter()) {
            return Err(InputError::InvalidParameters("start probabilities must sum to 1".to_string()));
        }
        for (i, row) in transition.rows().into_iter().enumerate() {
            if !is_distribution(row.iter()) {
                return Err(InputError::InvalidParameters(format!(
                    "transition row {} is not a probability distribution",
                    i
                )));
            }
        }
        if means.iter().any(|m| !m.is_finite()) {
            return Err(InputError::InvalidParameters("emission means must be finite".to_string()));
        }
        if variances.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(InputError::InvalidParameters("emission variances must be positive".to_string()));
        }

        Ok(Self { start_prob, transition, means, variances })
    }

    /// Convenience constructor from plain vectors.
    pub fn from_vecs(
        start_prob: Vec<f64>,
        transition: Vec<Vec<f64>>,
        means: Vec<f64>,
        variances: Vec<f64>,
    ) -> Result<Self, InputError> {
        let k = start_prob.len();
        if transition.len() != k || transition.iter().any(|row| row.len() != k) {
            return Err(InputError::InvalidParameters("transition matrix must be K x K".to_string()));
        }
        let flat: Vec<f64> = transition.into_iter().flatten().collect();
        let transition = Array2::from_shape_vec((k, k), flat)
            .map_err(|e| InputError::InvalidParameters(e.to_string()))?;
        Self::new(Array1::from_vec(start_prob), transition, Array1::from_vec(means), Array1::from_vec(variances))
    }

    pub fn n_states(&self) -> usize {
        self.start_prob.len()
    }

    pub fn start_prob(&self) -> &Array1<f64> {
        &self.start_prob
    }

    pub fn transition(&self) -> &Array2<f64> {
        &self.transition
    }

    pub fn means(&self) -> &Array1<f64> {
        &self.means
    }

    pub fn variances(&self) -> &Array1<f64> {
        &self.variances
    }

    /// Gaussian log-density of `x` under `state`'s emission.
    pub fn log_emission(&self, state: usize, x: f64) -> f64 {
        let var = self.variances[state];
        let diff = x - self.means[state];
        -0.5 * ((2.0 * PI * var).ln() + diff * diff / var)
    }

    /// Same model with states reordered by ascending emission mean. Equal
    /// means keep their relative order.
    pub fn sorted_by_mean(&self) -> Self {
        let k = self.n_states();
        let mut order: Vec<usize> = (0..k).collect();
        order.sort_by(|&a, &b| self.means[a].total_cmp(&self.means[b]));

        let start_prob = Array1::from_shape_fn(k, |i| self.start_prob[order[i]]);
        let transition = Array2::from_shape_fn((k, k), |(i, j)| self.transition[[order[i], order[j]]]);
        let means = Array1::from_shape_fn(k, |i| self.means[order[i]]);
        let variances = Array1::from_shape_fn(k, |i| self.variances[order[i]]);

        Self { start_prob, transition, means, variances }
    }
}

/// Log-space forward/backward quantities for one observation sequence.
#[derive(Debug, Clone)]
pub struct Posteriors {
    /// T x K smoothed state posteriors.
    pub gamma: Array2<f64>,
    /// K x K expected transition counts summed over the sequence.
    pub xi_sum: Array2<f64>,
    pub log_likelihood: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViterbiPath {
    pub states: Vec<usize>,
    pub log_probability: f64,
}

impl ViterbiPath {
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Summary of the training run that produced a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub log_likelihood: f64,
    pub iterations: usize,
    pub converged: bool,
    pub n_observations: usize,
}

/// K-state Gaussian HMM. Inference takes `&self` only; retraining produces a
/// new model rather than mutating this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianHmm {
    params: HmmParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fit: Option<FitSummary>,
}

#[derive(Serialize, Deserialize)]
struct ModelFile {
    model_type: String,
    n_states: usize,
    #[serde(flatten)]
    model: GaussianHmm,
}

const MODEL_TYPE: &str = "GaussianHMM";

impl GaussianHmm {
    pub fn new(params: HmmParameters) -> Self {
        Self { params, fit: None }
    }

    pub fn with_fit_summary(params: HmmParameters, fit: FitSummary) -> Self {
        Self { params, fit: Some(fit) }
    }

    pub fn params(&self) -> &HmmParameters {
        &self.params
    }

    pub fn fit_summary(&self) -> Option<&FitSummary> {
        self.fit.as_ref()
    }

    pub fn n_states(&self) -> usize {
        self.params.n_states()
    }

    fn check_observations(observations: &[f64]) -> Result<(), InputError> {
        if observations.is_empty() {
            return Err(InputError::EmptySequence);
        }
        if let Some((index, &value)) = observations.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(InputError::NonFiniteObservation { index, value });
        }
        Ok(())
    }

    fn log_transition(&self) -> Array2<f64> {
        self.params.transition.mapv(f64::ln)
    }

    fn log_emissions(&self, observations: &[f64]) -> Array2<f64> {
        let k = self.n_states();
        Array2::from_shape_fn((observations.len(), k), |(t, j)| self.params.log_emission(j, observations[t]))
    }

    /// Log emission densities of one observation under every state.
    pub fn log_emission_vector(&self, x: f64) -> Vec<f64> {
        (0..self.n_states()).map(|j| self.params.log_emission(j, x)).collect()
    }

    /// Forward pass in log space: (log_alpha, log-likelihood).
    fn forward(&self, log_b: &Array2<f64>, log_a: &Array2<f64>) -> Result<(Array2<f64>, f64), InputError> {
        let (n_obs, k) = log_b.dim();
        let mut log_alpha = Array2::from_elem((n_obs, k), f64::NEG_INFINITY);
        let mut terms = vec![0.0; k];

        for j in 0..k {
            log_alpha[[0, j]] = self.params.start_prob[j].ln() + log_b[[0, j]];
        }

        for t in 1..n_obs {
            for j in 0..k {
                for i in 0..k {
                    terms[i] = log_alpha[[t - 1, i]] + log_a[[i, j]];
                }
                log_alpha[[t, j]] = log_sum_exp(&terms) + log_b[[t, j]];
            }
        }

        let last: Vec<f64> = log_alpha.row(n_obs - 1).to_vec();
        let log_prob = log_sum_exp(&last);
        if !log_prob.is_finite() {
            return Err(InputError::ZeroLikelihood);
        }
        Ok((log_alpha, log_prob))
    }

    fn backward(&self, log_b: &Array2<f64>, log_a: &Array2<f64>) -> Array2<f64> {
        let (n_obs, k) = log_b.dim();
        let mut log_beta = Array2::from_elem((n_obs, k), f64::NEG_INFINITY);
        let mut terms = vec![0.0; k];

        for i in 0..k {
            log_beta[[n_obs - 1, i]] = 0.0;
        }

        for t in (0..n_obs - 1).rev() {
            for i in 0..k {
                for j in 0..k {
                    terms[j] = log_a[[i, j]] + log_b[[t + 1, j]] + log_beta[[t + 1, j]];
                }
                log_beta[[t, i]] = log_sum_exp(&terms);
            }
        }

        log_beta
    }

    /// Full forward-backward: smoothed posteriors, expected transition counts
    /// and the sequence log-likelihood.
    pub fn posteriors(&self, observations: &[f64]) -> Result<Posteriors, InputError> {
        Self::check_observations(observations)?;
        let k = self.n_states();
        let n_obs = observations.len();

        let log_a = self.log_transition();
        let log_b = self.log_emissions(observations);
        let (log_alpha, log_prob) = self.forward(&log_b, &log_a)?;
        let log_beta = self.backward(&log_b, &log_a);

        let mut gamma = Array2::zeros((n_obs, k));
        let mut terms = vec![0.0; k];
        for t in 0..n_obs {
            for i in 0..k {
                terms[i] = log_alpha[[t, i]] + log_beta[[t, i]];
            }
            let log_norm = log_sum_exp(&terms);
            for i in 0..k {
                gamma[[t, i]] = (terms[i] - log_norm).exp();
            }
        }

        let mut xi_sum = Array2::zeros((k, k));
        for t in 0..n_obs.saturating_sub(1) {
            for i in 0..k {
                for j in 0..k {
                    let log_xi = log_alpha[[t, i]] + log_a[[i, j]] + log_b[[t + 1, j]] + log_beta[[t + 1, j]]
                        - log_prob;
                    xi_sum[[i, j]] += log_xi.exp();
                }
            }
        }

        Ok(Posteriors { gamma, xi_sum, log_likelihood: log_prob })
    }

    /// Smoothed P(state_t | all observations) for every bar.
    pub fn state_probabilities(&self, observations: &[f64]) -> Result<Vec<StateProbabilities>, InputError> {
        let posteriors = self.posteriors(observations)?;
        Ok(posteriors
            .gamma
            .rows()
            .into_iter()
            .map(|row| StateProbabilities::from(row.to_vec()))
            .collect())
    }

    pub fn log_likelihood(&self, observations: &[f64]) -> Result<f64, InputError> {
        Self::check_observations(observations)?;
        let log_a = self.log_transition();
        let log_b = self.log_emissions(observations);
        Ok(self.forward(&log_b, &log_a)?.1)
    }

    /// Most likely state sequence. Equal scores resolve to the lower state
    /// index, both in the recursion and at the final bar.
    pub fn viterbi(&self, observations: &[f64]) -> Result<ViterbiPath, InputError> {
        Self::check_observations(observations)?;
        let k = self.n_states();
        let n_obs = observations.len();

        let log_a = self.log_transition();
        let log_b = self.log_emissions(observations);
        let mut log_delta = Array2::from_elem((n_obs, k), f64::NEG_INFINITY);
        let mut psi = Array2::<usize>::zeros((n_obs, k));

        for j in 0..k {
            log_delta[[0, j]] = self.params.start_prob[j].ln() + log_b[[0, j]];
        }

        for t in 1..n_obs {
            for j in 0..k {
                let mut max_val = f64::NEG_INFINITY;
                let mut max_state = 0;

                for i in 0..k {
                    let val = log_delta[[t - 1, i]] + log_a[[i, j]];
                    if val > max_val {
                        max_val = val;
                        max_state = i;
                    }
                }

                log_delta[[t, j]] = max_val + log_b[[t, j]];
                psi[[t, j]] = max_state;
            }
        }

        let mut states = vec![0; n_obs];
        let mut best = f64::NEG_INFINITY;
        for j in 0..k {
            if log_delta[[n_obs - 1, j]] > best {
                best = log_delta[[n_obs - 1, j]];
                states[n_obs - 1] = j;
            }
        }
        if !best.is_finite() {
            return Err(InputError::ZeroLikelihood);
        }

        for t in (0..n_obs - 1).rev() {
            states[t] = psi[[t + 1, states[t + 1]]];
        }

        Ok(ViterbiPath { states, log_probability: best })
    }

    /// Viterbi labels only.
    pub fn predict(&self, observations: &[f64]) -> Result<Vec<usize>, InputError> {
        Ok(self.viterbi(observations)?.states)
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let file = ModelFile {
            model_type: MODEL_TYPE.to_string(),
            n_states: self.n_states(),
            model: self.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write model file {}", path.display()))?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let json_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model file {}", path.display()))?;
        let file: ModelFile = serde_json::from_str(&json_str)
            .map_err(|e| anyhow!("Failed to parse model file {}: {}", path.display(), e))?;

        if file.model_type != MODEL_TYPE {
            return Err(anyhow!("Unsupported model type: {}", file.model_type));
        }
        if file.n_states != file.model.n_states() {
            return Err(anyhow!(
                "Model file declares {} states but parameters have {}",
                file.n_states,
                file.model.n_states()
            ));
        }
        Ok(file.model)
    }
}

/// Log-sum-exp trick for numerical stability
pub fn log_sum_exp(log_values: &[f64]) -> f64 {
    if log_values.is_empty() {
        return f64::NEG_INFINITY;
    }

    let max_val = log_values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max_val == f64::INFINITY {
        return f64::INFINITY;
    }

    let sum_exp: f64 = log_values.iter().map(|&v| (v - max_val).exp()).sum();
    max_val + sum_exp.ln()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    pub(crate) fn three_state_params() -> HmmParameters {
        HmmParameters::from_vecs(
            vec![0.5, 0.3, 0.2],
            vec![vec![0.90, 0.08, 0.02], vec![0.10, 0.80, 0.10], vec![0.05, 0.15, 0.80]],
            vec![0.0, 0.5, 1.0],
            vec![0.01, 0.02, 0.05],
        )
        .unwrap()
    }

    fn sample_observations() -> Vec<f64> {
        vec![0.02, -0.05, 0.1, 0.45, 0.52, 0.61, 0.48, 1.1, 0.95, 1.3, 0.9, 0.4, 0.05, 0.0]
    }

    #[test]
    fn test_parameter_validation() {
        let bad_row = HmmParameters::from_vecs(
            vec![0.5, 0.5],
            vec![vec![0.5, 0.4], vec![0.5, 0.5]],
            vec![0.0, 1.0],
            vec![1.0, 1.0],
        );
        assert!(matches!(bad_row, Err(InputError::InvalidParameters(_))));

        let zero_var = HmmParameters::from_vecs(
            vec![1.0, 0.0],
            vec![vec![0.5, 0.5], vec![0.5, 0.5]],
            vec![0.0, 1.0],
            vec![1.0, 0.0],
        );
        assert!(zero_var.is_err());

        let bad_shape = HmmParameters::from_vecs(vec![1.0], vec![vec![1.0]], vec![0.0, 1.0], vec![1.0]);
        assert!(bad_shape.is_err());

        let empty = HmmParameters::from_vecs(vec![], vec![], vec![], vec![]);
        assert!(empty.is_err());
    }

    #[test]
    fn test_deserialization_validates() {
        let json = r#"{"start_prob":{"v":1,"dim":[2],"data":[0.9,0.9]},
            "transition":{"v":1,"dim":[2,2],"data":[0.5,0.5,0.5,0.5]},
            "means":{"v":1,"dim":[2],"data":[0.0,1.0]},
            "variances":{"v":1,"dim":[2],"data":[1.0,1.0]}}"#;
        assert!(serde_json::from_str::<HmmParameters>(json).is_err());

        let params = three_state_params();
        let text = serde_json::to_string(&params).unwrap();
        let back: HmmParameters = serde_json::from_str(&text).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn test_log_emission_matches_gaussian_pdf() {
        let params = three_state_params();
        let x = 0.47;
        let var: f64 = 0.02;
        let pdf = (-(x - 0.5f64).powi(2) / (2.0 * var)).exp() / (2.0 * PI * var).sqrt();
        assert_relative_eq!(params.log_emission(1, x), pdf.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_sorted_by_mean() {
        let params = HmmParameters::from_vecs(
            vec![0.2, 0.8],
            vec![vec![0.7, 0.3], vec![0.1, 0.9]],
            vec![5.0, -1.0],
            vec![2.0, 1.0],
        )
        .unwrap();
        let sorted = params.sorted_by_mean();
        assert_eq!(sorted.means().to_vec(), vec![-1.0, 5.0]);
        assert_eq!(sorted.variances().to_vec(), vec![1.0, 2.0]);
        assert_eq!(sorted.start_prob().to_vec(), vec![0.8, 0.2]);
        assert_eq!(sorted.transition()[[0, 0]], 0.9);
        assert_eq!(sorted.transition()[[0, 1]], 0.1);
        assert_eq!(sorted.transition()[[1, 0]], 0.3);
        assert_eq!(sorted.transition()[[1, 1]], 0.7);
    }

    #[test]
    fn test_posteriors_sum_to_one() {
        let hmm = GaussianHmm::new(three_state_params());
        let probs = hmm.state_probabilities(&sample_observations()).unwrap();
        assert_eq!(probs.len(), sample_observations().len());
        for p in &probs {
            assert_relative_eq!(p.sum(), 1.0, epsilon = 1e-6);
        }
        // Clear-cut bars land in the obvious states.
        assert_eq!(probs[0].dominant(), 0);
        assert_eq!(probs[4].dominant(), 1);
        assert_eq!(probs[9].dominant(), 2);
    }

    #[test]
    fn test_log_likelihood_single_observation() {
        let hmm = GaussianHmm::new(three_state_params());
        let x = 0.3;
        let expected = log_sum_exp(
            &(0..3).map(|j| hmm.params().start_prob()[j].ln() + hmm.params().log_emission(j, x)).collect::<Vec<_>>(),
        );
        assert_relative_eq!(hmm.log_likelihood(&[x]).unwrap(), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_xi_sum_matches_transition_count() {
        let hmm = GaussianHmm::new(three_state_params());
        let obs = sample_observations();
        let post = hmm.posteriors(&obs).unwrap();
        assert_relative_eq!(post.xi_sum.sum(), (obs.len() - 1) as f64, epsilon = 1e-6);
    }

    #[test]
    fn test_inference_rejects_bad_input() {
        let hmm = GaussianHmm::new(three_state_params());
        assert_eq!(hmm.state_probabilities(&[]).unwrap_err(), InputError::EmptySequence);
        assert!(matches!(
            hmm.viterbi(&[0.1, f64::NAN]),
            Err(InputError::NonFiniteObservation { index: 1, .. })
        ));
    }

    #[test]
    fn test_viterbi_path() {
        let hmm = GaussianHmm::new(three_state_params());
        let obs = sample_observations();
        let path = hmm.viterbi(&obs).unwrap();
        assert_eq!(path.len(), obs.len());
        assert_eq!(path.states[0], 0);
        assert_eq!(path.states[4], 1);
        assert_eq!(path.states[9], 2);
        assert!(path.log_probability.is_finite());
        assert!(path.log_probability <= hmm.log_likelihood(&obs).unwrap());
    }

    #[test]
    fn test_viterbi_ties_prefer_lower_state() {
        // Two identical states: every step is a tie.
        let params = HmmParameters::from_vecs(
            vec![0.5, 0.5],
            vec![vec![0.5, 0.5], vec![0.5, 0.5]],
            vec![0.0, 0.0],
            vec![1.0, 1.0],
        )
        .unwrap();
        let hmm = GaussianHmm::new(params);
        assert_eq!(hmm.predict(&[0.3, -0.2, 1.0, 0.0]).unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_inference_is_deterministic() {
        let hmm = GaussianHmm::new(three_state_params());
        let obs = sample_observations();
        let a = hmm.state_probabilities(&obs).unwrap();
        let b = hmm.state_probabilities(&obs).unwrap();
        assert_eq!(a, b);
        assert_eq!(hmm.viterbi(&obs).unwrap(), hmm.viterbi(&obs).unwrap());
    }

    #[test]
    fn test_save_and_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let hmm = GaussianHmm::with_fit_summary(
            three_state_params(),
            FitSummary { log_likelihood: -12.5, iterations: 7, converged: true, n_observations: 300 },
        );
        hmm.save_json(&path).unwrap();
        let loaded = GaussianHmm::load_json(&path).unwrap();
        assert_eq!(loaded, hmm);
    }

    #[test]
    fn test_load_rejects_invalid_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, r#"{"model_type":"Other","n_states":1}"#).unwrap();
        assert!(GaussianHmm::load_json(&path).is_err());
        assert!(GaussianHmm::load_json(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_log_sum_exp() {
        let values = vec![-1.0, -2.0, -3.0];
        let result = log_sum_exp(&values);
        assert!(result > -1.0 && result < 0.0);
        assert_eq!(log_sum_exp(&[]), f64::NEG_INFINITY);
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY, f64::NEG_INFINITY]), f64::NEG_INFINITY);
        assert_relative_eq!(log_sum_exp(&[-1000.0, -1000.0]), -1000.0 + 2f64.ln(), epsilon = 1e-9);
    }

    proptest! {
        #[test]
        fn prop_posteriors_normalized_and_paths_in_range(
            obs in proptest::collection::vec(-2.0f64..3.0, 1..80)
        ) {
            let hmm = GaussianHmm::new(three_state_params());
            let probs = hmm.state_probabilities(&obs).unwrap();
            prop_assert_eq!(probs.len(), obs.len());
            for p in &probs {
                prop_assert!((p.sum() - 1.0).abs() < 1e-6);
            }
            let path = hmm.predict(&obs).unwrap();
            prop_assert_eq!(path.len(), obs.len());
            prop_assert!(path.iter().all(|&s| s < 3));
        }
    }
}
