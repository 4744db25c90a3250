//! Baum-Welch training with quantile seeding and parallel random restarts.
//!
//! Every restart owns its parameters from seed to convergence, so restarts run
//! on the rayon pool without sharing any mutable state. The winner is the
//! restart with the highest finite log-likelihood, lowest index on ties, and
//! its states are relabelled by ascending emission mean.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::gaussian_hmm::{FitSummary, GaussianHmm, HmmParameters, Posteriors};
use crate::config::HmmSettings;
use crate::error::{FittingError, InputError, NumericalWarning};
use crate::indicators::{mean, quantile_sorted, variance_about};

/// States with less posterior mass than this keep their previous emission.
const MIN_OCCUPANCY: f64 = 1e-10;

/// Self-transition probability of the default seed matrix.
const DEFAULT_PERSISTENCE: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub log_likelihood: f64,
    pub iterations: usize,
    pub converged: bool,
    pub best_restart: usize,
    /// Final log-likelihood per restart; `None` where the restart degenerated.
    pub restart_log_likelihoods: Vec<Option<f64>>,
    /// Log-likelihood of the winning restart, seed first.
    pub history: Vec<f64>,
    pub warnings: Vec<NumericalWarning>,
}

#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub model: GaussianHmm,
    pub report: FitReport,
}

#[derive(Debug)]
struct RestartOutcome {
    params: HmmParameters,
    log_likelihood: f64,
    iterations: usize,
    converged: bool,
    history: Vec<f64>,
    warnings: Vec<NumericalWarning>,
}

/// Baum-Welch trainer for `GaussianHmm`.
#[derive(Debug, Clone)]
pub struct BaumWelch {
    settings: HmmSettings,
}

impl BaumWelch {
    pub fn new(settings: HmmSettings) -> Result<Self, FittingError> {
        settings
            .validate()
            .map_err(|errors| FittingError::InvalidConfig(errors.join(", ")))?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &HmmSettings {
        &self.settings
    }

    /// Fit a fresh model. Never touches any existing model.
    pub fn fit(&self, observations: &[f64]) -> Result<TrainedModel, FittingError> {
        let settings = &self.settings;
        if observations.len() < settings.min_observations {
            return Err(FittingError::InsufficientData {
                len: observations.len(),
                minimum: settings.min_observations,
            });
        }
        if let Some((index, &value)) = observations.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(FittingError::NonFiniteObservation { index, value });
        }

        let mut sorted = observations.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        info!(
            "Training {}-state HMM on {} observations ({} restarts, max {} iterations)",
            settings.num_states,
            observations.len(),
            settings.em_restarts,
            settings.em_max_iterations
        );

        let outcomes: Vec<Result<RestartOutcome, String>> = (0..settings.em_restarts)
            .into_par_iter()
            .map(|restart| self.run_restart(observations, &sorted, restart))
            .collect();

        let mut best: Option<(usize, RestartOutcome)> = None;
        let mut restart_log_likelihoods = Vec::with_capacity(outcomes.len());
        let mut warnings = Vec::new();

        for (restart, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(outcome) => {
                    debug!(
                        "Restart {}: log-likelihood {:.4} after {} iterations (converged: {})",
                        restart, outcome.log_likelihood, outcome.iterations, outcome.converged
                    );
                    restart_log_likelihoods.push(Some(outcome.log_likelihood));
                    warnings.extend(outcome.warnings.iter().copied());
                    let better = best
                        .as_ref()
                        .map_or(true, |(_, current)| outcome.log_likelihood > current.log_likelihood);
                    if better {
                        best = Some((restart, outcome));
                    }
                }
                Err(reason) => {
                    warn!("Restart {} discarded: {}", restart, reason);
                    restart_log_likelihoods.push(None);
                }
            }
        }

        let (best_restart, outcome) = best.ok_or(FittingError::Degenerate {
            restarts: settings.em_restarts,
        })?;

        for warning in &warnings {
            warn!("{}", warning);
        }
        if !outcome.converged {
            warn!(
                "Best restart did not converge within {} iterations",
                settings.em_max_iterations
            );
        }

        let params = outcome.params.sorted_by_mean();
        info!(
            "HMM trained: log-likelihood {:.4}, restart {}, {} iterations, means {:?}",
            outcome.log_likelihood,
            best_restart,
            outcome.iterations,
            params.means().to_vec()
        );

        let summary = FitSummary {
            log_likelihood: outcome.log_likelihood,
            iterations: outcome.iterations,
            converged: outcome.converged,
            n_observations: observations.len(),
        };
        let report = FitReport {
            log_likelihood: outcome.log_likelihood,
            iterations: outcome.iterations,
            converged: outcome.converged,
            best_restart,
            restart_log_likelihoods,
            history: outcome.history,
            warnings,
        };

        Ok(TrainedModel {
            model: GaussianHmm::with_fit_summary(params, summary),
            report,
        })
    }

    fn run_restart(&self, observations: &[f64], sorted: &[f64], restart: usize) -> Result<RestartOutcome, String> {
        let settings = &self.settings;
        let seed = if restart == 0 {
            self.quantile_seed(sorted)
        } else {
            self.jittered_seed(sorted, restart)
        }
        .map_err(|e| format!("invalid seed parameters: {}", e))?;

        let mut model = GaussianHmm::new(seed);
        let mut posteriors = model.posteriors(observations).map_err(|e| e.to_string())?;
        let mut history = vec![posteriors.log_likelihood];
        let mut warnings = Vec::new();
        let mut iterations = 0;
        let mut converged = false;

        for iteration in 1..=settings.em_max_iterations {
            let (params, mut step_warnings) = maximization(
                model.params(),
                observations,
                &posteriors,
                settings.variance_floor,
                restart,
                iteration,
            )
            .map_err(|e| format!("iteration {}: {}", iteration, e))?;

            let next_model = GaussianHmm::new(params);
            let next = next_model
                .posteriors(observations)
                .map_err(|e| format!("iteration {}: {}", iteration, e))?;

            let gain = next.log_likelihood - posteriors.log_likelihood;
            model = next_model;
            posteriors = next;
            history.push(posteriors.log_likelihood);
            warnings.append(&mut step_warnings);
            iterations = iteration;

            if gain < settings.em_tolerance {
                converged = true;
                break;
            }
        }

        Ok(RestartOutcome {
            params: model.params().clone(),
            log_likelihood: posteriors.log_likelihood,
            iterations,
            converged,
            history,
            warnings,
        })
    }

    fn seed_transition(&self) -> Array2<f64> {
        let k = self.settings.num_states;
        match &self.settings.initial_transition {
            Some(matrix) => Array2::from_shape_fn((k, k), |(i, j)| matrix[i][j]),
            None => {
                let off = (1.0 - DEFAULT_PERSISTENCE) / (k - 1) as f64;
                Array2::from_shape_fn((k, k), |(i, j)| if i == j { DEFAULT_PERSISTENCE } else { off })
            }
        }
    }

    /// K equal-mass bins of the sorted observations give the emission seeds.
    fn quantile_seed(&self, sorted: &[f64]) -> Result<HmmParameters, InputError> {
        let k = self.settings.num_states;
        let n = sorted.len();
        let floor = self.settings.variance_floor;

        let mut means = Array1::zeros(k);
        let mut variances = Array1::zeros(k);
        for j in 0..k {
            let bin = &sorted[j * n / k..(j + 1) * n / k];
            let center = mean(bin)
                .or_else(|| quantile_sorted(sorted, (j as f64 + 0.5) / k as f64))
                .unwrap_or(0.0);
            means[j] = center;
            variances[j] = variance_about(bin, center).unwrap_or(floor).max(floor);
        }

        HmmParameters::new(Array1::from_elem(k, 1.0 / k as f64), self.seed_transition(), means, variances)
    }

    /// Quantile seed with means drawn inside their quantile bands, scaled
    /// variances and a random persistent transition matrix.
    fn jittered_seed(&self, sorted: &[f64], restart: usize) -> Result<HmmParameters, InputError> {
        let k = self.settings.num_states;
        let floor = self.settings.variance_floor;
        let base = self.quantile_seed(sorted)?;
        let mut rng = StdRng::seed_from_u64(self.settings.seed.wrapping_add(restart as u64));

        let means = Array1::from_shape_fn(k, |j| {
            let q = (j as f64 + rng.gen_range(0.2..0.8)) / k as f64;
            quantile_sorted(sorted, q).unwrap_or(base.means()[j])
        });
        let variances = Array1::from_shape_fn(k, |j| (base.variances()[j] * rng.gen_range(0.5..2.0)).max(floor));

        let mut transition = Array2::zeros((k, k));
        for i in 0..k {
            let stay: f64 = rng.gen_range(0.5..0.95);
            let weights: Vec<f64> = (0..k).map(|_| rng.gen_range(0.1..1.0)).collect();
            let off_total: f64 = weights.iter().enumerate().filter(|(j, _)| *j != i).map(|(_, w)| w).sum();
            for j in 0..k {
                transition[[i, j]] = if i == j { stay } else { (1.0 - stay) * weights[j] / off_total };
            }
        }

        HmmParameters::new(Array1::from_elem(k, 1.0 / k as f64), transition, means, variances)
    }
}

/// One M-step from the E-step quantities of `current`.
fn maximization(
    current: &HmmParameters,
    observations: &[f64],
    posteriors: &Posteriors,
    variance_floor: f64,
    restart: usize,
    iteration: usize,
) -> Result<(HmmParameters, Vec<NumericalWarning>), InputError> {
    let k = current.n_states();
    let gamma = &posteriors.gamma;
    let mut warnings = Vec::new();

    let first = gamma.row(0);
    let start_prob = &first / first.sum();

    let mut transition = current.transition().clone();
    for i in 0..k {
        let row = posteriors.xi_sum.row(i);
        let total = row.sum();
        if total > 0.0 {
            transition.row_mut(i).assign(&(&row / total));
        }
    }

    let occupancy = gamma.sum_axis(Axis(0));
    let mut means = current.means().clone();
    let mut variances = current.variances().clone();
    for i in 0..k {
        let weight = occupancy[i];
        if weight < MIN_OCCUPANCY {
            continue;
        }
        let column = gamma.column(i);
        let mu = column.iter().zip(observations).map(|(g, x)| g * x).sum::<f64>() / weight;
        let var = column
            .iter()
            .zip(observations)
            .map(|(g, x)| g * (x - mu).powi(2))
            .sum::<f64>()
            / weight;

        means[i] = mu;
        variances[i] = if var < variance_floor {
            warnings.push(NumericalWarning::VarianceFloorApplied {
                restart,
                iteration,
                state: i,
                variance: var,
            });
            variance_floor
        } else {
            var
        };
    }

    Ok((HmmParameters::new(start_prob, transition, means, variances)?, warnings))
}
