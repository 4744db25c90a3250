//! Error and warning types shared by the extractor, the regime model and the
//! decision engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Training could not produce a usable model. Never retried by the core.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FittingError {
    #[error("insufficient training data: have {len} observations, need {minimum}")]
    InsufficientData { len: usize, minimum: usize },

    #[error("non-finite observation {value} at index {index}")]
    NonFiniteObservation { index: usize, value: f64 },

    #[error("invalid training configuration: {0}")]
    InvalidConfig(String),

    #[error("all {restarts} restarts produced a non-finite log-likelihood")]
    Degenerate { restarts: usize },
}

/// A caller handed the core malformed data for a single evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InputError {
    #[error("probability vector has {got} states, expected {expected}")]
    ProbabilityLength { expected: usize, got: usize },

    #[error("probability {value} for state {state} is not a valid probability")]
    InvalidProbability { state: usize, value: f64 },

    #[error("probabilities sum to {sum}, expected 1 within {tolerance}")]
    ProbabilitySum { sum: f64, tolerance: f64 },

    #[error("forecast field {field} is not finite ({value})")]
    NonFiniteForecast { field: &'static str, value: f64 },

    #[error("forecast confidence {0} outside [-1, 1]")]
    ConfidenceOutOfRange(f64),

    #[error("non-finite observation {value} at index {index}")]
    NonFiniteObservation { index: usize, value: f64 },

    #[error("observation sequence is empty")]
    EmptySequence,

    #[error("bar at {timestamp} is not after the previous bar at {previous}")]
    OutOfOrder { timestamp: String, previous: String },

    #[error("price {0} cannot be used for directional change detection")]
    InvalidPrice(String),

    #[error("invalid model parameters: {0}")]
    InvalidParameters(String),

    #[error("observation sequence has zero likelihood under the model")]
    ZeroLikelihood,

    #[error("got {got} forecasts for {expected} bars")]
    ForecastCount { expected: usize, got: usize },
}

/// Non-fatal numerical event observed during training or inference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NumericalWarning {
    /// A state's re-estimated variance fell below the floor and was clamped.
    VarianceFloorApplied {
        restart: usize,
        iteration: usize,
        state: usize,
        variance: f64,
    },
    /// Forward mass for a bar underflowed; the bar was renormalized from the
    /// transition prior alone.
    LikelihoodSaturated { index: usize },
}

impl fmt::Display for NumericalWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumericalWarning::VarianceFloorApplied { restart, iteration, state, variance } => write!(
                f,
                "variance floor applied to state {} (raw variance {:.3e}) at restart {} iteration {}",
                state, variance, restart, iteration
            ),
            NumericalWarning::LikelihoodSaturated { index } => {
                write!(f, "log-likelihood saturated at observation {}", index)
            }
        }
    }
}

/// Umbrella error used by the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Fitting(#[from] FittingError),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error("invalid configuration: {}", .0.join(", "))]
    Config(Vec<String>),

    #[error("regime model has not been fitted")]
    NotFitted,

    #[error("forecast provider failed: {0}")]
    Forecast(#[source] anyhow::Error),
}
