//! Directional-change regime detection and signal decisions.
//!
//! Prices flow through the RDC extractor (`indicators`), a Gaussian HMM
//! (`ml::hmm`) and the decision table (`strategies`); `engine` wires them
//! together bar by bar.

pub mod config;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod ml;
pub mod strategies;
pub mod types;

pub use config::EngineConfig;
pub use engine::SignalPipeline;
pub use error::{EngineError, FittingError, InputError, NumericalWarning};
pub use ml::{ForecastProvider, ForecastResult, GaussianHmm, RegimeDetector, StateProbabilities};
pub use strategies::{SignalEngine, SignalRecord};
pub use types::{PricePoint, PriceSeries, Signal};
