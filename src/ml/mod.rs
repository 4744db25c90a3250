pub mod hmm;
pub mod forecast;

pub use hmm::{GaussianHmm, RegimeDetector, RegimeState, StateProbabilities};
pub use forecast::{ForecastProvider, ForecastResult};
