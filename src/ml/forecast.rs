use serde::{Deserialize, Serialize};

use crate::error::InputError;
use crate::types::pips_to_return;

/// Output of the external price forecaster for one bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub point_forecast_pips: f64,
    /// Lower bound of the prediction interval, as a return.
    pub lower_bound: f64,
    /// Upper bound of the prediction interval, as a return.
    pub upper_bound: f64,
    /// Signed conviction in [-1, 1].
    pub confidence: f64,
}

impl ForecastResult {
    pub fn new(point_forecast_pips: f64, lower_bound: f64, upper_bound: f64, confidence: f64) -> Self {
        Self { point_forecast_pips, lower_bound, upper_bound, confidence }
    }

    pub fn interval_width(&self) -> f64 {
        self.upper_bound - self.lower_bound
    }

    pub fn point_forecast_return(&self) -> f64 {
        pips_to_return(self.point_forecast_pips)
    }

    /// Numeric contract: every field finite, confidence in [-1, 1].
    pub fn validate(&self) -> Result<(), InputError> {
        let fields = [
            ("point_forecast_pips", self.point_forecast_pips),
            ("lower_bound", self.lower_bound),
            ("upper_bound", self.upper_bound),
            ("confidence", self.confidence),
        ];
        for (field, value) in fields {
            if !value.is_finite() {
                return Err(InputError::NonFiniteForecast { field, value });
            }
        }
        if !(-1.0..=1.0).contains(&self.confidence) {
            return Err(InputError::ConfidenceOutOfRange(self.confidence));
        }
        Ok(())
    }
}

/// Seam to the price forecaster. The engine only checks the numeric contract
/// of what comes back.
#[cfg_attr(test, mockall::automock)]
pub trait ForecastProvider {
    fn forecast(&self, features: &[f64]) -> anyhow::Result<ForecastResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_well_formed_forecast() {
        let forecast = ForecastResult::new(50.0, 0.01, 0.02, 0.5);
        assert!(forecast.validate().is_ok());
        assert!((forecast.interval_width() - 0.01).abs() < 1e-12);
        assert!((forecast.point_forecast_return() - 0.005).abs() < 1e-12);
    }

    #[test]
    fn test_validate_rejects_non_finite_fields() {
        let forecast = ForecastResult::new(f64::NAN, 0.0, 0.01, 0.2);
        assert!(matches!(
            forecast.validate(),
            Err(InputError::NonFiniteForecast { field: "point_forecast_pips", .. })
        ));
        let forecast = ForecastResult::new(10.0, 0.0, f64::INFINITY, 0.2);
        assert!(matches!(
            forecast.validate(),
            Err(InputError::NonFiniteForecast { field: "upper_bound", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_confidence_out_of_range() {
        let forecast = ForecastResult::new(10.0, 0.0, 0.01, 1.5);
        assert_eq!(forecast.validate(), Err(InputError::ConfidenceOutOfRange(1.5)));
    }

    #[test]
    fn test_mock_provider() {
        let mut provider = MockForecastProvider::new();
        provider
            .expect_forecast()
            .times(1)
            .returning(|features| Ok(ForecastResult::new(features.len() as f64, -0.01, 0.01, 0.0)));
        let forecast = provider.forecast(&[1.0, 2.0]).unwrap();
        assert_eq!(forecast.point_forecast_pips, 2.0);
    }
}
