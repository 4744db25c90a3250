use chrono::{DateTime, Utc};

use crate::config::DcSettings;
use crate::error::InputError;
use crate::indicators::{compute_rdc, RdcValue};
use crate::types::PricePoint;

/// RDC observation channel for the regime model, aligned with the bars it
/// came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RegimeObservations {
    rdc: Vec<RdcValue>,
}

impl RegimeObservations {
    pub fn len(&self) -> usize {
        self.rdc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rdc.is_empty()
    }

    /// Bar index of the first observation (the warm-up boundary).
    pub fn first_index(&self) -> Option<usize> {
        self.rdc.first().map(|v| v.index)
    }

    pub fn values(&self) -> Vec<f64> {
        self.rdc.iter().map(|v| v.value).collect()
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.rdc.iter().map(|v| v.timestamp).collect()
    }

    pub fn rdc(&self) -> &[RdcValue] {
        &self.rdc
    }
}

/// Prices to HMM observations: one RDC value per bar past warm-up.
pub fn extract_regime_observations(
    prices: &[PricePoint],
    settings: &DcSettings,
) -> Result<RegimeObservations, InputError> {
    Ok(RegimeObservations { rdc: compute_rdc(prices, settings)? })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal::Decimal;

    #[test]
    fn test_observations_align_with_warm_up() {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let prices: Vec<PricePoint> = (0..40)
            .map(|i| {
                let close = 1.1 + 0.002 * ((i as f64) * 0.7).sin();
                PricePoint::flat(start + Duration::hours(i), Decimal::try_from(close).unwrap())
            })
            .collect();
        let settings = DcSettings { theta: 0.001, window: 10, ..DcSettings::default() };

        let obs = extract_regime_observations(&prices, &settings).unwrap();
        assert_eq!(obs.len(), 31);
        assert_eq!(obs.first_index(), Some(9));
        assert_eq!(obs.timestamps()[0], prices[9].timestamp);
        assert!(obs.values().iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn test_short_history_has_no_observations() {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let prices = vec![PricePoint::flat(start, Decimal::ONE)];
        let obs = extract_regime_observations(&prices, &DcSettings::default()).unwrap();
        assert!(obs.is_empty());
        assert_eq!(obs.first_index(), None);
    }
}
