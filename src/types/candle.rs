use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::InputError;

/// One OHLC bar as delivered by the market-data supplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl PricePoint {
    pub fn new(timestamp: DateTime<Utc>, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Self {
        Self { timestamp, open, high, low, close }
    }

    /// Bar with all four prices equal to `close`.
    pub fn flat(timestamp: DateTime<Utc>, close: Decimal) -> Self {
        Self::new(timestamp, close, close, close, close)
    }

    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    pub fn change(&self) -> Decimal {
        self.close - self.open
    }

    pub fn typical_price(&self) -> Decimal {
        (self.high + self.low + self.close) / Decimal::from(3)
    }

    /// Close as f64; `None` if the decimal cannot be represented.
    pub fn close_f64(&self) -> Option<f64> {
        self.close.to_f64()
    }
}

/// Ordered, append-only price history with strictly increasing timestamps.
#[derive(Debug, Clone, Default)]
pub struct PriceSeries {
    points: Vec<PricePoint>,
}

impl PriceSeries {
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { points: Vec::with_capacity(capacity) }
    }

    /// Build a series from bars, rejecting the first out-of-order timestamp.
    pub fn from_points(points: Vec<PricePoint>) -> Result<Self, InputError> {
        let mut series = Self::with_capacity(points.len());
        for point in points {
            series.push(point)?;
        }
        Ok(series)
    }

    pub fn push(&mut self, point: PricePoint) -> Result<(), InputError> {
        if let Some(last) = self.points.last() {
            if point.timestamp <= last.timestamp {
                return Err(InputError::OutOfOrder {
                    timestamp: point.timestamp.to_rfc3339(),
                    previous: last.timestamp.to_rfc3339(),
                });
            }
        }
        self.points.push(point);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<&PricePoint> {
        self.points.last()
    }

    pub fn last_n(&self, n: usize) -> &[PricePoint] {
        let len = self.points.len();
        if n >= len {
            &self.points[..]
        } else {
            &self.points[len - n..]
        }
    }

    pub fn as_slice(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn closes(&self) -> Vec<Decimal> {
        self.points.iter().map(|p| p.close).collect()
    }

    /// Close prices as f64, failing on the first bar that cannot be converted.
    pub fn closes_f64(&self) -> Result<Vec<f64>, InputError> {
        self.points
            .iter()
            .map(|p| p.close_f64().ok_or_else(|| InputError::InvalidPrice(p.close.to_string())))
            .collect()
    }
}
