//! Directional-change (DC) event detection.
//!
//! A reversal is confirmed when the close moves against the current trend by
//! at least `theta` times the running extreme. The overshoot carried by an
//! event belongs to the trend it ends: how far that trend ran past its own
//! confirmation price.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{mean, Indicator};
use crate::error::InputError;
use crate::types::{Direction, PricePoint};

/// Minimum number of usable events for a theta candidate to be scored.
pub const MIN_EVENTS_FOR_THETA: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionalChangeEvent {
    /// Bar index at which the reversal was confirmed.
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    /// Direction of the new trend.
    pub direction: Direction,
    /// Extreme of the trend being reversed.
    pub extreme_price: f64,
    /// Close that confirmed the reversal.
    pub confirmation_price: f64,
    /// Fractional run of the previous trend beyond its confirmation price.
    pub overshoot: f64,
}

/// Price-only form of an event, used where timestamps are not available.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reversal {
    pub direction: Direction,
    pub extreme_price: f64,
    pub confirmation_price: f64,
    pub overshoot: f64,
}

#[derive(Debug, Clone)]
pub struct DirectionalChange {
    theta: f64,
    bars_seen: usize,
    anchor: f64,
    trend: Option<Direction>,
    extreme: f64,
    last_confirmation: Option<f64>,
    event_count: usize,
}

impl DirectionalChange {
    pub fn new(theta: f64) -> Result<Self, InputError> {
        if !theta.is_finite() || theta <= 0.0 || theta >= 1.0 {
            return Err(InputError::InvalidParameters(format!(
                "theta must be in (0, 1), got {}",
                theta
            )));
        }
        Ok(Self {
            theta,
            bars_seen: 0,
            anchor: 0.0,
            trend: None,
            extreme: 0.0,
            last_confirmation: None,
            event_count: 0,
        })
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    pub fn trend(&self) -> Option<Direction> {
        self.trend
    }

    pub fn extreme(&self) -> Option<f64> {
        self.trend.map(|_| self.extreme)
    }

    pub fn bars_seen(&self) -> usize {
        self.bars_seen
    }

    pub fn event_count(&self) -> usize {
        self.event_count
    }

    /// Feed one close price.
    pub fn observe(&mut self, price: f64) -> Result<Option<Reversal>, InputError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(InputError::InvalidPrice(price.to_string()));
        }
        self.bars_seen += 1;

        if self.bars_seen == 1 {
            self.anchor = price;
            return Ok(None);
        }

        let trend = match self.trend {
            Some(trend) => trend,
            None => {
                // Flat opening bars leave the trend undecided.
                if price > self.anchor {
                    self.trend = Some(Direction::Up);
                    self.extreme = price;
                } else if price < self.anchor {
                    self.trend = Some(Direction::Down);
                    self.extreme = price;
                }
                return Ok(None);
            }
        };

        let reversal = match trend {
            Direction::Up => {
                if price > self.extreme {
                    self.extreme = price;
                    None
                } else if price <= self.extreme * (1.0 - self.theta) {
                    let overshoot = self
                        .last_confirmation
                        .map(|c| (self.extreme - c) / c)
                        .unwrap_or(0.0);
                    Some(Reversal {
                        direction: Direction::Down,
                        extreme_price: self.extreme,
                        confirmation_price: price,
                        overshoot,
                    })
                } else {
                    None
                }
            }
            Direction::Down => {
                if price < self.extreme {
                    self.extreme = price;
                    None
                } else if price >= self.extreme * (1.0 + self.theta) {
                    let overshoot = self
                        .last_confirmation
                        .map(|c| (c - self.extreme) / c)
                        .unwrap_or(0.0);
                    Some(Reversal {
                        direction: Direction::Up,
                        extreme_price: self.extreme,
                        confirmation_price: price,
                        overshoot,
                    })
                } else {
                    None
                }
            }
        };

        if let Some(rev) = reversal {
            self.trend = Some(rev.direction);
            self.extreme = price;
            self.last_confirmation = Some(price);
            self.event_count += 1;
        }

        Ok(reversal)
    }

    /// Feed one bar; the close drives detection.
    pub fn update(&mut self, bar: &PricePoint) -> Result<Option<DirectionalChangeEvent>, InputError> {
        let price = bar
            .close_f64()
            .ok_or_else(|| InputError::InvalidPrice(bar.close.to_string()))?;
        let index = self.bars_seen;
        Ok(self.observe(price)?.map(|rev| DirectionalChangeEvent {
            index,
            timestamp: bar.timestamp,
            direction: rev.direction,
            extreme_price: rev.extreme_price,
            confirmation_price: rev.confirmation_price,
            overshoot: rev.overshoot,
        }))
    }
}

impl Indicator for DirectionalChange {
    fn name(&self) -> &'static str {
        "DirectionalChange"
    }

    fn is_ready(&self) -> bool {
        self.trend.is_some()
    }

    fn reset(&mut self) {
        self.bars_seen = 0;
        self.anchor = 0.0;
        self.trend = None;
        self.extreme = 0.0;
        self.last_confirmation = None;
        self.event_count = 0;
    }
}

/// Detect every DC event in a price history.
pub fn detect_events(prices: &[PricePoint], theta: f64) -> Result<Vec<DirectionalChangeEvent>, InputError> {
    let mut dc = DirectionalChange::new(theta)?;
    let mut events = Vec::new();
    for bar in prices {
        if let Some(event) = dc.update(bar)? {
            events.push(event);
        }
    }
    Ok(events)
}

/// Pick the theta whose DC events are followed by the largest mean absolute
/// return over `forward_periods` bars. Candidates yielding fewer than
/// [`MIN_EVENTS_FOR_THETA`] scorable events are skipped; ties keep the earlier
/// candidate.
pub fn select_theta(closes: &[f64], candidates: &[f64], forward_periods: usize) -> Option<f64> {
    if forward_periods == 0 || closes.len() <= forward_periods {
        return None;
    }

    let mut best: Option<(f64, f64)> = None;
    for &theta in candidates {
        let mut dc = match DirectionalChange::new(theta) {
            Ok(dc) => dc,
            Err(_) => continue,
        };

        let mut event_returns = Vec::new();
        let mut usable = true;
        for (i, &price) in closes.iter().enumerate() {
            match dc.observe(price) {
                Ok(Some(_)) if i + forward_periods < closes.len() => {
                    let forward = closes[i + forward_periods] / price - 1.0;
                    event_returns.push(forward.abs());
                }
                Ok(_) => {}
                Err(_) => {
                    usable = false;
                    break;
                }
            }
        }

        if !usable || event_returns.len() < MIN_EVENTS_FOR_THETA {
            continue;
        }
        let score = match mean(&event_returns) {
            Some(score) => score,
            None => continue,
        };
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((theta, score));
        }
    }

    best.map(|(theta, _)| theta)
}
