//! Rolling directional-change (RDC) index.
//!
//! Summarizes DC activity over the last `window` bars into one scalar that the
//! regime model uses as its observation channel. No value exists until
//! `window` bars have been seen.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::directional_change::{DirectionalChange, DirectionalChangeEvent};
use super::Indicator;
use crate::config::DcSettings;
use crate::error::InputError;
use crate::types::{Direction, PricePoint};

const BALANCE_EPS: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    /// Equal weight for each of the last `window` bars.
    Simple,
    /// Exponential weighting with alpha = 2 / (window + 1).
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RdcFormula {
    /// Weighted event frequency plus normalized mean overshoot, in [0, 1).
    Activity,
    /// (up - down) / (up + down), in [-1, 1].
    DirectionalBalance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RdcValue {
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    /// Events in the window (exponentially weighted when configured so).
    pub event_count: f64,
    pub mean_overshoot: f64,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct BarActivity {
    ups: f64,
    downs: f64,
    overshoot: f64,
}

impl BarActivity {
    fn from_event(event: Option<&DirectionalChangeEvent>) -> Self {
        match event {
            Some(e) => Self {
                ups: if e.direction == Direction::Up { 1.0 } else { 0.0 },
                downs: if e.direction == Direction::Down { 1.0 } else { 0.0 },
                overshoot: e.overshoot,
            },
            None => Self::default(),
        }
    }

    fn events(&self) -> f64 {
        self.ups + self.downs
    }
}

/// Streaming RDC computation, one bar at a time.
#[derive(Debug, Clone)]
pub struct RdcExtractor {
    settings: DcSettings,
    dc: DirectionalChange,
    recent: VecDeque<BarActivity>,
    smoothed: BarActivity,
    bars_seen: usize,
    last_event: Option<DirectionalChangeEvent>,
}

impl RdcExtractor {
    pub fn new(settings: &DcSettings) -> Result<Self, InputError> {
        settings
            .validate()
            .map_err(|errors| InputError::InvalidParameters(errors.join(", ")))?;
        Ok(Self {
            settings: settings.clone(),
            dc: DirectionalChange::new(settings.theta)?,
            recent: VecDeque::with_capacity(settings.window),
            smoothed: BarActivity::default(),
            bars_seen: 0,
            last_event: None,
        })
    }

    pub fn settings(&self) -> &DcSettings {
        &self.settings
    }

    pub fn window(&self) -> usize {
        self.settings.window
    }

    pub fn bars_seen(&self) -> usize {
        self.bars_seen
    }

    /// Event confirmed on the most recent bar, if any.
    pub fn last_event(&self) -> Option<&DirectionalChangeEvent> {
        self.last_event.as_ref()
    }

    /// Feed one bar. Returns the RDC value once the warm-up window is full.
    /// A rejected bar leaves the extractor untouched.
    pub fn update(&mut self, bar: &PricePoint) -> Result<Option<RdcValue>, InputError> {
        let mut dc = self.dc.clone();
        let event = dc.update(bar)?;
        self.dc = dc;

        let activity = BarActivity::from_event(event.as_ref());
        self.last_event = event;
        self.bars_seen += 1;

        let window = self.settings.window;
        match self.settings.window_kind {
            WindowKind::Simple => {
                if self.recent.len() == window {
                    self.recent.pop_front();
                }
                self.recent.push_back(activity);
            }
            WindowKind::Exponential => {
                let alpha = 2.0 / (window as f64 + 1.0);
                self.smoothed = BarActivity {
                    ups: alpha * activity.ups + (1.0 - alpha) * self.smoothed.ups,
                    downs: alpha * activity.downs + (1.0 - alpha) * self.smoothed.downs,
                    overshoot: alpha * activity.overshoot + (1.0 - alpha) * self.smoothed.overshoot,
                };
            }
        }

        if self.bars_seen < window {
            return Ok(None);
        }

        // `totals` is on a per-window scale in both modes.
        let totals = match self.settings.window_kind {
            WindowKind::Simple => self.recent.iter().fold(BarActivity::default(), |acc, a| BarActivity {
                ups: acc.ups + a.ups,
                downs: acc.downs + a.downs,
                overshoot: acc.overshoot + a.overshoot,
            }),
            WindowKind::Exponential => BarActivity {
                ups: self.smoothed.ups * window as f64,
                downs: self.smoothed.downs * window as f64,
                overshoot: self.smoothed.overshoot * window as f64,
            },
        };

        let event_count = totals.events();
        let mean_overshoot = if event_count > 0.0 { totals.overshoot / event_count } else { 0.0 };

        let value = match self.settings.formula {
            RdcFormula::Activity => {
                let frequency = event_count / window as f64;
                let theta = self.settings.theta;
                self.settings.count_weight * frequency
                    + self.settings.overshoot_weight * (mean_overshoot / (mean_overshoot + theta))
            }
            RdcFormula::DirectionalBalance => {
                (totals.ups - totals.downs) / (totals.ups + totals.downs + BALANCE_EPS)
            }
        };

        Ok(Some(RdcValue {
            index: self.bars_seen - 1,
            timestamp: bar.timestamp,
            event_count,
            mean_overshoot,
            value,
        }))
    }
}

impl Indicator for RdcExtractor {
    fn name(&self) -> &'static str {
        "RDC"
    }

    fn is_ready(&self) -> bool {
        self.bars_seen >= self.settings.window
    }

    fn reset(&mut self) {
        self.dc.reset();
        self.recent.clear();
        self.smoothed = BarActivity::default();
        self.bars_seen = 0;
        self.last_event = None;
    }
}

/// Lazy RDC values over a price history, restartable via [`RdcSeries::iter`].
#[derive(Debug, Clone)]
pub struct RdcSeries<'a> {
    prices: &'a [PricePoint],
    settings: DcSettings,
}

impl<'a> RdcSeries<'a> {
    pub fn new(prices: &'a [PricePoint], settings: &DcSettings) -> Result<Self, InputError> {
        RdcExtractor::new(settings)?;
        Ok(Self { prices, settings: settings.clone() })
    }

    pub fn iter(&self) -> RdcIter<'a> {
        RdcIter {
            prices: self.prices,
            position: 0,
            // Settings were validated in `new`.
            extractor: RdcExtractor::new(&self.settings).ok(),
        }
    }

    /// Number of values the series yields for clean input.
    pub fn expected_len(&self) -> usize {
        (self.prices.len() + 1).saturating_sub(self.settings.window)
    }
}

impl<'a> IntoIterator for &RdcSeries<'a> {
    type Item = Result<RdcValue, InputError>;
    type IntoIter = RdcIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Clone)]
pub struct RdcIter<'a> {
    prices: &'a [PricePoint],
    position: usize,
    extractor: Option<RdcExtractor>,
}

impl Iterator for RdcIter<'_> {
    type Item = Result<RdcValue, InputError>;

    fn next(&mut self) -> Option<Self::Item> {
        let extractor = self.extractor.as_mut()?;
        while self.position < self.prices.len() {
            let bar = &self.prices[self.position];
            self.position += 1;
            match extractor.update(bar) {
                Ok(Some(value)) => return Some(Ok(value)),
                Ok(None) => continue,
                Err(e) => {
                    self.position = self.prices.len();
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// Collect every RDC value for a price history.
pub fn compute_rdc(prices: &[PricePoint], settings: &DcSettings) -> Result<Vec<RdcValue>, InputError> {
    RdcSeries::new(prices, settings)?.iter().collect()
}
