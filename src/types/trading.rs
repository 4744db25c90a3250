use serde::{Deserialize, Serialize};
use std::fmt;

/// Discrete decision emitted once per bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    /// Enter (or keep) a long position.
    Long,
    /// Close an open position.
    Sell,
    /// Emergency exit: the high-volatility regime dominates.
    Danger,
    /// Do nothing.
    Wait,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Long => "LONG",
            Signal::Sell => "SELL",
            Signal::Danger => "DANGER",
            Signal::Wait => "WAIT",
        }
    }

    /// True for signals a position holder should act on by exiting.
    pub fn is_exit(&self) -> bool {
        matches!(self, Signal::Sell | Signal::Danger)
    }

    pub fn all() -> [Signal; 4] {
        [Signal::Long, Signal::Sell, Signal::Danger, Signal::Wait]
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Trend direction tracked by the directional-change detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "UP",
            Direction::Down => "DOWN",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 1 pip = 0.0001 in price-return terms (EUR/USD convention).
pub const PIP: f64 = 0.0001;

pub fn pips_to_return(pips: f64) -> f64 {
    pips * PIP
}

pub fn return_to_pips(ret: f64) -> f64 {
    ret / PIP
}
