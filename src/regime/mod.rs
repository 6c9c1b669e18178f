//! Regime performance feedback.
//!
//! Tracks recent campaign outcomes segmented by market regime and turns
//! them into threshold adjustments for the validator and the risk gate.
//! The analyzer is a tunable input, not a hard dependency: with too few
//! samples it stays neutral.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::debug;

use crate::config::RegimeConfig;

/// Broad market regime label supplied by an external classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    Trending,
    Ranging,
    Volatile,
    Quiet,
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trending => write!(f, "trending"),
            Self::Ranging => write!(f, "ranging"),
            Self::Volatile => write!(f, "volatile"),
            Self::Quiet => write!(f, "quiet"),
        }
    }
}

/// One finished campaign, as seen by the analyzer.
#[derive(Debug, Clone, Copy)]
struct Outcome {
    won: bool,
    r_multiple: Decimal,
}

/// Threshold adjustments derived from recent performance.
///
/// Neutral by default: zero floor shift, unit ceiling scale.
#[derive(Debug, Clone, PartialEq)]
pub struct RegimeAdjustments {
    /// Added to the validation confidence floor (negative = loosen)
    pub confidence_floor_shift: f64,
    /// Multiplied into the portfolio heat ceiling
    pub heat_ceiling_scale: Decimal,
}

impl Default for RegimeAdjustments {
    fn default() -> Self {
        Self {
            confidence_floor_shift: 0.0,
            heat_ceiling_scale: Decimal::ONE,
        }
    }
}

/// Rolling per-regime performance windows.
pub struct RegimePerformanceAnalyzer {
    config: RegimeConfig,
    current: MarketRegime,
    windows: HashMap<MarketRegime, VecDeque<Outcome>>,
}

impl RegimePerformanceAnalyzer {
    pub fn new(config: RegimeConfig) -> Self {
        Self {
            config,
            current: MarketRegime::Ranging,
            windows: HashMap::new(),
        }
    }

    /// Set the prevailing regime (fed by an external classifier).
    pub fn set_regime(&mut self, regime: MarketRegime) {
        if regime != self.current {
            debug!(from = %self.current, to = %regime, "market regime changed");
            self.current = regime;
        }
    }

    pub fn current_regime(&self) -> MarketRegime {
        self.current
    }

    /// Record a finished campaign under the current regime.
    pub fn record_outcome(&mut self, won: bool, r_multiple: Decimal) {
        let window = self.windows.entry(self.current).or_default();
        window.push_back(Outcome { won, r_multiple });
        while window.len() > self.config.window {
            window.pop_front();
        }
    }

    /// Win rate over the rolling window for a regime, if any samples.
    pub fn win_rate(&self, regime: MarketRegime) -> Option<f64> {
        let window = self.windows.get(&regime)?;
        if window.is_empty() {
            return None;
        }
        let wins = window.iter().filter(|o| o.won).count();
        Some(wins as f64 / window.len() as f64)
    }

    /// Mean R-multiple over the rolling window for a regime.
    pub fn avg_r(&self, regime: MarketRegime) -> Option<Decimal> {
        let window = self.windows.get(&regime)?;
        if window.is_empty() {
            return None;
        }
        let sum: Decimal = window.iter().map(|o| o.r_multiple).sum();
        Some(sum / Decimal::from(window.len()))
    }

    /// Adjustments for the current regime.
    ///
    /// Sustained edge loosens thresholds; sustained drawdown tightens
    /// them. Under `min_samples` outcomes the result is neutral.
    pub fn adjustments(&self) -> RegimeAdjustments {
        let window = match self.windows.get(&self.current) {
            Some(w) if w.len() >= self.config.min_samples => w,
            _ => return RegimeAdjustments::default(),
        };

        let wins = window.iter().filter(|o| o.won).count();
        let win_rate = wins as f64 / window.len() as f64;

        if win_rate >= self.config.loosen_win_rate {
            RegimeAdjustments {
                confidence_floor_shift: -self.config.floor_shift,
                heat_ceiling_scale: self.config.ceiling_scale_up,
            }
        } else if win_rate <= self.config.tighten_win_rate {
            RegimeAdjustments {
                confidence_floor_shift: self.config.floor_shift,
                heat_ceiling_scale: self.config.ceiling_scale_down,
            }
        } else {
            RegimeAdjustments::default()
        }
    }
}
