use crate::domain::WyckoffPhase;
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Main configuration structure for the campaign engine.
///
/// Supplied as an immutable value at construction time. The engine never
/// reloads it; every threshold below is a calibration default, not a
/// structural constant.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub campaign: CampaignConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub risk: RiskLimits,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub regime: RegimeConfig,
    /// Per-symbol portfolio tags (currency, correlation group, category).
    #[serde(default)]
    pub instruments: HashMap<String, InstrumentMeta>,
    /// Fallback tags for symbols absent from `instruments`.
    #[serde(default)]
    pub default_instrument: InstrumentMeta,
}

impl EngineConfig {
    /// Load configuration from a file, with `WYCKOFF_` environment
    /// variable overrides (e.g. `WYCKOFF_RISK__HEAT_CEILING=0.08`).
    pub fn load(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("WYCKOFF").separator("__"))
            .build()?;

        let cfg: EngineConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Sanity-check cross-field constraints.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.risk.heat_ceiling <= Decimal::ZERO {
            return Err(crate::error::EngineError::InvalidConfig(
                "risk.heat_ceiling must be positive".to_string(),
            ));
        }
        if self.risk.campaign_heat_cap > self.risk.heat_ceiling {
            return Err(crate::error::EngineError::InvalidConfig(
                "risk.campaign_heat_cap must not exceed risk.heat_ceiling".to_string(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(crate::error::EngineError::InvalidConfig(
                "cache.capacity must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.validation.confidence_floor) {
            return Err(crate::error::EngineError::InvalidConfig(
                "validation.confidence_floor must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the portfolio tags for a symbol.
    pub fn instrument(&self, symbol: &str) -> &InstrumentMeta {
        self.instruments
            .get(symbol)
            .unwrap_or(&self.default_instrument)
    }
}

/// Portfolio tags attached to every campaign on a symbol.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentMeta {
    /// Currency bucket for concentration limits (e.g. "USD")
    pub currency: String,
    /// Correlation group for cascade detection (e.g. "us-tech")
    pub correlation_group: String,
    /// Category/sector tag, informational only (e.g. "equity")
    pub category: String,
}

impl Default for InstrumentMeta {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            correlation_group: "default".to_string(),
            category: "uncategorized".to_string(),
        }
    }
}

/// Campaign lifecycle and risk-bookkeeping parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct CampaignConfig {
    /// Half-width of the trading range anchored around the first pattern
    /// price (e.g. 0.05 = support/resistance at -/+5%)
    #[serde(default = "default_range_anchor_pct")]
    pub range_anchor_pct: Decimal,
    /// How far below support a pattern may print and still belong to the
    /// range (springs dip under support by design)
    #[serde(default = "default_range_below_tolerance")]
    pub range_below_tolerance: Decimal,
    /// How far above resistance a pattern may print and still belong to
    /// the range (markup patterns overshoot the top)
    #[serde(default = "default_range_above_tolerance")]
    pub range_above_tolerance: Decimal,
    /// Buffer under the range low when placing the protective stop
    /// (e.g. 0.01 = stop 1% below the lowest accepted price)
    #[serde(default = "default_stop_buffer_pct")]
    pub stop_buffer_pct: Decimal,
    /// Equity fraction committed per accepted pattern (one tranche each)
    #[serde(default = "default_tranche_size_pct")]
    pub tranche_size_pct: Decimal,
    /// Accepted patterns required before a FORMING campaign activates
    #[serde(default = "default_confirmation_patterns")]
    pub confirmation_patterns: usize,
    /// FORMING campaigns not confirmed within this window are expired
    #[serde(default = "default_expiration_window_secs")]
    pub expiration_window_secs: u64,
    /// R-multiple at or above which a marked campaign counts as advancing
    #[serde(default = "default_advancing_r")]
    pub advancing_r: Decimal,
    /// R-multiple at or below which a marked campaign counts as failing
    #[serde(default = "default_failing_r")]
    pub failing_r: Decimal,
}

fn default_range_anchor_pct() -> Decimal {
    dec!(0.05)
}

fn default_range_below_tolerance() -> Decimal {
    dec!(0.05)
}

fn default_range_above_tolerance() -> Decimal {
    dec!(0.25)
}

fn default_stop_buffer_pct() -> Decimal {
    dec!(0.01)
}

fn default_tranche_size_pct() -> Decimal {
    dec!(0.10)
}

fn default_confirmation_patterns() -> usize {
    2
}

fn default_expiration_window_secs() -> u64 {
    4 * 3600
}

fn default_advancing_r() -> Decimal {
    dec!(0.5)
}

fn default_failing_r() -> Decimal {
    dec!(-0.5)
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            range_anchor_pct: default_range_anchor_pct(),
            range_below_tolerance: default_range_below_tolerance(),
            range_above_tolerance: default_range_above_tolerance(),
            stop_buffer_pct: default_stop_buffer_pct(),
            tranche_size_pct: default_tranche_size_pct(),
            confirmation_patterns: default_confirmation_patterns(),
            expiration_window_secs: default_expiration_window_secs(),
            advancing_r: default_advancing_r(),
            failing_r: default_failing_r(),
        }
    }
}

/// Sequence validation thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    /// Minimum adjusted confidence for a pattern to be accepted
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
    /// Confidence multiplier when volume context is merely average
    #[serde(default = "default_volume_factor_average")]
    pub volume_factor_average: f64,
    /// Confidence multiplier when volume is drying up (except for the
    /// kinds that expect low volume, e.g. springs and secondary tests)
    #[serde(default = "default_volume_factor_drying")]
    pub volume_factor_drying: f64,
}

fn default_confidence_floor() -> f64 {
    0.35
}

fn default_volume_factor_average() -> f64 {
    0.85
}

fn default_volume_factor_drying() -> f64 {
    0.65
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            confidence_floor: default_confidence_floor(),
            volume_factor_average: default_volume_factor_average(),
            volume_factor_drying: default_volume_factor_drying(),
        }
    }
}

/// Portfolio risk limits consumed by the admission gate.
///
/// Heat values are equity fractions: 0.10 means 10% of account equity.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskLimits {
    /// Hard ceiling on aggregate portfolio heat
    #[serde(default = "default_heat_ceiling")]
    pub heat_ceiling: Decimal,
    /// Hard cap on a single campaign's heat
    #[serde(default = "default_campaign_heat_cap")]
    pub campaign_heat_cap: Decimal,
    /// Ceiling multiplier granted to Phase D candidates
    #[serde(default = "default_phase_slack_d")]
    pub phase_slack_d: Decimal,
    /// Ceiling multiplier granted to Phase E candidates
    #[serde(default = "default_phase_slack_e")]
    pub phase_slack_e: Decimal,
    /// Exposure weight for Phase D campaigns in currency concentration
    #[serde(default = "default_phase_weight_d")]
    pub phase_weight_d: Decimal,
    /// Exposure weight for Phase E campaigns in currency concentration
    #[serde(default = "default_phase_weight_e")]
    pub phase_weight_e: Decimal,
    /// Hard cap on phase-weighted exposure per currency
    #[serde(default = "default_currency_weighted_cap")]
    pub currency_weighted_cap: Decimal,
    /// Independent cap on concurrent campaigns per currency
    #[serde(default = "default_currency_campaign_cap")]
    pub currency_campaign_cap: usize,
    /// Concurrently failing campaigns in one correlation group that
    /// trigger the portfolio-wide cascade signal
    #[serde(default = "default_cascade_threshold")]
    pub cascade_threshold: usize,
    /// Category share of total heat above which a warning is emitted
    /// (informational, never a rejection)
    #[serde(default = "default_category_warn_share")]
    pub category_warn_share: Decimal,
    /// Remaining headroom treated as "one admission slot left"
    #[serde(default = "default_admission_slot")]
    pub admission_slot: Decimal,
}

fn default_heat_ceiling() -> Decimal {
    dec!(0.10)
}

fn default_campaign_heat_cap() -> Decimal {
    dec!(0.05)
}

fn default_phase_slack_d() -> Decimal {
    dec!(1.15)
}

fn default_phase_slack_e() -> Decimal {
    dec!(1.25)
}

fn default_phase_weight_d() -> Decimal {
    dec!(0.75)
}

fn default_phase_weight_e() -> Decimal {
    dec!(0.5)
}

fn default_currency_weighted_cap() -> Decimal {
    dec!(0.06)
}

fn default_currency_campaign_cap() -> usize {
    4
}

fn default_cascade_threshold() -> usize {
    3
}

fn default_category_warn_share() -> Decimal {
    dec!(0.5)
}

fn default_admission_slot() -> Decimal {
    dec!(0.01)
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            heat_ceiling: default_heat_ceiling(),
            campaign_heat_cap: default_campaign_heat_cap(),
            phase_slack_d: default_phase_slack_d(),
            phase_slack_e: default_phase_slack_e(),
            phase_weight_d: default_phase_weight_d(),
            phase_weight_e: default_phase_weight_e(),
            currency_weighted_cap: default_currency_weighted_cap(),
            currency_campaign_cap: default_currency_campaign_cap(),
            cascade_threshold: default_cascade_threshold(),
            category_warn_share: default_category_warn_share(),
            admission_slot: default_admission_slot(),
        }
    }
}

impl RiskLimits {
    /// Effective heat ceiling for a candidate in the given phase.
    pub fn ceiling_for(&self, phase: WyckoffPhase) -> Decimal {
        match phase {
            WyckoffPhase::D => self.heat_ceiling * self.phase_slack_d,
            WyckoffPhase::E => self.heat_ceiling * self.phase_slack_e,
            _ => self.heat_ceiling,
        }
    }

    /// Concentration weight applied to a campaign's heat by phase.
    /// Later phases are closer to validated outcomes and weigh less.
    pub fn phase_weight(&self, phase: WyckoffPhase) -> Decimal {
        match phase {
            WyckoffPhase::D => self.phase_weight_d,
            WyckoffPhase::E => self.phase_weight_e,
            _ => Decimal::ONE,
        }
    }
}

/// Validation cache sizing and expiry.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached verdicts before LRU eviction
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Default time-to-live for cached verdicts in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Interval for the optional background expiry sweep in seconds
    #[serde(default = "default_cache_sweep_secs")]
    pub sweep_interval_secs: u64,
}

fn default_cache_capacity() -> usize {
    1024
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_sweep_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_cache_sweep_secs(),
        }
    }
}

/// Regime performance feedback parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct RegimeConfig {
    /// Rolling outcome window per regime
    #[serde(default = "default_regime_window")]
    pub window: usize,
    /// Outcomes required before adjustments apply
    #[serde(default = "default_regime_min_samples")]
    pub min_samples: usize,
    /// Win rate at or above which thresholds loosen
    #[serde(default = "default_loosen_win_rate")]
    pub loosen_win_rate: f64,
    /// Win rate at or below which thresholds tighten
    #[serde(default = "default_tighten_win_rate")]
    pub tighten_win_rate: f64,
    /// Confidence-floor shift applied when tightening (subtracted when
    /// loosening)
    #[serde(default = "default_floor_shift")]
    pub floor_shift: f64,
    /// Heat ceiling multiplier when loosening
    #[serde(default = "default_ceiling_scale_up")]
    pub ceiling_scale_up: Decimal,
    /// Heat ceiling multiplier when tightening
    #[serde(default = "default_ceiling_scale_down")]
    pub ceiling_scale_down: Decimal,
}

fn default_regime_window() -> usize {
    50
}

fn default_regime_min_samples() -> usize {
    10
}

fn default_loosen_win_rate() -> f64 {
    0.6
}

fn default_tighten_win_rate() -> f64 {
    0.4
}

fn default_floor_shift() -> f64 {
    0.05
}

fn default_ceiling_scale_up() -> Decimal {
    dec!(1.1)
}

fn default_ceiling_scale_down() -> Decimal {
    dec!(0.85)
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            window: default_regime_window(),
            min_samples: default_regime_min_samples(),
            loosen_win_rate: default_loosen_win_rate(),
            tighten_win_rate: default_tighten_win_rate(),
            floor_shift: default_floor_shift(),
            ceiling_scale_up: default_ceiling_scale_up(),
            ceiling_scale_down: default_ceiling_scale_down(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.risk.heat_ceiling, dec!(0.10));
        assert_eq!(cfg.risk.campaign_heat_cap, dec!(0.05));
        assert_eq!(cfg.cache.capacity, 1024);
        assert_eq!(cfg.campaign.confirmation_patterns, 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_phase_weights() {
        let limits = RiskLimits::default();
        assert_eq!(limits.phase_weight(WyckoffPhase::A), Decimal::ONE);
        assert_eq!(limits.phase_weight(WyckoffPhase::C), Decimal::ONE);
        assert_eq!(limits.phase_weight(WyckoffPhase::D), dec!(0.75));
        assert_eq!(limits.phase_weight(WyckoffPhase::E), dec!(0.5));
    }

    #[test]
    fn test_phase_slack_raises_ceiling() {
        let limits = RiskLimits::default();
        assert_eq!(limits.ceiling_for(WyckoffPhase::B), dec!(0.10));
        assert!(limits.ceiling_for(WyckoffPhase::D) > limits.heat_ceiling);
        assert!(limits.ceiling_for(WyckoffPhase::E) > limits.ceiling_for(WyckoffPhase::D));
    }

    #[test]
    fn test_validate_rejects_inverted_caps() {
        let mut cfg = EngineConfig::default();
        cfg.risk.campaign_heat_cap = dec!(0.20);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_instrument_fallback() {
        let mut cfg = EngineConfig::default();
        cfg.instruments.insert(
            "AAPL".to_string(),
            InstrumentMeta {
                currency: "USD".to_string(),
                correlation_group: "us-tech".to_string(),
                category: "equity".to_string(),
            },
        );
        assert_eq!(cfg.instrument("AAPL").correlation_group, "us-tech");
        assert_eq!(cfg.instrument("UNKNOWN").correlation_group, "default");
    }

    #[test]
    fn test_deserialize_partial_config() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"risk": {"heat_ceiling": "0.08"}}"#)
            .expect("partial config should deserialize");
        assert_eq!(cfg.risk.heat_ceiling, dec!(0.08));
        // Untouched sections fall back to defaults
        assert_eq!(cfg.risk.campaign_heat_cap, dec!(0.05));
        assert_eq!(cfg.cache.ttl_secs, 300);
    }
}
