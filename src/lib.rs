//! Campaign tracking core for Wyckoff-style pattern trading.
//!
//! Ingests detected chart-pattern events, groups them into campaigns
//! with a strict lifecycle and phase model, gates admission against
//! portfolio-wide risk limits, and notifies subscribers over an
//! asynchronous event bus. This is a library-level subsystem: pattern
//! detection, persistence and delivery channels live elsewhere and talk
//! to it through `CampaignStateManager` and `EventBus`.

pub mod bus;
pub mod cache;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod regime;
pub mod risk;
pub mod validation;

pub use bus::{BusStats, CampaignEvent, CampaignEventKind, EventBus, EventSubscriber, SubscriptionHandle};
pub use cache::{CacheStats, CachedVerdict, ValidationCache};
pub use config::{
    CacheConfig, CampaignConfig, EngineConfig, InstrumentMeta, RegimeConfig, RiskLimits,
    ValidationConfig,
};
pub use domain::{
    Campaign, CampaignBias, CampaignState, PatternEvent, PatternKind, RiskProfile, Timeframe,
    TradingRange, Trajectory, VolumeEvidence, VolumeSignal, WyckoffPhase,
};
pub use engine::{
    spawn_cache_sweep, spawn_expiration_sweep, CampaignStateManager, EngineStats, PatternOutcome,
    RejectReason, SweepHandle,
};
pub use error::{EngineError, Result};
pub use regime::{MarketRegime, RegimeAdjustments, RegimePerformanceAnalyzer};
pub use risk::{
    AdmissionDecision, AdmissionRequest, CascadeSignal, ExposureRow, PortfolioRiskGate,
    PortfolioView, RiskBlockReason, RiskWarning,
};
pub use validation::{rules::PatternRule, rules::RuleRegistry, rules::RuleVerdict, SequenceOutcome, SequenceReason, SequenceValidator};
