pub mod campaign;
pub mod pattern;

pub use campaign::{
    Campaign, CampaignBias, CampaignState, RiskProfile, TradingRange, Trajectory, WyckoffPhase,
};
pub use pattern::{PatternEvent, PatternKind, Timeframe, VolumeEvidence, VolumeSignal};
