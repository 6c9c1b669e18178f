//! Pattern events pushed by the external detection layer.
//!
//! A `PatternEvent` is immutable once created. The engine never edits one;
//! it only appends accepted events to a campaign.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::campaign::{CampaignBias, WyckoffPhase};

/// Closed set of detectable Wyckoff pattern kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    SellingClimax,
    AutomaticRally,
    SecondaryTest,
    Spring,
    Test,
    SignOfStrength,
    LastPointOfSupport,
    Upthrust,
    UpthrustAfterDistribution,
    SignOfWeakness,
}

impl PatternKind {
    /// Phases in which this pattern is structurally valid.
    pub fn compatible_phases(self) -> &'static [WyckoffPhase] {
        use WyckoffPhase::*;
        match self {
            Self::SellingClimax => &[A],
            Self::AutomaticRally => &[A, B],
            Self::SecondaryTest => &[B],
            Self::Test => &[B, C],
            Self::Spring => &[C],
            Self::SignOfStrength => &[C, D],
            Self::LastPointOfSupport => &[D, E],
            Self::Upthrust => &[B, C],
            Self::UpthrustAfterDistribution => &[C, D],
            Self::SignOfWeakness => &[C, D],
        }
    }

    /// The phase a campaign sits in after accepting this pattern.
    /// Also the opening phase when this pattern starts a campaign.
    pub fn target_phase(self) -> WyckoffPhase {
        use WyckoffPhase::*;
        match self {
            Self::SellingClimax => A,
            Self::AutomaticRally => B,
            Self::SecondaryTest => B,
            Self::Test => C,
            Self::Spring => C,
            Self::SignOfStrength => D,
            Self::LastPointOfSupport => D,
            Self::Upthrust => C,
            Self::UpthrustAfterDistribution => C,
            Self::SignOfWeakness => D,
        }
    }

    /// Directional bias this pattern commits a campaign to, if any.
    /// Climaxes, rallies and tests occur in both cycle variants.
    pub fn bias(self) -> Option<CampaignBias> {
        match self {
            Self::Spring | Self::SignOfStrength | Self::LastPointOfSupport => {
                Some(CampaignBias::Accumulation)
            }
            Self::Upthrust | Self::UpthrustAfterDistribution | Self::SignOfWeakness => {
                Some(CampaignBias::Distribution)
            }
            _ => None,
        }
    }

    /// Kinds that expect thin volume; drying-up volume is full weight
    /// for these instead of a penalty.
    pub fn expects_low_volume(self) -> bool {
        matches!(self, Self::Spring | Self::SecondaryTest | Self::Test)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SellingClimax => "selling_climax",
            Self::AutomaticRally => "automatic_rally",
            Self::SecondaryTest => "secondary_test",
            Self::Spring => "spring",
            Self::Test => "test",
            Self::SignOfStrength => "sign_of_strength",
            Self::LastPointOfSupport => "last_point_of_support",
            Self::Upthrust => "upthrust",
            Self::UpthrustAfterDistribution => "upthrust_after_distribution",
            Self::SignOfWeakness => "sign_of_weakness",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chart timeframe a pattern was detected on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::M5 => write!(f, "m5"),
            Timeframe::M15 => write!(f, "m15"),
            Timeframe::M30 => write!(f, "m30"),
            Timeframe::H1 => write!(f, "h1"),
            Timeframe::H4 => write!(f, "h4"),
            Timeframe::D1 => write!(f, "d1"),
        }
    }
}

impl FromStr for Timeframe {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "m5" => Ok(Timeframe::M5),
            "m15" => Ok(Timeframe::M15),
            "m30" => Ok(Timeframe::M30),
            "h1" => Ok(Timeframe::H1),
            "h4" => Ok(Timeframe::H4),
            "d1" => Ok(Timeframe::D1),
            _ => Err("invalid timeframe; expected m5|m15|m30|h1|h4|d1"),
        }
    }
}

/// Qualitative read of the volume behind a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeSignal {
    /// Climactic expansion (stopping volume)
    Climactic,
    /// Above-average expansion
    Expanding,
    /// Unremarkable
    Average,
    /// Contracting towards the lows
    DryingUp,
}

/// Volume evidence attached to a pattern by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeEvidence {
    /// Volume relative to its lookback average (1.0 = average)
    pub relative: Decimal,
    pub signal: VolumeSignal,
}

impl VolumeEvidence {
    pub fn new(relative: Decimal, signal: VolumeSignal) -> Self {
        Self { relative, signal }
    }
}

/// A single detected chart pattern for one symbol and timeframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternEvent {
    pub id: Uuid,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub kind: PatternKind,
    /// Price level the pattern printed at
    pub price: Decimal,
    pub volume: VolumeEvidence,
    /// Detector-assigned confidence in [0, 1]
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
}

impl PatternEvent {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        kind: PatternKind,
        price: Decimal,
        volume: VolumeEvidence,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            timeframe,
            kind,
            price,
            volume,
            confidence: confidence.clamp(0.0, 1.0),
            detected_at: Utc::now(),
        }
    }

    /// Deterministic content fingerprint over the salient inputs.
    ///
    /// Derived from pattern kind and numeric context only; the event id
    /// and timestamp are excluded so a re-detected identical pattern maps
    /// to the same key.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.symbol.as_bytes());
        hasher.update(self.timeframe.to_string().as_bytes());
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(self.price.normalize().to_string().as_bytes());
        hasher.update(self.volume.relative.normalize().to_string().as_bytes());
        hasher.update([self.volume.signal as u8]);
        hasher.update(format!("{:.4}", self.confidence).as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
