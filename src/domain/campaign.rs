//! Campaigns: tracked sequences of related pattern detections on one
//! instrument and trading range.
//!
//! Lifecycle: FORMING -> ACTIVE -> COMPLETED | FAILED, with EXPIRED for
//! FORMING campaigns that never confirm. Campaigns are owned by the state
//! manager; nothing outside it mutates one in place.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use super::pattern::PatternEvent;
use crate::config::CampaignConfig;

/// Stage within the accumulation/distribution cycle.
///
/// Progression is monotonic and stepwise: a campaign never reverts and
/// never skips a phase. The only reset to A is a new trading range, which
/// opens a new campaign rather than rewinding an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WyckoffPhase {
    A,
    B,
    C,
    D,
    E,
}

impl WyckoffPhase {
    pub fn rank(self) -> u8 {
        match self {
            Self::A => 0,
            Self::B => 1,
            Self::C => 2,
            Self::D => 3,
            Self::E => 4,
        }
    }

    /// Legal single-step progression: stay in place or advance one phase.
    pub fn can_progress_to(self, next: WyckoffPhase) -> bool {
        next.rank() == self.rank() || next.rank() == self.rank() + 1
    }
}

impl fmt::Display for WyckoffPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
            Self::C => write!(f, "C"),
            Self::D => write!(f, "D"),
            Self::E => write!(f, "E"),
        }
    }
}

/// Directional bias a campaign commits to once markup/markdown patterns
/// appear. Distribution campaigns see no markup: their phase progression
/// is capped at C.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignBias {
    Accumulation,
    Distribution,
}

/// Campaign lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    /// First pattern observed, awaiting confirmation
    Forming,
    /// Risk-validated and tradable
    Active,
    /// All positions closed per plan
    Completed,
    /// Invalidated (e.g. stop level breached)
    Failed,
    /// Confirmation window lapsed
    Expired,
}

impl CampaignState {
    /// Valid next states from the current one.
    pub fn valid_transitions(self) -> &'static [CampaignState] {
        use CampaignState::*;
        match self {
            Forming => &[Active, Failed, Expired],
            Active => &[Completed, Failed],
            Completed => &[],
            Failed => &[],
            Expired => &[],
        }
    }

    pub fn can_transition_to(self, next: CampaignState) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.valid_transitions().is_empty()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forming => "forming",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for CampaignState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The price range a campaign is anchored to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingRange {
    pub support: Decimal,
    pub resistance: Decimal,
    pub established_at: DateTime<Utc>,
}

impl TradingRange {
    /// Anchor a range around the first pattern price.
    pub fn anchored_at(price: Decimal, half_width: Decimal, at: DateTime<Utc>) -> Self {
        Self {
            support: price * (Decimal::ONE - half_width),
            resistance: price * (Decimal::ONE + half_width),
            established_at: at,
        }
    }

    pub fn midpoint(&self) -> Decimal {
        (self.support + self.resistance) / Decimal::TWO
    }

    /// Normalized token identifying this range for the
    /// one-campaign-per-(symbol, range) invariant.
    pub fn key(&self) -> String {
        format!(
            "{}-{}",
            self.support.normalize(),
            self.resistance.normalize()
        )
    }

    /// Whether a pattern at `price` belongs to this range, allowing the
    /// configured undershoot (springs) and overshoot (markup).
    pub fn admits(&self, price: Decimal, cfg: &CampaignConfig) -> bool {
        let floor = self.support * (Decimal::ONE - cfg.range_below_tolerance);
        let cap = self.resistance * (Decimal::ONE + cfg.range_above_tolerance);
        price >= floor && price <= cap
    }
}

/// Mark-to-market trend of a campaign, input to the correlation cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trajectory {
    Advancing,
    Stalling,
    Failing,
}

/// Derived risk bookkeeping for one campaign.
///
/// Heat is the campaign's risk-at-stake as an equity fraction. Each
/// accepted pattern opens one tranche; accepting a pattern can only add a
/// tranche or move the stop down, so heat never decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub stop_price: Decimal,
    pub heat: Decimal,
    pub tranche_count: usize,
}

impl RiskProfile {
    fn zero() -> Self {
        Self {
            stop_price: Decimal::ZERO,
            heat: Decimal::ZERO,
            tranche_count: 0,
        }
    }
}

/// A tracked accumulation/distribution campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub symbol: String,
    pub range: TradingRange,
    /// Portfolio tags resolved from configuration at creation
    pub currency: String,
    pub correlation_group: String,
    pub category: String,
    /// Constituent events in acceptance order; append-only
    pub events: Vec<PatternEvent>,
    /// Fingerprints of accepted events, for idempotent re-delivery
    pub accepted_fingerprints: HashSet<String>,
    pub state: CampaignState,
    pub phase: WyckoffPhase,
    pub bias: Option<CampaignBias>,
    pub weighted_entry: Decimal,
    pub risk: RiskProfile,
    pub trajectory: Trajectory,
    pub last_mark: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Open a FORMING campaign anchored at the first pattern. The event
    /// itself is not yet applied; acceptance goes through `apply`.
    pub fn open(
        event: &PatternEvent,
        currency: String,
        correlation_group: String,
        category: String,
        cfg: &CampaignConfig,
    ) -> Self {
        let now = event.detected_at;
        Self {
            id: Uuid::new_v4(),
            symbol: event.symbol.clone(),
            range: TradingRange::anchored_at(event.price, cfg.range_anchor_pct, now),
            currency,
            correlation_group,
            category,
            events: Vec::new(),
            accepted_fingerprints: HashSet::new(),
            state: CampaignState::Forming,
            phase: event.kind.target_phase(),
            bias: event.kind.bias(),
            weighted_entry: Decimal::ZERO,
            risk: RiskProfile::zero(),
            trajectory: Trajectory::Stalling,
            last_mark: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append an accepted event and recompute phase, weighted entry and
    /// risk in one step. Caller has already validated legality and
    /// admission; this only commits.
    pub fn apply(&mut self, event: PatternEvent, cfg: &CampaignConfig) {
        let target = event.kind.target_phase();
        if target > self.phase {
            self.phase = target;
        }
        if self.bias.is_none() {
            self.bias = event.kind.bias();
        }
        self.accepted_fingerprints.insert(event.fingerprint());
        self.updated_at = event.detected_at;
        self.events.push(event);
        self.recompute_risk(cfg);
    }

    /// Recompute stop, weighted entry and tranche heat from the full
    /// event list. Stop only ever moves down (min of support and lowest
    /// accepted price), so per-tranche risk never shrinks.
    fn recompute_risk(&mut self, cfg: &CampaignConfig) {
        if self.events.is_empty() {
            self.risk = RiskProfile::zero();
            self.weighted_entry = Decimal::ZERO;
            return;
        }

        let lowest = self
            .events
            .iter()
            .map(|e| e.price)
            .min()
            .unwrap_or(self.range.support);
        let anchor = lowest.min(self.range.support);
        let stop = anchor * (Decimal::ONE - cfg.stop_buffer_pct);

        let mut heat = Decimal::ZERO;
        let mut entry_sum = Decimal::ZERO;
        for event in &self.events {
            let at_stake = ((event.price - stop) / event.price).max(Decimal::ZERO);
            heat += cfg.tranche_size_pct * at_stake;
            entry_sum += event.price;
        }

        self.weighted_entry = entry_sum / Decimal::from(self.events.len());
        self.risk = RiskProfile {
            stop_price: stop,
            heat,
            tranche_count: self.events.len(),
        };
    }

    /// Project the risk profile as if `event` were accepted, without
    /// mutating the campaign. Used for admission checks.
    pub fn projected_with(&self, event: &PatternEvent, cfg: &CampaignConfig) -> Campaign {
        let mut trial = self.clone();
        trial.apply(event.clone(), cfg);
        trial
    }

    /// Mark-to-market: update trajectory from the latest price.
    pub fn record_mark(&mut self, price: Decimal, cfg: &CampaignConfig) {
        self.last_mark = Some(price);
        self.updated_at = Utc::now();

        let denom = self.weighted_entry - self.risk.stop_price;
        if denom <= Decimal::ZERO || self.events.is_empty() {
            self.trajectory = Trajectory::Stalling;
            return;
        }
        let r = (price - self.weighted_entry) / denom;
        self.trajectory = if r >= cfg.advancing_r {
            Trajectory::Advancing
        } else if r <= cfg.failing_r {
            Trajectory::Failing
        } else {
            Trajectory::Stalling
        };
    }

    /// Realized R-multiple at the last mark, for outcome bookkeeping.
    pub fn realized_r(&self) -> Option<Decimal> {
        let mark = self.last_mark?;
        let denom = self.weighted_entry - self.risk.stop_price;
        if denom <= Decimal::ZERO {
            return None;
        }
        Some((mark - self.weighted_entry) / denom)
    }

    /// Whether a FORMING campaign has outlived its confirmation window.
    pub fn is_stale(&self, now: DateTime<Utc>, window_secs: u64) -> bool {
        self.state == CampaignState::Forming
            && now - self.created_at > Duration::seconds(window_secs as i64)
    }

    /// Highest accepted pattern price, if any.
    pub fn highest_accepted(&self) -> Option<Decimal> {
        self.events.iter().map(|e| e.price).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pattern::{PatternKind, Timeframe, VolumeEvidence, VolumeSignal};
    use rust_decimal_macros::dec;

    fn cfg() -> CampaignConfig {
        CampaignConfig {
            stop_buffer_pct: Decimal::ZERO,
            tranche_size_pct: dec!(0.2),
            ..CampaignConfig::default()
        }
    }

    fn event(kind: PatternKind, price: Decimal) -> PatternEvent {
        PatternEvent::new(
            "EURUSD",
            Timeframe::H1,
            kind,
            price,
            VolumeEvidence::new(dec!(1.0), VolumeSignal::Average),
            0.8,
        )
    }

    fn open_campaign(kind: PatternKind, price: Decimal) -> Campaign {
        Campaign::open(
            &event(kind, price),
            "USD".to_string(),
            "g1".to_string(),
            "fx".to_string(),
            &cfg(),
        )
    }

    #[test]
    fn test_state_transitions() {
        use CampaignState::*;

        assert!(Forming.can_transition_to(Active));
        assert!(Forming.can_transition_to(Expired));
        assert!(Active.can_transition_to(Completed));
        assert!(Active.can_transition_to(Failed));

        // No backward or skipping moves
        assert!(!Active.can_transition_to(Forming));
        assert!(!Forming.can_transition_to(Completed));
        assert!(!Expired.can_transition_to(Forming));

        assert!(Completed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(Expired.is_terminal());
        assert!(!Forming.is_terminal());
    }

    #[test]
    fn test_phase_progression_stepwise() {
        use WyckoffPhase::*;
        assert!(A.can_progress_to(A));
        assert!(A.can_progress_to(B));
        assert!(C.can_progress_to(D));
        // Reversions and skips are illegal
        assert!(!B.can_progress_to(A));
        assert!(!D.can_progress_to(C));
        assert!(!A.can_progress_to(C));
        assert!(!B.can_progress_to(D));
    }

    #[test]
    fn test_open_anchors_range_and_phase() {
        let c = open_campaign(PatternKind::Spring, dec!(100));
        assert_eq!(c.state, CampaignState::Forming);
        assert_eq!(c.phase, WyckoffPhase::C);
        assert_eq!(c.bias, Some(CampaignBias::Accumulation));
        assert_eq!(c.range.support, dec!(95.00));
        assert_eq!(c.range.resistance, dec!(105.00));
        assert_eq!(c.risk.heat, Decimal::ZERO);
    }

    #[test]
    fn test_apply_accumulates_tranches() {
        let config = cfg();
        let mut c = open_campaign(PatternKind::Spring, dec!(100));
        c.apply(event(PatternKind::Spring, dec!(100)), &config);

        // stop = support = 95, heat = 0.2 * (100-95)/100 = 1%
        assert_eq!(c.risk.stop_price, dec!(95.00));
        assert_eq!(c.risk.heat, dec!(0.0100));
        assert_eq!(c.weighted_entry, dec!(100));

        c.apply(event(PatternKind::SignOfStrength, dec!(110)), &config);
        assert_eq!(c.phase, WyckoffPhase::D);
        assert_eq!(c.risk.tranche_count, 2);
        assert_eq!(c.weighted_entry, dec!(105));
        // Second tranche adds 0.2 * 15/110; total heat strictly grew
        assert!(c.risk.heat > dec!(0.0100));
    }

    #[test]
    fn test_heat_never_decreases_when_stop_moves_down() {
        let config = cfg();
        let mut c = open_campaign(PatternKind::Spring, dec!(100));
        c.apply(event(PatternKind::Spring, dec!(100)), &config);
        let before = c.risk.heat;

        // Spring dips below support: stop follows the lowest print down
        c.apply(event(PatternKind::SignOfStrength, dec!(93)), &config);
        assert_eq!(c.risk.stop_price, dec!(93));
        assert!(c.risk.heat > before);
    }

    #[test]
    fn test_range_admits_with_tolerances() {
        let config = cfg();
        let c = open_campaign(PatternKind::Spring, dec!(100));
        // In range
        assert!(c.range.admits(dec!(100), &config));
        // Spring undershoot within 5% below support (95 * 0.95 = 90.25)
        assert!(c.range.admits(dec!(91), &config));
        assert!(!c.range.admits(dec!(90), &config));
        // Markup overshoot within 25% above resistance
        assert!(c.range.admits(dec!(130), &config));
        assert!(!c.range.admits(dec!(132), &config));
    }

    #[test]
    fn test_record_mark_trajectory() {
        let config = cfg();
        let mut c = open_campaign(PatternKind::Spring, dec!(100));
        c.apply(event(PatternKind::Spring, dec!(100)), &config);

        // entry 100, stop 95: +1R at 105, -1R at 95
        c.record_mark(dec!(105), &config);
        assert_eq!(c.trajectory, Trajectory::Advancing);
        c.record_mark(dec!(100.5), &config);
        assert_eq!(c.trajectory, Trajectory::Stalling);
        c.record_mark(dec!(96), &config);
        assert_eq!(c.trajectory, Trajectory::Failing);
        assert_eq!(c.realized_r(), Some(dec!(-0.8)));
    }

    #[test]
    fn test_staleness_window() {
        let mut c = open_campaign(PatternKind::Spring, dec!(100));
        let later = c.created_at + Duration::seconds(120);
        assert!(!c.is_stale(later, 3600));
        assert!(c.is_stale(later, 60));

        c.state = CampaignState::Active;
        assert!(!c.is_stale(later, 60));
    }

    #[test]
    fn test_distribution_bias_from_pattern() {
        let c = open_campaign(PatternKind::Upthrust, dec!(100));
        assert_eq!(c.bias, Some(CampaignBias::Distribution));
        assert_eq!(c.phase, WyckoffPhase::C);
    }
}
