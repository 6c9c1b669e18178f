//! Sequence validation: decides whether a candidate pattern may legally
//! extend a campaign.
//!
//! Layered checks: duplicate fingerprint, bias conflict, phase legality
//! (monotonic, stepwise, distribution capped at C), per-kind structural
//! rules, then a graduated volume penalty on confidence. Structural
//! failures are hard rejections; weak volume only down-weights.
//! Verdicts are memoized in the validation cache keyed by fingerprint
//! plus campaign phase and bias.

pub mod rules;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::cache::{CachedVerdict, ValidationCache};
use crate::config::ValidationConfig;
use crate::domain::{Campaign, CampaignBias, PatternEvent, VolumeSignal, WyckoffPhase};
use crate::regime::RegimeAdjustments;
use self::rules::RuleRegistry;

/// Why a candidate pattern was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SequenceReason {
    /// Identical fingerprint already accepted by this campaign
    Duplicate,
    /// Pattern kind is structurally invalid in the campaign's phase
    PhaseMismatch {
        pattern: String,
        phase: WyckoffPhase,
    },
    /// Accepting would skip ahead more than one phase
    PhaseSkip {
        from: WyckoffPhase,
        to: WyckoffPhase,
    },
    /// Pattern bias contradicts the campaign's committed bias
    BiasConflict { campaign: CampaignBias },
    /// Distribution campaigns see no markup beyond Phase C
    DistributionCapped { target: WyckoffPhase },
    /// Per-kind structural rule failed
    StructuralRule { note: String },
    /// Adjusted confidence fell below the floor
    ConfidenceBelowFloor { adjusted: f64, floor: f64 },
}

impl fmt::Display for SequenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate => write!(f, "duplicate pattern fingerprint"),
            Self::PhaseMismatch { pattern, phase } => {
                write!(f, "{} is not valid in phase {}", pattern, phase)
            }
            Self::PhaseSkip { from, to } => {
                write!(f, "phase skip {} -> {} is not allowed", from, to)
            }
            Self::BiasConflict { campaign } => {
                write!(f, "pattern bias conflicts with {:?} campaign", campaign)
            }
            Self::DistributionCapped { target } => {
                write!(f, "distribution campaign cannot reach phase {}", target)
            }
            Self::StructuralRule { note } => write!(f, "{}", note),
            Self::ConfidenceBelowFloor { adjusted, floor } => {
                write!(f, "adjusted confidence {:.3} below floor {:.3}", adjusted, floor)
            }
        }
    }
}

/// Result of validating one candidate against one campaign.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceOutcome {
    pub ok: bool,
    /// Candidate confidence after volume down-weighting
    pub adjusted_confidence: f64,
    pub reason: Option<SequenceReason>,
}

impl SequenceOutcome {
    fn accept(adjusted_confidence: f64) -> Self {
        Self {
            ok: true,
            adjusted_confidence,
            reason: None,
        }
    }

    fn reject(adjusted_confidence: f64, reason: SequenceReason) -> Self {
        Self {
            ok: false,
            adjusted_confidence,
            reason: Some(reason),
        }
    }
}

/// Validates pattern sequences against the phase model, consulting the
/// verdict cache first.
pub struct SequenceValidator {
    config: ValidationConfig,
    cache: Arc<ValidationCache>,
    rules: RuleRegistry,
}

impl SequenceValidator {
    pub fn new(config: ValidationConfig, cache: Arc<ValidationCache>) -> Self {
        Self {
            config,
            cache,
            rules: RuleRegistry::with_builtin(),
        }
    }

    /// Replace the rule registry (e.g. to register a custom kind).
    pub fn with_rules(mut self, rules: RuleRegistry) -> Self {
        self.rules = rules;
        self
    }

    /// Validate `event` as an extension of `campaign`.
    ///
    /// Duplicate detection is campaign-local and always computed fresh;
    /// everything else is memoized under (phase, bias, fingerprint).
    pub fn validate(
        &self,
        campaign: &Campaign,
        event: &PatternEvent,
        adjustments: &RegimeAdjustments,
    ) -> SequenceOutcome {
        let fingerprint = event.fingerprint();
        if campaign.accepted_fingerprints.contains(&fingerprint) {
            return SequenceOutcome::reject(event.confidence, SequenceReason::Duplicate);
        }

        let cache_key = Self::cache_key(campaign, adjustments, &fingerprint);
        if let Some(cached) = self.cache.get(&cache_key) {
            if let Some(outcome) = Self::from_cached(&cached) {
                trace!(key = %cache_key, "validation cache hit");
                return outcome;
            }
            // Undecodable entry: treat as a miss, never as an error
            self.cache.invalidate(&cache_key);
        }

        let outcome = self.compute(campaign, event, adjustments);
        self.cache.put(cache_key, Self::to_cached(&outcome));
        outcome
    }

    fn compute(
        &self,
        campaign: &Campaign,
        event: &PatternEvent,
        adjustments: &RegimeAdjustments,
    ) -> SequenceOutcome {
        let kind = event.kind;
        let current = campaign.phase;
        let proposed = current.max(kind.target_phase());

        // Bias conflict is structural: an accumulation campaign never
        // accepts distribution patterns, and vice versa.
        if let (Some(have), Some(want)) = (campaign.bias, kind.bias()) {
            if have != want {
                debug!(
                    campaign = %campaign.id,
                    pattern = %kind,
                    "rejecting pattern with conflicting bias"
                );
                return SequenceOutcome::reject(
                    event.confidence,
                    SequenceReason::BiasConflict { campaign: have },
                );
            }
        }

        let effective_bias = campaign.bias.or_else(|| kind.bias());
        if effective_bias == Some(CampaignBias::Distribution) && proposed > WyckoffPhase::C {
            return SequenceOutcome::reject(
                event.confidence,
                SequenceReason::DistributionCapped { target: proposed },
            );
        }

        if !current.can_progress_to(proposed) {
            return SequenceOutcome::reject(
                event.confidence,
                SequenceReason::PhaseSkip {
                    from: current,
                    to: proposed,
                },
            );
        }

        let compat = kind.compatible_phases();
        if !compat.contains(&current) && !compat.contains(&proposed) {
            return SequenceOutcome::reject(
                event.confidence,
                SequenceReason::PhaseMismatch {
                    pattern: kind.to_string(),
                    phase: current,
                },
            );
        }

        // Structural placement rules only make sense once the range has
        // accepted evidence; the opener anchored the range itself.
        if !campaign.events.is_empty() {
            let verdict = self.rules.evaluate(campaign, event);
            if !verdict.valid {
                return SequenceOutcome::reject(
                    event.confidence,
                    SequenceReason::StructuralRule {
                        note: verdict.note.unwrap_or("structural rule failed").to_string(),
                    },
                );
            }
        }

        // Graduated volume penalty: weak context down-weights, it never
        // rejects on its own.
        let adjusted = event.confidence * self.volume_factor(event);
        let floor = (self.config.confidence_floor + adjustments.confidence_floor_shift)
            .clamp(0.0, 1.0);
        if adjusted < floor {
            return SequenceOutcome::reject(
                adjusted,
                SequenceReason::ConfidenceBelowFloor { adjusted, floor },
            );
        }

        SequenceOutcome::accept(adjusted)
    }

    fn volume_factor(&self, event: &PatternEvent) -> f64 {
        match event.volume.signal {
            VolumeSignal::Climactic | VolumeSignal::Expanding => 1.0,
            VolumeSignal::Average => self.config.volume_factor_average,
            VolumeSignal::DryingUp => {
                if event.kind.expects_low_volume() {
                    1.0
                } else {
                    self.config.volume_factor_drying
                }
            }
        }
    }

    fn cache_key(
        campaign: &Campaign,
        adjustments: &RegimeAdjustments,
        fingerprint: &str,
    ) -> String {
        let bias = match campaign.bias {
            Some(CampaignBias::Accumulation) => "acc",
            Some(CampaignBias::Distribution) => "dist",
            None => "none",
        };
        // The floor shift feeds the verdict, so it is part of the key
        format!(
            "{}|{}|{:.3}|{}",
            campaign.phase, bias, adjustments.confidence_floor_shift, fingerprint
        )
    }

    fn to_cached(outcome: &SequenceOutcome) -> CachedVerdict {
        CachedVerdict {
            ok: outcome.ok,
            adjusted_confidence: outcome.adjusted_confidence,
            reason: outcome
                .reason
                .as_ref()
                .and_then(|r| serde_json::to_string(r).ok()),
        }
    }

    fn from_cached(cached: &CachedVerdict) -> Option<SequenceOutcome> {
        let reason = match &cached.reason {
            Some(raw) => Some(serde_json::from_str(raw).ok()?),
            None => None,
        };
        Some(SequenceOutcome {
            ok: cached.ok,
            adjusted_confidence: cached.adjusted_confidence,
            reason,
        })
    }

    pub fn cache(&self) -> &Arc<ValidationCache> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, CampaignConfig};
    use crate::domain::{PatternKind, Timeframe, VolumeEvidence};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn validator() -> SequenceValidator {
        let cache = Arc::new(ValidationCache::new(&CacheConfig::default()));
        SequenceValidator::new(ValidationConfig::default(), cache)
    }

    fn event_with(
        kind: PatternKind,
        price: Decimal,
        signal: VolumeSignal,
        confidence: f64,
    ) -> PatternEvent {
        PatternEvent::new(
            "EURUSD",
            Timeframe::H1,
            kind,
            price,
            VolumeEvidence::new(dec!(1.0), signal),
            confidence,
        )
    }

    fn event(kind: PatternKind, price: Decimal) -> PatternEvent {
        event_with(kind, price, VolumeSignal::Expanding, 0.8)
    }

    fn campaign_with(kind: PatternKind, price: Decimal) -> Campaign {
        let cfg = CampaignConfig::default();
        let opener = event(kind, price);
        let mut c = Campaign::open(
            &opener,
            "USD".to_string(),
            "g1".to_string(),
            "fx".to_string(),
            &cfg,
        );
        c.apply(opener, &cfg);
        c
    }

    #[test]
    fn test_accepts_legal_progression() {
        let v = validator();
        let c = campaign_with(PatternKind::Spring, dec!(100));
        let outcome = v.validate(
            &c,
            &event(PatternKind::SignOfStrength, dec!(104)),
            &RegimeAdjustments::default(),
        );
        assert!(outcome.ok, "reason: {:?}", outcome.reason);
    }

    #[test]
    fn test_rejects_phase_mismatch() {
        let v = validator();
        // Campaign in phase C cannot take a selling climax (phase A only)
        let c = campaign_with(PatternKind::Spring, dec!(100));
        let outcome = v.validate(
            &c,
            &event(PatternKind::SellingClimax, dec!(96)),
            &RegimeAdjustments::default(),
        );
        assert!(!outcome.ok);
        assert!(matches!(
            outcome.reason,
            Some(SequenceReason::PhaseMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_phase_skip() {
        let v = validator();
        // Phase A campaign cannot jump straight to a phase D pattern
        let c = campaign_with(PatternKind::SellingClimax, dec!(100));
        let outcome = v.validate(
            &c,
            &event(PatternKind::SignOfStrength, dec!(104)),
            &RegimeAdjustments::default(),
        );
        assert!(!outcome.ok);
        assert!(matches!(
            outcome.reason,
            Some(SequenceReason::PhaseSkip { .. })
        ));
    }

    #[test]
    fn test_rejects_bias_conflict() {
        let v = validator();
        let c = campaign_with(PatternKind::Spring, dec!(100));
        let outcome = v.validate(
            &c,
            &event(PatternKind::UpthrustAfterDistribution, dec!(107)),
            &RegimeAdjustments::default(),
        );
        assert!(!outcome.ok);
        assert!(matches!(
            outcome.reason,
            Some(SequenceReason::BiasConflict { .. })
        ));
    }

    #[test]
    fn test_distribution_capped_at_c() {
        let v = validator();
        let c = campaign_with(PatternKind::Upthrust, dec!(100));
        // Sign of weakness targets phase D; distribution stops at C
        let outcome = v.validate(
            &c,
            &event(PatternKind::SignOfWeakness, dec!(96)),
            &RegimeAdjustments::default(),
        );
        assert!(!outcome.ok);
        assert!(matches!(
            outcome.reason,
            Some(SequenceReason::DistributionCapped { .. })
        ));
    }

    #[test]
    fn test_volume_penalty_downweights_without_rejecting() {
        let v = validator();
        let c = campaign_with(PatternKind::Spring, dec!(100));

        let strong = v.validate(
            &c,
            &event_with(PatternKind::SignOfStrength, dec!(104), VolumeSignal::Expanding, 0.8),
            &RegimeAdjustments::default(),
        );
        let weak = v.validate(
            &c,
            &event_with(PatternKind::SignOfStrength, dec!(104.5), VolumeSignal::DryingUp, 0.8),
            &RegimeAdjustments::default(),
        );

        assert!(strong.ok && weak.ok);
        assert_eq!(strong.adjusted_confidence, 0.8);
        assert!(weak.adjusted_confidence < strong.adjusted_confidence);
    }

    #[test]
    fn test_spring_expects_dry_volume() {
        let v = validator();
        let c = campaign_with(PatternKind::SellingClimax, dec!(100));
        let mut c = c;
        c.phase = WyckoffPhase::B;

        // A test on drying volume keeps full weight
        let outcome = v.validate(
            &c,
            &event_with(PatternKind::Test, dec!(96), VolumeSignal::DryingUp, 0.8),
            &RegimeAdjustments::default(),
        );
        assert!(outcome.ok);
        assert_eq!(outcome.adjusted_confidence, 0.8);
    }

    #[test]
    fn test_confidence_floor_rejection() {
        let v = validator();
        let c = campaign_with(PatternKind::Spring, dec!(100));
        let outcome = v.validate(
            &c,
            &event_with(PatternKind::SignOfStrength, dec!(104), VolumeSignal::DryingUp, 0.4),
            &RegimeAdjustments::default(),
        );
        // 0.4 * 0.65 = 0.26 < 0.35 floor
        assert!(!outcome.ok);
        assert!(matches!(
            outcome.reason,
            Some(SequenceReason::ConfidenceBelowFloor { .. })
        ));
    }

    #[test]
    fn test_duplicate_rejected_and_not_cached() {
        let v = validator();
        let cfg = CampaignConfig::default();
        let mut c = campaign_with(PatternKind::Spring, dec!(100));

        let candidate = event(PatternKind::SignOfStrength, dec!(104));
        let first = v.validate(&c, &candidate, &RegimeAdjustments::default());
        assert!(first.ok);
        c.apply(candidate.clone(), &cfg);

        // Identical fingerprint is now a duplicate for this campaign
        let second = v.validate(&c, &candidate, &RegimeAdjustments::default());
        assert!(!second.ok);
        assert_eq!(second.reason, Some(SequenceReason::Duplicate));
    }

    #[test]
    fn test_verdicts_are_memoized() {
        let v = validator();
        let c = campaign_with(PatternKind::Spring, dec!(100));
        let candidate = event(PatternKind::SignOfStrength, dec!(104));

        let before = v.cache().stats();
        let first = v.validate(&c, &candidate, &RegimeAdjustments::default());
        let second = v.validate(&c, &candidate, &RegimeAdjustments::default());
        let after = v.cache().stats();

        assert_eq!(first, second);
        assert_eq!(after.hits, before.hits + 1);
        assert_eq!(after.inserts, before.inserts + 1);
    }

    #[test]
    fn test_tightened_floor_rejects_marginal_pattern() {
        let v = validator();
        let c = campaign_with(PatternKind::Spring, dec!(100));
        let candidate =
            event_with(PatternKind::SignOfStrength, dec!(104), VolumeSignal::Average, 0.5);

        let neutral = v.validate(&c, &candidate, &RegimeAdjustments::default());
        assert!(neutral.ok); // 0.5 * 0.85 = 0.425 >= 0.35

        let tightened = RegimeAdjustments {
            confidence_floor_shift: 0.1,
            ..RegimeAdjustments::default()
        };
        let outcome = v.validate(&c, &candidate, &tightened);
        assert!(!outcome.ok); // floor now 0.45
    }
}
