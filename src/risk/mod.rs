//! Portfolio risk gate.
//!
//! Admission checks run against a momentary snapshot of all open
//! campaigns (`PortfolioView`); the gate owns no state of its own. All
//! rejections come back as structured reasons, and capacity warnings are
//! emitted before hard limits are reached so upstream can throttle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RiskLimits;
use crate::domain::{CampaignState, Trajectory, WyckoffPhase};
use crate::regime::RegimeAdjustments;

/// One open campaign's exposure, as captured in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureRow {
    pub campaign_id: Uuid,
    pub symbol: String,
    pub currency: String,
    pub correlation_group: String,
    pub category: String,
    pub state: CampaignState,
    pub phase: WyckoffPhase,
    pub heat: Decimal,
    pub trajectory: Trajectory,
    pub updated_at: DateTime<Utc>,
}

/// Momentarily frozen view of all non-terminal campaigns.
///
/// Produced by the campaign book under its lock and handed out by value;
/// the version counter ties it back to the mutation that built it.
#[derive(Debug, Clone, Default)]
pub struct PortfolioView {
    pub version: u64,
    pub as_of: DateTime<Utc>,
    pub rows: Vec<ExposureRow>,
}

impl PortfolioView {
    /// Aggregate heat across all open campaigns.
    pub fn total_heat(&self) -> Decimal {
        self.rows.iter().map(|r| r.heat).sum()
    }

    fn rows_in_currency<'a>(
        &'a self,
        currency: &'a str,
    ) -> impl Iterator<Item = &'a ExposureRow> + 'a {
        self.rows.iter().filter(move |r| r.currency == currency)
    }
}

/// What the candidate would do to the portfolio if admitted.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub campaign_id: Uuid,
    /// True when admission would open a new campaign
    pub is_new: bool,
    pub currency: String,
    pub correlation_group: String,
    pub category: String,
    /// Campaign phase before this pattern (ignored when new)
    pub prior_phase: WyckoffPhase,
    /// Campaign phase if the pattern is accepted
    pub phase: WyckoffPhase,
    /// Campaign heat before this pattern (zero when new)
    pub prior_heat: Decimal,
    /// Campaign heat if the pattern is accepted
    pub projected_heat: Decimal,
}

/// Why admission was blocked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskBlockReason {
    HeatCeilingExceeded {
        ceiling: Decimal,
        current: Decimal,
        projected: Decimal,
    },
    CampaignHeatExceeded {
        cap: Decimal,
        projected: Decimal,
    },
    CurrencyExposureExceeded {
        currency: String,
        cap: Decimal,
        projected: Decimal,
    },
    CurrencyCampaignCap {
        currency: String,
        cap: usize,
    },
    CorrelationCascade {
        group: String,
        failing: usize,
    },
}

impl fmt::Display for RiskBlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeatCeilingExceeded {
                ceiling,
                current,
                projected,
            } => write!(
                f,
                "portfolio heat {} would exceed ceiling {} (currently {})",
                projected, ceiling, current
            ),
            Self::CampaignHeatExceeded { cap, projected } => {
                write!(f, "campaign heat {} exceeds per-campaign cap {}", projected, cap)
            }
            Self::CurrencyExposureExceeded {
                currency,
                cap,
                projected,
            } => write!(
                f,
                "{} weighted exposure {} exceeds cap {}",
                currency, projected, cap
            ),
            Self::CurrencyCampaignCap { currency, cap } => {
                write!(f, "{} already holds {} campaigns", currency, cap)
            }
            Self::CorrelationCascade { group, failing } => {
                write!(f, "correlation group {} has {} failing campaigns", group, failing)
            }
        }
    }
}

/// Capacity warnings; informational, never a rejection by themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskWarning {
    /// Remaining heat headroom is down to a single admission slot
    HeatNearCeiling { remaining: Decimal },
    /// One campaign slot left in this currency
    CurrencyNearCap { currency: String, open: usize },
    /// A category dominates total heat
    CategoryConcentration { category: String, share: Decimal },
}

impl fmt::Display for RiskWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeatNearCeiling { remaining } => {
                write!(f, "heat headroom down to {}", remaining)
            }
            Self::CurrencyNearCap { currency, open } => {
                write!(f, "{} at {} campaigns, one slot left", currency, open)
            }
            Self::CategoryConcentration { category, share } => {
                write!(f, "category {} holds {} of total heat", category, share)
            }
        }
    }
}

/// Portfolio-wide defensive signal: several correlated campaigns failing
/// at once. Distinct from a single-campaign rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeSignal {
    pub group: String,
    pub failing: usize,
    pub campaign_ids: Vec<Uuid>,
}

/// Admission verdict for one candidate.
#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<RiskBlockReason>,
    pub warnings: Vec<RiskWarning>,
    /// Every cascade currently detected in the portfolio
    pub cascades: Vec<CascadeSignal>,
}

/// Stateless admission gate over portfolio snapshots.
pub struct PortfolioRiskGate {
    limits: RiskLimits,
}

impl PortfolioRiskGate {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Detect correlation cascades: groups where at least the configured
    /// number of active campaigns are concurrently failing.
    pub fn detect_cascades(&self, view: &PortfolioView) -> Vec<CascadeSignal> {
        let mut failing_by_group: HashMap<&str, Vec<Uuid>> = HashMap::new();
        for row in &view.rows {
            if row.state == CampaignState::Active && row.trajectory == Trajectory::Failing {
                failing_by_group
                    .entry(row.correlation_group.as_str())
                    .or_default()
                    .push(row.campaign_id);
            }
        }

        let mut signals: Vec<CascadeSignal> = failing_by_group
            .into_iter()
            .filter(|(_, ids)| ids.len() >= self.limits.cascade_threshold)
            .map(|(group, ids)| CascadeSignal {
                group: group.to_string(),
                failing: ids.len(),
                campaign_ids: ids,
            })
            .collect();
        signals.sort_by(|a, b| a.group.cmp(&b.group));
        signals
    }

    /// Decide whether a new or growing campaign may proceed.
    ///
    /// Boundary semantics: landing exactly on a limit is allowed,
    /// exceeding it by any amount is blocked.
    pub fn check_admission(
        &self,
        request: &AdmissionRequest,
        view: &PortfolioView,
        adjustments: &RegimeAdjustments,
    ) -> AdmissionDecision {
        let cascades = self.detect_cascades(view);
        let mut warnings = Vec::new();

        // A cascade in the candidate's own group blocks further growth
        // there while the defensive signal is live.
        if let Some(signal) = cascades
            .iter()
            .find(|s| s.group == request.correlation_group)
        {
            warn!(group = %signal.group, failing = signal.failing, "correlation cascade active");
            return self.blocked(
                RiskBlockReason::CorrelationCascade {
                    group: signal.group.clone(),
                    failing: signal.failing,
                },
                warnings,
                cascades,
            );
        }

        // Per-campaign cap
        if request.projected_heat > self.limits.campaign_heat_cap {
            return self.blocked(
                RiskBlockReason::CampaignHeatExceeded {
                    cap: self.limits.campaign_heat_cap,
                    projected: request.projected_heat,
                },
                warnings,
                cascades,
            );
        }

        // Portfolio heat ceiling, phase-aware slack, regime-scaled
        let ceiling = self.limits.ceiling_for(request.phase) * adjustments.heat_ceiling_scale;
        let current = view.total_heat();
        let projected = current - request.prior_heat + request.projected_heat;
        if projected > ceiling {
            return self.blocked(
                RiskBlockReason::HeatCeilingExceeded {
                    ceiling,
                    current,
                    projected,
                },
                warnings,
                cascades,
            );
        }

        // Phase-weighted currency concentration
        let weighted_now: Decimal = view
            .rows_in_currency(&request.currency)
            .filter(|r| r.campaign_id != request.campaign_id)
            .map(|r| r.heat * self.limits.phase_weight(r.phase))
            .sum();
        let weighted_projected =
            weighted_now + request.projected_heat * self.limits.phase_weight(request.phase);
        if weighted_projected > self.limits.currency_weighted_cap {
            return self.blocked(
                RiskBlockReason::CurrencyExposureExceeded {
                    currency: request.currency.clone(),
                    cap: self.limits.currency_weighted_cap,
                    projected: weighted_projected,
                },
                warnings,
                cascades,
            );
        }

        // Independent campaign-count cap per currency
        let open_in_currency = view.rows_in_currency(&request.currency).count();
        let open_after = if request.is_new {
            open_in_currency + 1
        } else {
            open_in_currency
        };
        if open_after > self.limits.currency_campaign_cap {
            return self.blocked(
                RiskBlockReason::CurrencyCampaignCap {
                    currency: request.currency.clone(),
                    cap: self.limits.currency_campaign_cap,
                },
                warnings,
                cascades,
            );
        }

        // Capacity warnings fire one admission slot before the limits
        let remaining = ceiling - projected;
        if remaining < self.limits.admission_slot {
            warnings.push(RiskWarning::HeatNearCeiling { remaining });
        }
        if self.limits.currency_campaign_cap - open_after <= 1 {
            warnings.push(RiskWarning::CurrencyNearCap {
                currency: request.currency.clone(),
                open: open_after,
            });
        }

        // Category concentration is informational only
        if projected > Decimal::ZERO {
            let category_heat: Decimal = view
                .rows
                .iter()
                .filter(|r| r.category == request.category && r.campaign_id != request.campaign_id)
                .map(|r| r.heat)
                .sum::<Decimal>()
                + request.projected_heat;
            let share = category_heat / projected;
            if share >= self.limits.category_warn_share {
                warnings.push(RiskWarning::CategoryConcentration {
                    category: request.category.clone(),
                    share,
                });
            }
        }

        debug!(
            campaign = %request.campaign_id,
            projected_heat = %projected,
            warnings = warnings.len(),
            "admission allowed"
        );
        AdmissionDecision {
            allowed: true,
            reason: None,
            warnings,
            cascades,
        }
    }

    fn blocked(
        &self,
        reason: RiskBlockReason,
        warnings: Vec<RiskWarning>,
        cascades: Vec<CascadeSignal>,
    ) -> AdmissionDecision {
        debug!(%reason, "admission blocked");
        AdmissionDecision {
            allowed: false,
            reason: Some(reason),
            warnings,
            cascades,
        }
    }

    /// Order open campaigns for forced contraction: nearest to completion
    /// first (phase E, then D, down to B), most recently updated as the
    /// tie-break.
    pub fn exit_priority(&self, view: &PortfolioView) -> Vec<Uuid> {
        let mut rows: Vec<&ExposureRow> = view
            .rows
            .iter()
            .filter(|r| r.state == CampaignState::Active)
            .collect();
        rows.sort_by(|a, b| {
            b.phase
                .rank()
                .cmp(&a.phase.rank())
                .then(b.updated_at.cmp(&a.updated_at))
        });
        rows.iter().map(|r| r.campaign_id).collect()
    }
}
