//! Campaign state manager: the single owner of the campaign set.
//!
//! Every mutation (pattern ingestion, caller-driven transitions, marks,
//! the expiration sweep) funnels through the book's write lock, which
//! serializes writers per campaign and keeps per-symbol arrival order.
//! Validation, admission and commit happen inside one critical section;
//! events are enqueued on the bus before the lock is released so that
//! per-campaign emission order matches mutation order, without ever
//! waiting on subscriber execution.

use chrono::Utc;
use rust_decimal::Decimal;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{CampaignEvent, EventBus};
use crate::cache::ValidationCache;
use crate::config::EngineConfig;
use crate::domain::{Campaign, CampaignState, PatternEvent};
use crate::error::{EngineError, Result};
use crate::regime::{MarketRegime, RegimePerformanceAnalyzer};
use crate::risk::{AdmissionRequest, PortfolioRiskGate, PortfolioView, RiskBlockReason, RiskWarning};
use crate::validation::{SequenceReason, SequenceValidator};

use super::book::CampaignBook;

/// Why a pattern was not accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    SequenceInvalid(SequenceReason),
    RiskRejected(RiskBlockReason),
    /// The targeted FORMING campaign outlived its confirmation window
    Expired,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SequenceInvalid(reason) => write!(f, "sequence invalid: {}", reason),
            Self::RiskRejected(reason) => write!(f, "risk rejected: {}", reason),
            Self::Expired => write!(f, "campaign expired before confirmation"),
        }
    }
}

/// Result of ingesting one pattern event.
#[derive(Debug, Clone)]
pub struct PatternOutcome {
    pub accepted: bool,
    /// Snapshot of the affected campaign; absent when the pattern was
    /// rejected before a campaign existed
    pub campaign: Option<Campaign>,
    pub rejection: Option<RejectReason>,
    pub warnings: Vec<RiskWarning>,
}

impl PatternOutcome {
    fn accepted(campaign: Campaign, warnings: Vec<RiskWarning>) -> Self {
        Self {
            accepted: true,
            campaign: Some(campaign),
            rejection: None,
            warnings,
        }
    }

    fn rejected(
        campaign: Option<Campaign>,
        reason: RejectReason,
        warnings: Vec<RiskWarning>,
    ) -> Self {
        Self {
            accepted: false,
            campaign,
            rejection: Some(reason),
            warnings,
        }
    }
}

/// Ingestion counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub patterns_accepted: u64,
    pub rejected_sequence: u64,
    pub rejected_risk: u64,
    pub rejected_expired: u64,
    pub campaigns_formed: u64,
    pub campaigns_activated: u64,
}

#[derive(Default)]
struct Counters {
    patterns_accepted: AtomicU64,
    rejected_sequence: AtomicU64,
    rejected_risk: AtomicU64,
    rejected_expired: AtomicU64,
    campaigns_formed: AtomicU64,
    campaigns_activated: AtomicU64,
}

/// Owns the authoritative campaign set and enforces its lifecycle.
pub struct CampaignStateManager {
    config: EngineConfig,
    book: RwLock<CampaignBook>,
    validator: SequenceValidator,
    gate: PortfolioRiskGate,
    regime: RwLock<RegimePerformanceAnalyzer>,
    bus: Arc<EventBus>,
    counters: Counters,
}

impl CampaignStateManager {
    /// Build a manager from an immutable configuration and a shared bus.
    pub fn new(config: EngineConfig, bus: Arc<EventBus>) -> Self {
        let cache = Arc::new(ValidationCache::new(&config.cache));
        let validator = SequenceValidator::new(config.validation.clone(), cache);
        let gate = PortfolioRiskGate::new(config.risk.clone());
        let regime = RwLock::new(RegimePerformanceAnalyzer::new(config.regime.clone()));
        Self {
            config,
            book: RwLock::new(CampaignBook::new()),
            validator,
            gate,
            regime,
            bus,
            counters: Counters::default(),
        }
    }

    /// Ingest one pattern event.
    ///
    /// Looks up or opens the FORMING campaign for the event's symbol and
    /// range, validates sequence legality, checks portfolio admission,
    /// and commits atomically. Rejections mutate nothing and carry a
    /// structured reason.
    pub async fn add_pattern(&self, event: PatternEvent) -> Result<PatternOutcome> {
        let adjustments = self.regime.read().await.adjustments();
        let mut book = self.book.write().await;

        let existing = book.find_open(&event.symbol, event.price, &self.config.campaign);
        let (campaign, is_new) = match existing {
            Some(id) => {
                let campaign = book
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| EngineError::Internal(format!("index points at missing campaign {}", id)))?;
                (campaign, false)
            }
            None => {
                let meta = self.config.instrument(&event.symbol);
                let campaign = Campaign::open(
                    &event,
                    meta.currency.clone(),
                    meta.correlation_group.clone(),
                    meta.category.clone(),
                    &self.config.campaign,
                );
                (campaign, true)
            }
        };

        // A stale FORMING campaign expires instead of growing.
        if !is_new
            && campaign.is_stale(event.detected_at, self.config.campaign.expiration_window_secs)
        {
            let mut expired = campaign;
            expired.state = CampaignState::Expired;
            expired.updated_at = event.detected_at;
            book.commit(expired.clone());
            self.counters.rejected_expired.fetch_add(1, Ordering::Relaxed);
            info!(campaign = %expired.id, symbol = %expired.symbol, "campaign expired on arrival");
            self.bus.publish(CampaignEvent::CampaignExpired {
                campaign: expired.clone(),
                correlation_id: event.id,
                emitted_at: Utc::now(),
            })?;
            return Ok(PatternOutcome::rejected(
                Some(expired),
                RejectReason::Expired,
                Vec::new(),
            ));
        }

        // Sequence legality, cache-backed.
        let sequence = self.validator.validate(&campaign, &event, &adjustments);
        if !sequence.ok {
            let reason = sequence
                .reason
                .unwrap_or(SequenceReason::Duplicate);
            self.counters.rejected_sequence.fetch_add(1, Ordering::Relaxed);
            debug!(symbol = %event.symbol, pattern = %event.kind, %reason, "pattern rejected");
            return Ok(PatternOutcome::rejected(
                (!is_new).then_some(campaign),
                RejectReason::SequenceInvalid(reason),
                Vec::new(),
            ));
        }

        // Portfolio admission on the projected exposure.
        let projected = campaign.projected_with(&event, &self.config.campaign);
        let request = AdmissionRequest {
            campaign_id: campaign.id,
            is_new,
            currency: campaign.currency.clone(),
            correlation_group: campaign.correlation_group.clone(),
            category: campaign.category.clone(),
            prior_phase: campaign.phase,
            phase: projected.phase,
            prior_heat: if is_new { Decimal::ZERO } else { campaign.risk.heat },
            projected_heat: projected.risk.heat,
        };
        let view = book.view(event.detected_at);
        let decision = self.gate.check_admission(&request, &view, &adjustments);

        // Cascades are portfolio-level defensive signals and go out
        // whether or not this candidate is admitted.
        for signal in &decision.cascades {
            self.bus.publish(CampaignEvent::CorrelationCascade {
                signal: signal.clone(),
                correlation_id: event.id,
                emitted_at: Utc::now(),
            })?;
        }

        if !decision.allowed {
            let reason = decision
                .reason
                .unwrap_or(RiskBlockReason::HeatCeilingExceeded {
                    ceiling: self.config.risk.heat_ceiling,
                    current: view.total_heat(),
                    projected: view.total_heat(),
                });
            self.counters.rejected_risk.fetch_add(1, Ordering::Relaxed);
            warn!(symbol = %event.symbol, %reason, "pattern blocked by risk gate");
            return Ok(PatternOutcome::rejected(
                (!is_new).then_some(campaign),
                RejectReason::RiskRejected(reason),
                decision.warnings,
            ));
        }

        // Commit: event list, phase, weighted entry, risk, state and
        // indexes all advance in this critical section.
        let was_forming = campaign.state == CampaignState::Forming;
        let mut committed = projected;

        if is_new {
            self.counters.campaigns_formed.fetch_add(1, Ordering::Relaxed);
            self.bus.publish(CampaignEvent::CampaignFormed {
                campaign: committed.clone(),
                correlation_id: event.id,
                emitted_at: Utc::now(),
            })?;
        }

        let activate = was_forming
            && committed.events.len() >= self.config.campaign.confirmation_patterns;
        if activate {
            committed.state = CampaignState::Active;
        }

        book.commit(committed.clone());
        self.counters.patterns_accepted.fetch_add(1, Ordering::Relaxed);

        self.bus.publish(CampaignEvent::PatternAdded {
            campaign: committed.clone(),
            pattern: event.clone(),
            correlation_id: event.id,
            emitted_at: Utc::now(),
        })?;
        if activate {
            self.counters.campaigns_activated.fetch_add(1, Ordering::Relaxed);
            info!(campaign = %committed.id, symbol = %committed.symbol, "campaign activated");
            self.bus.publish(CampaignEvent::CampaignActivated {
                campaign: committed.clone(),
                correlation_id: event.id,
                emitted_at: Utc::now(),
            })?;
        }

        let total_heat = book.view(event.detected_at).total_heat();
        for warning in &decision.warnings {
            self.bus.publish(CampaignEvent::HeatAlert {
                warning: warning.clone(),
                total_heat,
                correlation_id: event.id,
                emitted_at: Utc::now(),
            })?;
        }

        Ok(PatternOutcome::accepted(committed, decision.warnings))
    }

    /// Ingest a batch, observably equivalent to sequential `add_pattern`
    /// calls in the same order.
    pub async fn add_patterns_batch(
        &self,
        events: Vec<PatternEvent>,
    ) -> Result<Vec<PatternOutcome>> {
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            outcomes.push(self.add_pattern(event).await?);
        }
        Ok(outcomes)
    }

    /// Request a lifecycle transition on behalf of a caller (plan
    /// completion, stop breach). Illegal requests surface as errors and
    /// coerce nothing.
    pub async fn transition(&self, id: Uuid, target: CampaignState) -> Result<Campaign> {
        let mut book = self.book.write().await;
        let mut campaign = book
            .get(&id)
            .cloned()
            .ok_or(EngineError::CampaignNotFound(id))?;

        if !campaign.state.can_transition_to(target) {
            return Err(EngineError::InvalidStateTransition {
                from: campaign.state.to_string(),
                to: target.to_string(),
            });
        }

        campaign.state = target;
        campaign.updated_at = Utc::now();
        book.commit(campaign.clone());
        info!(campaign = %id, state = %target, "campaign transitioned");

        let emitted_at = Utc::now();
        match target {
            CampaignState::Active => {
                self.bus.publish(CampaignEvent::CampaignActivated {
                    campaign: campaign.clone(),
                    correlation_id: id,
                    emitted_at,
                })?;
            }
            CampaignState::Completed => {
                self.record_outcome(&campaign, true).await;
                self.bus.publish(CampaignEvent::CampaignCompleted {
                    campaign: campaign.clone(),
                    correlation_id: id,
                    emitted_at,
                })?;
            }
            CampaignState::Failed => {
                self.record_outcome(&campaign, false).await;
                self.bus.publish(CampaignEvent::CampaignFailed {
                    campaign: campaign.clone(),
                    correlation_id: id,
                    emitted_at,
                })?;
            }
            CampaignState::Expired => {
                self.bus.publish(CampaignEvent::CampaignExpired {
                    campaign: campaign.clone(),
                    correlation_id: id,
                    emitted_at,
                })?;
            }
            CampaignState::Forming => {}
        }

        Ok(campaign)
    }

    async fn record_outcome(&self, campaign: &Campaign, won: bool) {
        let r = campaign.realized_r().unwrap_or(Decimal::ZERO);
        self.regime.write().await.record_outcome(won, r);
    }

    /// Mark-to-market a campaign; updates its trajectory, which feeds
    /// the correlation cascade detector.
    pub async fn record_mark(&self, id: Uuid, price: Decimal) -> Result<Campaign> {
        let mut book = self.book.write().await;
        let mut campaign = book
            .get(&id)
            .cloned()
            .ok_or(EngineError::CampaignNotFound(id))?;
        campaign.record_mark(price, &self.config.campaign);
        book.commit(campaign.clone());
        Ok(campaign)
    }

    /// Expire every FORMING campaign past its confirmation window.
    /// Called by the periodic sweep through the same lock as ingestion,
    /// so it cannot race a concurrent `add_pattern` on the same campaign.
    pub async fn expire_stale(&self) -> Result<usize> {
        let now = Utc::now();
        let mut book = self.book.write().await;
        let stale = book.stale_forming(now, self.config.campaign.expiration_window_secs);

        for id in &stale {
            let mut campaign = match book.get(id).cloned() {
                Some(c) => c,
                None => continue,
            };
            campaign.state = CampaignState::Expired;
            campaign.updated_at = now;
            book.commit(campaign.clone());
            self.counters.rejected_expired.fetch_add(1, Ordering::Relaxed);
            self.bus.publish(CampaignEvent::CampaignExpired {
                campaign,
                correlation_id: *id,
                emitted_at: now,
            })?;
        }

        if !stale.is_empty() {
            info!(count = stale.len(), "expiration sweep closed stale campaigns");
        }
        Ok(stale.len())
    }

    // ==================== Read-only queries ====================

    /// Snapshot of one campaign.
    pub async fn get_campaign(&self, id: Uuid) -> Option<Campaign> {
        self.book.read().await.get(&id).cloned()
    }

    /// ACTIVE campaigns, optionally narrowed to one symbol. Served from
    /// the by-state / by-symbol indexes.
    pub async fn active_campaigns(&self, symbol: Option<&str>) -> Vec<Campaign> {
        let book = self.book.read().await;
        book.ids_in_state(CampaignState::Active, symbol)
            .into_iter()
            .filter_map(|id| book.get(&id).cloned())
            .collect()
    }

    /// Versioned snapshot of all open exposure.
    pub async fn portfolio_view(&self) -> PortfolioView {
        self.book.read().await.view(Utc::now())
    }

    /// Campaigns ordered for forced contraction (phase E first).
    pub async fn exit_priority(&self) -> Vec<Uuid> {
        let view = self.portfolio_view().await;
        self.gate.exit_priority(&view)
    }

    /// Set the prevailing market regime for threshold feedback.
    pub async fn set_regime(&self, regime: MarketRegime) {
        self.regime.write().await.set_regime(regime);
    }

    /// Shared handle to the validation cache (for the background sweep).
    pub fn validation_cache(&self) -> Arc<ValidationCache> {
        Arc::clone(self.validator.cache())
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            patterns_accepted: self.counters.patterns_accepted.load(Ordering::Relaxed),
            rejected_sequence: self.counters.rejected_sequence.load(Ordering::Relaxed),
            rejected_risk: self.counters.rejected_risk.load(Ordering::Relaxed),
            rejected_expired: self.counters.rejected_expired.load(Ordering::Relaxed),
            campaigns_formed: self.counters.campaigns_formed.load(Ordering::Relaxed),
            campaigns_activated: self.counters.campaigns_activated.load(Ordering::Relaxed),
        }
    }
}
