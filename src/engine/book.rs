//! The authoritative campaign set and its secondary indexes.
//!
//! `commit` is the only mutation entry point, so the primary map and the
//! by-symbol / by-state / open-range indexes always change in the same
//! step. The book also produces the versioned portfolio snapshots the
//! risk gate reads.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::config::CampaignConfig;
use crate::domain::{Campaign, CampaignState};
use crate::risk::{ExposureRow, PortfolioView};
use rust_decimal::Decimal;

#[derive(Default)]
pub struct CampaignBook {
    campaigns: HashMap<Uuid, Campaign>,
    by_symbol: HashMap<String, HashSet<Uuid>>,
    by_state: HashMap<CampaignState, HashSet<Uuid>>,
    /// (symbol, range key) -> the single non-terminal campaign there
    open_ranges: HashMap<(String, String), Uuid>,
    version: u64,
}

impl CampaignBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Uuid) -> Option<&Campaign> {
        self.campaigns.get(id)
    }

    pub fn len(&self) -> usize {
        self.campaigns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.campaigns.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Insert or replace a campaign, updating every index in the same
    /// logical step.
    pub fn commit(&mut self, campaign: Campaign) {
        let id = campaign.id;
        let range_key = (campaign.symbol.clone(), campaign.range.key());

        if let Some(old) = self.campaigns.get(&id) {
            if old.state != campaign.state {
                if let Some(set) = self.by_state.get_mut(&old.state) {
                    set.remove(&id);
                }
            }
        } else {
            self.by_symbol
                .entry(campaign.symbol.clone())
                .or_default()
                .insert(id);
        }

        self.by_state.entry(campaign.state).or_default().insert(id);

        if campaign.state.is_terminal() {
            self.open_ranges.remove(&range_key);
        } else {
            self.open_ranges.insert(range_key, id);
        }

        self.campaigns.insert(id, campaign);
        self.version += 1;
    }

    /// Find the non-terminal campaign whose range admits a pattern at
    /// `price` on `symbol`. Most recently updated wins if ranges overlap.
    pub fn find_open(&self, symbol: &str, price: Decimal, cfg: &CampaignConfig) -> Option<Uuid> {
        let ids = self.by_symbol.get(symbol)?;
        ids.iter()
            .filter_map(|id| self.campaigns.get(id))
            .filter(|c| !c.state.is_terminal() && c.range.admits(price, cfg))
            .max_by_key(|c| c.updated_at)
            .map(|c| c.id)
    }

    /// Ids in a given state, optionally narrowed to one symbol. Pure
    /// index intersection; never a scan over the campaign set.
    pub fn ids_in_state(&self, state: CampaignState, symbol: Option<&str>) -> Vec<Uuid> {
        let in_state = match self.by_state.get(&state) {
            Some(set) => set,
            None => return Vec::new(),
        };
        match symbol {
            Some(sym) => match self.by_symbol.get(sym) {
                Some(by_sym) => in_state.intersection(by_sym).copied().collect(),
                None => Vec::new(),
            },
            None => in_state.iter().copied().collect(),
        }
    }

    /// FORMING campaigns older than the expiration window.
    pub fn stale_forming(&self, now: DateTime<Utc>, window_secs: u64) -> Vec<Uuid> {
        self.ids_in_state(CampaignState::Forming, None)
            .into_iter()
            .filter(|id| {
                self.campaigns
                    .get(id)
                    .map(|c| c.is_stale(now, window_secs))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Build a momentarily frozen snapshot of all non-terminal
    /// campaigns, stamped with the current book version.
    pub fn view(&self, as_of: DateTime<Utc>) -> PortfolioView {
        let rows = self
            .campaigns
            .values()
            .filter(|c| !c.state.is_terminal())
            .map(|c| ExposureRow {
                campaign_id: c.id,
                symbol: c.symbol.clone(),
                currency: c.currency.clone(),
                correlation_group: c.correlation_group.clone(),
                category: c.category.clone(),
                state: c.state,
                phase: c.phase,
                heat: c.risk.heat,
                trajectory: c.trajectory,
                updated_at: c.updated_at,
            })
            .collect();
        PortfolioView {
            version: self.version,
            as_of,
            rows,
        }
    }
}
