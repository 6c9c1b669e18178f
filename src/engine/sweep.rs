//! Periodic maintenance tasks.
//!
//! Sweeps run as plain tokio tasks and talk to the core exclusively
//! through the same mutation API as foreground requests, so the
//! single-writer-per-campaign discipline holds. Each task stops cleanly
//! through a watch channel: no tick is left half-applied because
//! cancellation is only observed between ticks.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::ValidationCache;

use super::manager::CampaignStateManager;

/// Handle to a running sweep; `stop` cancels and waits for the task.
pub struct SweepHandle {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SweepHandle {
    /// Signal the sweep to stop and wait for it to finish its current
    /// tick, if any.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Spawn the campaign expiration sweep.
pub fn spawn_expiration_sweep(
    manager: Arc<CampaignStateManager>,
    interval: Duration,
) -> SweepHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = manager.expire_stale().await {
                        warn!(error = %e, "expiration sweep failed");
                    }
                }
                _ = stop_rx.changed() => {
                    debug!("expiration sweep stopping");
                    break;
                }
            }
        }
    });
    SweepHandle { stop_tx, handle }
}

/// Spawn the validation-cache expiry sweep. Lazy expiry on access does
/// not depend on it; this just bounds how long dead entries linger.
pub fn spawn_cache_sweep(cache: Arc<ValidationCache>, interval: Duration) -> SweepHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    cache.purge_expired();
                }
                _ = stop_rx.changed() => {
                    debug!("cache sweep stopping");
                    break;
                }
            }
        }
    });
    SweepHandle { stop_tx, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::cache::CachedVerdict;
    use crate::config::{CacheConfig, EngineConfig};
    use crate::domain::{CampaignState, PatternEvent, PatternKind, Timeframe, VolumeEvidence, VolumeSignal};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_expiration_sweep_expires_and_stops() {
        let mut config = EngineConfig::default();
        config.campaign.expiration_window_secs = 0;
        let manager = Arc::new(CampaignStateManager::new(config, Arc::new(EventBus::new())));

        let outcome = manager
            .add_pattern(PatternEvent::new(
                "EURUSD",
                Timeframe::H1,
                PatternKind::Spring,
                dec!(100),
                VolumeEvidence::new(dec!(0.6), VolumeSignal::DryingUp),
                0.8,
            ))
            .await
            .unwrap();
        let id = outcome.campaign.unwrap().id;

        let sweep = spawn_expiration_sweep(Arc::clone(&manager), Duration::from_millis(10));
        for _ in 0..100 {
            if manager.get_campaign(id).await.unwrap().state == CampaignState::Expired {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            manager.get_campaign(id).await.unwrap().state,
            CampaignState::Expired
        );

        sweep.stop().await;
    }

    #[tokio::test]
    async fn test_cache_sweep_purges_expired_entries() {
        let cache = Arc::new(ValidationCache::new(&CacheConfig {
            capacity: 16,
            ttl_secs: 300,
            sweep_interval_secs: 1,
        }));
        cache.put_with_ttl(
            "stale",
            CachedVerdict {
                ok: true,
                adjusted_confidence: 0.5,
                reason: None,
            },
            Duration::from_millis(5),
        );

        let sweep = spawn_cache_sweep(Arc::clone(&cache), Duration::from_millis(10));
        for _ in 0..100 {
            if cache.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cache.is_empty());

        sweep.stop().await;
    }

    #[tokio::test]
    async fn test_stop_before_first_tick_is_clean() {
        let manager = Arc::new(CampaignStateManager::new(
            EngineConfig::default(),
            Arc::new(EventBus::new()),
        ));
        let sweep = spawn_expiration_sweep(manager, Duration::from_secs(3600));
        assert!(!sweep.is_finished());
        sweep.stop().await;
    }
}
