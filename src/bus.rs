//! Asynchronous lifecycle event fabric.
//!
//! Publishing never blocks on subscriber execution: events go into an
//! unbounded queue drained by a single dispatcher task, which delivers to
//! each subscriber sequentially. That single consumer is what guarantees
//! per-campaign delivery order; no ordering holds across campaigns. A
//! failing handler is logged and skipped, never fatal. The bus holds no
//! campaign state; payloads are self-contained snapshots.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{Campaign, PatternEvent};
use crate::error::{EngineError, Result};
use crate::risk::{CascadeSignal, RiskWarning};

/// Discriminant of a lifecycle event, used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignEventKind {
    CampaignFormed,
    PatternAdded,
    CampaignActivated,
    CampaignCompleted,
    CampaignFailed,
    CampaignExpired,
    HeatAlert,
    CorrelationCascade,
}

/// A lifecycle notification with a self-contained payload snapshot.
///
/// `correlation_id` links back to the pattern event that triggered the
/// mutation (or the campaign id for sweep- and caller-driven changes).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CampaignEvent {
    CampaignFormed {
        campaign: Campaign,
        correlation_id: Uuid,
        emitted_at: DateTime<Utc>,
    },
    PatternAdded {
        campaign: Campaign,
        pattern: PatternEvent,
        correlation_id: Uuid,
        emitted_at: DateTime<Utc>,
    },
    CampaignActivated {
        campaign: Campaign,
        correlation_id: Uuid,
        emitted_at: DateTime<Utc>,
    },
    CampaignCompleted {
        campaign: Campaign,
        correlation_id: Uuid,
        emitted_at: DateTime<Utc>,
    },
    CampaignFailed {
        campaign: Campaign,
        correlation_id: Uuid,
        emitted_at: DateTime<Utc>,
    },
    CampaignExpired {
        campaign: Campaign,
        correlation_id: Uuid,
        emitted_at: DateTime<Utc>,
    },
    HeatAlert {
        warning: RiskWarning,
        total_heat: Decimal,
        correlation_id: Uuid,
        emitted_at: DateTime<Utc>,
    },
    CorrelationCascade {
        signal: CascadeSignal,
        correlation_id: Uuid,
        emitted_at: DateTime<Utc>,
    },
}

impl CampaignEvent {
    pub fn kind(&self) -> CampaignEventKind {
        match self {
            Self::CampaignFormed { .. } => CampaignEventKind::CampaignFormed,
            Self::PatternAdded { .. } => CampaignEventKind::PatternAdded,
            Self::CampaignActivated { .. } => CampaignEventKind::CampaignActivated,
            Self::CampaignCompleted { .. } => CampaignEventKind::CampaignCompleted,
            Self::CampaignFailed { .. } => CampaignEventKind::CampaignFailed,
            Self::CampaignExpired { .. } => CampaignEventKind::CampaignExpired,
            Self::HeatAlert { .. } => CampaignEventKind::HeatAlert,
            Self::CorrelationCascade { .. } => CampaignEventKind::CorrelationCascade,
        }
    }

    /// Campaign this event concerns; portfolio-level alerts have none.
    pub fn campaign_id(&self) -> Option<Uuid> {
        match self {
            Self::CampaignFormed { campaign, .. }
            | Self::PatternAdded { campaign, .. }
            | Self::CampaignActivated { campaign, .. }
            | Self::CampaignCompleted { campaign, .. }
            | Self::CampaignFailed { campaign, .. }
            | Self::CampaignExpired { campaign, .. } => Some(campaign.id),
            Self::HeatAlert { .. } | Self::CorrelationCascade { .. } => None,
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        match self {
            Self::CampaignFormed { correlation_id, .. }
            | Self::PatternAdded { correlation_id, .. }
            | Self::CampaignActivated { correlation_id, .. }
            | Self::CampaignCompleted { correlation_id, .. }
            | Self::CampaignFailed { correlation_id, .. }
            | Self::CampaignExpired { correlation_id, .. }
            | Self::HeatAlert { correlation_id, .. }
            | Self::CorrelationCascade { correlation_id, .. } => *correlation_id,
        }
    }
}

/// Capability implemented by every event consumer (persistence,
/// notification, dashboard transport). Failures are isolated per handler.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &str;
    async fn on_event(&self, event: &CampaignEvent) -> Result<()>;
}

struct SubscriberEntry {
    subscriber: Arc<dyn EventSubscriber>,
    /// Kinds this subscriber wants; empty means all
    filter: HashSet<CampaignEventKind>,
}

impl SubscriberEntry {
    fn wants(&self, kind: CampaignEventKind) -> bool {
        self.filter.is_empty() || self.filter.contains(&kind)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub handler_failures: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
}

/// Publish/subscribe fabric for campaign lifecycle events.
pub struct EventBus {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<CampaignEvent>>>,
    subscribers: Arc<RwLock<HashMap<u64, SubscriberEntry>>>,
    next_id: AtomicU64,
    counters: Arc<Counters>,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Create the bus and spawn its dispatcher task. Must be called from
    /// within a tokio runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<CampaignEvent>();
        let subscribers: Arc<RwLock<HashMap<u64, SubscriberEntry>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let counters = Arc::new(Counters::default());

        let task_subscribers = Arc::clone(&subscribers);
        let task_counters = Arc::clone(&counters);
        let dispatcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let kind = event.kind();
                let subs = task_subscribers.read().await;
                for entry in subs.values() {
                    if !entry.wants(kind) {
                        continue;
                    }
                    match entry.subscriber.on_event(&event).await {
                        Ok(()) => {
                            task_counters.delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            // Isolated: the failure never reaches the
                            // publisher or the other subscribers.
                            task_counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                subscriber = entry.subscriber.name(),
                                error = %e,
                                "event handler failed"
                            );
                        }
                    }
                }
            }
            debug!("event bus dispatcher drained and stopped");
        });

        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            subscribers,
            next_id: AtomicU64::new(1),
            counters,
            dispatcher: std::sync::Mutex::new(Some(dispatcher)),
        }
    }

    /// Enqueue an event for asynchronous delivery. Never waits on
    /// subscriber execution.
    pub fn publish(&self, event: CampaignEvent) -> Result<()> {
        let guard = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        let tx = guard.as_ref().ok_or(EngineError::BusClosed)?;
        tx.send(event).map_err(|_| EngineError::BusClosed)?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Register a subscriber for the given kinds (empty iterator = all).
    pub async fn subscribe(
        &self,
        kinds: impl IntoIterator<Item = CampaignEventKind>,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = SubscriberEntry {
            subscriber,
            filter: kinds.into_iter().collect(),
        };
        self.subscribers.write().await.insert(id, entry);
        SubscriptionHandle(id)
    }

    /// Remove a subscription; unknown handles are a no-op.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscribers.write().await.remove(&handle.0);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
        }
    }

    /// Close the bus and wait for the dispatcher to drain the queue.
    /// Publishing afterwards returns `BusClosed`.
    pub async fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CampaignConfig;
    use crate::domain::{PatternKind, Timeframe, VolumeEvidence, VolumeSignal};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn sample_campaign() -> Campaign {
        let cfg = CampaignConfig::default();
        let opener = PatternEvent::new(
            "EURUSD",
            Timeframe::H1,
            PatternKind::Spring,
            dec!(100),
            VolumeEvidence::new(dec!(1.0), VolumeSignal::DryingUp),
            0.8,
        );
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

    fn formed(campaign: &Campaign) -> CampaignEvent {
        CampaignEvent::CampaignFormed {
            campaign: campaign.clone(),
            correlation_id: Uuid::new_v4(),
            emitted_at: Utc::now(),
        }
    }

    fn activated(campaign: &Campaign) -> CampaignEvent {
        CampaignEvent::CampaignActivated {
            campaign: campaign.clone(),
            correlation_id: Uuid::new_v4(),
            emitted_at: Utc::now(),
        }
    }

    /// Records every received kind, optionally failing on a chosen one.
    struct Recorder {
        name: String,
        seen: std::sync::Mutex<Vec<CampaignEventKind>>,
        fail_on: Option<CampaignEventKind>,
    }

    impl Recorder {
        fn new(name: &str, fail_on: Option<CampaignEventKind>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: std::sync::Mutex::new(Vec::new()),
                fail_on,
            })
        }

        fn seen(&self) -> Vec<CampaignEventKind> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSubscriber for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_event(&self, event: &CampaignEvent) -> Result<()> {
            self.seen.lock().unwrap().push(event.kind());
            if self.fail_on == Some(event.kind()) {
                return Err(EngineError::Internal("handler blew up".to_string()));
            }
            Ok(())
        }
    }

    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_delivery_in_publish_order() {
        let bus = EventBus::new();
        let recorder = Recorder::new("rec", None);
        bus.subscribe([], Arc::clone(&recorder) as Arc<dyn EventSubscriber>)
            .await;

        let campaign = sample_campaign();
        bus.publish(formed(&campaign)).unwrap();
        bus.publish(activated(&campaign)).unwrap();

        wait_until(|| recorder.seen().len() == 2).await;
        assert_eq!(
            recorder.seen(),
            vec![
                CampaignEventKind::CampaignFormed,
                CampaignEventKind::CampaignActivated
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let bus = EventBus::new();
        let flaky = Recorder::new("flaky", Some(CampaignEventKind::CampaignFormed));
        let steady = Recorder::new("steady", None);
        bus.subscribe([], Arc::clone(&flaky) as Arc<dyn EventSubscriber>)
            .await;
        bus.subscribe([], Arc::clone(&steady) as Arc<dyn EventSubscriber>)
            .await;

        let campaign = sample_campaign();
        bus.publish(formed(&campaign)).unwrap();
        bus.publish(activated(&campaign)).unwrap();

        // The flaky handler fails on the first event but still gets the
        // second; the steady one sees both.
        wait_until(|| flaky.seen().len() == 2 && steady.seen().len() == 2).await;
        assert_eq!(
            flaky.seen(),
            vec![
                CampaignEventKind::CampaignFormed,
                CampaignEventKind::CampaignActivated
            ]
        );
        assert_eq!(steady.seen(), flaky.seen());
        assert_eq!(bus.stats().handler_failures, 1);
    }

    #[tokio::test]
    async fn test_kind_filter() {
        let bus = EventBus::new();
        let recorder = Recorder::new("filtered", None);
        bus.subscribe(
            [CampaignEventKind::CampaignActivated],
            Arc::clone(&recorder) as Arc<dyn EventSubscriber>,
        )
        .await;

        let campaign = sample_campaign();
        bus.publish(formed(&campaign)).unwrap();
        bus.publish(activated(&campaign)).unwrap();

        wait_until(|| recorder.seen().len() == 1).await;
        assert_eq!(recorder.seen(), vec![CampaignEventKind::CampaignActivated]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let recorder = Recorder::new("rec", None);
        let handle = bus
            .subscribe([], Arc::clone(&recorder) as Arc<dyn EventSubscriber>)
            .await;

        let campaign = sample_campaign();
        bus.publish(formed(&campaign)).unwrap();
        wait_until(|| recorder.seen().len() == 1).await;

        bus.unsubscribe(handle).await;
        assert_eq!(bus.subscriber_count().await, 0);
        bus.publish(activated(&campaign)).unwrap();

        // Give the dispatcher a moment; nothing further may arrive
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(recorder.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_closes() {
        let bus = EventBus::new();
        let recorder = Recorder::new("rec", None);
        bus.subscribe([], Arc::clone(&recorder) as Arc<dyn EventSubscriber>)
            .await;

        let campaign = sample_campaign();
        bus.publish(formed(&campaign)).unwrap();
        bus.publish(activated(&campaign)).unwrap();
        bus.shutdown().await;

        // Everything queued before shutdown was delivered
        assert_eq!(recorder.seen().len(), 2);
        assert!(matches!(
            bus.publish(formed(&campaign)),
            Err(EngineError::BusClosed)
        ));
    }
}
