use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use afters_common::{PulseDelta, VenueScore};

use crate::config::PulseConfig;

/// Receives coalesced score deltas.
#[async_trait]
pub trait PulseSubscriber: Send + Sync {
    async fn deliver(&self, delta: &PulseDelta) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct VenueLane {
    tx: watch::Sender<Option<VenueScore>>,
    task: JoinHandle<()>,
}

struct Shared {
    subscribers: RwLock<HashMap<SubscriptionId, Arc<dyn PulseSubscriber>>>,
    config: PulseConfig,
    emitted: AtomicU64,
    failures: AtomicU64,
}

/// Debounced fan-out of venue scores.
///
/// Each venue gets one coalescing loop. A publish marks the venue's latest
/// score; the loop waits out the coalescing window, then delivers whatever is
/// latest at that moment. Emissions for a venue never overlap and are at
/// least one window apart.
pub struct PulseBroadcaster {
    shared: Arc<Shared>,
    lanes: Mutex<HashMap<Uuid, VenueLane>>,
    next_id: AtomicU64,
}

impl PulseBroadcaster {
    pub fn new(config: PulseConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: RwLock::new(HashMap::new()),
                config,
                emitted: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
            lanes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn PulseSubscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared
            .subscribers
            .write()
            .expect("lock poisoned")
            .insert(id, subscriber);
        debug!(%id, "Pulse subscriber registered");
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared
            .subscribers
            .write()
            .expect("lock poisoned")
            .remove(&id)
            .is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.read().expect("lock poisoned").len()
    }

    /// Queue `score` for its venue. Must be called inside a Tokio runtime.
    pub fn publish(&self, score: VenueScore) {
        let venue_id = score.venue_id;
        let mut lanes = self.lanes.lock().expect("lock poisoned");
        let lane = lanes.entry(venue_id).or_insert_with(|| {
            let (tx, rx) = watch::channel(None);
            let task = tokio::spawn(coalesce_loop(venue_id, rx, self.shared.clone()));
            VenueLane { tx, task }
        });
        lane.tx.send_replace(Some(score));
        debug!(%venue_id, "Score published");
    }

    /// Close a venue's lane, discarding any pending score. Returns false if
    /// the venue had no lane.
    pub fn forget(&self, venue_id: Uuid) -> bool {
        let lane = self.lanes.lock().expect("lock poisoned").remove(&venue_id);
        match lane {
            Some(lane) => {
                lane.task.abort();
                debug!(%venue_id, "Pulse lane closed");
                true
            }
            None => false,
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.lock().expect("lock poisoned").len()
    }

    /// Payloads delivered (one per venue per window, regardless of subscriber count).
    pub fn emitted_count(&self) -> u64 {
        self.shared.emitted.load(Ordering::Relaxed)
    }

    pub fn failed_deliveries(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }

    /// Stop accepting publishes, deliver anything pending, and wait for every
    /// venue loop to finish.
    pub async fn shutdown(&self) {
        let lanes: Vec<VenueLane> = self
            .lanes
            .lock()
            .expect("lock poisoned")
            .drain()
            .map(|(_, lane)| lane)
            .collect();
        for lane in lanes {
            drop(lane.tx);
            if let Err(e) = lane.task.await {
                warn!(error = %e, "Pulse loop ended abnormally");
            }
        }
    }
}

async fn coalesce_loop(venue_id: Uuid, mut rx: watch::Receiver<Option<VenueScore>>, shared: Arc<Shared>) {
    // `changed` still yields an unseen value after the sender is dropped, so
    // a pending score is flushed before the loop ends.
    while rx.changed().await.is_ok() {
        tokio::time::sleep(shared.config.coalesce_window).await;
        let latest = rx.borrow_and_update().clone();
        if let Some(score) = latest {
            deliver_all(&shared, &PulseDelta::from(&score)).await;
        }
    }
    debug!(%venue_id, "Pulse loop closed");
}

async fn deliver_all(shared: &Shared, delta: &PulseDelta) {
    let subscribers: Vec<(SubscriptionId, Arc<dyn PulseSubscriber>)> = shared
        .subscribers
        .read()
        .expect("lock poisoned")
        .iter()
        .map(|(id, s)| (*id, s.clone()))
        .collect();

    let timeout = shared.config.delivery_timeout;
    let deliveries = subscribers.iter().map(|(id, subscriber)| async move {
        match tokio::time::timeout(timeout, subscriber.deliver(delta)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(subscription = %id, venue_id = %delta.venue_id, error = %e, "Subscriber failed, skipping");
                false
            }
            Err(_) => {
                warn!(subscription = %id, venue_id = %delta.venue_id, "Subscriber timed out, skipping");
                false
            }
        }
    });
    let results = futures::future::join_all(deliveries).await;

    let failed = results.iter().filter(|ok| !**ok).count() as u64;
    shared.failures.fetch_add(failed, Ordering::Relaxed);
    shared.emitted.fetch_add(1, Ordering::Relaxed);
    debug!(
        venue_id = %delta.venue_id,
        subscribers = results.len(),
        failed,
        "Pulse delivered"
    );
}
