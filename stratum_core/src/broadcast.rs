//! Subscriber fan-out: pushing configuration to downstream evaluators.
//!
//! In multi-tier deployments, leaf processes don't poll the change log themselves; they subscribe
//! to a process that does. A new subscriber receives a `FullReload` with the snapshot subset for
//! its services, then incremental [`ConfigChange`] events. Queues are bounded: a subscriber that
//! can't keep up is marked stale and must resync, it never blocks the state manager.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::FanoutConfig;
use crate::metrics;
use crate::model::{Experiment, Layer, Timestamp};
use crate::snapshot::Snapshot;
use crate::snapshot_store::SnapshotStore;
use crate::{Error, Result};

/// What kind of configuration change happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    LayerCreated,
    LayerUpdated,
    LayerDeleted,
    ExperimentCreated,
    ExperimentUpdated,
    ExperimentDeleted,
}

/// The changed entity, or its id for deletions.
#[derive(Debug, Clone, Serialize)]
pub enum ChangePayload {
    Layer(Arc<Layer>),
    Experiment(Arc<Experiment>),
    DeletedLayer(String),
    DeletedExperiment(i64),
}

/// An incremental configuration change emitted after every applied change-log entry.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigChange {
    pub kind: ChangeKind,
    /// Snapshot version this change produced.
    pub version: i64,
    pub timestamp: Timestamp,
    /// Services affected by this change; drives fan-out filtering.
    pub services: Vec<String>,
    pub payload: ChangePayload,
}

/// An event delivered to a subscriber.
#[derive(Debug, Clone, Serialize)]
pub enum ConfigEvent {
    /// The full snapshot subset for the subscriber's services. Sent on registration and resync.
    FullReload {
        version: i64,
        layers: Vec<Arc<Layer>>,
        experiments: Vec<Arc<Experiment>>,
    },
    Change(ConfigChange),
}

/// The receiving end of a subscription.
pub struct Subscription {
    pub id: String,
    receiver: mpsc::Receiver<ConfigEvent>,
}

impl Subscription {
    /// Receive the next event. `None` means the registry dropped this subscriber.
    pub async fn recv(&mut self) -> Option<ConfigEvent> {
        self.receiver.recv().await
    }

    /// Blocking variant for synchronous consumers. Must not be called from an async context.
    pub fn blocking_recv(&mut self) -> Option<ConfigEvent> {
        self.receiver.blocking_recv()
    }
}

struct SubscriberHandle {
    services: HashSet<String>,
    sender: mpsc::Sender<ConfigEvent>,
    /// Set when the queue overflowed; no further events are delivered until a resync.
    stale: bool,
    acked_version: i64,
}

impl SubscriberHandle {
    fn wants(&self, services: &[String]) -> bool {
        // An empty subscription scope means "all services".
        self.services.is_empty() || services.iter().any(|s| self.services.contains(s))
    }
}

/// Registry of downstream subscribers with bounded per-subscriber queues.
pub struct SubscriberRegistry {
    config: FanoutConfig,
    snapshots: Arc<SnapshotStore>,
    subscribers: Mutex<HashMap<String, SubscriberHandle>>,
}

impl SubscriberRegistry {
    pub fn new(config: FanoutConfig, snapshots: Arc<SnapshotStore>) -> SubscriberRegistry {
        SubscriberRegistry {
            config,
            snapshots,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a subscriber and enqueue a `FullReload` for its services.
    ///
    /// Re-registering an existing id replaces the previous subscription.
    pub fn subscribe(
        &self,
        id: impl Into<String>,
        services: Vec<String>,
        known_version: i64,
    ) -> Result<Subscription> {
        let id = id.into();
        let mut subscribers = self.subscribers.lock();

        if !subscribers.contains_key(&id) && subscribers.len() >= self.config.max_subscribers {
            return Err(Error::TooManySubscribers);
        }

        let (sender, receiver) = mpsc::channel(self.config.queue_depth.max(1));
        let services: HashSet<String> = services.into_iter().collect();

        let snapshot = self.snapshots.current();
        let reload = full_reload(&snapshot, &services);
        log::debug!(target: "stratum",
            subscriber = id.as_str(),
            known_version,
            version = snapshot.version();
            "subscriber registered, sending full reload");
        // The channel is freshly created, so there is always room for the first event.
        let _ = sender.try_send(reload);

        subscribers.insert(
            id.clone(),
            SubscriberHandle {
                services,
                sender,
                stale: false,
                acked_version: known_version,
            },
        );
        metrics::SUBSCRIBERS_ACTIVE.set(subscribers.len() as i64);

        Ok(Subscription { id, receiver })
    }

    /// Deliver a change to every live subscriber whose services intersect the change's.
    ///
    /// Never blocks: a full queue marks the subscriber stale, a closed queue (receiver dropped)
    /// discards the subscriber entirely.
    pub fn publish(&self, change: &ConfigChange) {
        let mut subscribers = self.subscribers.lock();

        subscribers.retain(|id, handle| {
            if handle.stale || !handle.wants(&change.services) {
                return true;
            }

            match handle.sender.try_send(ConfigEvent::Change(change.clone())) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    metrics::SUBSCRIBER_DROPS_TOTAL.inc();
                    handle.stale = true;
                    log::warn!(target: "stratum",
                        subscriber = id.as_str();
                        "subscriber queue full, marking stale until resync");
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!(target: "stratum",
                        subscriber = id.as_str();
                        "subscriber disconnected, discarding state");
                    false
                }
            }
        });
        metrics::SUBSCRIBERS_ACTIVE.set(subscribers.len() as i64);
    }

    /// Record the version a subscriber reports having applied.
    pub fn ack(&self, id: &str, applied_version: i64) -> Result<()> {
        let mut subscribers = self.subscribers.lock();
        let handle = subscribers
            .get_mut(id)
            .ok_or_else(|| Error::UnknownSubscriber(id.to_owned()))?;
        handle.acked_version = applied_version;
        Ok(())
    }

    /// Re-enqueue a `FullReload` for a (typically stale) subscriber and clear its stale flag.
    pub fn resync(&self, id: &str) -> Result<()> {
        let mut subscribers = self.subscribers.lock();
        let handle = subscribers
            .get_mut(id)
            .ok_or_else(|| Error::UnknownSubscriber(id.to_owned()))?;

        let snapshot = self.snapshots.current();
        let reload = full_reload(&snapshot, &handle.services);
        match handle.sender.try_send(reload) {
            Ok(()) => {
                handle.stale = false;
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                // Still backed up; the subscriber has to drain its queue first.
                metrics::SUBSCRIBER_DROPS_TOTAL.inc();
                Ok(())
            }
            Err(TrySendError::Closed(_)) => {
                subscribers.remove(id);
                metrics::SUBSCRIBERS_ACTIVE.set(subscribers.len() as i64);
                Err(Error::UnknownSubscriber(id.to_owned()))
            }
        }
    }

    /// Drop a subscription explicitly.
    pub fn unsubscribe(&self, id: &str) {
        let mut subscribers = self.subscribers.lock();
        subscribers.remove(id);
        metrics::SUBSCRIBERS_ACTIVE.set(subscribers.len() as i64);
    }

    pub fn is_stale(&self, id: &str) -> Result<bool> {
        self.subscribers
            .lock()
            .get(id)
            .map(|h| h.stale)
            .ok_or_else(|| Error::UnknownSubscriber(id.to_owned()))
    }

    pub fn acked_version(&self, id: &str) -> Result<i64> {
        self.subscribers
            .lock()
            .get(id)
            .map(|h| h.acked_version)
            .ok_or_else(|| Error::UnknownSubscriber(id.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }
}

fn full_reload(snapshot: &Snapshot, services: &HashSet<String>) -> ConfigEvent {
    let all = services.is_empty();

    let layers: Vec<Arc<Layer>> = snapshot
        .layers()
        .filter(|layer| {
            all || snapshot
                .services_of(&layer.layer_id)
                .iter()
                .any(|s| services.contains(s))
        })
        .cloned()
        .collect();

    let experiments: Vec<Arc<Experiment>> = snapshot
        .experiments()
        .filter(|exp| all || services.contains(&exp.service))
        .cloned()
        .collect();

    ConfigEvent::FullReload {
        version: snapshot.version(),
        layers,
        experiments,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::FieldTypes;

    fn registry(queue_depth: usize, max: usize) -> SubscriberRegistry {
        let snapshots = Arc::new(SnapshotStore::new());
        snapshots.publish(Snapshot::build(
            vec![],
            vec![],
            Arc::new(FieldTypes::new()),
            7,
        ));
        SubscriberRegistry::new(
            FanoutConfig::new()
                .with_queue_depth(queue_depth)
                .with_max_subscribers(max),
            snapshots,
        )
    }

    fn change(services: &[&str]) -> ConfigChange {
        ConfigChange {
            kind: ChangeKind::LayerDeleted,
            version: 8,
            timestamp: Utc::now(),
            services: services.iter().map(|s| (*s).to_owned()).collect(),
            payload: ChangePayload::DeletedLayer("l1".to_owned()),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_full_reload_then_changes() {
        let registry = registry(4, 8);
        let mut sub = registry
            .subscribe("node-1", vec!["svc".to_owned()], 0)
            .unwrap();

        let Some(ConfigEvent::FullReload { version, .. }) = sub.recv().await else {
            panic!("expected full reload first");
        };
        assert_eq!(version, 7);

        registry.publish(&change(&["svc"]));
        let Some(ConfigEvent::Change(received)) = sub.recv().await else {
            panic!("expected change event");
        };
        assert_eq!(received.version, 8);
    }

    #[tokio::test]
    async fn changes_are_filtered_by_service() {
        let registry = registry(4, 8);
        let mut sub = registry
            .subscribe("node-1", vec!["search".to_owned()], 0)
            .unwrap();
        let _ = sub.recv().await; // full reload

        registry.publish(&change(&["ranking"]));
        registry.publish(&change(&["search"]));

        let Some(ConfigEvent::Change(received)) = sub.recv().await else {
            panic!("expected change event");
        };
        assert_eq!(received.services, vec!["search".to_owned()]);
    }

    #[tokio::test]
    async fn overflow_marks_subscriber_stale_and_resync_recovers() {
        let registry = registry(1, 8);
        let mut sub = registry.subscribe("slow", vec![], 0).unwrap();

        // Queue depth 1 is taken by the initial full reload; the first change overflows.
        registry.publish(&change(&["svc"]));
        assert!(registry.is_stale("slow").unwrap());

        // Stale subscribers receive nothing further.
        registry.publish(&change(&["svc"]));

        let Some(ConfigEvent::FullReload { .. }) = sub.recv().await else {
            panic!("expected the registration full reload");
        };

        registry.resync("slow").unwrap();
        assert!(!registry.is_stale("slow").unwrap());
        let Some(ConfigEvent::FullReload { version, .. }) = sub.recv().await else {
            panic!("expected resync full reload");
        };
        assert_eq!(version, 7);
    }

    #[tokio::test]
    async fn disconnected_subscriber_is_discarded() {
        let registry = registry(4, 8);
        let sub = registry.subscribe("gone", vec![], 0).unwrap();
        drop(sub);

        registry.publish(&change(&["svc"]));
        assert!(registry.is_empty());
    }

    #[test]
    fn registration_respects_capacity() {
        let registry = registry(4, 1);
        let _first = registry.subscribe("a", vec![], 0).unwrap();
        assert!(matches!(
            registry.subscribe("b", vec![], 0),
            Err(Error::TooManySubscribers)
        ));
    }

    #[test]
    fn ack_updates_applied_version() {
        let registry = registry(4, 8);
        let _sub = registry.subscribe("node-1", vec![], 3).unwrap();
        assert_eq!(registry.acked_version("node-1").unwrap(), 3);

        registry.ack("node-1", 9).unwrap();
        assert_eq!(registry.acked_version("node-1").unwrap(), 9);

        assert!(matches!(
            registry.ack("missing", 1),
            Err(Error::UnknownSubscriber(_))
        ));
    }
}
