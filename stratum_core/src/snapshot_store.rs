//! A thread-safe in-memory slot for the currently active snapshot. [`SnapshotStore`] provides
//! concurrent access for readers (evaluation) and a single writer (the state manager).
//!
//! The snapshot itself is always immutable and can only be replaced fully. Readers clone the
//! `Arc` handle on entry and drop it on exit; the swap is a lock-free atomic pointer exchange, so
//! the evaluation path never takes a lock and an in-flight request keeps seeing the snapshot it
//! started with.
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::metrics;
use crate::snapshot::Snapshot;

pub struct SnapshotStore {
    snapshot: ArcSwap<Snapshot>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        SnapshotStore::new()
    }
}

impl SnapshotStore {
    /// Create a store holding an empty snapshot at version 0.
    pub fn new() -> Self {
        SnapshotStore {
            snapshot: ArcSwap::from_pointee(Snapshot::empty()),
        }
    }

    /// Acquire a handle to the current snapshot. O(1), no copy.
    pub fn current(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Publish a new snapshot, atomically replacing the current one.
    ///
    /// Readers that acquired the old snapshot keep using it until their request ends; the old
    /// snapshot is released once no reader retains it.
    pub fn publish(&self, snapshot: Snapshot) {
        let version = snapshot.version();
        self.snapshot.store(Arc::new(snapshot));
        metrics::SNAPSHOT_PUBLISH_TOTAL.inc();
        log::debug!(target: "stratum", version; "published new snapshot");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::SnapshotStore;
    use crate::model::FieldTypes;
    use crate::snapshot::Snapshot;

    #[test]
    fn can_publish_snapshot_from_another_thread() {
        let store = Arc::new(SnapshotStore::new());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.publish(Snapshot::build(
                    vec![],
                    vec![],
                    Arc::new(FieldTypes::new()),
                    42,
                ));
            })
            .join();
        }

        assert_eq!(store.current().version(), 42);
    }

    #[test]
    fn readers_keep_the_snapshot_they_acquired() {
        let store = SnapshotStore::new();
        store.publish(Snapshot::build(
            vec![],
            vec![],
            Arc::new(FieldTypes::new()),
            1,
        ));

        let held = store.current();
        store.publish(Snapshot::build(
            vec![],
            vec![],
            Arc::new(FieldTypes::new()),
            2,
        ));

        assert_eq!(held.version(), 1, "in-flight reader must not observe the swap");
        assert_eq!(store.current().version(), 2);
    }
}
