//! Durable, bounded FIFO of samples waiting for redelivery.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use geotrack_core::{new_entry_id, validate_sample, Clock, LocationSample, QueuedLocationSample};
use thiserror::Error;
use tracing::{debug, warn};

use crate::kv::{get_json, set_json, KeyValueStore, StoreError};

/// Storage key holding the JSON array of queued samples.
pub const QUEUE_KEY: &str = "location_queue";

/// Default entry cap.
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("sample rejected: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Retry queue persisted under [`QUEUE_KEY`].
///
/// Every read-modify-write cycle runs under one mutex, so the immediate-send
/// path and the processor never overwrite each other's changes.
pub struct RetryQueueStore {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    capacity: usize,
    lock: Mutex<()>,
}

impl RetryQueueStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            kv,
            clock,
            capacity: capacity.max(1),
            lock: Mutex::new(()),
        }
    }

    /// Appends `sample` as a fresh entry, dropping the oldest entries when the
    /// queue grows past capacity.
    pub fn enqueue(&self, sample: LocationSample) -> Result<QueuedLocationSample, QueueError> {
        let outcome = validate_sample(&sample);
        if !outcome.is_valid() {
            return Err(QueueError::Invalid(outcome.violations));
        }

        let _guard = self.guard();
        let mut entries = self.load_for_update()?;
        let entry = QueuedLocationSample::new(new_entry_id(), sample, self.clock.now_ms());
        entries.push(entry.clone());

        if entries.len() > self.capacity {
            let overflow = entries.len() - self.capacity;
            entries.drain(..overflow);
            warn!("retry queue full; dropped {overflow} oldest entries");
        }

        self.save(&entries)?;
        debug!("queued sample {} (queue size {})", entry.id, entries.len());
        Ok(entry)
    }

    /// Snapshot of the whole queue, oldest first.
    pub fn dequeue_all(&self) -> Vec<QueuedLocationSample> {
        let _guard = self.guard();
        self.load_or_empty()
    }

    /// Removes the given entry ids. Returns how many were present.
    pub fn remove(&self, ids: &HashSet<String>) -> Result<usize, StoreError> {
        self.commit(ids, &[])
    }

    /// Applies one processor pass: drops `removed` ids and replaces entries
    /// in `updated` by id, in a single persisted write. Entries enqueued after
    /// the processor took its snapshot are kept as they are.
    pub fn commit(
        &self,
        removed: &HashSet<String>,
        updated: &[QueuedLocationSample],
    ) -> Result<usize, StoreError> {
        if removed.is_empty() && updated.is_empty() {
            return Ok(0);
        }

        let _guard = self.guard();
        let entries = self.load_for_update()?;
        let before = entries.len();

        let mut replacements: HashMap<&str, &QueuedLocationSample> =
            updated.iter().map(|e| (e.id.as_str(), e)).collect();
        let next: Vec<QueuedLocationSample> = entries
            .into_iter()
            .filter(|e| !removed.contains(&e.id))
            .map(|e| match replacements.remove(e.id.as_str()) {
                Some(newer) => newer.clone(),
                None => e,
            })
            .collect();

        let dropped = before - next.len();
        self.save(&next)?;
        Ok(dropped)
    }

    /// Current queue length.
    pub fn size(&self) -> usize {
        let _guard = self.guard();
        self.load_or_empty().len()
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read failures propagate so a write never clobbers data we could not
    /// read. Undecodable data is discarded.
    fn load_for_update(&self) -> Result<Vec<QueuedLocationSample>, StoreError> {
        match get_json::<Vec<QueuedLocationSample>>(self.kv.as_ref(), QUEUE_KEY) {
            Ok(entries) => Ok(entries.unwrap_or_default()),
            Err(StoreError::Json(e)) => {
                warn!("retry queue is corrupt, starting empty: {e}");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    fn load_or_empty(&self) -> Vec<QueuedLocationSample> {
        match get_json::<Vec<QueuedLocationSample>>(self.kv.as_ref(), QUEUE_KEY) {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                warn!("retry queue read failed, treating as empty: {e}");
                Vec::new()
            }
        }
    }

    fn save(&self, entries: &[QueuedLocationSample]) -> Result<(), StoreError> {
        set_json(self.kv.as_ref(), QUEUE_KEY, entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use geotrack_core::ManualClock;

    fn store(capacity: usize) -> (RetryQueueStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let q = RetryQueueStore::new(Arc::new(MemoryKvStore::new()), clock.clone(), capacity);
        (q, clock)
    }

    fn sample(ts: i64) -> LocationSample {
        LocationSample::new("42", -12.04, -77.04, ts)
    }

    #[test]
    fn enqueue_wraps_with_fresh_metadata() {
        let (q, clock) = store(DEFAULT_CAPACITY);
        let entry = q.enqueue(sample(1)).unwrap();
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.created_at, clock.now_ms());
        assert!(!entry.id.is_empty());
        assert_eq!(q.size(), 1);
        assert_eq!(q.dequeue_all(), vec![entry]);
    }

    #[test]
    fn ids_are_unique() {
        let (q, _) = store(DEFAULT_CAPACITY);
        let ids: HashSet<String> = (1..=20).map(|i| q.enqueue(sample(i)).unwrap().id).collect();
        assert_eq!(ids.len(), 20);
    }

    #[test]
    fn invalid_samples_are_never_queued() {
        let (q, _) = store(DEFAULT_CAPACITY);
        let err = q.enqueue(LocationSample::new("", 91.0, 0.0, 1)).unwrap_err();
        match err {
            QueueError::Invalid(v) => assert_eq!(v.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn capacity_drops_oldest_first() {
        let (q, _) = store(100);
        for ts in 1..=130 {
            q.enqueue(sample(ts)).unwrap();
            assert!(q.size() <= 100);
        }
        let entries = q.dequeue_all();
        assert_eq!(entries.len(), 100);
        assert_eq!(entries.first().unwrap().sample.timestamp, 31);
        assert_eq!(entries.last().unwrap().sample.timestamp, 130);
    }

    #[test]
    fn remove_only_touches_given_ids() {
        let (q, _) = store(DEFAULT_CAPACITY);
        let a = q.enqueue(sample(1)).unwrap();
        let b = q.enqueue(sample(2)).unwrap();
        let removed = q.remove(&HashSet::from([a.id.clone(), "missing".to_string()])).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(q.dequeue_all(), vec![b]);
    }

    #[test]
    fn commit_keeps_entries_enqueued_after_snapshot() {
        let (q, _) = store(DEFAULT_CAPACITY);
        let a = q.enqueue(sample(1)).unwrap();
        let mut b = q.enqueue(sample(2)).unwrap();

        let snapshot = q.dequeue_all();
        assert_eq!(snapshot.len(), 2);

        // Immediate-send path adds while the processor is mid-pass.
        let c = q.enqueue(sample(3)).unwrap();

        b.retry_count = 1;
        q.commit(&HashSet::from([a.id.clone()]), std::slice::from_ref(&b)).unwrap();

        let entries = q.dequeue_all();
        assert_eq!(entries, vec![b, c]);
    }

    #[test]
    fn corrupt_queue_reads_as_empty_and_recovers_on_enqueue() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.set(QUEUE_KEY, "[{broken").unwrap();
        let q = RetryQueueStore::new(kv, Arc::new(ManualClock::new(1)), 10);
        assert_eq!(q.size(), 0);
        q.enqueue(sample(5)).unwrap();
        assert_eq!(q.size(), 1);
    }
}
