#![allow(clippy::missing_errors_doc)]

//! In-memory telemetry store.
//!
//! Locking: one `RwLock` over the key -> series map and one `Mutex` per key.
//! The map lock is only held to look a key up or to insert a key seen for the
//! first time, never while waiting on a per-key mutex. Everything belonging to
//! one key (latest snapshot and history window) sits behind that key's mutex,
//! so an ingest is a single visible unit and readers see it entirely or not at
//! all. No I/O happens under either lock.

mod gate;
mod query;

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use telemetry_cache_core::{
    HistoryEntry, HistoryRing, NodeKey, Reading, Snapshot, StoreConfig, TelemetryError,
};
use time::OffsetDateTime;

pub use gate::{Clock, IngestAck, IngestionGate, SystemClock};
pub use query::QueryFacade;

type SeriesHandle = Arc<Mutex<NodeSeries>>;

#[derive(Debug)]
pub struct TelemetryStore {
    config: StoreConfig,
    nodes: RwLock<HashMap<NodeKey, SeriesHandle>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStats {
    pub nodes: usize,
    pub retained_entries: usize,
    pub history_capacity: usize,
}

#[derive(Debug)]
struct NodeSeries {
    latest: Snapshot,
    history: HistoryRing,
}

impl NodeSeries {
    fn new(first: Snapshot, capacity: usize) -> Self {
        let mut series = Self {
            latest: first,
            history: HistoryRing::with_capacity(capacity),
        };
        series.record(first);
        series
    }

    fn record(&mut self, snapshot: Snapshot) {
        self.latest = snapshot;
        if let Some(evicted) = self.history.push(snapshot.history_entry()) {
            tracing::trace!(evicted_at = %evicted.timestamp, "history window full, dropped oldest entry");
        }
    }

    fn record_with<F>(&mut self, make: F) -> Snapshot
    where
        F: FnOnce(Option<&Snapshot>) -> Snapshot,
    {
        let snapshot = make(Some(&self.latest));
        self.record(snapshot);
        snapshot
    }
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryStore {
    /// Store with the default retention window of
    /// [`telemetry_cache_core::DEFAULT_HISTORY_CAPACITY`] entries per key.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: StoreConfig::default(),
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_config(config: StoreConfig) -> Result<Self, TelemetryError> {
        config.validate()?;
        Ok(Self {
            config,
            nodes: RwLock::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn history_capacity(&self) -> usize {
        self.config.history_capacity
    }

    /// Records `reading` for `key`: overwrites the snapshot, appends to the
    /// history window and evicts the oldest entry once the window is full.
    ///
    /// Entries are kept in call order. `timestamp` is stored as given and is
    /// never used to reorder.
    pub fn ingest(&self, key: NodeKey, reading: Reading, timestamp: OffsetDateTime) {
        let _ = self.upsert(key, |_| Snapshot { reading, timestamp });
    }

    /// Like [`TelemetryStore::ingest`], but the timestamp is read from `now`
    /// while the key's lock is held and is raised to the key's current latest
    /// timestamp if `now` is behind it. Stamps for one key are therefore
    /// non-decreasing in history order. Returns the stored timestamp.
    pub fn ingest_stamped<F>(&self, key: NodeKey, reading: Reading, now: F) -> OffsetDateTime
    where
        F: FnOnce() -> OffsetDateTime,
    {
        let snapshot = self.upsert(key, |previous| {
            let stamped = now();
            let timestamp = previous.map_or(stamped, |previous| stamped.max(previous.timestamp));
            Snapshot { reading, timestamp }
        });
        snapshot.timestamp
    }

    fn upsert<F>(&self, key: NodeKey, make: F) -> Snapshot
    where
        F: FnOnce(Option<&Snapshot>) -> Snapshot,
    {
        if let Some(series) = self.series(&key) {
            return lock_series(&series).record_with(make);
        }

        let mut nodes = write_nodes(&self.nodes);
        let series = match nodes.entry(key) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                tracing::debug!(node_id = %entry.key(), "first reading for node");
                let snapshot = make(None);
                let _ = entry.insert(Arc::new(Mutex::new(NodeSeries::new(
                    snapshot,
                    self.config.history_capacity,
                ))));
                return snapshot;
            }
        };
        drop(nodes);

        let recorded = lock_series(&series).record_with(make);
        recorded
    }

    #[must_use]
    pub fn latest(&self, key: &NodeKey) -> Option<Snapshot> {
        self.series(key).map(|series| {
            let guard = lock_series(&series);
            guard.latest
        })
    }

    /// Copies every known key's snapshot. Each snapshot is read under its
    /// own key's lock, so ingests racing with this call may or may not show.
    #[must_use]
    pub fn all_latest(&self) -> BTreeMap<NodeKey, Snapshot> {
        self.handles()
            .into_iter()
            .map(|(key, series)| {
                let latest = lock_series(&series).latest;
                (key, latest)
            })
            .collect()
    }

    /// History window for `key`, oldest first. Unknown keys yield an empty vector.
    #[must_use]
    pub fn history(&self, key: &NodeKey) -> Vec<HistoryEntry> {
        self.series(key)
            .map(|series| {
                let guard = lock_series(&series);
                guard.history.to_vec()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        read_nodes(&self.nodes).len()
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let handles = self.handles();
        let retained_entries = handles
            .iter()
            .map(|(_, series)| lock_series(series).history.len())
            .sum();
        StoreStats {
            nodes: handles.len(),
            retained_entries,
            history_capacity: self.config.history_capacity,
        }
    }

    fn series(&self, key: &NodeKey) -> Option<SeriesHandle> {
        read_nodes(&self.nodes).get(key).map(Arc::clone)
    }

    fn handles(&self) -> Vec<(NodeKey, SeriesHandle)> {
        read_nodes(&self.nodes)
            .iter()
            .map(|(key, series)| (key.clone(), Arc::clone(series)))
            .collect()
    }
}

// Critical sections below cannot panic part-way through a mutation, so a
// poisoned lock still guards consistent data.
fn lock_series(series: &Mutex<NodeSeries>) -> MutexGuard<'_, NodeSeries> {
    series.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_nodes(
    nodes: &RwLock<HashMap<NodeKey, SeriesHandle>>,
) -> RwLockReadGuard<'_, HashMap<NodeKey, SeriesHandle>> {
    nodes.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_nodes(
    nodes: &RwLock<HashMap<NodeKey, SeriesHandle>>,
) -> RwLockWriteGuard<'_, HashMap<NodeKey, SeriesHandle>> {
    nodes.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::cast_precision_loss, clippy::cast_possible_wrap)]

    use super::*;
    use proptest::prelude::*;
    use time::Duration;

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(value) => value,
            None => panic!("expected Some(..)"),
        }
    }

    fn key(raw: &str) -> NodeKey {
        must_some(NodeKey::parse(raw))
    }

    fn at(offset_secs: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(offset_secs)
    }

    fn reading(temperature: f64, humidity: f64) -> Reading {
        Reading {
            temperature,
            humidity,
        }
    }

    fn temperatures(entries: &[HistoryEntry]) -> Vec<f64> {
        entries.iter().map(|entry| entry.temperature).collect()
    }

    #[test]
    fn latest_tracks_last_ingested_reading() {
        let store = TelemetryStore::new();
        store.ingest(key("1"), reading(25.0, 40.0), at(0));
        store.ingest(key("1"), reading(26.5, 41.0), at(1));

        let latest = must_some(store.latest(&key("1")));
        assert_eq!(latest.reading, reading(26.5, 41.0));
        assert_eq!(latest.timestamp, at(1));

        let history = store.history(&key("1"));
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].reading(), reading(25.0, 40.0));
        assert_eq!(history[1].reading(), reading(26.5, 41.0));
    }

    #[test]
    fn history_retains_most_recent_hundred() {
        let store = TelemetryStore::new();
        for index in 1..=150_i64 {
            store.ingest(key("2"), reading(index as f64, 50.0), at(index));
        }

        let history = store.history(&key("2"));
        assert_eq!(history.len(), 100);
        let expected: Vec<f64> = (51..=150).map(f64::from).collect();
        assert_eq!(temperatures(&history), expected);
    }

    #[test]
    fn unknown_keys_are_empty_not_errors() {
        let store = TelemetryStore::new();
        store.ingest(key("1"), reading(1.0, 1.0), at(0));

        assert!(store.latest(&key("ghost")).is_none());
        assert!(store.history(&key("ghost")).is_empty());
    }

    #[test]
    fn all_latest_lists_every_key() {
        let store = TelemetryStore::new();
        store.ingest(key("1"), reading(20.0, 30.0), at(0));
        store.ingest(key("10"), reading(21.0, 31.0), at(1));

        let all = store.all_latest();
        assert_eq!(all.len(), 2);
        assert_eq!(must_some(all.get(&key("1"))).reading, reading(20.0, 30.0));
        assert_eq!(must_some(all.get(&key("10"))).reading, reading(21.0, 31.0));
    }

    #[test]
    fn out_of_order_timestamps_keep_arrival_order() {
        let store = TelemetryStore::new();
        store.ingest(key("1"), reading(1.0, 1.0), at(100));
        store.ingest(key("1"), reading(2.0, 2.0), at(10));

        assert_eq!(must_some(store.latest(&key("1"))).timestamp, at(10));
        assert_eq!(temperatures(&store.history(&key("1"))), vec![1.0, 2.0]);
    }

    #[test]
    fn configured_window_is_respected() {
        let store = match TelemetryStore::with_config(StoreConfig { history_capacity: 3 }) {
            Ok(store) => store,
            Err(err) => panic!("unexpected config error: {err}"),
        };
        for index in 0..5_i64 {
            store.ingest(key("a"), reading(index as f64, 0.0), at(index));
        }
        assert_eq!(temperatures(&store.history(&key("a"))), vec![2.0, 3.0, 4.0]);
        assert_eq!(
            store.stats(),
            StoreStats {
                nodes: 1,
                retained_entries: 3,
                history_capacity: 3
            }
        );
    }

    #[test]
    fn stamped_ingest_never_steps_back_in_time() {
        let store = TelemetryStore::new();
        assert_eq!(store.ingest_stamped(key("1"), reading(1.0, 1.0), || at(100)), at(100));
        assert_eq!(store.ingest_stamped(key("1"), reading(2.0, 2.0), || at(40)), at(100));
        assert_eq!(store.ingest_stamped(key("1"), reading(3.0, 3.0), || at(120)), at(120));

        let stamps: Vec<OffsetDateTime> =
            store.history(&key("1")).iter().map(|entry| entry.timestamp).collect();
        assert_eq!(stamps, vec![at(100), at(100), at(120)]);
        assert_eq!(must_some(store.latest(&key("1"))).reading, reading(3.0, 3.0));
    }

    #[test]
    fn concurrent_stamped_ingests_keep_history_time_ordered() {
        let store = TelemetryStore::new();
        let ticks = std::sync::atomic::AtomicI64::new(0);
        std::thread::scope(|scope| {
            for worker in 0..6_i64 {
                let (store, ticks) = (&store, &ticks);
                scope.spawn(move || {
                    for _ in 0..50 {
                        let _ = store.ingest_stamped(key("shared"), reading(worker as f64, 0.0), || {
                            at(ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
                        });
                    }
                });
            }
        });

        let history = store.history(&key("shared"));
        assert_eq!(history.len(), 100);
        for pair in history.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp, "{pair:?}");
        }
        assert_eq!(must_some(history.last()).timestamp, at(299));
    }

    #[test]
    fn zero_window_is_rejected() {
        let result = TelemetryStore::with_config(StoreConfig { history_capacity: 0 });
        assert!(matches!(result, Err(TelemetryError::Configuration(_))));
    }

    #[test]
    fn concurrent_ingests_for_one_key_lose_nothing() {
        let store = TelemetryStore::new();
        for index in 0..40_i64 {
            store.ingest(key("dup"), reading(index as f64, 0.0), at(index));
        }

        std::thread::scope(|scope| {
            scope.spawn(|| store.ingest(key("dup"), reading(1000.0, 0.0), at(1000)));
            scope.spawn(|| store.ingest(key("dup"), reading(2000.0, 0.0), at(2000)));
        });

        let history = store.history(&key("dup"));
        assert_eq!(history.len(), 42);
        let tail = temperatures(&history[40..]);
        assert!(tail == vec![1000.0, 2000.0] || tail == vec![2000.0, 1000.0]);
        assert_eq!(must_some(history.last()).reading(), must_some(store.latest(&key("dup"))).reading);
    }

    #[test]
    fn concurrent_first_ingest_creates_one_series() {
        let store = TelemetryStore::new();
        std::thread::scope(|scope| {
            for worker in 0..8_i64 {
                let store = &store;
                scope.spawn(move || store.ingest(key("fresh"), reading(worker as f64, 0.0), at(worker)));
            }
        });

        assert_eq!(store.node_count(), 1);
        assert_eq!(store.history(&key("fresh")).len(), 8);
    }

    #[test]
    fn concurrent_writers_and_readers_never_see_torn_state() {
        const WRITERS: i64 = 6;
        const PER_WRITER: i64 = 300;

        let store = TelemetryStore::new();
        std::thread::scope(|scope| {
            for writer in 0..WRITERS {
                let store = &store;
                scope.spawn(move || {
                    let node = key(&format!("node-{writer}"));
                    for step in 0..PER_WRITER {
                        let value = step as f64;
                        store.ingest(node.clone(), reading(value, value), at(step));
                    }
                });
            }

            for _ in 0..3 {
                let store = &store;
                scope.spawn(move || {
                    for _ in 0..200 {
                        for snapshot in store.all_latest().values() {
                            assert_eq!(snapshot.reading.temperature, snapshot.reading.humidity);
                        }
                        let history = store.history(&key("node-0"));
                        assert!(history.len() <= 100);
                        for pair in history.windows(2) {
                            assert_eq!(pair[1].temperature, pair[0].temperature + 1.0);
                        }
                    }
                });
            }
        });

        let all = store.all_latest();
        assert_eq!(all.len(), usize::try_from(WRITERS).unwrap_or(0));
        for writer in 0..WRITERS {
            let node = key(&format!("node-{writer}"));
            let expected: Vec<f64> = (PER_WRITER - 100..PER_WRITER).map(|step| step as f64).collect();
            assert_eq!(temperatures(&store.history(&node)), expected);
            assert_eq!(must_some(store.latest(&node)).reading.temperature, (PER_WRITER - 1) as f64);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_history_keeps_most_recent_window(count in 1usize..260, capacity in 1usize..120) {
            let store = match TelemetryStore::with_config(StoreConfig { history_capacity: capacity }) {
                Ok(store) => store,
                Err(err) => panic!("unexpected config error: {err}"),
            };
            for index in 0..count {
                store.ingest(key("k"), reading(index as f64, 0.0), at(0));
            }

            let history = store.history(&key("k"));
            prop_assert_eq!(history.len(), count.min(capacity));
            let expected: Vec<f64> = (count.saturating_sub(capacity)..count).map(|index| index as f64).collect();
            prop_assert_eq!(temperatures(&history), expected);
        }

        #[test]
        fn prop_keys_are_isolated(stream in prop::collection::vec((0u8..4, -50i32..50), 1..300)) {
            let store = TelemetryStore::new();
            let mut expected: BTreeMap<String, Vec<f64>> = BTreeMap::new();

            for (step, (node, value)) in stream.iter().copied().enumerate() {
                let name = format!("{node}");
                store.ingest(key(&name), reading(f64::from(value), 0.0), at(step as i64));
                expected.entry(name).or_default().push(f64::from(value));
            }

            prop_assert_eq!(store.node_count(), expected.len());
            for (name, values) in &expected {
                let window: Vec<f64> = values[values.len().saturating_sub(100)..].to_vec();
                prop_assert_eq!(temperatures(&store.history(&key(name))), window);
                let latest = must_some(store.latest(&key(name)));
                prop_assert_eq!(Some(latest.reading.temperature), values.last().copied());
            }
        }
    }
}
