use std::collections::BTreeMap;
use std::sync::Arc;

use telemetry_cache_core::{HistoryEntry, NodeKey, Snapshot};

use crate::{StoreStats, TelemetryStore};

/// Read-only view of a [`TelemetryStore`] for protocol adapters.
///
/// Holds no cache: every call reads the store as it is at call time.
#[derive(Debug, Clone)]
pub struct QueryFacade {
    store: Arc<TelemetryStore>,
}

impl QueryFacade {
    #[must_use]
    pub fn new(store: Arc<TelemetryStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn get_all_latest(&self) -> BTreeMap<NodeKey, Snapshot> {
        self.store.all_latest()
    }

    #[must_use]
    pub fn get_latest(&self, key: &NodeKey) -> Option<Snapshot> {
        self.store.latest(key)
    }

    #[must_use]
    pub fn get_history(&self, key: &NodeKey) -> Vec<HistoryEntry> {
        self.store.history(key)
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }
}
