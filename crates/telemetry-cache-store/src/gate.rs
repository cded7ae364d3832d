use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use telemetry_cache_core::{now_utc, InboundReport, NodeKey, TelemetryError};
use time::OffsetDateTime;

use crate::TelemetryStore;

/// Source of ingestion timestamps.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        now_utc()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestAck {
    pub node_id: NodeKey,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Turns inbound device reports into store ingestions.
///
/// This is the only writer of [`TelemetryStore`] outside tests and the only
/// place timestamps are taken; whatever time a device claims is ignored. The
/// clock is read under the key's lock, so one key's stamps never decrease.
#[derive(Debug, Clone)]
pub struct IngestionGate {
    store: Arc<TelemetryStore>,
    clock: Arc<dyn Clock>,
}

impl IngestionGate {
    #[must_use]
    pub fn new(store: Arc<TelemetryStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(store: Arc<TelemetryStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Validates a raw JSON report and records it.
    ///
    /// # Errors
    /// Returns [`TelemetryError::MalformedReading`] when the report is
    /// structurally unusable. The store is untouched in that case.
    pub fn submit(&self, payload: &Value) -> Result<IngestAck, TelemetryError> {
        let report = InboundReport::from_value(payload)?;
        self.submit_report(&report)
    }

    /// # Errors
    /// Returns [`TelemetryError::MalformedReading`] when the report does not
    /// normalize.
    pub fn submit_report(&self, report: &InboundReport) -> Result<IngestAck, TelemetryError> {
        let (node_id, reading) = report.normalize()?;
        let timestamp = self
            .store
            .ingest_stamped(node_id.clone(), reading, || self.clock.now());
        Ok(IngestAck { node_id, timestamp })
    }
}
