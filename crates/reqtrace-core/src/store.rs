//! Bounded in-memory request record store.
//!
//! Create-on-first-observation with field-merge updates, count-based eviction
//! after bounded write batches, and an age-based retention sweep. The store is
//! the only shared mutable resource; every other component reads snapshots or
//! goes through its merge operations.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::events::CaptureMessage;
use crate::record::{ExtractionRules, Observation, RequestRecord, RequestState};

/// Result of a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepResult {
    /// Records removed by the age threshold.
    pub removed: usize,
    /// Records remaining after the sweep.
    pub retained: usize,
}

impl SweepResult {
    /// Whether the sweep removed anything.
    #[must_use]
    pub fn any_work_done(&self) -> bool {
        self.removed > 0
    }
}

/// Mapping from request identifier to `RequestRecord`.
pub struct RequestRecordStore {
    records: HashMap<String, RequestRecord>,
    rules: ExtractionRules,
    clock: Arc<dyn Clock>,
    max_records: usize,
    evict_batch: u32,
    writes_since_evict: u32,
}

impl RequestRecordStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(config: &StoreConfig, rules: ExtractionRules, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: HashMap::new(),
            rules,
            clock,
            max_records: config.max_records,
            evict_batch: config.evict_batch.max(1),
            writes_since_evict: 0,
        }
    }

    /// Merge a partial observation, creating the record on first sight.
    ///
    /// Unknown ids from non-creating event types are tolerated: the
    /// environment occasionally drops or reorders the creation event, so a
    /// partial record is created rather than the update rejected.
    pub fn observe(&mut self, request_id: &str, obs: &Observation) {
        match self.records.get_mut(request_id) {
            Some(record) => record.merge(obs, &self.rules),
            None => {
                if obs.phase != RequestState::Started {
                    debug!(request_id, phase = ?obs.phase, "creating partial record for unseen id");
                }
                let record = RequestRecord::from_observation(request_id, obs, &self.rules);
                self.records.insert(request_id.to_string(), record);
            }
        }
        self.note_write();
    }

    /// Apply the out-of-band capture overlay to an existing record.
    ///
    /// Returns false when the id is unknown (the correlator then falls back
    /// to window matching or synthesis).
    pub fn apply_capture(&mut self, request_id: &str, msg: &CaptureMessage) -> bool {
        let Some(record) = self.records.get_mut(request_id) else {
            return false;
        };
        record.response_body = Some(msg.response_body.clone());
        record.captured_at = Some(msg.timestamp);
        if let Some(headers) = &msg.headers {
            record.captured_response_headers = Some(headers.clone());
        }
        if record.status_code.is_none() {
            record.status_code = Some(msg.status);
        }
        if record.status_text.is_none() {
            record.status_text.clone_from(&msg.status_text);
        }
        if record.correlation_token.is_none() {
            record.correlation_token.clone_from(&msg.correlation_token);
        }
        self.note_write();
        true
    }

    /// Insert a fully-formed record (synthesized or restored).
    pub fn insert(&mut self, record: RequestRecord) {
        self.records.insert(record.request_id.clone(), record);
        self.note_write();
    }

    /// Repopulate from a persisted snapshot. Does not count as writes.
    pub fn restore(&mut self, records: HashMap<String, RequestRecord>) {
        self.records = records;
        self.writes_since_evict = 0;
    }

    /// When size exceeds `max_count`, retain exactly the `max_count` most
    /// recent records by `start_time`.
    pub fn evict_to_capacity(&mut self, max_count: usize) {
        if self.records.len() <= max_count {
            return;
        }
        let mut ordered: Vec<(String, i64)> = self
            .records
            .iter()
            .map(|(id, record)| (id.clone(), record.start_time))
            .collect();
        // Most recent first; id tie-break keeps the cut deterministic.
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

        let evicted = ordered.split_off(max_count);
        for (id, _) in &evicted {
            self.records.remove(id);
        }
        info!(
            evicted = evicted.len(),
            retained = self.records.len(),
            "Evicted records beyond capacity"
        );
    }

    /// Remove records whose `start_time` is older than `now - max_age_ms`.
    pub fn sweep_older_than(&mut self, max_age_ms: i64) -> SweepResult {
        let cutoff = self.clock.now_ms().saturating_sub(max_age_ms);
        let before = self.records.len();
        self.records.retain(|_, record| record.start_time >= cutoff);
        let result = SweepResult {
            removed: before - self.records.len(),
            retained: self.records.len(),
        };
        if result.any_work_done() {
            info!(
                removed = result.removed,
                retained = result.retained,
                max_age_ms,
                "Swept records past retention age"
            );
        }
        result
    }

    /// Remove all records.
    pub fn clear(&mut self) {
        let removed = self.records.len();
        self.records.clear();
        self.writes_since_evict = 0;
        if removed > 0 {
            info!(removed, "Cleared record store");
        }
    }

    /// Immutable copy of all records for read-only consumers.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RequestRecord> {
        self.records.values().cloned().collect()
    }

    /// Copy of the full id-to-record map, as persisted.
    #[must_use]
    pub fn to_map(&self) -> HashMap<String, RequestRecord> {
        self.records.clone()
    }

    /// Look up a single record.
    #[must_use]
    pub fn get(&self, request_id: &str) -> Option<&RequestRecord> {
        self.records.get(request_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Configured capacity bound.
    #[must_use]
    pub fn max_records(&self) -> usize {
        self.max_records
    }

    /// Count a write and run eviction once per bounded batch, not per update.
    fn note_write(&mut self) {
        self.writes_since_evict += 1;
        if self.writes_since_evict >= self.evict_batch {
            self.writes_since_evict = 0;
            self.evict_to_capacity(self.max_records);
        }
    }
}
