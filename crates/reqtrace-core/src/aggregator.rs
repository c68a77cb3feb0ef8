//! Aggregator facade wiring the store, correlator, persistence, and session
//! derivation together.
//!
//! All dependencies are injected at construction: the key-value port and the
//! clock come from the caller, so tests drive time manually and persist to
//! memory. The store and persistence manager each sit behind their own mutex;
//! no operation holds both locks at once.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::correlate::{CaptureCorrelator, CorrelationOutcome};
use crate::error::{Error, Result};
use crate::events::ObserverMessage;
use crate::persist::{KeyValuePort, PersistenceManager, SnapshotMeta};
use crate::record::{ExtractionRules, Observation, RequestRecord, RequestState};
use crate::session::{SessionAggregator, SessionSummary};
use crate::store::{RequestRecordStore, SweepResult};

/// Owns the full request-tracking pipeline.
pub struct RequestAggregator {
    store: Mutex<RequestRecordStore>,
    persist: Mutex<PersistenceManager>,
    correlator: CaptureCorrelator,
    sessions: SessionAggregator,
    sweep_max_age_ms: i64,
    sweep_interval: Duration,
}

impl RequestAggregator {
    /// Wire up all components from configuration and injected dependencies.
    pub fn new(
        config: &Config,
        port: Arc<dyn KeyValuePort>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let rules = ExtractionRules::from_config(&config.session);
        Ok(Self {
            store: Mutex::new(RequestRecordStore::new(
                &config.store,
                rules.clone(),
                Arc::clone(&clock),
            )),
            persist: Mutex::new(PersistenceManager::new(&config.persist, port, clock)),
            correlator: CaptureCorrelator::new(&config.correlate, rules),
            sessions: SessionAggregator::new(&config.session)?,
            sweep_max_age_ms: i64::try_from(config.store.sweep_max_age_hours)
                .unwrap_or(i64::MAX / 3_600_000)
                .saturating_mul(3_600_000),
            sweep_interval: Duration::from_secs(config.store.sweep_interval_minutes * 60),
        })
    }

    /// Load the persisted snapshot into the store. Returns the record count.
    ///
    /// Call once at startup, before messages flow.
    pub fn restore(&self) -> Result<usize> {
        let restored = self.lock_persist()?.restore()?;
        let count = restored.len();
        self.lock_store()?.restore(restored);
        Ok(count)
    }

    /// Dispatch one inbound message.
    ///
    /// Lifecycle messages merge into the store; capture messages go through
    /// the correlator and report how they were resolved. Every message arms
    /// the persistence debounce.
    pub fn handle_message(&self, msg: &ObserverMessage) -> Result<Option<CorrelationOutcome>> {
        let outcome = match msg {
            ObserverMessage::RequestStarted {
                request_id,
                url,
                method,
                time_stamp,
                post_data,
            } => {
                self.lock_store()?.observe(
                    request_id,
                    &Observation {
                        url: Some(url.clone()),
                        method: Some(method.clone()),
                        time_stamp: *time_stamp,
                        post_data: post_data.clone(),
                        phase: RequestState::Started,
                        ..Observation::default()
                    },
                );
                None
            }
            ObserverMessage::HeadersSent {
                request_id,
                url,
                method,
                time_stamp,
                request_headers,
            } => {
                self.lock_store()?.observe(
                    request_id,
                    &Observation {
                        url: Some(url.clone()),
                        method: Some(method.clone()),
                        time_stamp: *time_stamp,
                        request_headers: Some(request_headers.clone()),
                        phase: RequestState::HeadersSent,
                        ..Observation::default()
                    },
                );
                None
            }
            ObserverMessage::HeadersReceived {
                request_id,
                url,
                method,
                time_stamp,
                response_headers,
                status_code,
                status_line,
            } => {
                self.lock_store()?.observe(
                    request_id,
                    &Observation {
                        url: Some(url.clone()),
                        method: Some(method.clone()),
                        time_stamp: *time_stamp,
                        response_headers: Some(response_headers.clone()),
                        status_code: *status_code,
                        status_text: status_line.clone(),
                        phase: RequestState::HeadersReceived,
                        ..Observation::default()
                    },
                );
                None
            }
            ObserverMessage::RequestCompleted {
                request_id,
                url,
                method,
                time_stamp,
                status_code,
                status_line,
                response_size,
                response_headers,
            } => {
                self.lock_store()?.observe(
                    request_id,
                    &Observation {
                        url: Some(url.clone()),
                        method: Some(method.clone()),
                        time_stamp: *time_stamp,
                        status_code: *status_code,
                        status_text: status_line.clone(),
                        response_size: *response_size,
                        response_headers: response_headers.clone(),
                        phase: RequestState::Completed,
                        ..Observation::default()
                    },
                );
                None
            }
            ObserverMessage::RequestErrored {
                request_id,
                url,
                method,
                time_stamp,
                error,
            } => {
                self.lock_store()?.observe(
                    request_id,
                    &Observation {
                        url: Some(url.clone()),
                        method: Some(method.clone()),
                        time_stamp: *time_stamp,
                        error: Some(error.clone()),
                        phase: RequestState::Errored,
                        ..Observation::default()
                    },
                );
                None
            }
            ObserverMessage::ResponseCaptured(capture) => {
                let outcome = self.correlator.correlate(&mut *self.lock_store()?, capture);
                Some(outcome)
            }
        };
        self.lock_persist()?.schedule_flush();
        Ok(outcome)
    }

    /// Snapshot of every record.
    pub fn get_all_records(&self) -> Result<Vec<RequestRecord>> {
        Ok(self.lock_store()?.snapshot())
    }

    /// Look up a single record by id.
    pub fn get_record(&self, request_id: &str) -> Result<Option<RequestRecord>> {
        Ok(self.lock_store()?.get(request_id).cloned())
    }

    /// Number of records currently held.
    pub fn record_count(&self) -> Result<usize> {
        Ok(self.lock_store()?.len())
    }

    /// Drop every record and schedule a flush of the now-empty snapshot.
    pub fn clear_all(&self) -> Result<()> {
        self.lock_store()?.clear();
        self.lock_persist()?.schedule_flush();
        Ok(())
    }

    /// Derive the session summary for a domain, if any.
    pub fn summarize(&self, domain: &str) -> Result<Option<SessionSummary>> {
        let snapshot = self.lock_store()?.snapshot();
        Ok(self.sessions.summarize(&snapshot, domain))
    }

    /// Run one retention sweep; schedules a flush when anything was removed.
    pub fn sweep(&self) -> Result<SweepResult> {
        let result = self.lock_store()?.sweep_older_than(self.sweep_max_age_ms);
        if result.any_work_done() {
            self.lock_persist()?.schedule_flush();
        }
        Ok(result)
    }

    /// Flush the snapshot if the debounce quiet period has elapsed.
    ///
    /// Returns true when a write was attempted.
    pub fn poll_persistence(&self) -> Result<bool> {
        if !self.lock_persist()?.flush_pending() {
            return Ok(false);
        }
        let records = self.lock_store()?.to_map();
        Ok(self.lock_persist()?.poll(&records))
    }

    /// Flush unconditionally, e.g. on shutdown.
    pub fn flush_now(&self) -> Result<()> {
        let records = self.lock_store()?.to_map();
        self.lock_persist()?.flush(&records);
        Ok(())
    }

    /// Metadata of the last persisted snapshot.
    pub fn snapshot_meta(&self) -> Result<Option<SnapshotMeta>> {
        Ok(self.lock_persist()?.snapshot_meta()?)
    }

    /// Spawn the periodic maintenance loop: persistence polling on a short
    /// tick and the retention sweep on its configured interval. Runs until
    /// the returned handle is aborted.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let aggregator = Arc::clone(self);
        let sweep_interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut flush_tick = tokio::time::interval(Duration::from_millis(250));
            flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut sweep_tick = tokio::time::interval(sweep_interval);
            sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately.
            sweep_tick.tick().await;
            info!(sweep_interval_secs = sweep_interval.as_secs(), "Maintenance loop started");
            loop {
                tokio::select! {
                    _ = flush_tick.tick() => {
                        if let Err(err) = aggregator.poll_persistence() {
                            warn!(error = %err, "Persistence poll failed");
                        }
                    }
                    _ = sweep_tick.tick() => {
                        match aggregator.sweep() {
                            Ok(result) if result.any_work_done() => {
                                info!(removed = result.removed, retained = result.retained, "Periodic sweep");
                            }
                            Ok(_) => {}
                            Err(err) => warn!(error = %err, "Periodic sweep failed"),
                        }
                    }
                }
            }
        })
    }

    fn lock_store(&self) -> Result<std::sync::MutexGuard<'_, RequestRecordStore>> {
        self.store
            .lock()
            .map_err(|_| Error::Runtime("store mutex poisoned".to_string()))
    }

    fn lock_persist(&self) -> Result<std::sync::MutexGuard<'_, PersistenceManager>> {
        self.persist
            .lock()
            .map_err(|_| Error::Runtime("persistence mutex poisoned".to_string()))
    }
}
