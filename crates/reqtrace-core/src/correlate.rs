//! Out-of-band response capture correlation.
//!
//! Capture messages arrive on an independent channel and must be reconciled
//! with records in the store. Resolution is an ordered list of strategies
//! evaluated first-success-wins:
//!
//! 1. Exact request-id merge (common, unambiguous).
//! 2. URL + time-window match, most recent `start_time` wins. The window
//!    exists because the two channels race with practically small skew.
//! 3. Synthesis of a fresh record marked `is_synthetic`.
//!
//! A capture is therefore never silently dropped.

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::CorrelateConfig;
use crate::events::CaptureMessage;
use crate::record::{ExtractionRules, RequestRecord, RequestState, extract_route_id};
use crate::store::RequestRecordStore;

/// How a capture message was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorrelationOutcome {
    /// Merged into the record carrying the capture's request id.
    MergedById { request_id: String },
    /// Merged into the closest same-URL record inside the window.
    MergedByWindow { request_id: String, diff_ms: i64 },
    /// No match; a synthetic record was created.
    Synthesized { request_id: String },
}

impl CorrelationOutcome {
    /// Id of the record the capture landed on.
    #[must_use]
    pub fn request_id(&self) -> &str {
        match self {
            Self::MergedById { request_id }
            | Self::MergedByWindow { request_id, .. }
            | Self::Synthesized { request_id } => request_id,
        }
    }
}

/// Evaluate strategies in order; the first to produce a value wins.
pub fn first_success<Ctx, T>(
    ctx: &mut Ctx,
    strategies: &[&dyn Fn(&mut Ctx) -> Option<T>],
) -> Option<T> {
    strategies.iter().find_map(|strategy| strategy(ctx))
}

/// Reconciles capture messages with the record store.
#[derive(Debug, Clone)]
pub struct CaptureCorrelator {
    window_ms: i64,
    rules: ExtractionRules,
}

impl CaptureCorrelator {
    #[must_use]
    pub fn new(config: &CorrelateConfig, rules: ExtractionRules) -> Self {
        Self {
            window_ms: config.window_ms,
            rules,
        }
    }

    /// Resolve one capture message against the store.
    pub fn correlate(
        &self,
        store: &mut RequestRecordStore,
        msg: &CaptureMessage,
    ) -> CorrelationOutcome {
        let strategies: [&dyn Fn(&mut RequestRecordStore) -> Option<CorrelationOutcome>; 2] = [
            &|store| self.merge_by_id(store, msg),
            &|store| self.merge_by_window(store, msg),
        ];
        let matched = first_success(store, &strategies);
        matched.unwrap_or_else(|| self.synthesize(store, msg))
    }

    /// Strategy 1: exact id merge.
    fn merge_by_id(
        &self,
        store: &mut RequestRecordStore,
        msg: &CaptureMessage,
    ) -> Option<CorrelationOutcome> {
        let request_id = msg.request_id.as_deref()?;
        if store.apply_capture(request_id, msg) {
            debug!(request_id, "Capture merged by id");
            Some(CorrelationOutcome::MergedById {
                request_id: request_id.to_string(),
            })
        } else {
            None
        }
    }

    /// Strategy 2: exact URL within the time window, most recent first.
    ///
    /// When several candidates share the same URL and `start_time`, the
    /// lexicographically greatest id wins so the choice does not depend on
    /// map iteration order.
    fn merge_by_window(
        &self,
        store: &mut RequestRecordStore,
        msg: &CaptureMessage,
    ) -> Option<CorrelationOutcome> {
        let target_url = self.resolve_url(msg);
        let candidate = store
            .snapshot()
            .into_iter()
            .filter(|record| {
                record.url == target_url
                    && (record.start_time - msg.timestamp).abs() <= self.window_ms
            })
            .max_by(|a, b| {
                a.start_time
                    .cmp(&b.start_time)
                    .then_with(|| a.request_id.cmp(&b.request_id))
            })?;

        let diff_ms = (candidate.start_time - msg.timestamp).abs();
        store.apply_capture(&candidate.request_id, msg);
        debug!(
            request_id = %candidate.request_id,
            diff_ms,
            window_ms = self.window_ms,
            "Capture merged by URL window"
        );
        Some(CorrelationOutcome::MergedByWindow {
            request_id: candidate.request_id,
            diff_ms,
        })
    }

    /// Strategy 3 (always succeeds): synthesize a record from the capture.
    fn synthesize(&self, store: &mut RequestRecordStore, msg: &CaptureMessage) -> CorrelationOutcome {
        let request_id = format!("cap-{:016x}", rand::random::<u64>());
        let url = self.resolve_url(msg);

        let record = RequestRecord {
            request_id: request_id.clone(),
            route_id: extract_route_id(&url),
            is_login_request: self.rules.is_login_url(&url),
            url,
            method: msg.method.clone().unwrap_or_default(),
            start_time: msg.timestamp,
            end_time: Some(msg.timestamp),
            post_data: None,
            request_headers: None,
            response_headers: None,
            correlation_token: msg.correlation_token.clone(),
            workstation_id: None,
            utc_offset: None,
            status_code: Some(msg.status),
            status_text: msg.status_text.clone(),
            response_size: None,
            mime_type: None,
            error: None,
            response_body: Some(msg.response_body.clone()),
            captured_response_headers: msg.headers.clone(),
            captured_at: Some(msg.timestamp),
            is_synthetic: true,
            state: RequestState::Completed,
        };
        debug!(request_id = %record.request_id, url = %record.url, "Synthesized record from capture");
        store.insert(record);
        CorrelationOutcome::Synthesized { request_id }
    }

    /// Absolute form of the capture URL, using `page_url` as base when the
    /// captured URL is relative.
    fn resolve_url(&self, msg: &CaptureMessage) -> String {
        if Url::parse(&msg.url).is_ok() {
            return msg.url.clone();
        }
        if let Some(page_url) = &msg.page_url {
            if let Ok(base) = Url::parse(page_url) {
                if let Ok(joined) = base.join(&msg.url) {
                    return joined.to_string();
                }
            }
        }
        msg.url.clone()
    }
}
