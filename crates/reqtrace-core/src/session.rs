//! Session aggregation and summary derivation.
//!
//! Filters a store snapshot by domain and correlation token, selects the
//! active token, collapses competing observations of the login exchange down
//! to one canonical record, and derives a padded time window plus environment
//! and timezone metadata. Summaries are recomputed on demand and never
//! persisted.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SessionConfig;
use crate::error::ConfigError;
use crate::record::RequestRecord;

/// A derived, transient session summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Active correlation token.
    pub session_id: String,
    pub workstation_id: Option<String>,
    pub domain: String,
    /// Padded window start (epoch ms).
    pub start_time: i64,
    /// Padded window end (epoch ms).
    pub end_time: i64,
    /// Deduplicated records: canonical login record first, remainder ordered
    /// by descending `start_time`.
    pub requests: Vec<RequestRecord>,
    pub is_staging: bool,
    /// Canonical signed 4-digit offset, e.g. `+0530`.
    pub utc_offset: Option<String>,
    /// Cheap change-detection digest; collisions are tolerable.
    pub data_signature: u64,
}

/// Derives session summaries from store snapshots.
#[derive(Debug, Clone)]
pub struct SessionAggregator {
    padding_ms: i64,
    staging_re: Regex,
}

impl SessionAggregator {
    /// Build from configuration; compiles the staging-marker pattern.
    pub fn new(config: &SessionConfig) -> Result<Self, ConfigError> {
        let pattern = if config.staging_markers.is_empty() {
            // Matches nothing.
            "a^".to_string()
        } else {
            config
                .staging_markers
                .iter()
                .map(|marker| regex::escape(marker))
                .collect::<Vec<_>>()
                .join("|")
        };
        let staging_re =
            Regex::new(&format!("(?i)(?:{pattern})")).map_err(|err| ConfigError::InvalidPattern {
                pattern,
                reason: err.to_string(),
            })?;
        Ok(Self {
            padding_ms: config.padding_ms,
            staging_re,
        })
    }

    /// Summarize the session for `domain`, or None when nothing matches.
    #[must_use]
    pub fn summarize(&self, snapshot: &[RequestRecord], domain: &str) -> Option<SessionSummary> {
        // 1. Domain filter: tokened records, synthetic captures, and records
        //    that received a capture overlay.
        let in_domain: Vec<&RequestRecord> = snapshot
            .iter()
            .filter(|record| {
                (record.correlation_token.is_some()
                    || record.is_synthetic
                    || record.captured_at.is_some())
                    && record.domain().as_deref() == Some(domain)
            })
            .collect();
        if in_domain.is_empty() {
            return None;
        }

        // 2. Active token: the most recently started tokened record wins, so
        //    an older session's traffic drops out once a new one begins.
        let active_token = in_domain
            .iter()
            .filter(|record| record.correlation_token.is_some())
            .max_by(|a, b| {
                a.start_time
                    .cmp(&b.start_time)
                    .then_with(|| a.request_id.cmp(&b.request_id))
            })
            .and_then(|record| record.correlation_token.clone())?;

        // 3. Token filter. Synthetic captures without a token stay in; they
        //    joined through the capture channel and carry no header to match.
        let session_records: Vec<&RequestRecord> = in_domain
            .iter()
            .copied()
            .filter(|record| match &record.correlation_token {
                Some(token) => *token == active_token,
                None => record.is_synthetic,
            })
            .collect();
        if session_records.is_empty() {
            return None;
        }

        // 4. Canonical-duplicate selection for login observations.
        let requests = select_requests(&session_records);

        // 5. Padded window over everything the domain filter admitted. A
        //    tokenless record carrying a captured login response is excluded
        //    from the request list but still anchors the window.
        let min_start = in_domain
            .iter()
            .map(|record| record.start_time)
            .min()
            .unwrap_or(0);
        let max_end = in_domain
            .iter()
            .map(|record| record.end_or_start())
            .max()
            .unwrap_or(min_start);

        // 6. Environment classification.
        let is_staging = session_records
            .iter()
            .any(|record| self.staging_re.is_match(&record.url));

        // 7. Shared timezone offset, newest record first.
        let utc_offset = derive_utc_offset(&session_records);

        // 8. Change-detection signature.
        let most_recent_id = requests
            .iter()
            .map(|record| (record.start_time, record.request_id.as_str()))
            .max()
            .map(|(_, id)| id)
            .unwrap_or_default();
        let data_signature = data_signature(&active_token, requests.len(), most_recent_id);

        let workstation_id = newest_first(&session_records)
            .into_iter()
            .find_map(|record| record.workstation_id.clone());

        debug!(
            domain,
            session_id = %active_token,
            requests = requests.len(),
            is_staging,
            "Derived session summary"
        );

        Some(SessionSummary {
            session_id: active_token,
            workstation_id,
            domain: domain.to_string(),
            start_time: min_start - self.padding_ms,
            end_time: max_end + self.padding_ms,
            requests,
            is_staging,
            utc_offset,
            data_signature,
        })
    }
}

/// Keep one canonical login record, then the rest by descending `start_time`.
fn select_requests(records: &[&RequestRecord]) -> Vec<RequestRecord> {
    let canonical_login = records
        .iter()
        .filter(|record| record.is_login_request)
        .max_by(|a, b| {
            login_score(a)
                .cmp(&login_score(b))
                .then_with(|| a.start_time.cmp(&b.start_time))
                .then_with(|| a.request_id.cmp(&b.request_id))
        })
        .copied();

    let mut rest: Vec<&RequestRecord> = records
        .iter()
        .copied()
        .filter(|record| !record.is_login_request)
        .collect();
    rest.sort_by(|a, b| {
        b.start_time
            .cmp(&a.start_time)
            .then_with(|| b.request_id.cmp(&a.request_id))
    });

    canonical_login
        .into_iter()
        .chain(rest)
        .cloned()
        .collect()
}

/// Scores competing observations of the login exchange.
fn login_score(record: &RequestRecord) -> u8 {
    if record.is_synthetic {
        if record.response_body.is_some() {
            3
        } else {
            2
        }
    } else {
        1
    }
}

/// First normalizable offset, scanning newest record to oldest: direct field
/// first, then a field parsed out of the captured response body.
fn derive_utc_offset(records: &[&RequestRecord]) -> Option<String> {
    for record in newest_first(records) {
        if let Some(normalized) = record
            .utc_offset
            .as_deref()
            .and_then(normalize_utc_offset)
        {
            return Some(normalized);
        }
        if let Some(normalized) = record
            .response_body
            .as_deref()
            .and_then(offset_from_body)
            .as_deref()
            .and_then(normalize_utc_offset)
        {
            return Some(normalized);
        }
    }
    None
}

/// Pull a timezone-offset field out of a captured JSON body, when it is JSON.
fn offset_from_body(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    for key in ["utc_offset", "utcOffset", "timezone_offset", "timezone"] {
        if let Some(offset) = value.get(key).and_then(serde_json::Value::as_str) {
            return Some(offset.to_string());
        }
    }
    None
}

// Optional UTC/GMT prefix, sign, 1-2 hour digits, optional minutes with or
// without a colon.
static OFFSET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:utc|gmt)?\s*([+-]?)(\d{1,2})(?::?([0-5]\d))?$")
        .expect("offset pattern is valid")
});

/// Normalize textual offsets (`"UTC"`, `"+5:30"`, `"0530"`, `"GMT-8"`) into
/// the canonical signed 4-digit form. Unparseable input yields None.
#[must_use]
pub fn normalize_utc_offset(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.eq_ignore_ascii_case("utc")
        || trimmed.eq_ignore_ascii_case("gmt")
        || trimmed.eq_ignore_ascii_case("z")
    {
        return Some("+0000".to_string());
    }

    let caps = OFFSET_RE.captures(trimmed)?;

    let sign = if caps.get(1).is_some_and(|m| m.as_str() == "-") {
        '-'
    } else {
        '+'
    };
    let hours: u32 = caps.get(2)?.as_str().parse().ok()?;
    if hours > 14 {
        return None;
    }
    let minutes: u32 = caps
        .get(3)
        .map_or(Some(0), |m| m.as_str().parse().ok())?;

    Some(format!("{sign}{hours:02}{minutes:02}"))
}

/// Cheap polynomial digest over `(token, count, most_recent_id)`.
///
/// Only used to let consumers skip redundant re-rendering; not cryptographic.
#[must_use]
pub fn data_signature(token: &str, count: usize, most_recent_id: &str) -> u64 {
    const BASE: u64 = 257;
    let mut hash: u64 = 0;
    for byte in token.bytes() {
        hash = hash.wrapping_mul(BASE).wrapping_add(u64::from(byte));
    }
    hash = hash.wrapping_mul(BASE).wrapping_add(0xFF);
    hash = hash.wrapping_mul(BASE).wrapping_add(count as u64);
    hash = hash.wrapping_mul(BASE).wrapping_add(0xFF);
    for byte in most_recent_id.bytes() {
        hash = hash.wrapping_mul(BASE).wrapping_add(u64::from(byte));
    }
    hash
}

/// Records ordered newest start first, deterministic id tie-break.
fn newest_first<'a>(records: &[&'a RequestRecord]) -> Vec<&'a RequestRecord> {
    let mut ordered = records.to_vec();
    ordered.sort_by(|a, b| {
        b.start_time
            .cmp(&a.start_time)
            .then_with(|| b.request_id.cmp(&a.request_id))
    });
    ordered
}
