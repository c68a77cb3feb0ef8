//! Request record model and merge semantics.
//!
//! A `RequestRecord` is assembled from partial observations arriving in any
//! order. Temporal fields are write-once: `start_time` belongs to the first
//! observation, `end_time` to whichever terminal observation lands first.
//! Everything else merges by field union.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::SessionConfig;

/// Primary lifecycle state of a request.
///
/// `Completed` and `Errored` are terminal; the response-capture overlay is
/// tracked separately (`captured_at`) and may land in any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    #[default]
    Started,
    HeadersSent,
    HeadersReceived,
    Completed,
    Errored,
}

impl RequestState {
    /// Whether this state admits no further primary transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }
}

/// One observed network request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Opaque identifier assigned by the observation environment
    pub request_id: String,
    pub url: String,
    pub method: String,
    /// Set once, at first observation (epoch ms)
    pub start_time: i64,
    /// Set once, by whichever terminal event arrives first (epoch ms)
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub post_data: Option<String>,
    #[serde(default)]
    pub request_headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub response_headers: Option<HashMap<String, String>>,
    /// Session identifier extracted from headers
    #[serde(default)]
    pub correlation_token: Option<String>,
    #[serde(default)]
    pub workstation_id: Option<String>,
    #[serde(default)]
    pub utc_offset: Option<String>,
    /// Route identifier extracted from the URL path
    #[serde(default)]
    pub route_id: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub status_text: Option<String>,
    #[serde(default)]
    pub response_size: Option<u64>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Out-of-band capture overlay
    #[serde(default)]
    pub response_body: Option<String>,
    #[serde(default)]
    pub captured_response_headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub captured_at: Option<i64>,
    /// True when the record originated purely from a capture message
    #[serde(default)]
    pub is_synthetic: bool,
    /// True when the URL marks a login/identity exchange
    #[serde(default)]
    pub is_login_request: bool,
    #[serde(default)]
    pub state: RequestState,
}

impl RequestRecord {
    /// Create a record from its first observation.
    #[must_use]
    pub fn from_observation(request_id: &str, obs: &Observation, rules: &ExtractionRules) -> Self {
        let url = obs.url.clone().unwrap_or_default();
        let mut record = Self {
            request_id: request_id.to_string(),
            route_id: extract_route_id(&url),
            url,
            method: obs.method.clone().unwrap_or_default(),
            start_time: obs.time_stamp,
            end_time: None,
            post_data: None,
            request_headers: None,
            response_headers: None,
            correlation_token: None,
            workstation_id: None,
            utc_offset: None,
            status_code: None,
            status_text: None,
            response_size: None,
            mime_type: None,
            error: None,
            response_body: None,
            captured_response_headers: None,
            captured_at: None,
            is_synthetic: false,
            is_login_request: false,
            state: RequestState::Started,
        };
        record.is_login_request = rules.is_login_url(&record.url);
        record.merge(obs, rules);
        record
    }

    /// Merge a partial observation into this record.
    ///
    /// Non-null fields are unioned in; `start_time` is never touched and
    /// `end_time` is only set by the first terminal observation. Terminal
    /// states are sticky.
    pub fn merge(&mut self, obs: &Observation, rules: &ExtractionRules) {
        if let Some(url) = &obs.url {
            if !url.is_empty() && self.url.is_empty() {
                self.url = url.clone();
                self.route_id = extract_route_id(url);
                self.is_login_request = rules.is_login_url(url);
            }
        }
        if let Some(method) = &obs.method {
            if !method.is_empty() {
                self.method = method.clone();
            }
        }
        if let Some(post_data) = &obs.post_data {
            self.post_data = Some(post_data.clone());
        }
        if let Some(headers) = &obs.request_headers {
            self.request_headers = Some(headers.clone());
        }
        if let Some(headers) = &obs.response_headers {
            self.response_headers = Some(headers.clone());
        }
        if let Some(code) = obs.status_code {
            self.status_code = Some(code);
        }
        if let Some(text) = &obs.status_text {
            self.status_text = Some(text.clone());
        }
        if let Some(size) = obs.response_size {
            self.response_size = Some(size);
        }
        if let Some(error) = &obs.error {
            self.error = Some(error.clone());
        }

        if obs.phase.is_terminal() && self.end_time.is_none() {
            self.end_time = Some(obs.time_stamp);
        }
        if !self.state.is_terminal() && obs.phase > self.state {
            self.state = obs.phase;
        }

        self.extract_derived(rules);
    }

    /// Re-run header/URL-derived field extraction.
    fn extract_derived(&mut self, rules: &ExtractionRules) {
        if self.correlation_token.is_none() {
            self.correlation_token = self.find_header(&rules.token_headers);
        }
        if self.workstation_id.is_none() {
            self.workstation_id = self.find_header(&rules.workstation_headers);
        }
        if self.utc_offset.is_none() {
            self.utc_offset = self.find_header(&rules.offset_headers);
        }
        if self.mime_type.is_none() {
            self.mime_type = self
                .find_header(&["content-type".to_string()])
                .map(|v| v.split(';').next().unwrap_or(&v).trim().to_string());
        }
        if self.route_id.is_none() {
            self.route_id = extract_route_id(&self.url);
        }
    }

    /// First value among request then response headers matching any of the
    /// given names, case-insensitively.
    fn find_header(&self, names: &[String]) -> Option<String> {
        for headers in [&self.request_headers, &self.response_headers]
            .into_iter()
            .flatten()
        {
            for name in names {
                if let Some((_, value)) = headers
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                {
                    if !value.is_empty() {
                        return Some(value.clone());
                    }
                }
            }
        }
        None
    }

    /// Effective end of the request window for summaries.
    #[must_use]
    pub fn end_or_start(&self) -> i64 {
        self.end_time.unwrap_or(self.start_time)
    }

    /// Host component of the record URL.
    #[must_use]
    pub fn domain(&self) -> Option<String> {
        url_domain(&self.url)
    }
}

/// A partial set of fields observed in one lifecycle message.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub url: Option<String>,
    pub method: Option<String>,
    pub time_stamp: i64,
    pub post_data: Option<String>,
    pub request_headers: Option<HashMap<String, String>>,
    pub response_headers: Option<HashMap<String, String>>,
    pub status_code: Option<u16>,
    pub status_text: Option<String>,
    pub response_size: Option<u64>,
    pub error: Option<String>,
    pub phase: RequestState,
}

/// Compiled extraction rules for header- and URL-derived fields.
#[derive(Debug, Clone)]
pub struct ExtractionRules {
    pub token_headers: Vec<String>,
    pub workstation_headers: Vec<String>,
    pub offset_headers: Vec<String>,
    login_markers: Vec<String>,
}

impl ExtractionRules {
    /// Build rules from session configuration.
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            token_headers: config.token_headers.clone(),
            workstation_headers: config.workstation_headers.clone(),
            offset_headers: config.offset_headers.clone(),
            login_markers: config
                .login_markers
                .iter()
                .map(|m| m.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Whether the URL marks a login/identity exchange.
    #[must_use]
    pub fn is_login_url(&self, url: &str) -> bool {
        let lower = url.to_ascii_lowercase();
        self.login_markers.iter().any(|m| lower.contains(m.as_str()))
    }
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

/// Host component of a URL, or None when unparseable.
#[must_use]
pub fn url_domain(raw: &str) -> Option<String> {
    Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// Route identifier: the last non-empty path segment, without query/fragment.
#[must_use]
pub fn extract_route_id(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .next_back()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ExtractionRules {
        ExtractionRules::default()
    }

    fn started(url: &str, ts: i64) -> Observation {
        Observation {
            url: Some(url.to_string()),
            method: Some("GET".to_string()),
            time_stamp: ts,
            phase: RequestState::Started,
            ..Observation::default()
        }
    }

    #[test]
    fn state_ordering_and_terminality() {
        assert!(RequestState::Started < RequestState::HeadersSent);
        assert!(RequestState::HeadersReceived < RequestState::Completed);
        assert!(RequestState::Completed.is_terminal());
        assert!(RequestState::Errored.is_terminal());
        assert!(!RequestState::HeadersSent.is_terminal());
    }

    #[test]
    fn first_observation_sets_start_time() {
        let record = RequestRecord::from_observation("r1", &started("https://a.example/x", 123), &rules());
        assert_eq!(record.start_time, 123);
        assert_eq!(record.state, RequestState::Started);
        assert!(record.end_time.is_none());
    }

    #[test]
    fn start_time_never_overwritten() {
        let mut record =
            RequestRecord::from_observation("r1", &started("https://a.example/x", 100), &rules());
        record.merge(
            &Observation {
                time_stamp: 500,
                phase: RequestState::HeadersReceived,
                ..Observation::default()
            },
            &rules(),
        );
        assert_eq!(record.start_time, 100);
    }

    #[test]
    fn end_time_set_once_by_first_terminal() {
        let mut record =
            RequestRecord::from_observation("r1", &started("https://a.example/x", 100), &rules());
        record.merge(
            &Observation {
                time_stamp: 300,
                error: Some("net::ERR_ABORTED".to_string()),
                phase: RequestState::Errored,
                ..Observation::default()
            },
            &rules(),
        );
        assert_eq!(record.end_time, Some(300));
        assert_eq!(record.state, RequestState::Errored);

        // A second terminal event must not move end_time or the state.
        record.merge(
            &Observation {
                time_stamp: 900,
                status_code: Some(200),
                phase: RequestState::Completed,
                ..Observation::default()
            },
            &rules(),
        );
        assert_eq!(record.end_time, Some(300));
        assert_eq!(record.state, RequestState::Errored);
        // Non-temporal fields still merge.
        assert_eq!(record.status_code, Some(200));
    }

    #[test]
    fn state_never_regresses() {
        let mut record =
            RequestRecord::from_observation("r1", &started("https://a.example/x", 100), &rules());
        record.merge(
            &Observation {
                time_stamp: 200,
                phase: RequestState::HeadersReceived,
                ..Observation::default()
            },
            &rules(),
        );
        record.merge(
            &Observation {
                time_stamp: 250,
                phase: RequestState::HeadersSent,
                ..Observation::default()
            },
            &rules(),
        );
        assert_eq!(record.state, RequestState::HeadersReceived);
    }

    #[test]
    fn token_extracted_from_request_headers() {
        let mut record =
            RequestRecord::from_observation("r1", &started("https://a.example/x", 100), &rules());
        let mut headers = HashMap::new();
        headers.insert("X-Session-Token".to_string(), "tok-1".to_string());
        record.merge(
            &Observation {
                time_stamp: 150,
                request_headers: Some(headers),
                phase: RequestState::HeadersSent,
                ..Observation::default()
            },
            &rules(),
        );
        assert_eq!(record.correlation_token.as_deref(), Some("tok-1"));
    }

    #[test]
    fn workstation_offset_and_mime_extracted_from_response_headers() {
        let mut record =
            RequestRecord::from_observation("r1", &started("https://a.example/x", 100), &rules());
        let mut headers = HashMap::new();
        headers.insert("x-workstation-id".to_string(), "WS-7".to_string());
        headers.insert("x-utc-offset".to_string(), "+0530".to_string());
        headers.insert(
            "Content-Type".to_string(),
            "application/json; charset=utf-8".to_string(),
        );
        record.merge(
            &Observation {
                time_stamp: 200,
                response_headers: Some(headers),
                status_code: Some(200),
                phase: RequestState::HeadersReceived,
                ..Observation::default()
            },
            &rules(),
        );
        assert_eq!(record.workstation_id.as_deref(), Some("WS-7"));
        assert_eq!(record.utc_offset.as_deref(), Some("+0530"));
        assert_eq!(record.mime_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn login_url_detected() {
        let record = RequestRecord::from_observation(
            "r1",
            &started("https://bank.example/logonUser?ws1", 1000),
            &rules(),
        );
        assert!(record.is_login_request);
        assert_eq!(record.route_id.as_deref(), Some("logonUser"));

        let record =
            RequestRecord::from_observation("r2", &started("https://bank.example/accounts", 2000), &rules());
        assert!(!record.is_login_request);
    }

    #[test]
    fn domain_and_route_extraction() {
        assert_eq!(
            url_domain("https://bank.example/a/b?q=1"),
            Some("bank.example".to_string())
        );
        assert_eq!(url_domain("not a url"), None);
        assert_eq!(
            extract_route_id("https://bank.example/api/v2/accounts?x=1"),
            Some("accounts".to_string())
        );
        assert_eq!(extract_route_id("https://bank.example/"), None);
    }

    #[test]
    fn record_serde_roundtrip() {
        let record = RequestRecord::from_observation(
            "r1",
            &started("https://bank.example/login", 1000),
            &rules(),
        );
        let json = serde_json::to_string(&record).unwrap();
        let back: RequestRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn minimal_persisted_record_deserializes() {
        // Older snapshots may lack overlay fields entirely.
        let json = r#"{
            "request_id": "r1",
            "url": "https://a.example/x",
            "method": "GET",
            "start_time": 5
        }"#;
        let record: RequestRecord = serde_json::from_str(json).unwrap();
        assert!(!record.is_synthetic);
        assert_eq!(record.state, RequestState::Started);
        assert!(record.captured_at.is_none());
    }

    #[test]
    fn end_or_start_falls_back() {
        let mut record =
            RequestRecord::from_observation("r1", &started("https://a.example/x", 100), &rules());
        assert_eq!(record.end_or_start(), 100);
        record.end_time = Some(250);
        assert_eq!(record.end_or_start(), 250);
    }
}
