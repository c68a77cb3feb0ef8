//! Tagged-union inbound message types.
//!
//! Two independent channels feed the aggregator: the primary lifecycle stream
//! (one message per request phase) and the out-of-band capture channel. Both
//! are modeled as one serde tagged union so dispatch is an exhaustive match
//! rather than string comparisons.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Messages consumed by the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverMessage {
    /// First observation of a request
    RequestStarted {
        request_id: String,
        url: String,
        method: String,
        time_stamp: i64,
        #[serde(default)]
        post_data: Option<String>,
    },

    /// Request headers were sent
    HeadersSent {
        request_id: String,
        url: String,
        method: String,
        time_stamp: i64,
        request_headers: HashMap<String, String>,
    },

    /// Response headers arrived
    HeadersReceived {
        request_id: String,
        url: String,
        method: String,
        time_stamp: i64,
        response_headers: HashMap<String, String>,
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        status_line: Option<String>,
    },

    /// Request completed successfully (terminal)
    RequestCompleted {
        request_id: String,
        url: String,
        method: String,
        time_stamp: i64,
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        status_line: Option<String>,
        #[serde(default)]
        response_size: Option<u64>,
        #[serde(default)]
        response_headers: Option<HashMap<String, String>>,
    },

    /// Request failed (terminal)
    RequestErrored {
        request_id: String,
        url: String,
        method: String,
        time_stamp: i64,
        error: String,
    },

    /// Out-of-band response capture from the page-context agent
    ResponseCaptured(CaptureMessage),
}

impl ObserverMessage {
    /// Request id carried by the message, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::RequestStarted { request_id, .. }
            | Self::HeadersSent { request_id, .. }
            | Self::HeadersReceived { request_id, .. }
            | Self::RequestCompleted { request_id, .. }
            | Self::RequestErrored { request_id, .. } => Some(request_id),
            Self::ResponseCaptured(capture) => capture.request_id.as_deref(),
        }
    }
}

/// An out-of-band response capture.
///
/// Arrives independently of the lifecycle stream and may precede, follow, or
/// entirely miss its primary counterpart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureMessage {
    /// Primary-channel request id when the capturing agent could observe it
    #[serde(default)]
    pub request_id: Option<String>,

    /// Request URL (possibly relative to `page_url`)
    pub url: String,

    #[serde(default)]
    pub method: Option<String>,

    /// HTTP status observed by the capturing agent
    pub status: u16,

    #[serde(default)]
    pub status_text: Option<String>,

    /// Captured response body, stored as opaque text
    pub response_body: String,

    /// Capture timestamp (epoch ms)
    pub timestamp: i64,

    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,

    #[serde(default)]
    pub correlation_token: Option<String>,

    /// Page URL used as base when `url` is relative
    #[serde(default)]
    pub page_url: Option<String>,
}
