//! reqtrace-core: Core library for reqtrace
//!
//! This crate reconstructs complete per-request records from partial,
//! asynchronously-arriving network lifecycle events and groups them into
//! session-scoped summaries for downstream diagnostics.
//!
//! # Architecture
//!
//! ```text
//! Lifecycle events ─┐
//!                   ├→ RequestRecordStore ─→ PersistenceManager (debounced)
//! Capture messages ─┘        │
//!        │                   ↓
//!        └→ CaptureCorrelator → SessionAggregator → SessionSummary
//! ```
//!
//! # Modules
//!
//! - `aggregator`: Owned facade wiring store, persistence, and correlation
//! - `clock`: Injectable millisecond clock (system and manual test clocks)
//! - `config`: Configuration management (`reqtrace.toml`)
//! - `correlate`: Out-of-band response capture correlation
//! - `error`: Error types
//! - `events`: Tagged-union inbound message types
//! - `logging`: Structured logging setup
//! - `persist`: Debounced snapshot persistence over a key-value port
//! - `record`: Request record model and merge semantics
//! - `session`: Session aggregation and summary derivation
//! - `store`: Bounded in-memory request record store
//!
//! # Safety
//!
//! This crate forbids unsafe code.

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod correlate;
pub mod error;
pub mod events;
pub mod logging;
pub mod persist;
pub mod record;
pub mod session;
pub mod store;

pub use error::{ConfigError, Error, PersistError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
