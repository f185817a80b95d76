//! Injected logging capability
//!
//! Components receive a logger at construction instead of referencing a
//! global sink. The default is a no-op; `TraceLog` forwards to the
//! `tracing` ecosystem for hosts that already run a subscriber.

use std::sync::Arc;

/// Debug-granularity log sink for netcode internals.
///
/// Every line is diagnostic only; nothing in the library makes decisions
/// based on whether a logger is attached.
pub trait NetLog: Send + Sync {
    fn line(&self, msg: &str);
}

/// Discards everything. The default for all components.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLog;

impl NetLog for NullLog {
    fn line(&self, _msg: &str) {}
}

/// Forwards to `tracing::debug!` under the `rewind` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceLog;

impl NetLog for TraceLog {
    fn line(&self, msg: &str) {
        tracing::debug!(target: "rewind", "{msg}");
    }
}

/// Shared logger handle, cloned into each component.
pub type Logger = Arc<dyn NetLog>;
