//! Fatal-condition taxonomy.
//!
//! Malformed trace lines and `EMPTY`/`NotShared` snoop replies are not
//! errors — those are accepted and folded into the traffic counters. Only
//! the four conditions below abort a run.

use crate::event::{BusEventKind, Pid};

/// A fatal condition raised by a component. Each variant names the
/// offending component, so failures can be traced back to its origin.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SimError {
    /// An unknown policy/protocol value or a missing required parameter was
    /// supplied at construction time.
    #[error("configuration error in {component}: {reason}")]
    Config {
        component: &'static str,
        reason: String,
    },

    /// A reachable-state invariant was violated — e.g. a "hit" was
    /// dispatched against an `Invalid` line.
    #[error("cache {cache_id}: invariant violation: {reason}")]
    Invariant { cache_id: Pid, reason: String },

    /// A bus event of a kind that cannot legally appear on that link arrived
    /// at a handler (e.g. a `PrRd` event delivered to `Cache::on_bus_snoop`).
    #[error("cache {cache_id}: unexpected event kind {kind:?} on {link}")]
    UnexpectedEventKind {
        cache_id: Pid,
        link: &'static str,
        kind: BusEventKind,
    },
}

pub type Result<T> = std::result::Result<T, SimError>;
