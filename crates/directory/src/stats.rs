//! Activity counters for one connection.
//!
//! Counters only ever increase; they are reset by process restart alone.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::Timestamp;

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Live counters shared by the correlator, reconnect policy and
        /// connection façade.
        #[derive(Debug)]
        pub struct Stats {
            since: Timestamp,
            $($(#[$doc])* $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`Stats`].
        #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
        pub struct StatsSnapshot {
            /// When counting started for this connection.
            pub since: Timestamp,
            $($(#[$doc])* pub $name: u64,)*
        }

        impl Stats {
            /// Creates a block of zeroed counters.
            pub fn new() -> Self {
                Self {
                    since: Timestamp::now(),
                    $($name: AtomicU64::new(0),)*
                }
            }

            /// Copies every counter.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    since: self.since,
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Completions that arrived for an id with no pending request.
    late_responses,
    /// Re-initialization attempts made by the reconnect policy.
    reconnects,
    /// Re-initialization or re-bind attempts that failed.
    reconnect_failures,
    /// Requests that hit the request timeout.
    timeouts,
    /// Requests accepted by the engine and registered for correlation.
    requests,
    /// Search operations issued.
    searches,
    /// Bind operations issued.
    binds,
    /// Add operations issued.
    adds,
    /// Modify operations issued.
    modifies,
    /// Delete operations issued.
    removes,
    /// Rename operations issued.
    renames,
    /// Disconnect notifications received from the engine.
    disconnects,
    /// Completions received from the engine, matched or not.
    results,
    /// Operations the engine rejected synchronously.
    errors,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Increments one counter of a [`Stats`] block.
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Stats {
    pub(crate) fn late_response(&self) {
        bump(&self.late_responses);
    }
    pub(crate) fn reconnect(&self) {
        bump(&self.reconnects);
    }
    pub(crate) fn reconnect_failure(&self) {
        bump(&self.reconnect_failures);
    }
    pub(crate) fn timeout(&self) {
        bump(&self.timeouts);
    }
    pub(crate) fn request(&self) {
        bump(&self.requests);
    }
    pub(crate) fn disconnect(&self) {
        bump(&self.disconnects);
    }
    pub(crate) fn result(&self) {
        bump(&self.results);
    }
    pub(crate) fn error(&self) {
        bump(&self.errors);
    }

    /// Counts one issued operation of the given kind.
    pub(crate) fn operation(&self, kind: OperationKind) {
        let counter = match kind {
            OperationKind::Search => &self.searches,
            OperationKind::Bind => &self.binds,
            OperationKind::Add => &self.adds,
            OperationKind::Modify => &self.modifies,
            OperationKind::Delete => &self.removes,
            OperationKind::Rename => &self.renames,
        };
        bump(counter);
    }
}

/// The operations a connection forwards to its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Search,
    Bind,
    Add,
    Modify,
    Delete,
    Rename,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationKind::Search => "search",
            OperationKind::Bind => "bind",
            OperationKind::Add => "add",
            OperationKind::Modify => "modify",
            OperationKind::Delete => "delete",
            OperationKind::Rename => "rename",
        };
        f.write_str(name)
    }
}
