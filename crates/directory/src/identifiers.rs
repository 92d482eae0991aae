//! Newtype identifiers for connections and in-flight requests.
//!
//! A [`ConnectionId`] and a [`MessageId`] are both small integers under the
//! hood; wrapping them separately prevents passing one where the other is
//! expected (log fields, correlator keys).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Macro for u64-wrapped newtypes.
// Generates: struct (Copy), new(), as_u64(), Display.
// ---------------------------------------------------------------------------
macro_rules! u64_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new identifier from a raw integer.
            pub fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the underlying integer value.
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

u64_id! {
    /// Engine-assigned token correlating one outbound operation with its
    /// eventual completion.
    ///
    /// Unique only while the operation is outstanding; engines may reuse ids
    /// after completion.
    MessageId
}

u64_id! {
    /// Identifies one [`crate::Connection`] in log output.
    ///
    /// Allocated from a process-wide counter by [`ConnectionId::next`].
    ConnectionId
}

/// Largest connection id handed out before the counter wraps back to zero.
///
/// Ids are reused after exhaustion. Log correlation assumes small integers, so
/// the wraparound is kept instead of switching to random identifiers.
pub const MAX_CONNECTION_ID: u64 = (1 << 53) - 1;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

impl ConnectionId {
    /// Allocates the next process-wide connection id.
    pub fn next() -> Self {
        Self(advance(&NEXT_CONNECTION_ID))
    }
}

/// Returns the current counter value and moves the counter forward, wrapping
/// to zero once [`MAX_CONNECTION_ID`] has been handed out.
fn advance(counter: &AtomicU64) -> u64 {
    let step = |current: u64| {
        Some(if current >= MAX_CONNECTION_ID {
            0
        } else {
            current + 1
        })
    };
    match counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, step) {
        Ok(previous) | Err(previous) => previous,
    }
}
