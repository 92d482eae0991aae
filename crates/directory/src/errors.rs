//! Error types for directory operations.
//!
//! [`DirectoryError`] is the single error type surfaced to callers of
//! [`crate::Connection`]. Engine-reported failures are carried as a
//! [`StructuredError`], built from the engine's raw code and message text.
//!
//! Argument and option validation errors are returned before the engine is
//! consulted; every engine-originated failure reaches the caller only through
//! the awaited operation result.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::MessageId;

// ---------------------------------------------------------------------------
// Result codes with special handling
// ---------------------------------------------------------------------------

/// Result codes the orchestration layer reacts to.
pub mod result_code {
    /// Client-side "server down" code reported by engines that lost, or never
    /// had, a session.
    pub const SERVER_DOWN: i32 = -1;
    /// The bind succeeded or the operation completed normally.
    pub const SUCCESS: i32 = 0;
    /// The response could not be decoded.
    pub const PROTOCOL_ERROR: i32 = 2;
    /// The bound identity lacks permission for the operation.
    pub const INSUFFICIENT_ACCESS: i32 = 50;
    /// The server refuses to perform the operation.
    pub const UNWILLING_TO_PERFORM: i32 = 53;
}

// ---------------------------------------------------------------------------
// Engine-reported failures
// ---------------------------------------------------------------------------

/// A failure reported by the directory engine.
///
/// The engine's raw error text is split on its first line break: the part
/// before becomes the headline `message`, the remainder (if any) the `detail`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredError {
    /// Headline message (first line of the engine text).
    pub message: String,
    /// Numeric result code. `None` when the engine reported no code.
    pub code: Option<i32>,
    /// Everything after the first line break of the engine text.
    pub detail: Option<String>,
}

impl StructuredError {
    /// Builds a [`StructuredError`] from an engine code and raw message text.
    pub fn from_engine(code: Option<i32>, raw: &str) -> Self {
        match raw.split_once('\n') {
            Some((headline, rest)) => Self {
                message: headline.trim_end_matches('\r').to_owned(),
                code,
                detail: (!rest.is_empty()).then(|| rest.to_owned()),
            },
            None => Self {
                message: raw.to_owned(),
                code,
                detail: None,
            },
        }
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code})", self.message)?,
            None => write!(f, "{}", self.message)?,
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Caller-facing errors
// ---------------------------------------------------------------------------

/// Errors produced by [`crate::Connection`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// The caller supplied malformed or missing arguments.
    ///
    /// Raised before anything is sent to the engine.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of what was wrong.
        message: String,
    },

    /// The engine reported a failure for the operation.
    #[error("Directory operation failed: {0}")]
    Protocol(StructuredError),

    /// No completion arrived within the configured request timeout.
    ///
    /// A completion arriving later is counted as a late response and dropped.
    #[error("Timeout waiting for response to message {message_id}")]
    Timeout {
        /// Message id of the request that timed out.
        message_id: MessageId,
    },

    /// The search step of find-and-bind did not match exactly one entry.
    #[error("Search returned {count} results, expected 1")]
    AmbiguousOrMissingEntry {
        /// Number of entries the search returned.
        count: usize,
    },

    /// The search options combine paging and sorting controls in a way the
    /// protocols do not allow.
    #[error("Invalid search options: {reason}")]
    InvalidSearchOptions {
        /// Which combination was rejected.
        reason: String,
    },

    /// The connection was closed before or while the operation was pending.
    #[error("Connection is closed")]
    Closed,
}

impl DirectoryError {
    /// Shorthand for [`DirectoryError::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Shorthand for [`DirectoryError::InvalidSearchOptions`].
    pub fn invalid_search_options(reason: impl Into<String>) -> Self {
        Self::InvalidSearchOptions {
            reason: reason.into(),
        }
    }

    /// Returns the engine result code, if this error carries one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Protocol(err) => err.code,
            _ => None,
        }
    }
}

impl From<StructuredError> for DirectoryError {
    fn from(err: StructuredError) -> Self {
        Self::Protocol(err)
    }
}
