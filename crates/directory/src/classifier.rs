//! Classification of synchronous engine rejections.
//!
//! When the engine refuses an operation without assigning a message id, the
//! connection reads the engine's last error and asks [`classify`] whether the
//! failure needs handling beyond being reported.

use crate::errors::{result_code, StructuredError};

/// Text reported by engines that cannot reach the server and expose no code.
const CANNOT_CONTACT_SERVER: &str = "can't contact ldap server";

/// Side-effecting conditions recognised in a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// Permission failure; the session is closed.
    InsufficientAccess,
    /// The server cannot be reached; the session is re-established inline.
    CannotContactServer,
    /// Reported to the caller with no further action.
    Other,
}

/// Classifies a rejection from the engine's last error code and text.
///
/// A code, when present, decides. Text matching (case-insensitive substring)
/// is used only when the engine has no code.
pub fn classify(code: Option<i32>, text: &str) -> Condition {
    match code {
        Some(result_code::INSUFFICIENT_ACCESS) => Condition::InsufficientAccess,
        Some(result_code::SERVER_DOWN) => Condition::CannotContactServer,
        Some(_) => Condition::Other,
        None if text.to_lowercase().contains(CANNOT_CONTACT_SERVER) => {
            Condition::CannotContactServer
        }
        None => Condition::Other,
    }
}

/// The error surfaced for a rejection.
pub fn rejection_error(code: Option<i32>, text: &str) -> StructuredError {
    StructuredError::from_engine(code, text.trim())
}
