//! The directory engine boundary.
//!
//! A [`DirectoryEngine`] performs the wire protocol (TLS, BER encoding, socket
//! I/O). It accepts operations synchronously, hands back a [`MessageId`] for
//! each accepted one, and later reports the outcome through the
//! [`EngineEvents`] sink it was created with.
//!
//! ## Rejection
//!
//! An operation method returning `None` means the engine refused the request
//! without assigning an id. The reason is then available from
//! [`DirectoryEngine::last_error_code`] and
//! [`DirectoryEngine::last_error_string`]. An engine whose session has been
//! closed rejects every operation with code
//! [`result_code::SERVER_DOWN`](crate::errors::result_code::SERVER_DOWN) and the
//! text `"Can't contact LDAP server"`.
//!
//! ## Events
//!
//! Engines may report from any thread; the [`crate::Connection`] drains the
//! sink on a single task so observers never run concurrently.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{ConnectionId, Control, Cookie, Entry, MessageId, PageResult, Scope};

// ---------------------------------------------------------------------------
// Session settings
// ---------------------------------------------------------------------------

/// Everything an engine needs to (re-)establish a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Directory URI, e.g. `ldaps://ldap.example.com:636`.
    pub uri: String,
    /// Network connect timeout.
    pub connect_timeout: Duration,
    /// Whether to upgrade a plain connection with StartTLS.
    pub starttls: bool,
    /// Owning connection, for log correlation.
    pub connection_id: ConnectionId,
}

/// Failure to establish an engine session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cannot initialize directory session to {uri}: {reason}")]
pub struct EngineError {
    /// URI the engine tried to reach.
    pub uri: String,
    /// Engine-specific description.
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Search request
// ---------------------------------------------------------------------------

/// Which search continuation protocol a search uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BindingMode {
    /// One-shot search with no continuation.
    #[default]
    Plain,
    /// Simple paged results: an opaque cookie fetches the next page.
    SimplePagedResults,
    /// Virtual list view: an explicit offset over a server-sorted result set.
    VirtualListView,
}

impl std::fmt::Display for BindingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BindingMode::Plain => "plain",
            BindingMode::SimplePagedResults => "pagedresults",
            BindingMode::VirtualListView => "vlv",
        };
        f.write_str(name)
    }
}

/// A fully resolved search, as forwarded to the engine.
///
/// Defaults have been merged and the binding mode decided; `sort` is only
/// ever set for [`BindingMode::VirtualListView`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSearch {
    /// Search base DN.
    pub base: String,
    /// LDAP filter string.
    pub filter: String,
    /// Attributes to return; `*` for all user attributes.
    pub attrs: Vec<String>,
    /// Search scope.
    pub scope: Scope,
    /// Request controls passed through unchanged.
    pub controls: Vec<Control>,
    /// Continuation protocol to use.
    pub mode: BindingMode,
    /// Entries per page (paged results) or window size (VLV).
    pub page_size: Option<u32>,
    /// Paged-results cookie from the previous page.
    pub cookie: Option<Cookie>,
    /// Zero-based VLV window start.
    pub offset: Option<u32>,
    /// Server-side sort specification.
    pub sort: Option<String>,
}

// ---------------------------------------------------------------------------
// Completions and events
// ---------------------------------------------------------------------------

/// The outcome of one accepted operation.
///
/// When `error_message` is set the operation failed; `error_code` then
/// carries the result code (or `None` if the engine had none).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCompletion {
    /// Id the engine returned when it accepted the operation.
    pub message_id: MessageId,
    /// Result code of a failed operation.
    pub error_code: Option<i32>,
    /// Raw error text; headline, then optional detail after a newline.
    pub error_message: Option<String>,
    /// Entries returned by a search.
    pub entries: Vec<Entry>,
    /// Continuation cookie of a paged search; empty when no pages remain.
    pub cookie: Option<Cookie>,
    /// Paging metadata reported by the server.
    pub page_result: Option<PageResult>,
}

impl EngineCompletion {
    /// A successful completion with no data (bind, add, modify, ...).
    pub fn success(message_id: MessageId) -> Self {
        Self {
            message_id,
            error_code: None,
            error_message: None,
            entries: Vec::new(),
            cookie: None,
            page_result: None,
        }
    }

    /// A successful search completion.
    pub fn entries(message_id: MessageId, entries: Vec<Entry>) -> Self {
        Self {
            entries,
            ..Self::success(message_id)
        }
    }

    /// A failed completion.
    pub fn failure(message_id: MessageId, code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            error_code: code,
            error_message: Some(message.into()),
            ..Self::success(message_id)
        }
    }

    /// Attaches continuation state to a search completion.
    #[must_use]
    pub fn with_page(mut self, cookie: Option<Cookie>, page_result: Option<PageResult>) -> Self {
        self.cookie = cookie;
        self.page_result = page_result;
        self
    }
}

/// Something an engine reports asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// An accepted operation finished.
    Completed(EngineCompletion),
    /// A session became established.
    Reconnected,
    /// An established session was lost without `close()` being called.
    Disconnected,
}

/// Sending half handed to every engine at creation.
///
/// Cheap to clone; engines typically give one copy to each background task.
#[derive(Debug, Clone)]
pub struct EngineEvents {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineEvents {
    /// Creates a sink and the receiver the connection drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Reports the completion of an accepted operation.
    pub fn completed(&self, completion: EngineCompletion) {
        self.send(EngineEvent::Completed(completion));
    }

    /// Reports that a session has been established.
    pub fn reconnected(&self) {
        self.send(EngineEvent::Reconnected);
    }

    /// Reports an unexpected loss of the session.
    pub fn disconnected(&self) {
        self.send(EngineEvent::Disconnected);
    }

    fn send(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            trace!("engine event dropped: connection no longer listening");
        }
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// A directory wire-protocol engine.
///
/// Operation methods return `None` when the engine rejects the request
/// outright (see the module documentation).
#[async_trait]
pub trait DirectoryEngine: Send {
    /// Establishes (or re-establishes) the session, replacing any previous
    /// one.
    async fn initialize(&mut self, settings: &SessionSettings) -> Result<(), EngineError>;

    /// Starts a simple bind.
    fn bind(&mut self, dn: &str, password: &str) -> Option<MessageId>;

    /// Starts a search.
    fn search(&mut self, request: &EngineSearch) -> Option<MessageId>;

    /// Starts adding an entry.
    fn add(&mut self, dn: &str, attrs: &[crate::Attribute]) -> Option<MessageId>;

    /// Starts modifying an entry.
    fn modify(&mut self, dn: &str, mods: &[crate::Modification]) -> Option<MessageId>;

    /// Starts deleting an entry.
    fn delete(&mut self, dn: &str) -> Option<MessageId>;

    /// Starts renaming an entry within its parent.
    fn rename(&mut self, dn: &str, new_rdn: &str) -> Option<MessageId>;

    /// Closes the session. Must not report [`EngineEvent::Disconnected`].
    fn close(&mut self);

    /// Result code of the last rejected operation, if the engine has one.
    fn last_error_code(&self) -> Option<i32>;

    /// Text of the last rejected operation.
    fn last_error_string(&self) -> String;
}

/// Creates engines for new connections.
///
/// A connection asks for one engine when it opens and the find-and-bind flow
/// asks for a second one for its authentication connection.
pub trait Connector: Send + Sync {
    /// Creates an uninitialized engine reporting to `events`.
    fn create(&self, events: EngineEvents) -> Box<dyn DirectoryEngine>;
}

/// Receives engine events on the connection's dispatcher task.
///
/// Implemented by the connection itself; calls never overlap.
#[async_trait]
pub trait EngineObserver: Send + Sync {
    /// An accepted operation finished.
    async fn on_result(&self, completion: EngineCompletion);

    /// The engine established a session.
    async fn on_reconnect(&self);

    /// The engine lost its session.
    async fn on_disconnect(&self);
}

/// Drains `events` into `observer` until every sender is gone or the observer
/// has been dropped.
pub(crate) async fn dispatch<O>(
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    observer: std::sync::Weak<O>,
) where
    O: EngineObserver + ?Sized,
{
    while let Some(event) = events.recv().await {
        let Some(observer) = observer.upgrade() else {
            break;
        };
        match event {
            EngineEvent::Completed(completion) => observer.on_result(completion).await,
            EngineEvent::Reconnected => observer.on_reconnect().await,
            EngineEvent::Disconnected => observer.on_disconnect().await,
        }
    }
}
