//! Client-side orchestration for directory (LDAP) connections.
//!
//! This crate turns a message-id-addressed, event-driven directory engine into
//! a [`Connection`] with request/response correlation, per-request timeouts,
//! automatic reconnection, paged and virtual-list-view search continuation,
//! and a compound find-and-bind operation.
//!
//! ## Architectural Layer
//!
//! **Orchestration + port definitions.** This crate has no socket or TLS code.
//! The wire protocol lives behind the [`DirectoryEngine`] trait; adapter
//! crates implement it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | `ConnectionId`, `MessageId` |
//! | [`types`] | Shared value types (`Entry`, `Scope`, `Cookie`, `PageResult`, etc.) |
//! | [`errors`] | `DirectoryError`, `StructuredError`, special result codes |
//! | [`stats`] | Per-connection activity counters |
//! | [`engine`] | Engine boundary: `DirectoryEngine`, `Connector`, engine events |
//! | [`classifier`] | Classification of synchronous engine rejections |
//! | [`correlator`] | Pending-request table with timeouts |
//! | [`binding`] | Search options, binding-mode resolution, continuation |
//! | `reconnect` | Session re-establishment after a lost connection |
//! | [`config`] | `ConnectionConfig` and session hooks |
//! | [`connection`] | The `Connection` façade |

pub mod binding;
pub mod classifier;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod engine;
pub mod errors;
pub mod identifiers;
mod reconnect;
pub mod stats;
pub mod types;

pub use binding::{resolve, SearchControlType, SearchOptions, SearchPage};
pub use config::{ConnectionConfig, DisconnectStrategy, HookFn, SessionHooks};
pub use connection::Connection;
pub use engine::{
    BindingMode, Connector, DirectoryEngine, EngineCompletion, EngineError, EngineEvent,
    EngineEvents, EngineObserver, EngineSearch, SessionSettings,
};
pub use errors::{result_code, DirectoryError, StructuredError};
pub use identifiers::{ConnectionId, MessageId, MAX_CONNECTION_ID};
pub use stats::{OperationKind, Stats, StatsSnapshot};
pub use types::{
    parse_attribute_list, Attribute, BindCredentials, Control, Cookie, Entry, ModOp,
    Modification, PageResult, Scope, SortResult, Timestamp,
};
