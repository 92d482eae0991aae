//! Connection configuration.
//!
//! [`ConnectionConfig`] deserializes from the JSON option names used in
//! configuration files (`uri`, `base`, `filter`, `attrs`, `scope`,
//! `connecttimeout`, `starttls`, `autoreconnect`, `timeout`). Session hooks are
//! attached programmatically and never deserialized.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::SessionSettings;
use crate::errors::DirectoryError;
use crate::types::deserialize_attribute_list;
use crate::{ConnectionId, Scope};

/// Default search base.
pub const DEFAULT_BASE: &str = "dc=com";
/// Default search filter.
pub const DEFAULT_FILTER: &str = "(objectClass=*)";
/// Default network connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1_000;
/// Default per-request timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 2_000;

fn default_base() -> String {
    DEFAULT_BASE.to_owned()
}

fn default_filter() -> String {
    DEFAULT_FILTER.to_owned()
}

fn default_attrs() -> Vec<String> {
    vec!["*".to_owned()]
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Session hooks
// ---------------------------------------------------------------------------

/// Callback invoked with the id of the connection an event concerns.
pub type HookFn = Arc<dyn Fn(ConnectionId) + Send + Sync>;

/// What a connection does when its engine reports an unexpected disconnect.
#[derive(Clone, Default)]
pub enum DisconnectStrategy {
    /// Re-initialize the session and replay the last bind.
    #[default]
    AutoReconnect,
    /// Do nothing; the next operation fails (and may recover through the
    /// cannot-contact-server path).
    Ignore,
    /// Hand the event to a caller-supplied function instead of reconnecting.
    Custom(HookFn),
}

impl std::fmt::Debug for DisconnectStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AutoReconnect => f.write_str("AutoReconnect"),
            Self::Ignore => f.write_str("Ignore"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Caller hooks for engine session events.
#[derive(Clone, Default)]
pub struct SessionHooks {
    /// Called whenever the engine reports an established session.
    pub on_reconnect: Option<HookFn>,
    /// Strategy applied to unexpected disconnects.
    pub on_disconnect: DisconnectStrategy,
}

impl std::fmt::Debug for SessionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHooks")
            .field("on_reconnect", &self.on_reconnect.as_ref().map(|_| ".."))
            .field("on_disconnect", &self.on_disconnect)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Connection configuration
// ---------------------------------------------------------------------------

/// Defaults and session settings for one [`crate::Connection`].
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Directory URI (`ldap://` or `ldaps://`). Required.
    pub uri: String,

    /// Search base used when a search does not name one.
    #[serde(default = "default_base")]
    pub base: String,

    /// Filter used when a search does not supply one.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Attributes requested when a search does not list any.
    #[serde(
        default = "default_attrs",
        deserialize_with = "deserialize_attribute_list"
    )]
    pub attrs: Vec<String>,

    /// Scope used when a search does not specify one.
    #[serde(default)]
    pub scope: Scope,

    /// Network connect timeout in milliseconds.
    #[serde(rename = "connecttimeout", default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// StartTLS upgrade. `None` enables it exactly when the URI scheme is
    /// `ldaps`.
    #[serde(default)]
    pub starttls: Option<bool>,

    /// Whether the last bind is replayed after a reconnect.
    #[serde(default = "default_true")]
    pub autoreconnect: bool,

    /// Per-request timeout in milliseconds.
    #[serde(rename = "timeout", default = "default_request_timeout_ms")]
    pub timeout_ms: u64,

    /// Session event hooks.
    #[serde(skip)]
    pub hooks: SessionHooks,
}

impl ConnectionConfig {
    /// Creates a configuration for `uri` with every other option defaulted.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            base: default_base(),
            filter: default_filter(),
            attrs: default_attrs(),
            scope: Scope::default(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            starttls: None,
            autoreconnect: true,
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            hooks: SessionHooks::default(),
        }
    }

    /// Parses a configuration from its JSON form and validates it.
    pub fn from_json(json: &str) -> Result<Self, DirectoryError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DirectoryError::invalid_argument(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the default search base.
    #[must_use]
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Enables or disables replaying the last bind after a reconnect.
    #[must_use]
    pub fn with_autoreconnect(mut self, enabled: bool) -> Self {
        self.autoreconnect = enabled;
        self
    }

    /// Attaches session hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: SessionHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Checks that the configuration can be used to open a connection.
    pub fn validate(&self) -> Result<(), DirectoryError> {
        if self.uri.trim().is_empty() {
            return Err(DirectoryError::invalid_argument("Missing argument: uri"));
        }
        Ok(())
    }

    /// Whether StartTLS is requested, after applying the URI-scheme default.
    pub fn starttls_enabled(&self) -> bool {
        self.starttls
            .unwrap_or_else(|| self.uri.to_ascii_lowercase().starts_with("ldaps"))
    }

    /// Network connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Settings handed to the engine on (re-)initialization.
    pub fn session_settings(&self, connection_id: ConnectionId) -> SessionSettings {
        SessionSettings {
            uri: self.uri.clone(),
            connect_timeout: self.connect_timeout(),
            starttls: self.starttls_enabled(),
            connection_id,
        }
    }

    /// Configuration for the find-and-bind authentication connection: the
    /// same directory defaults, without the caller's hooks.
    pub(crate) fn for_auth_connection(&self) -> Self {
        Self {
            hooks: SessionHooks::default(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ConnectionConfig::from_json(r#"{"uri":"ldap://localhost:1389"}"#)
            .expect("minimal config");
        assert_eq!(config.base, DEFAULT_BASE);
        assert_eq!(config.filter, DEFAULT_FILTER);
        assert_eq!(config.attrs, vec!["*"]);
        assert_eq!(config.scope, Scope::Sub);
        assert_eq!(config.connect_timeout(), Duration::from_millis(1_000));
        assert_eq!(config.request_timeout(), Duration::from_millis(2_000));
        assert!(config.autoreconnect);
        assert!(!config.starttls_enabled());
    }

    #[test]
    fn ldaps_enables_starttls_unless_overridden() {
        assert!(ConnectionConfig::new("LDAPS://ldap.example.com").starttls_enabled());

        let config = ConnectionConfig::from_json(r#"{"uri":"ldaps://x","starttls":false}"#)
            .expect("valid config");
        assert!(!config.starttls_enabled());
    }

    #[test]
    fn missing_uri_is_rejected() {
        assert!(matches!(
            ConnectionConfig::from_json(r#"{"base":"dc=x"}"#),
            Err(DirectoryError::InvalidArgument { .. })
        ));
        assert!(matches!(
            ConnectionConfig::new("  ").validate(),
            Err(DirectoryError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn option_names_follow_the_file_format() {
        let config = ConnectionConfig::from_json(
            r#"{
                "uri": "ldap://localhost",
                "base": "dc=sample,dc=com",
                "attrs": "cn,sn",
                "scope": "one",
                "connecttimeout": 250,
                "autoreconnect": false,
                "timeout": 500
            }"#,
        )
        .expect("valid config");
        assert_eq!(config.attrs, vec!["cn", "sn"]);
        assert_eq!(config.scope, Scope::One);
        assert_eq!(config.connect_timeout_ms, 250);
        assert_eq!(config.timeout_ms, 500);
        assert!(!config.autoreconnect);
    }

    #[test]
    fn auth_connection_config_drops_hooks() {
        let hooks = SessionHooks {
            on_reconnect: Some(Arc::new(|_: ConnectionId| {})),
            on_disconnect: DisconnectStrategy::Ignore,
        };
        let config = ConnectionConfig::new("ldap://x").with_hooks(hooks);
        let auth = config.for_auth_connection();
        assert!(auth.hooks.on_reconnect.is_none());
        assert!(matches!(auth.hooks.on_disconnect, DisconnectStrategy::AutoReconnect));
        assert_eq!(auth.uri, config.uri);
    }
}
