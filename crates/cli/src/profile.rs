//! Connection profiles loaded from JSON files.
//!
//! A profile is one flat JSON object holding connection options, optional
//! bind credentials and default search options:
//!
//! ```json
//! {
//!   "uri": "ldap://localhost:1389",
//!   "binddn": "cn=admin,dc=example,dc=com",
//!   "password": "secret",
//!   "base": "ou=people,dc=example,dc=com",
//!   "filter": "(objectClass=person)",
//!   "attrs": "cn sn mail",
//!   "searchRequestControlType": "pagedresults",
//!   "pagesize": 100
//! }
//! ```

use std::path::Path;

use anyhow::Context;
use directory::{BindCredentials, ConnectionConfig, SearchOptions};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
struct RawCredentials {
    binddn: Option<String>,
    password: Option<String>,
}

/// Everything a command needs to connect and search.
#[derive(Debug)]
pub struct Profile {
    pub connection: ConnectionConfig,
    pub credentials: Option<BindCredentials>,
    pub search: SearchOptions,
}

impl Profile {
    /// Reads and parses a profile file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read profile {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("invalid profile {}", path.display()))
    }

    /// Parses a profile from its JSON text.
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let connection: ConnectionConfig = serde_json::from_value(value.clone())?;
        let search: SearchOptions = serde_json::from_value(value.clone())?;
        let raw: RawCredentials = serde_json::from_value(value)?;
        let credentials = raw
            .binddn
            .map(|binddn| BindCredentials::new(binddn, raw.password.unwrap_or_default()));
        Ok(Self {
            connection,
            credentials,
            search,
        })
    }

    /// A profile with no file: only a URI.
    pub fn for_uri(uri: &str) -> Self {
        Self {
            connection: ConnectionConfig::new(uri),
            credentials: None,
            search: SearchOptions::default(),
        }
    }
}
