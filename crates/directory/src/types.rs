//! Shared value types for directory operations.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! directory data (entries, modifications, controls, paging state) that flows
//! between callers, the [`crate::Connection`] and the engine.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::DirectoryError;

// ---------------------------------------------------------------------------
// Search scope
// ---------------------------------------------------------------------------

/// How far below the base DN a search descends.
///
/// Numeric values match the LDAP `SearchRequest.scope` enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Only the base entry itself.
    Base,
    /// Immediate children of the base entry.
    #[serde(alias = "onelevel")]
    One,
    /// The base entry and its whole subtree.
    #[default]
    #[serde(alias = "subtree")]
    Sub,
    /// The subtree below the base entry, excluding the base itself.
    Subordinate,
    /// Whatever the server considers its default scope.
    Default,
}

impl Scope {
    /// Returns the protocol value of this scope.
    pub fn as_i32(self) -> i32 {
        match self {
            Scope::Base => 0,
            Scope::One => 1,
            Scope::Sub => 2,
            Scope::Subordinate => 3,
            Scope::Default => 4,
        }
    }
}

impl FromStr for Scope {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "base" | "0" => Ok(Scope::Base),
            "one" | "onelevel" | "1" => Ok(Scope::One),
            "sub" | "subtree" | "2" => Ok(Scope::Sub),
            "subordinate" | "3" => Ok(Scope::Subordinate),
            "default" | "4" => Ok(Scope::Default),
            other => Err(DirectoryError::invalid_argument(format!(
                "unknown search scope '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Scope::Base => "base",
            Scope::One => "one",
            Scope::Sub => "sub",
            Scope::Subordinate => "subordinate",
            Scope::Default => "default",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Attribute lists
// ---------------------------------------------------------------------------

/// Splits an attribute list written as one string (`"cn sn,mail"`) into names.
///
/// Separators are spaces, tabs and commas; empty segments are dropped.
pub fn parse_attribute_list(list: &str) -> Vec<String> {
    list.split([' ', '\t', ','])
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Deserializes an attribute list given either as a JSON array or as a single
/// separated string.
pub(crate) fn deserialize_attribute_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Joined(String),
        Listed(Vec<String>),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Joined(list) => parse_attribute_list(&list),
        Raw::Listed(names) => names,
    })
}

/// Optional variant of [`deserialize_attribute_list`].
pub(crate) fn deserialize_optional_attribute_list<'de, D>(
    deserializer: D,
) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_attribute_list(deserializer).map(Some)
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// One directory entry returned by a search.
///
/// Attribute values are kept in server order. Values the engine could not
/// decode as UTF-8 (photos, certificates) are reported in `bin_attrs`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Entry {
    /// Distinguished name of the entry.
    pub dn: String,

    /// Textual attribute values keyed by attribute name.
    #[serde(default)]
    pub attrs: BTreeMap<String, Vec<String>>,

    /// Binary attribute values keyed by attribute name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bin_attrs: BTreeMap<String, Vec<Vec<u8>>>,
}

impl Entry {
    /// Creates an entry with no attributes.
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            ..Self::default()
        }
    }

    /// Adds textual values for `name`, returning the updated entry.
    #[must_use]
    pub fn with_attr<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.attrs
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Returns all textual values of `name`, if present.
    pub fn values(&self, name: &str) -> Option<&[String]> {
        self.attrs.get(name).map(Vec::as_slice)
    }

    /// Returns the first textual value of `name`, if the attribute is present
    /// and populated.
    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.values(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// An attribute and its values, as supplied to an add operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Attribute name.
    pub attr: String,
    /// Values to store.
    pub vals: Vec<String>,
}

impl Attribute {
    /// Creates an attribute from a name and values.
    pub fn new<I, V>(attr: impl Into<String>, vals: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self {
            attr: attr.into(),
            vals: vals.into_iter().map(Into::into).collect(),
        }
    }
}

/// Kind of change applied by one [`Modification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModOp {
    /// Add the listed values.
    Add,
    /// Delete the listed values (all values when the list is empty).
    Delete,
    /// Replace every value with the listed ones.
    Replace,
}

/// One change within a modify operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    /// What to do with the values.
    pub op: ModOp,
    /// Attribute being changed.
    pub attr: String,
    /// Values the change applies to.
    #[serde(default)]
    pub vals: Vec<String>,
}

impl Modification {
    /// Creates a modification.
    pub fn new<I, V>(op: ModOp, attr: impl Into<String>, vals: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self {
            op,
            attr: attr.into(),
            vals: vals.into_iter().map(Into::into).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Controls and paging state
// ---------------------------------------------------------------------------

/// An opaque request control passed through to the engine untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    /// Control type OID.
    pub oid: String,
    /// Whether the server must reject the request if it does not support the
    /// control.
    #[serde(default)]
    pub critical: bool,
    /// BER-encoded control value, if any.
    #[serde(default)]
    pub value: Option<Vec<u8>>,
}

/// Opaque continuation state returned by a paged or VLV search.
///
/// An empty cookie means the server has no further pages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Cookie(Vec<u8>);

impl Cookie {
    /// Wraps raw cookie bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw cookie bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns `true` if the server sent no continuation state.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Outcome of the server-side sort control attached to a VLV search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortResult {
    /// Result code of the sort (0 = success).
    pub result_code: i32,
    /// Attribute that caused the sort to fail, when reported.
    pub error_attribute: Option<String>,
}

/// Paging metadata reported alongside search results.
///
/// Simple paged results usually fill only `count` (and only when the server
/// chooses to estimate). VLV always reports `offset` and `count`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageResult {
    /// Total (or estimated) size of the result set.
    pub count: Option<u32>,
    /// Zero-based position of the first returned entry (VLV only).
    pub offset: Option<u32>,
    /// Result code of the VLV response control.
    pub vlv_result_code: Option<i32>,
    /// Server-side sort outcome, when a sort control was sent.
    pub sort: Option<SortResult>,
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// A simple-bind DN and password.
///
/// Captured by [`crate::Connection::bind`] so the reconnect policy can replay
/// them. The password never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct BindCredentials {
    /// DN to bind as.
    pub binddn: String,
    /// Password for `binddn`.
    pub password: String,
}

impl BindCredentials {
    /// Creates credentials from a DN and password.
    pub fn new(binddn: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            binddn: binddn.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for BindCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindCredentials")
            .field("binddn", &self.binddn)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
