//! Search options and the search binding resolver.
//!
//! A search runs in one of three continuation protocols (see
//! [`BindingMode`]). [`resolve`] picks the protocol for a set of
//! [`SearchOptions`] and rejects contradictory combinations:
//!
//! | Control type | Page size | Sort spec | Result |
//! |--------------|-----------|-----------|--------|
//! | `vlv` | any | missing or empty | `InvalidSearchOptions` |
//! | `vlv` | any | present | VLV, sort forwarded |
//! | `pagedresults` | any | present | `InvalidSearchOptions` |
//! | `pagedresults` | any | missing | simple paged results |
//! | none | missing or 0 | any | plain |
//! | none | > 0 | missing or empty | simple paged results |
//! | none | > 0 | present | VLV, sort forwarded |

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::engine::BindingMode;
use crate::errors::DirectoryError;
use crate::types::deserialize_optional_attribute_list;
use crate::{Control, Cookie, Entry, PageResult, Scope};

/// Continuation protocol requested explicitly by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SearchControlType {
    /// Virtual list view (`"vlv"`); requires a sort specification.
    Vlv,
    /// Simple paged results (`"pagedresults"`); forbids a sort specification.
    PagedResults,
}

impl FromStr for SearchControlType {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vlv" => Ok(Self::Vlv),
            "pagedresults" => Ok(Self::PagedResults),
            other => Err(DirectoryError::invalid_search_options(format!(
                "unknown search request control type '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for SearchControlType {
    type Error = DirectoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SearchControlType> for String {
    fn from(value: SearchControlType) -> Self {
        match value {
            SearchControlType::Vlv => "vlv".to_owned(),
            SearchControlType::PagedResults => "pagedresults".to_owned(),
        }
    }
}

/// Caller-supplied search parameters.
///
/// Unset `base`, `filter`, `attrs` and `scope` fall back to the connection's
/// configured defaults. Field names in serialized form follow the
/// configuration file conventions (`pagesize`, `sortString`,
/// `searchRequestControlType`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SearchOptions {
    /// Search base DN.
    pub base: Option<String>,
    /// LDAP filter string.
    pub filter: Option<String>,
    /// Attributes to return; an empty list means the configured default.
    #[serde(default, deserialize_with = "deserialize_optional_attribute_list")]
    pub attrs: Option<Vec<String>>,
    /// Search scope.
    pub scope: Option<Scope>,
    /// Request controls passed through to the engine.
    #[serde(default)]
    pub controls: Vec<Control>,
    /// Explicit continuation protocol; inferred from `page_size` and `sort`
    /// when unset.
    #[serde(rename = "searchRequestControlType")]
    pub control_type: Option<SearchControlType>,
    /// Entries per page (paged results) or window size (VLV).
    #[serde(rename = "pagesize")]
    pub page_size: Option<u32>,
    /// Server-side sort specification; required by VLV.
    #[serde(rename = "sortString")]
    pub sort: Option<String>,
    /// Paged-results cookie returned by the previous page.
    #[serde(skip)]
    pub cookie: Option<Cookie>,
    /// Zero-based VLV window start.
    pub offset: Option<u32>,
}

impl SearchOptions {
    /// Options with only a filter set.
    pub fn filter(filter: impl Into<String>) -> Self {
        Self {
            filter: Some(filter.into()),
            ..Self::default()
        }
    }
}

/// The outcome of [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Continuation protocol to use.
    pub mode: BindingMode,
    /// Sort specification to forward; only ever set for VLV.
    pub sort: Option<String>,
}

/// Chooses and validates the continuation protocol for `options`.
pub fn resolve(options: &SearchOptions) -> Result<Resolution, DirectoryError> {
    let sort = options.sort.as_deref();
    let has_sort = sort.is_some_and(|s| !s.is_empty());

    let mode = match options.control_type {
        Some(SearchControlType::Vlv) => {
            if !has_sort {
                return Err(DirectoryError::invalid_search_options(
                    "VLV control requires server side sort control",
                ));
            }
            BindingMode::VirtualListView
        }
        Some(SearchControlType::PagedResults) => {
            if sort.is_some() {
                return Err(DirectoryError::invalid_search_options(
                    "Cannot use both pagedResults control and server side sort control",
                ));
            }
            BindingMode::SimplePagedResults
        }
        None => match options.page_size {
            Some(size) if size > 0 && has_sort => BindingMode::VirtualListView,
            Some(size) if size > 0 => BindingMode::SimplePagedResults,
            _ => BindingMode::Plain,
        },
    };

    let sort = match mode {
        BindingMode::VirtualListView => options.sort.clone(),
        BindingMode::Plain | BindingMode::SimplePagedResults => None,
    };
    Ok(Resolution { mode, sort })
}

/// One completed search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchPage {
    /// Entries returned in this page.
    pub entries: Vec<Entry>,
    /// Continuation state to send with the next request, if any.
    pub cookie: Option<Cookie>,
    /// Paging metadata reported by the server.
    pub page_result: Option<PageResult>,
}

impl SearchPage {
    /// Computes the options for the next page of a continuation loop, or
    /// `None` when the result set is exhausted.
    ///
    /// VLV advances `offset` by the page size while the reported count lies
    /// beyond the next offset. Simple paged results continue while the server
    /// returns a non-empty cookie. Plain searches never continue.
    pub fn next_options(&self, previous: &SearchOptions) -> Option<SearchOptions> {
        let mode = resolve(previous).ok()?.mode;
        let returned_cookie = self.cookie.as_ref().filter(|c| !c.is_empty());

        match mode {
            BindingMode::Plain => None,
            BindingMode::SimplePagedResults => {
                let cookie = returned_cookie?;
                Some(SearchOptions {
                    cookie: Some(cookie.clone()),
                    ..previous.clone()
                })
            }
            BindingMode::VirtualListView => {
                let page_size = previous.page_size.filter(|size| *size > 0)?;
                let count = self.page_result.as_ref()?.count?;
                let next = previous.offset.unwrap_or(0).checked_add(page_size)?;
                if next >= count {
                    return None;
                }
                Some(SearchOptions {
                    offset: Some(next),
                    cookie: returned_cookie.cloned().or_else(|| previous.cookie.clone()),
                    ..previous.clone()
                })
            }
        }
    }
}
