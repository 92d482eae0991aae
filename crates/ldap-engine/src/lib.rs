//! Directory engine backed by the [`ldap3`] client.
//!
//! [`Ldap3Engine`] implements [`DirectoryEngine`] on top of an
//! [`ldap3::Ldap`] handle. Each accepted operation gets a locally allocated
//! [`MessageId`] and runs on its own task; its outcome is reported through the
//! engine's [`EngineEvents`] sink.
//!
//! ## Limitations
//!
//! - `ldap3` has no virtual-list-view control, so VLV searches are rejected
//!   synchronously with "unwilling to perform".
//! - The `subordinate` and `default` scopes are sent as `subtree`.
//! - StartTLS is only negotiated on `ldap://` URIs; `ldaps://` is already
//!   encrypted.

use std::collections::HashSet;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use directory::{
    result_code, Attribute, BindingMode, ConnectionId, Connector, DirectoryEngine,
    EngineCompletion, EngineError, EngineEvents, EngineSearch, Entry, MessageId, ModOp,
    Modification, PageResult, Scope, SessionSettings,
};
use ldap3::controls::{Control, ControlType, PagedResults, RawControl};
use ldap3::{
    Ldap, LdapConnAsync, LdapConnSettings, LdapError, LdapResult, Mod, SearchEntry, SearchResult,
};
use tracing::{debug, info, warn};

/// Text reported for operations attempted without a session.
pub const SERVER_DOWN_TEXT: &str = "Can't contact LDAP server";

/// Client-side code for a search filter `ldap3` cannot parse.
const FILTER_ERROR: i32 = -7;

/// Creates [`Ldap3Engine`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ldap3Connector;

impl Connector for Ldap3Connector {
    fn create(&self, events: EngineEvents) -> Box<dyn DirectoryEngine> {
        Box::new(Ldap3Engine::new(events))
    }
}

/// A [`DirectoryEngine`] speaking LDAPv3 through `ldap3`.
pub struct Ldap3Engine {
    events: EngineEvents,
    handle: Option<Ldap>,
    connection_id: Option<ConnectionId>,
    next_id: u64,
    /// Bumped whenever the current session is replaced or closed, so the
    /// driver of a superseded session does not report a disconnect.
    generation: Arc<AtomicU64>,
    last_error: (Option<i32>, String),
}

impl Ldap3Engine {
    /// Creates an engine with no session.
    pub fn new(events: EngineEvents) -> Self {
        Self {
            events,
            handle: None,
            connection_id: None,
            next_id: 0,
            generation: Arc::new(AtomicU64::new(0)),
            last_error: (Some(result_code::SERVER_DOWN), SERVER_DOWN_TEXT.to_owned()),
        }
    }

    fn allocate(&mut self) -> MessageId {
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        MessageId::new(self.next_id)
    }

    fn reject(&mut self, code: i32, text: impl Into<String>) -> Option<MessageId> {
        self.last_error = (Some(code), text.into());
        None
    }

    /// Releases the current session without reporting a disconnect.
    fn release(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(mut ldap) = self.handle.take() {
            let connection_id = self.connection_id;
            tokio::spawn(async move {
                if let Err(e) = ldap.unbind().await {
                    debug!(connection_id = ?connection_id, error = %e, "unbind failed");
                }
            });
        }
    }

    /// Runs `op` on its own task and reports its completion.
    fn launch<F, Fut>(&mut self, op: F) -> Option<MessageId>
    where
        F: FnOnce(Ldap, MessageId) -> Fut,
        Fut: Future<Output = EngineCompletion> + Send + 'static,
    {
        let Some(ldap) = self.handle.clone() else {
            return self.reject(result_code::SERVER_DOWN, SERVER_DOWN_TEXT);
        };
        let message_id = self.allocate();
        let events = self.events.clone();
        let operation = op(ldap, message_id);
        tokio::spawn(async move {
            events.completed(operation.await);
        });
        Some(message_id)
    }
}

#[async_trait]
impl DirectoryEngine for Ldap3Engine {
    async fn initialize(&mut self, settings: &SessionSettings) -> Result<(), EngineError> {
        self.release();
        self.connection_id = Some(settings.connection_id);

        let starttls = settings.starttls && !is_ldaps(&settings.uri);
        let conn_settings = LdapConnSettings::new()
            .set_conn_timeout(settings.connect_timeout)
            .set_starttls(starttls);
        let (conn, ldap) = match LdapConnAsync::with_settings(conn_settings, &settings.uri).await {
            Ok(pair) => pair,
            Err(e) => {
                self.last_error = (
                    Some(result_code::SERVER_DOWN),
                    format!("{SERVER_DOWN_TEXT}\n{e}"),
                );
                return Err(EngineError {
                    uri: settings.uri.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let generation = self.generation.load(Ordering::SeqCst);
        let current = Arc::clone(&self.generation);
        let events = self.events.clone();
        let connection_id = settings.connection_id;
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(connection_id = %connection_id, error = %e, "LDAP connection driver error");
            }
            if current.load(Ordering::SeqCst) == generation {
                events.disconnected();
            }
        });

        self.handle = Some(ldap);
        info!(
            connection_id = %connection_id,
            uri = %settings.uri,
            starttls,
            "LDAP session established"
        );
        self.events.reconnected();
        Ok(())
    }

    fn bind(&mut self, dn: &str, password: &str) -> Option<MessageId> {
        let dn = dn.to_owned();
        let password = password.to_owned();
        self.launch(move |mut ldap, id| async move {
            finish(id, ldap.simple_bind(&dn, &password).await)
        })
    }

    fn search(&mut self, request: &EngineSearch) -> Option<MessageId> {
        if request.mode == BindingMode::VirtualListView {
            return self.reject(
                result_code::UNWILLING_TO_PERFORM,
                "Server is unwilling to perform\nvirtual list view searches are not supported",
            );
        }

        let mut controls: Vec<RawControl> = request
            .controls
            .iter()
            .map(|c| RawControl {
                ctype: c.oid.clone(),
                crit: c.critical,
                val: c.value.clone(),
            })
            .collect();
        let paged = request.mode == BindingMode::SimplePagedResults;
        if paged {
            controls.push(
                PagedResults {
                    size: request
                        .page_size
                        .map_or(0, |size| i32::try_from(size).unwrap_or(i32::MAX)),
                    cookie: request
                        .cookie
                        .as_ref()
                        .map(|c| c.as_bytes().to_vec())
                        .unwrap_or_default(),
                }
                .into(),
            );
        }

        let base = request.base.clone();
        let filter = request.filter.clone();
        let attrs = request.attrs.clone();
        let scope = ldap_scope(request.scope);
        self.launch(move |mut ldap, id| async move {
            if !controls.is_empty() {
                ldap.with_controls(controls);
            }
            match ldap.search(&base, scope, &filter, attrs).await {
                Ok(SearchResult(entries, result)) if result.rc == 0 => {
                    let entries = entries
                        .into_iter()
                        .map(|e| into_entry(SearchEntry::construct(e)))
                        .collect();
                    let completion = EngineCompletion::entries(id, entries);
                    if !paged {
                        return completion;
                    }
                    match paged_response(&result) {
                        Ok((cookie, page_result)) => completion.with_page(cookie, page_result),
                        Err(reason) => EngineCompletion::failure(
                            id,
                            Some(result_code::PROTOCOL_ERROR),
                            format!("{}\n{reason}", result_text(result_code::PROTOCOL_ERROR)),
                        ),
                    }
                }
                Ok(SearchResult(_, result)) => failure(id, &result),
                Err(e) => transport_failure(id, &e),
            }
        })
    }

    fn add(&mut self, dn: &str, attrs: &[Attribute]) -> Option<MessageId> {
        let dn = dn.to_owned();
        let attrs: Vec<(String, HashSet<String>)> = attrs
            .iter()
            .map(|a| (a.attr.clone(), a.vals.iter().cloned().collect()))
            .collect();
        self.launch(move |mut ldap, id| async move { finish(id, ldap.add(&dn, attrs).await) })
    }

    fn modify(&mut self, dn: &str, mods: &[Modification]) -> Option<MessageId> {
        let dn = dn.to_owned();
        let mods: Vec<Mod<String>> = mods.iter().map(ldap_mod).collect();
        self.launch(move |mut ldap, id| async move { finish(id, ldap.modify(&dn, mods).await) })
    }

    fn delete(&mut self, dn: &str) -> Option<MessageId> {
        let dn = dn.to_owned();
        self.launch(move |mut ldap, id| async move { finish(id, ldap.delete(&dn).await) })
    }

    fn rename(&mut self, dn: &str, new_rdn: &str) -> Option<MessageId> {
        let dn = dn.to_owned();
        let new_rdn = new_rdn.to_owned();
        self.launch(move |mut ldap, id| async move {
            finish(id, ldap.modifydn(&dn, &new_rdn, true, None).await)
        })
    }

    fn close(&mut self) {
        self.release();
        self.last_error = (Some(result_code::SERVER_DOWN), SERVER_DOWN_TEXT.to_owned());
        debug!(connection_id = ?self.connection_id, "LDAP session closed");
    }

    fn last_error_code(&self) -> Option<i32> {
        self.last_error.0
    }

    fn last_error_string(&self) -> String {
        self.last_error.1.clone()
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn is_ldaps(uri: &str) -> bool {
    uri.get(..8)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("ldaps://"))
}

fn ldap_scope(scope: Scope) -> ldap3::Scope {
    match scope {
        Scope::Base => ldap3::Scope::Base,
        Scope::One => ldap3::Scope::OneLevel,
        Scope::Sub | Scope::Subordinate | Scope::Default => ldap3::Scope::Subtree,
    }
}

fn ldap_mod(m: &Modification) -> Mod<String> {
    let vals: HashSet<String> = m.vals.iter().cloned().collect();
    match m.op {
        ModOp::Add => Mod::Add(m.attr.clone(), vals),
        ModOp::Delete => Mod::Delete(m.attr.clone(), vals),
        ModOp::Replace => Mod::Replace(m.attr.clone(), vals),
    }
}

fn into_entry(entry: SearchEntry) -> Entry {
    Entry {
        dn: entry.dn,
        attrs: entry.attrs.into_iter().collect(),
        bin_attrs: entry.bin_attrs.into_iter().collect(),
    }
}

type PagedResponse = (Option<directory::Cookie>, Option<PageResult>);

/// Extracts the continuation cookie and size estimate of a paged search.
///
/// `ldap3` panics on a response control it cannot decode; that is reported
/// as an error instead.
fn paged_response(result: &LdapResult) -> Result<PagedResponse, String> {
    let raw = result.ctrls.iter().find_map(|Control(kind, raw)| match kind {
        Some(ControlType::PagedResults) if raw.val.is_some() => Some(raw),
        _ => None,
    });
    let paged = match raw {
        Some(raw) => Some(
            panic::catch_unwind(AssertUnwindSafe(|| raw.parse::<PagedResults>()))
                .map_err(|_| "malformed paged results response control".to_owned())?,
        ),
        None => None,
    };
    Ok(match paged {
        Some(paged) => {
            let count = u32::try_from(paged.size).ok().filter(|size| *size > 0);
            let page_result = count.map(|count| PageResult {
                count: Some(count),
                ..PageResult::default()
            });
            (Some(directory::Cookie::new(paged.cookie)), page_result)
        }
        None => (Some(directory::Cookie::default()), None),
    })
}

fn finish(id: MessageId, outcome: Result<LdapResult, LdapError>) -> EngineCompletion {
    match outcome {
        Ok(result) if result.rc == 0 => EngineCompletion::success(id),
        Ok(result) => failure(id, &result),
        Err(e) => transport_failure(id, &e),
    }
}

/// A completion for a non-zero LDAP result code: the standard text for the
/// code, followed by the server's diagnostic message on the next line.
fn failure(id: MessageId, result: &LdapResult) -> EngineCompletion {
    let code = i32::try_from(result.rc).unwrap_or(i32::MAX);
    let headline = result_text(code);
    let message = if result.text.is_empty() {
        headline.to_owned()
    } else {
        format!("{headline}\n{}", result.text)
    };
    EngineCompletion::failure(id, Some(code), message)
}

fn transport_failure(id: MessageId, error: &LdapError) -> EngineCompletion {
    match error {
        LdapError::FilterParsing => {
            EngineCompletion::failure(id, Some(FILTER_ERROR), result_text(FILTER_ERROR))
        }
        LdapError::LdapResult { result } => failure(id, result),
        other => EngineCompletion::failure(
            id,
            Some(result_code::SERVER_DOWN),
            format!("{SERVER_DOWN_TEXT}\n{other}"),
        ),
    }
}

/// Standard description of an LDAP result code.
pub fn result_text(code: i32) -> &'static str {
    match code {
        -7 => "Bad search filter",
        -1 => SERVER_DOWN_TEXT,
        0 => "Success",
        1 => "Operations error",
        2 => "Protocol error",
        3 => "Time limit exceeded",
        4 => "Size limit exceeded",
        7 => "Auth method not supported",
        8 => "Strong(er) authentication required",
        10 => "Referral",
        11 => "Administrative limit exceeded",
        12 => "Critical extension is unavailable",
        16 => "No such attribute",
        17 => "Undefined attribute type",
        18 => "Inappropriate matching",
        19 => "Constraint violation",
        20 => "Type or value exists",
        21 => "Invalid syntax",
        32 => "No such object",
        34 => "Invalid DN syntax",
        48 => "Inappropriate authentication",
        49 => "Invalid credentials",
        50 => "Insufficient access",
        51 => "Server is busy",
        52 => "Server is unavailable",
        53 => "Server is unwilling to perform",
        54 => "Loop detected",
        64 => "Naming violation",
        65 => "Object class violation",
        66 => "Operation not allowed on non-leaf",
        67 => "Operation not allowed on RDN",
        68 => "Already exists",
        69 => "Cannot modify object class",
        80 => "Internal (implementation specific) error",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use directory::{Cookie, EngineEvent};

    use super::*;

    fn engine() -> (Ldap3Engine, tokio::sync::mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = EngineEvents::channel();
        (Ldap3Engine::new(events), rx)
    }

    fn search(mode: BindingMode) -> EngineSearch {
        EngineSearch {
            base: "dc=example,dc=com".into(),
            filter: "(objectClass=*)".into(),
            attrs: vec!["*".into()],
            scope: Scope::Sub,
            controls: Vec::new(),
            mode,
            page_size: Some(10),
            cookie: None,
            offset: Some(0),
            sort: Some("cn".into()),
        }
    }

    #[test]
    fn operations_without_a_session_report_server_down() {
        let (mut engine, _rx) = engine();
        assert_eq!(engine.bind("cn=admin", "secret"), None);
        assert_eq!(engine.delete("cn=x"), None);
        assert_eq!(engine.last_error_code(), Some(-1));
        assert_eq!(engine.last_error_string(), SERVER_DOWN_TEXT);
    }

    #[test]
    fn vlv_searches_are_refused() {
        let (mut engine, _rx) = engine();
        assert_eq!(engine.search(&search(BindingMode::VirtualListView)), None);
        assert_eq!(engine.last_error_code(), Some(53));
        assert!(engine
            .last_error_string()
            .starts_with("Server is unwilling to perform\n"));
    }

    #[tokio::test]
    async fn unreachable_server_fails_initialize() {
        let (mut engine, mut rx) = engine();
        let settings = SessionSettings {
            uri: "ldap://127.0.0.1:1".into(),
            connect_timeout: Duration::from_millis(500),
            starttls: false,
            connection_id: ConnectionId::new(1),
        };
        let err = engine.initialize(&settings).await.expect_err("nothing listens on port 1");
        assert_eq!(err.uri, settings.uri);
        assert_eq!(engine.last_error_code(), Some(-1));
        assert!(engine.last_error_string().starts_with(SERVER_DOWN_TEXT));
        assert!(rx.try_recv().is_err(), "no session, no events");
    }

    #[test]
    fn failures_carry_standard_text_and_server_detail() {
        let result = LdapResult {
            rc: 32,
            matched: "dc=example,dc=com".into(),
            text: "entry ou=missing not found".into(),
            refs: Vec::new(),
            ctrls: Vec::new(),
        };
        let completion = failure(MessageId::new(4), &result);
        assert_eq!(completion.error_code, Some(32));
        assert_eq!(
            completion.error_message.as_deref(),
            Some("No such object\nentry ou=missing not found")
        );

        let bare = LdapResult {
            text: String::new(),
            ..result
        };
        assert_eq!(
            failure(MessageId::new(5), &bare).error_message.as_deref(),
            Some("No such object")
        );
    }

    #[test]
    fn scopes_map_onto_ldap3() {
        assert!(matches!(ldap_scope(Scope::Base), ldap3::Scope::Base));
        assert!(matches!(ldap_scope(Scope::One), ldap3::Scope::OneLevel));
        assert!(matches!(ldap_scope(Scope::Subordinate), ldap3::Scope::Subtree));
    }

    #[test]
    fn ldaps_scheme_is_detected_case_insensitively() {
        assert!(is_ldaps("LDAPS://ldap.example.com"));
        assert!(!is_ldaps("ldap://ldap.example.com"));
        assert!(!is_ldaps("ldaps"));
    }

    #[test]
    fn entries_keep_text_and_binary_values() {
        let entry = into_entry(SearchEntry {
            dn: "uid=alice,dc=example,dc=com".into(),
            attrs: HashMap::from([("cn".to_owned(), vec!["Alice".to_owned()])]),
            bin_attrs: HashMap::from([("jpegPhoto".to_owned(), vec![vec![0xff, 0xd8]])]),
        });
        assert_eq!(entry.first_value("cn"), Some("Alice"));
        assert_eq!(entry.bin_attrs["jpegPhoto"], vec![vec![0xff, 0xd8]]);
    }

    #[test]
    fn paged_search_without_response_control_ends_the_loop() {
        let result = LdapResult {
            rc: 0,
            matched: String::new(),
            text: String::new(),
            refs: Vec::new(),
            ctrls: Vec::new(),
        };
        let (cookie, page_result) = paged_response(&result).expect("no control is not an error");
        assert_eq!(cookie, Some(Cookie::default()));
        assert_eq!(page_result, None);
    }

    #[test]
    fn malformed_paged_control_is_an_error_not_a_panic() {
        let result = LdapResult {
            rc: 0,
            matched: String::new(),
            text: String::new(),
            refs: Vec::new(),
            ctrls: vec![Control(
                Some(ControlType::PagedResults),
                RawControl {
                    ctype: "1.2.840.113556.1.4.319".to_owned(),
                    crit: false,
                    val: Some(vec![0xff]),
                },
            )],
        };
        let err = paged_response(&result).expect_err("undecodable control");
        assert!(err.contains("paged results"));
    }

    #[test]
    fn modifications_map_onto_ldap3() {
        let m = Modification::new(ModOp::Replace, "mail", ["a@example.com"]);
        match ldap_mod(&m) {
            Mod::Replace(attr, vals) => {
                assert_eq!(attr, "mail");
                assert!(vals.contains("a@example.com"));
            }
            _ => panic!("expected a replace"),
        }
    }
}
