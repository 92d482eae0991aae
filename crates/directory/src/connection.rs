//! The connection façade.
//!
//! A [`Connection`] owns one engine and turns its message-id-addressed,
//! event-driven interface into `async` operations. Every accepted operation
//! goes through the [`Correlator`]; every synchronous rejection goes through
//! the deferred-rejection path, so callers always receive engine failures as
//! the awaited result of the operation.
//!
//! ## Ordering
//!
//! The session lock is held while an operation is handed to the engine and
//! registered with the correlator. The dispatcher takes the same lock before
//! delivering a completion, so a completion can never overtake the
//! registration of its own request.
//!
//! After a reconnect, submissions wait for the replayed bind to resolve
//! before they take the lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::binding::{resolve, Resolution, SearchOptions, SearchPage};
use crate::classifier::{classify, rejection_error, Condition};
use crate::config::{ConnectionConfig, DisconnectStrategy};
use crate::correlator::{Correlator, Reply};
use crate::engine::{
    dispatch, Connector, DirectoryEngine, EngineCompletion, EngineEvents, EngineObserver,
    EngineSearch,
};
use crate::errors::{result_code, DirectoryError, StructuredError};
use crate::reconnect::{ReconnectPolicy, Session};
use crate::stats::{OperationKind, Stats, StatsSnapshot};
use crate::{Attribute, BindCredentials, ConnectionId, Entry, MessageId, Modification};

/// A directory connection.
///
/// Cheap to clone; clones share the engine, the pending-request table and the
/// counters.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("uri", &self.inner.config.uri)
            .finish_non_exhaustive()
    }
}

struct Inner {
    id: ConnectionId,
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    stats: Arc<Stats>,
    correlator: Arc<Correlator>,
    policy: ReconnectPolicy,
    session: Mutex<Session>,
    closing: AtomicBool,
    /// Secondary connection used only by find-and-bind.
    auth: Mutex<Option<Connection>>,
}

impl Connection {
    /// Opens a connection: creates an engine through `connector` and
    /// initializes its session.
    pub async fn open(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, DirectoryError> {
        config.validate()?;

        let id = ConnectionId::next();
        let settings = config.session_settings(id);
        let (events, rx) = EngineEvents::channel();
        let mut engine = connector.create(events);
        if let Err(e) = engine.initialize(&settings).await {
            warn!(
                connection_id = %id,
                uri = %config.uri,
                error = %e,
                "cannot initialize directory session"
            );
            return Err(DirectoryError::Protocol(StructuredError {
                message: "Cannot initialize LDAP connection".to_owned(),
                code: Some(result_code::SERVER_DOWN),
                detail: Some(e.reason),
            }));
        }

        let stats = Arc::new(Stats::new());
        let correlator = Arc::new(Correlator::new(
            id,
            config.request_timeout(),
            Arc::clone(&stats),
        ));
        let policy = ReconnectPolicy::new(
            settings,
            config.autoreconnect,
            Arc::clone(&stats),
            Arc::clone(&correlator),
        );
        let inner = Arc::new(Inner {
            id,
            config,
            connector,
            stats,
            correlator,
            policy,
            session: Mutex::new(Session::new(engine)),
            closing: AtomicBool::new(false),
            auth: Mutex::new(None),
        });
        tokio::spawn(dispatch(rx, Arc::downgrade(&inner)));

        info!(
            connection_id = %id,
            uri = %inner.config.uri,
            starttls = inner.config.starttls_enabled(),
            "directory connection opened"
        );
        Ok(Self { inner })
    }

    /// This connection's id.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The configuration the connection was opened with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// A copy of the activity counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Number of requests awaiting a completion.
    pub fn outstanding(&self) -> usize {
        self.inner.correlator.outstanding()
    }

    /// Performs a simple bind.
    ///
    /// The credentials are kept so the reconnect policy can replay them. An
    /// empty `dn` performs an anonymous bind.
    pub async fn bind(&self, dn: &str, password: &str) -> Result<(), DirectoryError> {
        self.inner.stats.operation(OperationKind::Bind);
        debug!(connection_id = %self.inner.id, binddn = %dn, "bind");
        let credentials = BindCredentials::new(dn, password);
        self.inner
            .submit(OperationKind::Bind, move |engine, captured| {
                let message_id = engine.bind(&credentials.binddn, &credentials.password);
                *captured = Some(credentials);
                message_id
            })
            .await
            .map(drop)
    }

    /// Searches the directory.
    ///
    /// Unset fields of `options` fall back to the configured defaults. The
    /// returned page carries the cookie and paging metadata needed for the
    /// next call of a continuation loop (see [`SearchPage::next_options`]).
    pub async fn search(&self, options: &SearchOptions) -> Result<SearchPage, DirectoryError> {
        self.inner.stats.operation(OperationKind::Search);
        let resolution = resolve(options)?;
        let request = self.inner.engine_search(options, resolution);
        debug!(
            connection_id = %self.inner.id,
            base = %request.base,
            filter = %request.filter,
            scope = %request.scope,
            mode = %request.mode,
            "search"
        );
        self.inner
            .submit(OperationKind::Search, move |engine, _| engine.search(&request))
            .await
    }

    /// Adds an entry.
    pub async fn add(&self, dn: &str, attrs: &[Attribute]) -> Result<(), DirectoryError> {
        self.inner.stats.operation(OperationKind::Add);
        require_dn(dn)?;
        if attrs.is_empty() {
            return Err(DirectoryError::invalid_argument("Missing argument: attrs"));
        }
        if attrs.iter().any(|a| a.attr.is_empty()) {
            return Err(DirectoryError::invalid_argument("attribute name must not be empty"));
        }
        debug!(connection_id = %self.inner.id, dn = %dn, attributes = attrs.len(), "add");
        self.inner
            .submit(OperationKind::Add, |engine, _| engine.add(dn, attrs))
            .await
            .map(drop)
    }

    /// Applies modifications to an entry.
    pub async fn modify(&self, dn: &str, mods: &[Modification]) -> Result<(), DirectoryError> {
        self.inner.stats.operation(OperationKind::Modify);
        require_dn(dn)?;
        if mods.is_empty() {
            return Err(DirectoryError::invalid_argument("Missing argument: modifications"));
        }
        if mods.iter().any(|m| m.attr.is_empty()) {
            return Err(DirectoryError::invalid_argument("attribute name must not be empty"));
        }
        debug!(connection_id = %self.inner.id, dn = %dn, modifications = mods.len(), "modify");
        self.inner
            .submit(OperationKind::Modify, |engine, _| engine.modify(dn, mods))
            .await
            .map(drop)
    }

    /// Deletes an entry.
    #[doc(alias = "remove")]
    pub async fn delete(&self, dn: &str) -> Result<(), DirectoryError> {
        self.inner.stats.operation(OperationKind::Delete);
        require_dn(dn)?;
        debug!(connection_id = %self.inner.id, dn = %dn, "delete");
        self.inner
            .submit(OperationKind::Delete, |engine, _| engine.delete(dn))
            .await
            .map(drop)
    }

    /// Renames an entry within its parent.
    pub async fn rename(&self, dn: &str, new_rdn: &str) -> Result<(), DirectoryError> {
        self.inner.stats.operation(OperationKind::Rename);
        require_dn(dn)?;
        if new_rdn.is_empty() {
            return Err(DirectoryError::invalid_argument("Missing argument: new rdn"));
        }
        debug!(connection_id = %self.inner.id, dn = %dn, new_rdn = %new_rdn, "rename");
        self.inner
            .submit(OperationKind::Rename, |engine, _| engine.rename(dn, new_rdn))
            .await
            .map(drop)
    }

    /// Locates exactly one entry by search and authenticates as it.
    ///
    /// The bind runs on a secondary connection created on first use, so this
    /// connection's own bind identity is unchanged. The bind DN is the first
    /// value of the first listed attribute the entry has, or the entry's DN
    /// when no listed attribute is populated.
    pub async fn findandbind(
        &self,
        options: &SearchOptions,
        password: &str,
    ) -> Result<Entry, DirectoryError> {
        if password.is_empty() {
            return Err(DirectoryError::invalid_argument("Missing argument: password"));
        }
        if options.filter.as_deref().map_or(true, str::is_empty) {
            return Err(DirectoryError::invalid_argument("Missing argument: filter"));
        }

        let page = self.search(options).await?;
        let [entry] = <[Entry; 1]>::try_from(page.entries).map_err(|entries| {
            DirectoryError::AmbiguousOrMissingEntry {
                count: entries.len(),
            }
        })?;

        let binddn = bind_dn(&entry, options.attrs.as_deref().unwrap_or_default());
        debug!(
            connection_id = %self.inner.id,
            dn = %entry.dn,
            binddn = %binddn,
            "find-and-bind located entry"
        );
        let auth = self.auth_connection().await?;
        auth.bind(&binddn, password).await?;
        Ok(entry)
    }

    /// Closes the connection.
    ///
    /// The secondary connection is closed first. Requests still pending are
    /// resolved with [`DirectoryError::Closed`], as is every later operation.
    /// Disconnect notifications arriving during or after close never trigger a
    /// reconnect.
    pub async fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);

        let auth = self.inner.auth.lock().await.take();
        if let Some(auth) = auth {
            Box::pin(auth.close()).await;
        }

        let mut session = self.inner.session.lock().await;
        let drained = self.inner.correlator.drain(&DirectoryError::Closed);
        if let Some(mut engine) = session.engine.take() {
            engine.close();
        }
        info!(
            connection_id = %self.inner.id,
            drained,
            "directory connection closed"
        );
        self.inner.closing.store(false, Ordering::SeqCst);
    }

    /// Returns the find-and-bind connection, opening it on first use.
    async fn auth_connection(&self) -> Result<Connection, DirectoryError> {
        let mut slot = self.inner.auth.lock().await;
        if let Some(auth) = slot.as_ref() {
            return Ok(auth.clone());
        }
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(DirectoryError::Closed);
        }
        let auth = Connection::open(
            self.inner.config.for_auth_connection(),
            Arc::clone(&self.inner.connector),
        )
        .await?;
        debug!(
            connection_id = %self.inner.id,
            auth_connection_id = %auth.id(),
            "opened find-and-bind connection"
        );
        *slot = Some(auth.clone());
        Ok(auth)
    }
}

impl Inner {
    /// Hands an operation to the engine and waits for its resolution.
    ///
    /// `op` receives the engine and the captured bind credentials, and returns
    /// the engine's message id or `None` for a synchronous rejection.
    async fn submit<F>(self: &Arc<Self>, kind: OperationKind, op: F) -> Reply
    where
        F: FnOnce(&mut dyn DirectoryEngine, &mut Option<BindCredentials>) -> Option<MessageId>
            + Send,
    {
        let reply = {
            let mut session = self.ready_session().await;
            let Session {
                engine,
                credentials,
                epoch,
                ..
            } = &mut *session;
            let Some(engine) = engine.as_mut() else {
                return Err(DirectoryError::Closed);
            };
            match op(&mut **engine, credentials) {
                Some(message_id) => {
                    debug!(
                        connection_id = %self.id,
                        message_id = %message_id,
                        operation = %kind,
                        "operation accepted"
                    );
                    self.correlator.register(message_id)
                }
                None => {
                    let code = engine.last_error_code();
                    let text = engine.last_error_string();
                    self.defer_rejection(kind, *epoch, code, text)
                }
            }
        };
        reply.await.unwrap_or(Err(DirectoryError::Closed))
    }

    /// Locks the session once no replayed bind is outstanding.
    async fn ready_session(&self) -> MutexGuard<'_, Session> {
        loop {
            let mut session = self.session.lock().await;
            let Some(mut rebind) = session.pending_rebind() else {
                return session;
            };
            drop(session);
            debug!(connection_id = %self.id, "waiting for re-bind before submitting");
            let _ = rebind.wait_for(|done| *done).await;
        }
    }

    /// Handles a synchronous rejection on a later scheduling turn.
    ///
    /// `epoch` is the session epoch the rejection was observed in.
    fn defer_rejection(
        self: &Arc<Self>,
        kind: OperationKind,
        epoch: u64,
        code: Option<i32>,
        text: String,
    ) -> oneshot::Receiver<Reply> {
        self.stats.error();
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let error = inner.handle_rejection(kind, epoch, code, &text).await;
            let _ = tx.send(Err(error));
        });
        rx
    }

    async fn handle_rejection(
        &self,
        kind: OperationKind,
        epoch: u64,
        code: Option<i32>,
        text: &str,
    ) -> DirectoryError {
        debug!(
            connection_id = %self.id,
            operation = %kind,
            code = ?code,
            error = %text.trim(),
            "operation rejected by engine"
        );
        match classify(code, text) {
            Condition::InsufficientAccess => {
                warn!(
                    connection_id = %self.id,
                    operation = %kind,
                    "insufficient access; closing the directory session"
                );
                let mut session = self.session.lock().await;
                if let Some(engine) = session.engine.as_mut() {
                    engine.close();
                }
            }
            Condition::CannotContactServer => {
                let mut session = self.session.lock().await;
                let closing = self.closing.load(Ordering::SeqCst);
                self.policy.reestablish(closing, epoch, &mut session).await;
            }
            Condition::Other => {}
        }
        DirectoryError::Protocol(rejection_error(code, text))
    }

    fn engine_search(&self, options: &SearchOptions, resolution: Resolution) -> EngineSearch {
        let defaults = &self.config;
        EngineSearch {
            base: options.base.clone().unwrap_or_else(|| defaults.base.clone()),
            filter: options
                .filter
                .clone()
                .unwrap_or_else(|| defaults.filter.clone()),
            attrs: options
                .attrs
                .clone()
                .filter(|attrs| !attrs.is_empty())
                .unwrap_or_else(|| defaults.attrs.clone()),
            scope: options.scope.unwrap_or(defaults.scope),
            controls: options.controls.clone(),
            mode: resolution.mode,
            page_size: options.page_size,
            cookie: options.cookie.clone(),
            offset: options.offset,
            sort: resolution.sort,
        }
    }
}

#[async_trait]
impl EngineObserver for Inner {
    async fn on_result(&self, completion: EngineCompletion) {
        let _session = self.session.lock().await;
        self.correlator.deliver(completion);
    }

    async fn on_reconnect(&self) {
        info!(connection_id = %self.id, uri = %self.config.uri, "directory session established");
        if let Some(hook) = &self.config.hooks.on_reconnect {
            hook(self.id);
        }
    }

    async fn on_disconnect(&self) {
        self.stats.disconnect();
        match &self.config.hooks.on_disconnect {
            DisconnectStrategy::AutoReconnect => {
                let mut session = self.session.lock().await;
                let closing = self.closing.load(Ordering::SeqCst);
                if closing || session.engine.is_none() {
                    debug!(connection_id = %self.id, "disconnect after close ignored");
                    return;
                }
                warn!(connection_id = %self.id, "directory session lost");
                let epoch = session.epoch;
                self.policy.reestablish(closing, epoch, &mut session).await;
            }
            DisconnectStrategy::Ignore => {
                debug!(connection_id = %self.id, "directory session lost; reconnect disabled");
            }
            DisconnectStrategy::Custom(hook) => hook(self.id),
        }
    }
}

fn require_dn(dn: &str) -> Result<(), DirectoryError> {
    if dn.is_empty() {
        return Err(DirectoryError::invalid_argument("Missing argument: dn"));
    }
    Ok(())
}

/// Picks the DN find-and-bind authenticates as.
fn bind_dn(entry: &Entry, attrs: &[String]) -> String {
    attrs
        .iter()
        .find_map(|attr| entry.first_value(attr))
        .unwrap_or(entry.dn.as_str())
        .to_owned()
}
