//! The reconnect policy.
//!
//! Runs when the engine reports an unexpected disconnect and on the
//! cannot-contact-server rejection path. The session is re-initialized with
//! the stored settings and, when auto-reconnect is on and a bind has been
//! made, the last credentials are replayed.
//!
//! Every successful re-initialization advances the session epoch. Callers pass
//! the epoch they observed the failure in, so several failures caused by one
//! lost session trigger a single reconnect.
//!
//! While a replayed bind is outstanding the session is gated: submissions wait
//! for the bind to resolve (it is tracked by the correlator, so it resolves
//! within the request timeout) before reaching the engine.
//!
//! Nobody is waiting on a reconnect, so failures are logged and counted in
//! [`Stats`] and otherwise swallowed. The next disconnect notification tries
//! again; nothing retries on a timer.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::correlator::Correlator;
use crate::engine::{DirectoryEngine, SessionSettings};
use crate::errors::DirectoryError;
use crate::stats::Stats;
use crate::{BindCredentials, ConnectionId, MessageId};

/// Engine handle plus the state replayed after a reconnect.
///
/// `engine` is `None` once the connection has been closed.
pub(crate) struct Session {
    pub(crate) engine: Option<Box<dyn DirectoryEngine>>,
    pub(crate) credentials: Option<BindCredentials>,
    /// Number of successful re-initializations.
    pub(crate) epoch: u64,
    /// Set while a replayed bind is outstanding; flips to `true` once it
    /// resolves.
    rebind: Option<watch::Receiver<bool>>,
}

impl Session {
    pub(crate) fn new(engine: Box<dyn DirectoryEngine>) -> Self {
        Self {
            engine: Some(engine),
            credentials: None,
            epoch: 0,
            rebind: None,
        }
    }

    /// The gate of an outstanding replayed bind, if any.
    pub(crate) fn pending_rebind(&mut self) -> Option<watch::Receiver<bool>> {
        if self.rebind.as_ref().is_some_and(|gate| !*gate.borrow()) {
            return self.rebind.clone();
        }
        self.rebind = None;
        None
    }
}

/// What a reconnect attempt achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The connection is closed or closing, or the session was already
    /// re-established since the failure was observed; nothing was attempted.
    Skipped,
    /// The session was re-initialized; no bind needed replaying.
    Reinitialized,
    /// The session was re-initialized and the last bind re-issued.
    Rebinding(MessageId),
    /// Re-initialization or the re-bind submission failed.
    Failed,
}

/// Re-establishes sessions for one connection.
pub(crate) struct ReconnectPolicy {
    connection_id: ConnectionId,
    settings: SessionSettings,
    autoreconnect: bool,
    stats: Arc<Stats>,
    correlator: Arc<Correlator>,
}

impl ReconnectPolicy {
    pub(crate) fn new(
        settings: SessionSettings,
        autoreconnect: bool,
        stats: Arc<Stats>,
        correlator: Arc<Correlator>,
    ) -> Self {
        Self {
            connection_id: settings.connection_id,
            settings,
            autoreconnect,
            stats,
            correlator,
        }
    }

    /// Re-initializes the session unless the connection is shutting down or
    /// the session has moved past `observed`, the epoch the failure was seen
    /// in.
    ///
    /// The caller holds the session lock, so no operation can be submitted
    /// against a half-initialized engine.
    pub(crate) async fn reestablish(
        &self,
        closing: bool,
        observed: u64,
        session: &mut Session,
    ) -> Outcome {
        if closing {
            return Outcome::Skipped;
        }
        if session.epoch != observed {
            debug!(
                connection_id = %self.connection_id,
                observed,
                epoch = session.epoch,
                "session already re-established"
            );
            return Outcome::Skipped;
        }
        let Some(engine) = session.engine.as_mut() else {
            return Outcome::Skipped;
        };

        self.stats.reconnect();
        info!(
            connection_id = %self.connection_id,
            uri = %self.settings.uri,
            "re-establishing directory session"
        );
        if let Err(e) = engine.initialize(&self.settings).await {
            self.stats.reconnect_failure();
            warn!(
                connection_id = %self.connection_id,
                error = %e,
                "reconnect failed"
            );
            return Outcome::Failed;
        }
        session.epoch += 1;

        let credentials = match &session.credentials {
            Some(credentials) if self.autoreconnect => credentials,
            _ => return Outcome::Reinitialized,
        };
        let Some(message_id) = engine.bind(&credentials.binddn, &credentials.password) else {
            self.stats.reconnect_failure();
            warn!(
                connection_id = %self.connection_id,
                binddn = %credentials.binddn,
                code = ?engine.last_error_code(),
                error = %engine.last_error_string(),
                "re-bind after reconnect was rejected"
            );
            return Outcome::Failed;
        };

        session.rebind = Some(self.watch_rebind(message_id, &credentials.binddn));
        Outcome::Rebinding(message_id)
    }

    /// Tracks a replayed bind so its completion is not counted as a late
    /// response, and records its failure. The returned gate flips once the
    /// bind has resolved.
    fn watch_rebind(&self, message_id: MessageId, binddn: &str) -> watch::Receiver<bool> {
        let reply = self.correlator.register(message_id);
        let (done, gate) = watch::channel(false);
        let stats = Arc::clone(&self.stats);
        let connection_id = self.connection_id;
        let binddn = binddn.to_owned();
        tokio::spawn(async move {
            match reply.await {
                Ok(Ok(_)) => info!(
                    connection_id = %connection_id,
                    message_id = %message_id,
                    binddn = %binddn,
                    "re-bind after reconnect succeeded"
                ),
                Ok(Err(DirectoryError::Closed)) | Err(_) => {}
                Ok(Err(e)) => {
                    stats.reconnect_failure();
                    warn!(
                        connection_id = %connection_id,
                        message_id = %message_id,
                        binddn = %binddn,
                        error = %e,
                        "re-bind after reconnect failed"
                    );
                }
            }
            let _ = done.send(true);
        });
        gate
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::engine::{EngineCompletion, EngineError, EngineSearch};
    use crate::{Attribute, Modification};

    #[derive(Default)]
    struct Calls {
        initialized: usize,
        binds: Vec<String>,
    }

    struct FakeEngine {
        calls: Arc<Mutex<Calls>>,
        fail_init: bool,
        reject_bind: bool,
    }

    #[async_trait]
    impl DirectoryEngine for FakeEngine {
        async fn initialize(&mut self, settings: &SessionSettings) -> Result<(), EngineError> {
            self.calls.lock().unwrap().initialized += 1;
            if self.fail_init {
                return Err(EngineError {
                    uri: settings.uri.clone(),
                    reason: "connection refused".into(),
                });
            }
            Ok(())
        }
        fn bind(&mut self, dn: &str, _password: &str) -> Option<MessageId> {
            self.calls.lock().unwrap().binds.push(dn.to_owned());
            (!self.reject_bind).then(|| MessageId::new(77))
        }
        fn search(&mut self, _: &EngineSearch) -> Option<MessageId> {
            None
        }
        fn add(&mut self, _: &str, _: &[Attribute]) -> Option<MessageId> {
            None
        }
        fn modify(&mut self, _: &str, _: &[Modification]) -> Option<MessageId> {
            None
        }
        fn delete(&mut self, _: &str) -> Option<MessageId> {
            None
        }
        fn rename(&mut self, _: &str, _: &str) -> Option<MessageId> {
            None
        }
        fn close(&mut self) {}
        fn last_error_code(&self) -> Option<i32> {
            Some(-1)
        }
        fn last_error_string(&self) -> String {
            "Can't contact LDAP server".into()
        }
    }

    fn fixture(
        autoreconnect: bool,
        fail_init: bool,
        reject_bind: bool,
    ) -> (ReconnectPolicy, Session, Arc<Mutex<Calls>>, Arc<Correlator>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let stats = Arc::new(Stats::new());
        let id = ConnectionId::new(5);
        let correlator = Arc::new(Correlator::new(id, Duration::from_secs(2), Arc::clone(&stats)));
        let settings = SessionSettings {
            uri: "ldap://localhost".into(),
            connect_timeout: Duration::from_secs(1),
            starttls: false,
            connection_id: id,
        };
        let policy = ReconnectPolicy::new(settings, autoreconnect, stats, Arc::clone(&correlator));
        let session = Session::new(Box::new(FakeEngine {
            calls: Arc::clone(&calls),
            fail_init,
            reject_bind,
        }));
        (policy, session, calls, correlator)
    }

    #[tokio::test]
    async fn closing_or_released_sessions_are_left_alone() {
        let (policy, mut session, calls, _) = fixture(true, false, false);
        assert_eq!(policy.reestablish(true, session.epoch, &mut session).await, Outcome::Skipped);

        session.engine = None;
        assert_eq!(policy.reestablish(false, session.epoch, &mut session).await, Outcome::Skipped);
        assert_eq!(calls.lock().unwrap().initialized, 0);
        assert_eq!(policy.stats.snapshot().reconnects, 0);
    }

    #[tokio::test]
    async fn last_bind_is_replayed_and_tracked() {
        let (policy, mut session, calls, correlator) = fixture(true, false, false);
        session.credentials = Some(BindCredentials::new("cn=admin", "secret"));

        let outcome = policy.reestablish(false, session.epoch, &mut session).await;
        assert_eq!(outcome, Outcome::Rebinding(MessageId::new(77)));
        assert_eq!(calls.lock().unwrap().binds, vec!["cn=admin"]);
        assert!(correlator.is_pending(MessageId::new(77)));

        let mut gate = session.pending_rebind().expect("rebind gates the session");
        correlator.deliver(EngineCompletion::success(MessageId::new(77)));
        gate.wait_for(|done| *done).await.expect("watcher reports");
        assert!(session.pending_rebind().is_none());
        assert_eq!(policy.stats.snapshot().late_responses, 0);
    }

    #[tokio::test]
    async fn stale_failures_do_not_reconnect_again() {
        let (policy, mut session, calls, _) = fixture(true, false, false);
        let observed = session.epoch;

        assert_eq!(
            policy.reestablish(false, observed, &mut session).await,
            Outcome::Reinitialized
        );
        assert_eq!(session.epoch, observed + 1);
        assert_eq!(
            policy.reestablish(false, observed, &mut session).await,
            Outcome::Skipped
        );
        assert_eq!(calls.lock().unwrap().initialized, 1);
        assert_eq!(policy.stats.snapshot().reconnects, 1);
    }

    #[tokio::test]
    async fn failed_reinitialize_keeps_the_epoch() {
        let (policy, mut session, _, _) = fixture(true, true, false);
        assert_eq!(policy.reestablish(false, 0, &mut session).await, Outcome::Failed);
        assert_eq!(session.epoch, 0);
    }

    #[tokio::test]
    async fn no_rebind_without_autoreconnect_or_credentials() {
        let (policy, mut session, calls, _) = fixture(true, false, false);
        assert_eq!(
            policy.reestablish(false, session.epoch, &mut session).await,
            Outcome::Reinitialized
        );

        let (policy, mut session, _, _) = fixture(false, false, false);
        session.credentials = Some(BindCredentials::new("cn=admin", "secret"));
        assert_eq!(
            policy.reestablish(false, session.epoch, &mut session).await,
            Outcome::Reinitialized
        );
        assert!(calls.lock().unwrap().binds.is_empty());
    }

    #[tokio::test]
    async fn failures_are_counted_not_raised() {
        let (policy, mut session, _, _) = fixture(true, true, false);
        assert_eq!(policy.reestablish(false, session.epoch, &mut session).await, Outcome::Failed);
        let stats = policy.stats.snapshot();
        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.reconnect_failures, 1);

        let (policy, mut session, _, _) = fixture(true, false, true);
        session.credentials = Some(BindCredentials::new("cn=admin", "secret"));
        assert_eq!(policy.reestablish(false, session.epoch, &mut session).await, Outcome::Failed);
        assert_eq!(policy.stats.snapshot().reconnect_failures, 1);
    }

    #[tokio::test]
    async fn failed_rebind_completion_is_counted() {
        let (policy, mut session, _, correlator) = fixture(true, false, false);
        session.credentials = Some(BindCredentials::new("cn=admin", "wrong"));
        policy.reestablish(false, session.epoch, &mut session).await;

        correlator.deliver(EngineCompletion::failure(
            MessageId::new(77),
            Some(49),
            "Invalid credentials",
        ));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(policy.stats.snapshot().reconnect_failures, 1);
    }
}
