//! Request correlation: pending requests keyed by message id.
//!
//! Every operation the engine accepts is registered here with a timer. The
//! request is then resolved exactly once, by whichever of these happens
//! first:
//!
//! - the engine delivers a completion for its id ([`Correlator::deliver`]),
//! - the request timeout fires ([`Correlator::expire`]),
//! - the connection closes ([`Correlator::drain`]).
//!
//! Each path removes the entry from the table before resolving it, so the
//! remove is the single point of arbitration. A completion for an id that is
//! no longer in the table is a late response: counted and dropped.
//!
//! Synchronous engine rejections never reach this table; the connection
//! handles them on the deferred-rejection path.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::binding::SearchPage;
use crate::engine::EngineCompletion;
use crate::errors::{DirectoryError, StructuredError};
use crate::stats::Stats;
use crate::{ConnectionId, MessageId};

/// What a pending request resolves to.
pub type Reply = Result<SearchPage, DirectoryError>;

struct PendingRequest {
    reply: oneshot::Sender<Reply>,
    timer: Option<AbortHandle>,
    enqueued_at: Instant,
}

impl PendingRequest {
    fn resolve(self, reply: Reply) -> bool {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        self.reply.send(reply).is_ok()
    }
}

/// The pending-request table of one connection.
pub struct Correlator {
    connection_id: ConnectionId,
    timeout: Duration,
    stats: Arc<Stats>,
    pending: DashMap<MessageId, PendingRequest>,
}

impl Correlator {
    /// Creates an empty table whose requests expire after `timeout`.
    pub fn new(connection_id: ConnectionId, timeout: Duration, stats: Arc<Stats>) -> Self {
        Self {
            connection_id,
            timeout,
            stats,
            pending: DashMap::new(),
        }
    }

    /// Registers an accepted request and arms its timeout.
    ///
    /// The returned receiver yields the request's single resolution.
    pub fn register(self: &Arc<Self>, message_id: MessageId) -> oneshot::Receiver<Reply> {
        let (reply, receiver) = oneshot::channel();
        let request = PendingRequest {
            reply,
            timer: None,
            enqueued_at: Instant::now(),
        };
        if let Some(previous) = self.pending.insert(message_id, request) {
            warn!(
                connection_id = %self.connection_id,
                message_id = %message_id,
                "engine reused an outstanding message id; dropping the older request"
            );
            previous.resolve(Err(DirectoryError::Closed));
        }

        let timer = spawn_timer(Arc::downgrade(self), message_id, self.timeout);
        match self.pending.get_mut(&message_id) {
            Some(mut entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }

        self.stats.request();
        debug!(
            connection_id = %self.connection_id,
            message_id = %message_id,
            outstanding = self.pending.len(),
            "request enqueued"
        );
        receiver
    }

    /// Resolves the request a completion belongs to.
    pub fn deliver(&self, completion: EngineCompletion) {
        self.stats.result();
        let message_id = completion.message_id;
        let Some((_, request)) = self.pending.remove(&message_id) else {
            self.stats.late_response();
            debug!(
                connection_id = %self.connection_id,
                message_id = %message_id,
                "late response dropped"
            );
            return;
        };

        let elapsed = request.enqueued_at.elapsed();
        let reply = completion_reply(completion);
        debug!(
            connection_id = %self.connection_id,
            message_id = %message_id,
            elapsed_ms = elapsed.as_millis() as u64,
            ok = reply.is_ok(),
            "request completed"
        );
        if !request.resolve(reply) {
            debug!(
                connection_id = %self.connection_id,
                message_id = %message_id,
                "caller stopped waiting before completion"
            );
        }
    }

    /// Resolves a request with [`DirectoryError::Timeout`] if it is still
    /// pending.
    pub fn expire(&self, message_id: MessageId) {
        let Some((_, request)) = self.pending.remove(&message_id) else {
            return;
        };
        self.stats.timeout();
        warn!(
            connection_id = %self.connection_id,
            message_id = %message_id,
            timeout_ms = self.timeout.as_millis() as u64,
            "request timed out"
        );
        request.resolve(Err(DirectoryError::Timeout { message_id }));
    }

    /// Resolves every pending request with `error`, returning how many there
    /// were.
    pub fn drain(&self, error: &DirectoryError) -> usize {
        let ids: Vec<MessageId> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut drained = 0;
        for message_id in ids {
            if let Some((_, request)) = self.pending.remove(&message_id) {
                request.resolve(Err(error.clone()));
                drained += 1;
            }
        }
        drained
    }

    /// Number of requests awaiting resolution.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if `message_id` is awaiting resolution.
    pub fn is_pending(&self, message_id: MessageId) -> bool {
        self.pending.contains_key(&message_id)
    }
}

fn spawn_timer(
    correlator: Weak<Correlator>,
    message_id: MessageId,
    timeout: Duration,
) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(correlator) = correlator.upgrade() {
            correlator.expire(message_id);
        }
    })
    .abort_handle()
}

fn completion_reply(completion: EngineCompletion) -> Reply {
    match completion.error_message.filter(|message| !message.is_empty()) {
        Some(message) => Err(DirectoryError::Protocol(StructuredError::from_engine(
            completion.error_code,
            &message,
        ))),
        None => Ok(SearchPage {
            entries: completion.entries,
            cookie: completion.cookie,
            page_result: completion.page_result,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Entry;

    fn correlator(timeout_ms: u64) -> Arc<Correlator> {
        Arc::new(Correlator::new(
            ConnectionId::new(1),
            Duration::from_millis(timeout_ms),
            Arc::new(Stats::new()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn completion_resolves_and_cancels_the_timer() {
        let table = correlator(2_000);
        let id = MessageId::new(1);
        let rx = table.register(id);

        table.deliver(EngineCompletion::entries(id, vec![Entry::new("cn=a")]));
        let page = rx.await.expect("resolved").expect("success");
        assert_eq!(page.entries.len(), 1);
        assert_eq!(table.outstanding(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let stats = table.stats.snapshot();
        assert_eq!(stats.timeouts, 0);
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.results, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_after_timeout_is_a_late_response() {
        let table = correlator(100);
        let id = MessageId::new(9);
        let rx = table.register(id);

        let err = rx.await.expect("resolved").expect_err("must time out");
        assert_eq!(err, DirectoryError::Timeout { message_id: id });
        assert!(!table.is_pending(id));

        table.deliver(EngineCompletion::success(id));
        let stats = table.stats.snapshot();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.late_responses, 1);
    }

    #[tokio::test]
    async fn error_message_becomes_a_structured_error() {
        let table = correlator(2_000);
        let id = MessageId::new(3);
        let rx = table.register(id);

        table.deliver(EngineCompletion::failure(
            id,
            Some(68),
            "Already exists\nentry cn=a exists",
        ));
        let err = rx.await.expect("resolved").expect_err("failure");
        let structured = match err {
            DirectoryError::Protocol(structured) => structured,
            other => panic!("expected a protocol error, got {other:?}"),
        };
        assert_eq!(structured.code, Some(68));
        assert_eq!(structured.message, "Already exists");
        assert_eq!(structured.detail.as_deref(), Some("entry cn=a exists"));
    }

    #[tokio::test]
    async fn empty_error_message_counts_as_success() {
        let table = correlator(2_000);
        let id = MessageId::new(4);
        let rx = table.register(id);
        table.deliver(EngineCompletion::failure(id, Some(0), ""));
        assert!(rx.await.expect("resolved").is_ok());
    }

    #[tokio::test]
    async fn drain_resolves_everything_once() {
        let table = correlator(2_000);
        let receivers: Vec<_> = (1..=3).map(|n| table.register(MessageId::new(n))).collect();

        assert_eq!(table.drain(&DirectoryError::Closed), 3);
        for rx in receivers {
            assert_eq!(rx.await.expect("resolved"), Err(DirectoryError::Closed));
        }
        assert_eq!(table.drain(&DirectoryError::Closed), 0);
    }
}
