//! Scripted in-memory directory engine for integration tests.
//!
//! Every engine created through [`Script::connector`] records its calls in a
//! shared [`Script`]. Tests decide how each call is answered: automatically
//! through a responder, by rejecting it synchronously, or by completing it
//! later by hand with [`Script::complete`].

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use directory::{
    Attribute, ConnectionConfig, Connector, DirectoryEngine, EngineCompletion, EngineError,
    EngineEvents, EngineSearch, Entry, MessageId, Modification, SessionSettings,
};

pub const URI: &str = "ldap://directory.test:389";
pub const SERVER_DOWN_TEXT: &str = "Can't contact LDAP server";

/// One engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Initialize { uri: String, starttls: bool },
    Bind { dn: String, password: String },
    Search(EngineSearch),
    Add { dn: String, attrs: Vec<Attribute> },
    Modify { dn: String, mods: Vec<Modification> },
    Delete { dn: String },
    Rename { dn: String, new_rdn: String },
    Close,
}

/// A recorded engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Index of the engine in creation order.
    pub engine: usize,
    pub op: Op,
    /// Id assigned by the engine; `None` for rejected calls and for
    /// initialize/close.
    pub message_id: Option<MessageId>,
}

/// How a responder answers an accepted operation.
#[derive(Debug, Clone)]
pub enum Answer {
    Entries(Vec<Entry>),
    Done,
    Fail(i32, String),
}

type Responder = Box<dyn Fn(&Op) -> Option<Answer> + Send + Sync>;

#[derive(Default)]
struct State {
    next_id: u64,
    calls: Vec<Call>,
    engines: Vec<EngineEvents>,
    routes: HashMap<MessageId, usize>,
    rejections: VecDeque<(Option<i32>, String)>,
    failed_inits: usize,
    responder: Option<Responder>,
}

/// Shared script driving every engine created by its connector.
#[derive(Clone, Default)]
pub struct Script {
    state: Arc<Mutex<State>>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("script lock poisoned")
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(ScriptedConnector {
            script: self.clone(),
        })
    }

    /// Answers accepted operations automatically. Operations the responder
    /// returns `None` for stay pending until completed by hand.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&Op) -> Option<Answer> + Send + Sync + 'static,
    {
        self.state().responder = Some(Box::new(responder));
    }

    /// Rejects the next operation synchronously with the given last error.
    pub fn reject_next(&self, code: Option<i32>, text: &str) {
        self.state().rejections.push_back((code, text.to_owned()));
    }

    /// Makes the next `initialize` call fail.
    pub fn fail_next_initialize(&self) {
        self.state().failed_inits += 1;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Recorded calls matching `predicate`.
    pub fn calls_where(&self, predicate: impl Fn(&Call) -> bool) -> Vec<Call> {
        self.state().calls.iter().filter(|c| predicate(c)).cloned().collect()
    }

    pub fn initializations(&self, engine: usize) -> usize {
        self.calls_where(|c| c.engine == engine && matches!(c.op, Op::Initialize { .. }))
            .len()
    }

    pub fn binds(&self, engine: usize) -> Vec<(String, String)> {
        self.calls_where(|c| c.engine == engine)
            .into_iter()
            .filter_map(|c| match c.op {
                Op::Bind { dn, password } => Some((dn, password)),
                _ => None,
            })
            .collect()
    }

    pub fn searches(&self) -> Vec<EngineSearch> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c.op {
                Op::Search(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    /// Ids of accepted searches, in submission order.
    pub fn search_ids(&self) -> Vec<MessageId> {
        self.calls_where(|c| matches!(c.op, Op::Search(_)))
            .into_iter()
            .filter_map(|c| c.message_id)
            .collect()
    }

    pub fn closed(&self, engine: usize) -> bool {
        !self
            .calls_where(|c| c.engine == engine && c.op == Op::Close)
            .is_empty()
    }

    /// Delivers a completion through the engine that issued its id.
    pub fn complete(&self, completion: EngineCompletion) {
        let state = self.state();
        let engine = state.routes.get(&completion.message_id).copied().unwrap_or(0);
        state.engines[engine].completed(completion);
    }

    /// Reports an unexpected loss of session on `engine`.
    pub fn disconnect(&self, engine: usize) {
        self.state().engines[engine].disconnected();
    }

    fn register_engine(&self, events: EngineEvents) -> usize {
        let mut state = self.state();
        state.engines.push(events);
        state.engines.len() - 1
    }
}

struct ScriptedConnector {
    script: Script,
}

impl Connector for ScriptedConnector {
    fn create(&self, events: EngineEvents) -> Box<dyn DirectoryEngine> {
        let index = self.script.register_engine(events.clone());
        Box::new(ScriptedEngine {
            index,
            events,
            script: self.script.clone(),
            closed: true,
            last_error: (None, String::new()),
        })
    }
}

/// Engine answering from a [`Script`].
///
/// Before `initialize` and after `close` every operation is rejected with the
/// server-down code.
struct ScriptedEngine {
    index: usize,
    events: EngineEvents,
    script: Script,
    closed: bool,
    last_error: (Option<i32>, String),
}

impl ScriptedEngine {
    fn submit(&mut self, op: Op) -> Option<MessageId> {
        let mut state = self.script.state();
        let rejection = if self.closed {
            Some((Some(-1), SERVER_DOWN_TEXT.to_owned()))
        } else {
            state.rejections.pop_front()
        };
        if let Some(error) = rejection {
            self.last_error = error;
            state.calls.push(Call {
                engine: self.index,
                op,
                message_id: None,
            });
            return None;
        }

        state.next_id += 1;
        let message_id = MessageId::new(state.next_id);
        state.routes.insert(message_id, self.index);
        let answer = state.responder.as_ref().and_then(|respond| respond(&op));
        state.calls.push(Call {
            engine: self.index,
            op,
            message_id: Some(message_id),
        });
        drop(state);

        if let Some(answer) = answer {
            let completion = match answer {
                Answer::Entries(entries) => EngineCompletion::entries(message_id, entries),
                Answer::Done => EngineCompletion::success(message_id),
                Answer::Fail(code, text) => EngineCompletion::failure(message_id, Some(code), text),
            };
            self.events.completed(completion);
        }
        Some(message_id)
    }

    fn record(&self, op: Op) {
        self.script.state().calls.push(Call {
            engine: self.index,
            op,
            message_id: None,
        });
    }
}

#[async_trait]
impl DirectoryEngine for ScriptedEngine {
    async fn initialize(&mut self, settings: &SessionSettings) -> Result<(), EngineError> {
        self.record(Op::Initialize {
            uri: settings.uri.clone(),
            starttls: settings.starttls,
        });
        let fail = {
            let mut state = self.script.state();
            let fail = state.failed_inits > 0;
            if fail {
                state.failed_inits -= 1;
            }
            fail
        };
        if fail {
            self.closed = true;
            return Err(EngineError {
                uri: settings.uri.clone(),
                reason: "connection refused".to_owned(),
            });
        }
        self.closed = false;
        self.events.reconnected();
        Ok(())
    }

    fn bind(&mut self, dn: &str, password: &str) -> Option<MessageId> {
        self.submit(Op::Bind {
            dn: dn.to_owned(),
            password: password.to_owned(),
        })
    }

    fn search(&mut self, request: &EngineSearch) -> Option<MessageId> {
        self.submit(Op::Search(request.clone()))
    }

    fn add(&mut self, dn: &str, attrs: &[Attribute]) -> Option<MessageId> {
        self.submit(Op::Add {
            dn: dn.to_owned(),
            attrs: attrs.to_vec(),
        })
    }

    fn modify(&mut self, dn: &str, mods: &[Modification]) -> Option<MessageId> {
        self.submit(Op::Modify {
            dn: dn.to_owned(),
            mods: mods.to_vec(),
        })
    }

    fn delete(&mut self, dn: &str) -> Option<MessageId> {
        self.submit(Op::Delete { dn: dn.to_owned() })
    }

    fn rename(&mut self, dn: &str, new_rdn: &str) -> Option<MessageId> {
        self.submit(Op::Rename {
            dn: dn.to_owned(),
            new_rdn: new_rdn.to_owned(),
        })
    }

    fn close(&mut self) {
        self.closed = true;
        self.record(Op::Close);
    }

    fn last_error_code(&self) -> Option<i32> {
        self.last_error.0
    }

    fn last_error_string(&self) -> String {
        self.last_error.1.clone()
    }
}

/// Configuration pointing at the scripted directory.
pub fn config() -> ConnectionConfig {
    ConnectionConfig::new(URI).with_base("dc=example,dc=com")
}

/// Lets spawned tasks (dispatcher, deferred rejections, rebind watchers) run
/// to quiescence.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// A person entry.
pub fn person(uid: &str) -> Entry {
    Entry::new(format!("uid={uid},ou=people,dc=example,dc=com"))
        .with_attr("uid", [uid])
        .with_attr("cn", [format!("User {uid}")])
}
