//! # In-process messaging substrate.
//!
//! [`MemoryBroker`] routes RPC calls and publications between [`MemorySession`]s living in
//! the same process. It behaves like a remote broker from the service layer's point of view:
//! every delegate runs on the *receiving* session's delivery thread, never on the caller.
//!
//! ## Architecture
//! ```text
//!   MemorySession A                MemoryBroker                 MemorySession B
//!   invoke(uri) ──────────► realm.calls[uri] = B ─────────► [B outbox] ─► B thread: handler()
//!                                                                               │
//!   A thread: on_result() ◄─ [A outbox] ◄─────────────────────────────────────────┘
//!
//!   publish(topic) ───────► realm.topics[topic] = {B, C} ──► [B outbox], [C outbox]
//! ```
//!
//! ## Rules
//! - One delivery thread per session; deliveries to a session are FIFO.
//! - A publisher does not receive its own publications.
//! - One subscription per session and topic; subscribing again replaces the delegate.
//! - [`MemoryBroker::set_online`]`(false)` drops every session (registrations and
//!   subscriptions are purged, connection delegates get `false`); `set_online(true)` brings
//!   them back (delegates get `true`) and the owners re-register.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::error::{panic_message, MessagingError};
use crate::messaging::{
    CallHandler, ConnectionDelegate, ErrorDelegate, EventDelegate, Messaging, MessagingFactory,
    ResultDelegate,
};

type SessionId = u64;
type Job = Box<dyn FnOnce() + Send>;

struct Callee {
    session: SessionId,
    handler: CallHandler,
}

#[derive(Default)]
struct Realm {
    calls: HashMap<String, Callee>,
    topics: HashMap<String, HashMap<SessionId, EventDelegate>>,
}

impl Realm {
    fn purge(&mut self, session: SessionId) {
        self.calls.retain(|_, callee| callee.session != session);
        for subscribers in self.topics.values_mut() {
            subscribers.remove(&session);
        }
        self.topics.retain(|_, subscribers| !subscribers.is_empty());
    }
}

struct BrokerState {
    online: bool,
    connected: HashMap<SessionId, Weak<SessionInner>>,
    /// Sessions dropped by an outage, restored by `set_online(true)`.
    suspended: HashMap<SessionId, Weak<SessionInner>>,
    realms: HashMap<String, Realm>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    next_session: AtomicU64,
}

/// In-process broker.
///
/// Cheap to clone; all clones route through the same tables.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates an online broker with no sessions.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState {
                    online: true,
                    connected: HashMap::new(),
                    suspended: HashMap::new(),
                    realms: HashMap::new(),
                }),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Creates an unconnected session in `realm`.
    pub fn session(&self, realm: &str) -> MemorySession {
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let spawned = thread::Builder::new()
            .name(format!("memory-session-{id}"))
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                        tracing::error!(
                            session = id,
                            panic = %panic_message(payload.as_ref()),
                            "delivery panicked"
                        );
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::error!(session = id, error = %e, "cannot spawn delivery thread");
        }

        MemorySession {
            inner: Arc::new(SessionInner {
                id,
                realm: realm.to_string(),
                broker: Arc::clone(&self.inner),
                outbox: tx,
                on_connection: RwLock::new(None),
            }),
        }
    }

    /// True while the broker accepts connections.
    pub fn is_online(&self) -> bool {
        self.inner.state.lock().online
    }

    /// Simulates a broker outage (`false`) or recovery (`true`).
    pub fn set_online(&self, online: bool) {
        let notify: Vec<Arc<SessionInner>> = {
            let mut state = self.inner.state.lock();
            if state.online == online {
                return;
            }
            state.online = online;
            if online {
                let restored: Vec<_> = state.suspended.drain().collect();
                let mut live = Vec::with_capacity(restored.len());
                for (id, weak) in restored {
                    if let Some(session) = weak.upgrade() {
                        state.connected.insert(id, weak);
                        live.push(session);
                    }
                }
                live
            } else {
                state.realms.clear();
                let dropped: Vec<_> = state.connected.drain().collect();
                let mut live = Vec::with_capacity(dropped.len());
                for (id, weak) in dropped {
                    if let Some(session) = weak.upgrade() {
                        state.suspended.insert(id, weak);
                        live.push(session);
                    }
                }
                live
            }
        };

        tracing::info!(online, sessions = notify.len(), "memory broker availability changed");
        for session in notify {
            session.notify_connection(online);
        }
    }

    /// Number of connected sessions.
    pub fn session_count(&self) -> usize {
        self.inner.state.lock().connected.len()
    }

    /// Number of registered procedures in `realm`.
    pub fn registration_count(&self, realm: &str) -> usize {
        self.inner
            .state
            .lock()
            .realms
            .get(realm)
            .map_or(0, |r| r.calls.len())
    }
}

impl MessagingFactory for MemoryBroker {
    fn open(&self, url: &str, realm: &str) -> Result<Arc<dyn Messaging>, MessagingError> {
        tracing::debug!(%url, %realm, "opening memory session");
        Ok(Arc::new(self.session(realm)))
    }
}

struct SessionInner {
    id: SessionId,
    realm: String,
    broker: Arc<BrokerInner>,
    outbox: mpsc::UnboundedSender<Job>,
    on_connection: RwLock<Option<ConnectionDelegate>>,
}

impl SessionInner {
    fn deliver(&self, job: Job) {
        if self.outbox.send(job).is_err() {
            tracing::warn!(session = self.id, "delivery thread gone; dropping message");
        }
    }

    fn fail(&self, on_error: &ErrorDelegate, error: MessagingError) {
        let on_error = Arc::clone(on_error);
        self.deliver(Box::new(move || on_error(error)));
    }

    fn notify_connection(&self, connected: bool) {
        if let Some(delegate) = self.on_connection.read().clone() {
            self.deliver(Box::new(move || delegate(connected)));
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let mut state = self.broker.state.lock();
        state.connected.remove(&self.id);
        state.suspended.remove(&self.id);
        if let Some(realm) = state.realms.get_mut(&self.realm) {
            realm.purge(self.id);
        }
    }
}

/// A session on a [`MemoryBroker`].
pub struct MemorySession {
    inner: Arc<SessionInner>,
}

impl MemorySession {
    /// Session identifier (unique per broker).
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    fn connected_state(&self) -> Result<parking_lot::MutexGuard<'_, BrokerState>, MessagingError> {
        let state = self.inner.broker.state.lock();
        if state.connected.contains_key(&self.inner.id) {
            Ok(state)
        } else {
            Err(MessagingError::NotConnected)
        }
    }
}

impl Messaging for MemorySession {
    fn connect(&self) -> Result<(), MessagingError> {
        let mut state = self.inner.broker.state.lock();
        if !state.online {
            return Err(MessagingError::Transport {
                error: "broker offline".to_string(),
            });
        }
        state.suspended.remove(&self.inner.id);
        state
            .connected
            .insert(self.inner.id, Arc::downgrade(&self.inner));
        tracing::trace!(session = self.inner.id, realm = %self.inner.realm, "session connected");
        Ok(())
    }

    fn disconnect(&self) {
        let mut state = self.inner.broker.state.lock();
        state.connected.remove(&self.inner.id);
        state.suspended.remove(&self.inner.id);
        if let Some(realm) = state.realms.get_mut(&self.inner.realm) {
            realm.purge(self.inner.id);
        }
        tracing::trace!(session = self.inner.id, "session disconnected");
    }

    fn is_connected(&self) -> bool {
        self.connected_state().is_ok()
    }

    fn set_connection_delegate(&self, delegate: Option<ConnectionDelegate>) {
        *self.inner.on_connection.write() = delegate;
    }

    fn register_call(
        &self,
        uri: &str,
        handler: CallHandler,
        _on_error: ErrorDelegate,
    ) -> Result<(), MessagingError> {
        let mut state = self.connected_state()?;
        let realm = state.realms.entry(self.inner.realm.clone()).or_default();
        if realm.calls.contains_key(uri) {
            return Err(MessagingError::AlreadyRegistered {
                uri: uri.to_string(),
            });
        }
        realm.calls.insert(
            uri.to_string(),
            Callee {
                session: self.inner.id,
                handler,
            },
        );
        Ok(())
    }

    fn unregister_call(&self, uri: &str, on_error: ErrorDelegate) -> Result<(), MessagingError> {
        let mut state = self.connected_state()?;
        let removed = state
            .realms
            .get_mut(&self.inner.realm)
            .and_then(|realm| match realm.calls.get(uri) {
                Some(callee) if callee.session == self.inner.id => realm.calls.remove(uri),
                _ => None,
            });
        drop(state);

        if removed.is_none() {
            self.inner.fail(
                &on_error,
                MessagingError::NoSuchProcedure {
                    uri: uri.to_string(),
                },
            );
        }
        Ok(())
    }

    fn invoke(
        &self,
        uri: &str,
        args: String,
        on_result: ResultDelegate,
        on_error: ErrorDelegate,
    ) -> Result<(), MessagingError> {
        let state = self.connected_state()?;
        let target = state
            .realms
            .get(&self.inner.realm)
            .and_then(|realm| realm.calls.get(uri))
            .and_then(|callee| {
                let session = state.connected.get(&callee.session)?.upgrade()?;
                Some((session, Arc::clone(&callee.handler)))
            });
        drop(state);

        let Some((callee, handler)) = target else {
            self.inner.fail(
                &on_error,
                MessagingError::NoSuchProcedure {
                    uri: uri.to_string(),
                },
            );
            return Ok(());
        };

        let caller = Arc::downgrade(&self.inner);
        callee.deliver(Box::new(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| handler(&args))) {
                Ok(outcome) => outcome,
                Err(payload) => Err(format!("handler panicked: {}", panic_message(payload.as_ref()))),
            };
            let Some(caller) = caller.upgrade() else {
                return;
            };
            caller.deliver(Box::new(move || match outcome {
                Ok(result) => on_result(result),
                Err(error) => on_error(MessagingError::Remote { error }),
            }));
        }));
        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
        on_event: EventDelegate,
        _on_error: ErrorDelegate,
    ) -> Result<(), MessagingError> {
        let mut state = self.connected_state()?;
        state
            .realms
            .entry(self.inner.realm.clone())
            .or_default()
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(self.inner.id, on_event);
        Ok(())
    }

    fn unsubscribe(&self, topic: &str, _on_error: ErrorDelegate) -> Result<(), MessagingError> {
        let mut state = self.connected_state()?;
        if let Some(realm) = state.realms.get_mut(&self.inner.realm) {
            if let Some(subscribers) = realm.topics.get_mut(topic) {
                subscribers.remove(&self.inner.id);
                if subscribers.is_empty() {
                    realm.topics.remove(topic);
                }
            }
        }
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        args: String,
        _on_error: ErrorDelegate,
    ) -> Result<(), MessagingError> {
        let state = self.connected_state()?;
        let targets: Vec<(Arc<SessionInner>, EventDelegate)> = state
            .realms
            .get(&self.inner.realm)
            .and_then(|realm| realm.topics.get(topic))
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|(id, _)| **id != self.inner.id)
                    .filter_map(|(id, delegate)| {
                        let session = state.connected.get(id)?.upgrade()?;
                        Some((session, Arc::clone(delegate)))
                    })
                    .collect()
            })
            .unwrap_or_default();
        drop(state);

        let payload: Arc<str> = Arc::from(args);
        for (session, delegate) in targets {
            let payload = Arc::clone(&payload);
            session.deliver(Box::new(move || delegate(&payload)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn ignore_errors() -> ErrorDelegate {
        Arc::new(|_| {})
    }

    fn connected(broker: &MemoryBroker) -> MemorySession {
        let session = broker.session("test");
        session.connect().unwrap();
        session
    }

    #[test]
    fn test_invoke_round_trip() {
        let broker = MemoryBroker::new();
        let server = connected(&broker);
        let client = connected(&broker);

        server
            .register_call(
                "svc.echo",
                Arc::new(|args: &str| Ok(format!("[{args}]"))),
                ignore_errors(),
            )
            .unwrap();

        let (tx, rx) = std_mpsc::channel();
        client
            .invoke(
                "svc.echo",
                "1".to_string(),
                Box::new(move |result| tx.send(result).unwrap()),
                ignore_errors(),
            )
            .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "[1]");
    }

    #[test]
    fn test_invoke_unknown_procedure_reports_error() {
        let broker = MemoryBroker::new();
        let client = connected(&broker);
        let (tx, rx) = std_mpsc::channel();
        client
            .invoke(
                "svc.missing",
                "null".to_string(),
                Box::new(|_| panic!("no result expected")),
                Arc::new(move |e| tx.send(e).unwrap()),
            )
            .unwrap();
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            MessagingError::NoSuchProcedure {
                uri: "svc.missing".into()
            }
        );
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let broker = MemoryBroker::new();
        let a = connected(&broker);
        let b = connected(&broker);
        let handler: CallHandler = Arc::new(|_: &str| Ok("null".into()));
        a.register_call("svc.x", Arc::clone(&handler), ignore_errors())
            .unwrap();
        assert!(matches!(
            b.register_call("svc.x", handler, ignore_errors()),
            Err(MessagingError::AlreadyRegistered { .. })
        ));
        assert_eq!(broker.registration_count("test"), 1);
    }

    #[test]
    fn test_publish_skips_publisher_and_replaces_subscription() {
        let broker = MemoryBroker::new();
        let publisher = connected(&broker);
        let subscriber = connected(&broker);

        let (tx, rx) = std_mpsc::channel::<String>();
        let first = tx.clone();
        publisher
            .subscribe(
                "svc.topic",
                Arc::new(|_: &str| panic!("publisher must not hear itself")),
                ignore_errors(),
            )
            .unwrap();
        subscriber
            .subscribe(
                "svc.topic",
                Arc::new(move |e: &str| first.send(format!("first:{e}")).unwrap()),
                ignore_errors(),
            )
            .unwrap();
        subscriber
            .subscribe(
                "svc.topic",
                Arc::new(move |e: &str| tx.send(format!("second:{e}")).unwrap()),
                ignore_errors(),
            )
            .unwrap();

        publisher
            .publish("svc.topic", "7".into(), ignore_errors())
            .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "second:7");
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_requests_require_connection() {
        let broker = MemoryBroker::new();
        let session = broker.session("test");
        assert_eq!(
            session.publish("t", "1".into(), ignore_errors()),
            Err(MessagingError::NotConnected)
        );
        session.connect().unwrap();
        assert!(session.is_connected());
        session.disconnect();
        assert!(!session.is_connected());
    }

    #[test]
    fn test_outage_notifies_and_restores_sessions() {
        let broker = MemoryBroker::new();
        let session = connected(&broker);
        session
            .register_call("svc.x", Arc::new(|_: &str| Ok("1".into())), ignore_errors())
            .unwrap();

        let (tx, rx) = std_mpsc::channel();
        session.set_connection_delegate(Some(Arc::new(move |up| tx.send(up).unwrap())));

        broker.set_online(false);
        assert!(!rx.recv_timeout(WAIT).unwrap());
        assert!(!session.is_connected());
        assert_eq!(broker.registration_count("test"), 0);
        assert!(session.connect().is_err());

        broker.set_online(true);
        assert!(rx.recv_timeout(WAIT).unwrap());
        assert!(session.is_connected());
    }
}
