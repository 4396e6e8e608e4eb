//! # Client role.
//!
//! [`ServiceStub`] calls a remote [`ServiceImpl`](crate::ServiceImpl), listens to its
//! publications and infers its liveness from the heartbeat.
//!
//! ## States
//! ```text
//!                connect()                      ready / alive / period query ok
//! Disconnected ───────────► session open ─────────────────────────────────► Connected
//!      ▲                  (awaiting first alive)                               │
//!      │                                                                       │
//!      └──── watchdog fired (no message for factor × alive_period) ◄───────────┘
//!      └──── disconnect() / transport loss ◄───────────────────────────────────┘
//! ```
//!
//! ## Watchdog
//! - Armed with the period announced by the server (`ReadyMsg`, `AliveMsg` or the
//!   `get.alive.period` call), at `watchdog_factor × alive_period`.
//! - Every inbound message and every successful call result pushes the deadline forward.
//! - While a call is pending the watchdog does not fire; the server suspends its heartbeat
//!   for the duration of the call.
//! - Firing moves the stub to Disconnected, publishes `AliveLost` and fails pending calls.
//!   The session stays open, so the next alive message reconnects the stub.
//!
//! ## Calls
//! - [`ServiceStub::invoke`] blocks the calling thread for at most the call timeout.
//! - [`ServiceStub::invoke_async`] returns a future; its timeout runs on the stub's loop.
//! - A response arriving after its call timed out is discarded.
//! - Neither may be awaited from inside a subscription callback: callbacks run on the
//!   session's delivery thread, which also delivers the response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, watch};

use crate::config::ServiceConfig;
use crate::error::{MessagingError, ServiceError};
use crate::events::{Bus, Event, EventKind};
use crate::messaging::{ErrorDelegate, EventDelegate, MessagingFactory};
use crate::scheduler::TaskLoop;
use crate::service::lifecycle::{ConnectionLifecycle, ServiceRole};
use crate::service::messages::{
    decode_event, decode_result, encode_args, AliveMsg, CallResult, ReadyMsg, RuntimeErrorMsg,
    ServiceConnectionMsg,
};
use crate::service::{Service, CALL_GET_ALIVE_PERIOD, TOPIC_ALIVE, TOPIC_READY, TOPIC_RUNTIME_ERROR};
use crate::tasks::TaskRef;

type Completion = Box<dyn FnOnce(Result<String, ServiceError>) + Send>;

struct PendingCall {
    uri: String,
    complete: Completion,
    timer: Option<TaskRef>,
}

#[derive(Default)]
struct Watchdog {
    task: Option<TaskRef>,
    generation: u64,
    period: Duration,
}

struct StubCore {
    lifecycle: ConnectionLifecycle,
    self_ref: Weak<StubCore>,
    alive_period: Mutex<Option<Duration>>,
    watchdog: Mutex<Watchdog>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    next_call: AtomicU64,
    subscriptions: Mutex<HashMap<String, EventDelegate>>,
}

/// Client-role service.
pub struct ServiceStub {
    core: Arc<StubCore>,
}

impl ServiceStub {
    /// Creates a stub owning its task loop; the loop runs while the stub is connected.
    pub fn new(name: &str, factory: Arc<dyn MessagingFactory>, config: ServiceConfig) -> Self {
        Self::from_lifecycle(ConnectionLifecycle::new(name, factory, config))
    }

    /// Creates a stub scheduling its watchdog and call timeouts on a shared `task_loop`.
    ///
    /// The caller runs the shared loop.
    pub fn with_task_loop(
        name: &str,
        factory: Arc<dyn MessagingFactory>,
        config: ServiceConfig,
        task_loop: TaskLoop,
    ) -> Self {
        Self::from_lifecycle(ConnectionLifecycle::with_task_loop(
            name, factory, config, task_loop,
        ))
    }

    fn from_lifecycle(lifecycle: ConnectionLifecycle) -> Self {
        let core = Arc::new_cyclic(|self_ref| StubCore {
            lifecycle,
            self_ref: self_ref.clone(),
            alive_period: Mutex::new(None),
            watchdog: Mutex::new(Watchdog::default()),
            pending: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(1),
            subscriptions: Mutex::new(HashMap::new()),
        });
        Self { core }
    }

    /// Connects using the broker address of the configuration.
    pub fn connect_default(&self) -> Result<(), ServiceError> {
        let (host, port) = self.core.lifecycle.config().broker_address();
        self.connect(&host, port)
    }

    /// Calls `<name>.<uri>` and waits for the result.
    ///
    /// `args` is usually a tuple (sent as a JSON array) or `()`.
    ///
    /// ### Errors
    /// - [`ServiceError::NotConnected`] without an open session.
    /// - [`ServiceError::Timeout`] when the call timeout elapses first.
    /// - [`ServiceError::Remote`] when the handler failed.
    /// - [`ServiceError::Codec`] when arguments or result do not (de)serialize.
    pub fn invoke<R, A>(&self, uri: &str, args: &A) -> Result<R, ServiceError>
    where
        R: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        let payload = encode_args(args)?;
        let json = self
            .core
            .call_blocking(uri, payload, self.core.lifecycle.call_timeout())?;
        decode_result(&json)
    }

    /// Calls `<name>.<uri>` without blocking.
    ///
    /// The future resolves with the outcome; the call timeout is enforced by the stub's loop.
    pub fn invoke_async<R, A>(
        &self,
        uri: &str,
        args: &A,
    ) -> BoxFuture<'static, CallResult<R>>
    where
        R: DeserializeOwned + Send + 'static,
        A: Serialize + ?Sized,
    {
        let (tx, rx) = oneshot::channel::<Result<String, ServiceError>>();
        let full_uri = self.core.lifecycle.make_full_uri(uri);
        let started = encode_args(args).and_then(|payload| {
            self.core.start_call(
                uri,
                payload,
                self.core.lifecycle.call_timeout(),
                Box::new(move |outcome| {
                    let _ = tx.send(outcome);
                }),
            )
        });

        async move {
            let outcome = match started {
                Ok(_) => rx
                    .await
                    .unwrap_or(Err(ServiceError::Disconnected { uri: full_uri })),
                Err(e) => Err(e),
            };
            match outcome.and_then(|json| decode_result::<R>(&json)) {
                Ok(value) => CallResult::ok(value),
                Err(e) => CallResult::err(e),
            }
        }
        .boxed()
    }

    /// Subscribes `callback` to `<name>.<topic>`.
    ///
    /// Subscribing again to `topic` replaces the previous callback. Callbacks run on the
    /// session's delivery thread and survive reconnections.
    pub fn subscribe<T, F>(&self, topic: &str, callback: F) -> Result<(), ServiceError>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let delegate = self.core.event_delegate(topic, move |core: &StubCore, msg: T| {
            core.touch();
            callback(msg);
        });
        self.core
            .subscriptions
            .lock()
            .insert(topic.to_string(), Arc::clone(&delegate));
        if self.core.lifecycle.has_session() {
            self.core.subscribe_remote(topic, delegate)?;
        }
        Ok(())
    }

    /// Cancels the subscription to `<name>.<topic>`.
    pub fn unsubscribe(&self, topic: &str) -> Result<(), ServiceError> {
        self.core.subscriptions.lock().remove(topic);
        if self.core.lifecycle.has_session() {
            self.core.unsubscribe_remote(topic)?;
        }
        Ok(())
    }

    /// Number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.core.pending.lock().len()
    }

    pub fn task_loop(&self) -> &TaskLoop {
        self.core.lifecycle.task_loop()
    }

    pub fn lifecycle(&self) -> &ConnectionLifecycle {
        &self.core.lifecycle
    }
}

impl Service for ServiceStub {
    fn name(&self) -> &str {
        self.core.lifecycle.name()
    }

    fn connect(&self, url: &str, port: u16) -> Result<(), ServiceError> {
        self.core.lifecycle.start_owned_loop();
        let role: Weak<dyn ServiceRole> = self.core.self_ref.clone();
        let connected = self.core.lifecycle.connect(role, url, port);
        if connected.is_err() {
            self.core.lifecycle.stop_owned_loop();
        }
        connected
    }

    fn disconnect(&self) {
        self.core.lifecycle.disconnect(self.core.as_ref());
        self.core.lifecycle.stop_owned_loop();
    }

    fn is_connected(&self) -> bool {
        self.core.lifecycle.is_connected()
    }

    /// Period announced by the server; zero until learned.
    fn alive_period(&self) -> Duration {
        let period = *self.core.alive_period.lock();
        period.unwrap_or_default()
    }

    fn set_call_timeout(&self, timeout: Duration) {
        self.core.lifecycle.set_call_timeout(timeout);
    }

    fn watch_connection(&self) -> watch::Receiver<ServiceConnectionMsg> {
        self.core.lifecycle.watch_connection()
    }

    fn bus(&self) -> &Bus {
        self.core.lifecycle.bus()
    }
}

impl Drop for ServiceStub {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl StubCore {
    fn service_error(error: MessagingError) -> ServiceError {
        match error {
            MessagingError::Remote { error } => ServiceError::Remote { error },
            other => ServiceError::Messaging(other),
        }
    }

    /// Issues a call; `complete` receives the outcome exactly once.
    fn start_call(
        &self,
        uri: &str,
        payload: String,
        timeout: Option<Duration>,
        complete: Completion,
    ) -> Result<u64, ServiceError> {
        let session = self.lifecycle.session()?;
        let full_uri = self.lifecycle.make_full_uri(uri);
        let id = self.next_call.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(
            id,
            PendingCall {
                uri: full_uri.clone(),
                complete,
                timer: None,
            },
        );

        let on_result = {
            let weak = self.self_ref.clone();
            Box::new(move |json: String| {
                if let Some(core) = weak.upgrade() {
                    core.finish(id, Ok(json));
                }
            })
        };
        let on_error: ErrorDelegate = {
            let weak = self.self_ref.clone();
            Arc::new(move |error: MessagingError| {
                if let Some(core) = weak.upgrade() {
                    core.finish(id, Err(Self::service_error(error)));
                }
            })
        };

        if let Err(e) = session.invoke(&full_uri, payload, on_result, on_error) {
            self.pending.lock().remove(&id);
            return Err(e.into());
        }

        if let Some(timeout) = timeout {
            let weak = self.self_ref.clone();
            let timer = self
                .lifecycle
                .task_loop()
                .push_single_shot(timeout, move || {
                    if let Some(core) = weak.upgrade() {
                        core.expire(id, timeout);
                    }
                });
            match self.pending.lock().get_mut(&id) {
                Some(call) => call.timer = Some(timer),
                None => timer.set_enabled(false),
            }
        }
        Ok(id)
    }

    /// Issues a call and blocks the current thread until it completes or `timeout` elapses.
    fn call_blocking(
        &self,
        uri: &str,
        payload: String,
        timeout: Option<Duration>,
    ) -> Result<String, ServiceError> {
        let (tx, rx) = mpsc::sync_channel::<Result<String, ServiceError>>(1);
        let full_uri = self.lifecycle.make_full_uri(uri);
        let id = self.start_call(
            uri,
            payload,
            None,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )?;

        let outcome = match timeout {
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(outcome) => Ok(outcome),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    self.expire(id, timeout);
                    rx.recv()
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => rx.recv(),
            },
            None => rx.recv(),
        };
        outcome.unwrap_or(Err(ServiceError::Disconnected { uri: full_uri }))
    }

    fn finish(&self, id: u64, outcome: Result<String, ServiceError>) {
        let Some(call) = self.pending.lock().remove(&id) else {
            tracing::debug!(service = %self.lifecycle.name(), call = id, "late response discarded");
            return;
        };
        if let Some(timer) = &call.timer {
            timer.set_enabled(false);
        }
        if outcome.is_ok() {
            self.touch();
        }
        (call.complete)(outcome);
    }

    fn expire(&self, id: u64, timeout: Duration) {
        let Some(call) = self.pending.lock().remove(&id) else {
            return;
        };
        tracing::warn!(service = %self.lifecycle.name(), uri = %call.uri, ?timeout, "call timed out");
        self.lifecycle.bus().publish(
            Event::new(EventKind::CallTimedOut)
                .with_service(self.lifecycle.name())
                .with_uri(call.uri.as_str())
                .with_timeout(timeout),
        );
        (call.complete)(Err(ServiceError::Timeout {
            uri: call.uri,
            timeout,
        }));
    }

    fn fail_pending(&self) {
        let calls: Vec<PendingCall> = self.pending.lock().drain().map(|(_, call)| call).collect();
        for call in calls {
            if let Some(timer) = &call.timer {
                timer.set_enabled(false);
            }
            (call.complete)(Err(ServiceError::Disconnected { uri: call.uri }));
        }
    }

    fn event_delegate<T, F>(&self, topic: &str, on_message: F) -> EventDelegate
    where
        T: DeserializeOwned + 'static,
        F: Fn(&StubCore, T) + Send + Sync + 'static,
    {
        let weak = self.self_ref.clone();
        let topic = topic.to_string();
        Arc::new(move |json: &str| {
            let Some(core) = weak.upgrade() else {
                return;
            };
            match decode_event::<T>(json) {
                Ok(message) => on_message(&core, message),
                Err(e) => {
                    tracing::warn!(service = %core.lifecycle.name(), %topic, error = %e, "dropping malformed message");
                }
            }
        })
    }

    fn subscribe_remote(&self, topic: &str, delegate: EventDelegate) -> Result<(), ServiceError> {
        let full_topic = self.lifecycle.make_full_uri(topic);
        let session = self.lifecycle.session()?;
        session.subscribe(&full_topic, delegate, self.lifecycle.error_delegate(&full_topic))?;
        Ok(())
    }

    fn unsubscribe_remote(&self, topic: &str) -> Result<(), ServiceError> {
        let full_topic = self.lifecycle.make_full_uri(topic);
        let session = self.lifecycle.session()?;
        session.unsubscribe(&full_topic, self.lifecycle.error_delegate(&full_topic))?;
        Ok(())
    }

    fn subscribe_all(&self) -> Result<(), ServiceError> {
        self.subscribe_remote(
            TOPIC_READY,
            self.event_delegate(TOPIC_READY, |core: &StubCore, msg: ReadyMsg| {
                core.on_alive(msg.alive_period_ms, true);
            }),
        )?;
        self.subscribe_remote(
            TOPIC_ALIVE,
            self.event_delegate(TOPIC_ALIVE, |core: &StubCore, msg: AliveMsg| {
                core.on_alive(msg.alive_period_ms, false);
            }),
        )?;
        self.subscribe_remote(
            TOPIC_RUNTIME_ERROR,
            self.event_delegate(TOPIC_RUNTIME_ERROR, |core: &StubCore, msg: RuntimeErrorMsg| {
                core.on_runtime_error(msg);
            }),
        )?;

        let user: Vec<(String, EventDelegate)> = self
            .subscriptions
            .lock()
            .iter()
            .map(|(topic, d)| (topic.clone(), Arc::clone(d)))
            .collect();
        for (topic, delegate) in user {
            self.subscribe_remote(&topic, delegate)?;
        }
        Ok(())
    }

    fn unsubscribe_all(&self) {
        let mut topics: Vec<String> = self.subscriptions.lock().keys().cloned().collect();
        topics.extend([TOPIC_READY, TOPIC_ALIVE, TOPIC_RUNTIME_ERROR].map(String::from));
        for topic in topics {
            if let Err(e) = self.unsubscribe_remote(&topic) {
                tracing::debug!(service = %self.lifecycle.name(), %topic, error = %e, "unsubscribe skipped");
            }
        }
    }

    fn query_alive_period(&self) -> Result<Duration, ServiceError> {
        let bound = self
            .lifecycle
            .call_timeout()
            .unwrap_or_else(|| {
                let config = self.lifecycle.config();
                config.watchdog_period(config.alive_period)
            });
        let json = self.call_blocking(CALL_GET_ALIVE_PERIOD, encode_args(&())?, Some(bound))?;
        Ok(Duration::from_millis(decode_result::<u64>(&json)?))
    }

    /// Handles a ready or alive message announcing `period_ms`.
    fn on_alive(&self, period_ms: u64, ready: bool) {
        if !self.lifecycle.has_session() {
            return;
        }
        let period = Duration::from_millis(period_ms);
        if ready {
            tracing::debug!(service = %self.lifecycle.name(), ?period, "server ready");
            self.lifecycle.bus().publish(
                Event::new(EventKind::ServiceReady)
                    .with_service(self.lifecycle.name())
                    .with_delay(period),
            );
        }
        if period.is_zero() {
            tracing::warn!(service = %self.lifecycle.name(), "server announced a zero alive period");
            return;
        }
        *self.alive_period.lock() = Some(period);
        self.arm_watchdog();
        self.lifecycle.set_connected(true, "alive");
    }

    fn on_runtime_error(&self, msg: RuntimeErrorMsg) {
        self.touch();
        tracing::error!(service = %self.lifecycle.name(), uri = %msg.uri, error = %msg.error, "remote runtime error");
        self.lifecycle.bus().publish(
            Event::new(EventKind::RuntimeError)
                .with_service(self.lifecycle.name())
                .with_uri(msg.uri)
                .with_reason(msg.error),
        );
    }

    /// Pushes the watchdog deadline forward if it is armed.
    fn touch(&self) {
        let armed = self.watchdog.lock().task.is_some();
        if armed {
            self.arm_watchdog();
        }
    }

    /// (Re)arms the watchdog one watchdog period from now.
    fn arm_watchdog(&self) {
        let Some(alive_period) = *self.alive_period.lock() else {
            return;
        };
        let period = self.lifecycle.config().watchdog_period(alive_period);
        let weak = self.self_ref.clone();

        let mut watchdog = self.watchdog.lock();
        watchdog.generation += 1;
        watchdog.period = period;
        let generation = watchdog.generation;
        if let Some(previous) = watchdog.task.take() {
            previous.set_enabled(false);
        }
        watchdog.task = Some(self.lifecycle.task_loop().push_repeated(period, move || {
            if let Some(core) = weak.upgrade() {
                core.on_watchdog(generation);
            }
        }));
    }

    fn disarm_watchdog(&self) {
        let mut watchdog = self.watchdog.lock();
        watchdog.generation += 1;
        if let Some(task) = watchdog.task.take() {
            task.set_enabled(false);
        }
    }

    fn on_watchdog(&self, generation: u64) {
        // The server skips heartbeats while it runs our calls; the repeated task fires again.
        let in_flight = self.pending.lock().len();
        if in_flight > 0 {
            tracing::trace!(service = %self.lifecycle.name(), in_flight, "watchdog deferred by pending calls");
            return;
        }
        let period = {
            let mut watchdog = self.watchdog.lock();
            if watchdog.generation != generation || watchdog.task.is_none() {
                return;
            }
            if let Some(task) = watchdog.task.take() {
                task.set_enabled(false);
            }
            watchdog.period
        };

        tracing::warn!(service = %self.lifecycle.name(), ?period, "no alive message; server lost");
        self.lifecycle.bus().publish(
            Event::new(EventKind::AliveLost)
                .with_service(self.lifecycle.name())
                .with_timeout(period),
        );
        self.fail_pending();
        self.lifecycle.set_connected(false, "alive timeout");
    }
}

impl ServiceRole for StubCore {
    fn do_register(&self) -> Result<bool, ServiceError> {
        self.subscribe_all()?;
        match self.query_alive_period() {
            Ok(period) if !period.is_zero() => {
                *self.alive_period.lock() = Some(period);
                self.arm_watchdog();
                tracing::info!(service = %self.lifecycle.name(), ?period, "server alive period learned");
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) => {
                tracing::debug!(service = %self.lifecycle.name(), error = %e, "alive period unknown; waiting for ready");
                Ok(false)
            }
        }
    }

    fn do_unregister(&self) {
        self.disarm_watchdog();
        self.unsubscribe_all();
        self.fail_pending();
    }

    fn on_messaging_connection(&self, connected: bool) {
        if !connected {
            self.disarm_watchdog();
            self.fail_pending();
            self.lifecycle.set_connected(false, "transport");
            return;
        }
        let Some(core) = self.self_ref.upgrade() else {
            return;
        };
        self.lifecycle.task_loop().push_method(&core, |core: &StubCore| {
            if !core.lifecycle.has_session() {
                return;
            }
            match core.do_register() {
                Ok(true) => {
                    core.lifecycle.set_connected(true, "transport");
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(service = %core.lifecycle.name(), error = %e, "re-subscription failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::MemoryBroker;
    use crate::service::ServiceImpl;
    use std::time::Instant;

    fn config(alive_ms: u64) -> ServiceConfig {
        ServiceConfig {
            alive_period: Duration::from_millis(alive_ms),
            ..ServiceConfig::default()
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn running_server(broker: &MemoryBroker, alive_ms: u64) -> ServiceImpl {
        let srv = ServiceImpl::new("echo", Arc::new(broker.clone()), config(alive_ms));
        srv.register_call("say", |(s,): (String,)| Ok::<_, String>(format!("<{s}>")))
            .unwrap();
        srv.connect("localhost", 8080).unwrap();
        srv.run_async().unwrap();
        srv
    }

    #[test]
    fn test_connect_learns_alive_period() {
        let broker = MemoryBroker::new();
        let _srv = running_server(&broker, 100);
        let stub = ServiceStub::new("echo", Arc::new(broker.clone()), config(1000));

        stub.connect("localhost", 8080).unwrap();
        assert!(stub.is_connected());
        assert_eq!(stub.alive_period(), Duration::from_millis(100));
        assert!(stub.task_loop().is_running());

        let reply: String = stub.invoke("say", &("hi",)).unwrap();
        assert_eq!(reply, "<hi>");
        let args: &[&str] = &["slice"];
        let reply: String = stub.invoke("say", args).unwrap();
        assert_eq!(reply, "<slice>");

        stub.disconnect();
        assert!(!stub.is_connected());
        assert!(!stub.task_loop().is_running());
    }

    #[test]
    fn test_connect_without_server_stays_disconnected() {
        let broker = MemoryBroker::new();
        let stub = ServiceStub::new("echo", Arc::new(broker.clone()), config(100));
        stub.connect("localhost", 8080).unwrap();
        assert!(!stub.is_connected());
        assert_eq!(stub.alive_period(), Duration::ZERO);

        let _srv = running_server(&broker, 50);
        assert!(wait_for(|| stub.is_connected()));
        assert_eq!(stub.alive_period(), Duration::from_millis(50));
    }

    #[test]
    fn test_invoke_requires_session() {
        let broker = MemoryBroker::new();
        let stub = ServiceStub::new("echo", Arc::new(broker), config(100));
        let err = stub.invoke::<String, _>("say", &("hi",)).unwrap_err();
        assert_eq!(err.as_label(), "service_not_connected");
    }

    #[test]
    fn test_unknown_call_fails() {
        let broker = MemoryBroker::new();
        let _srv = running_server(&broker, 100);
        let stub = ServiceStub::new("echo", Arc::new(broker.clone()), config(100));
        stub.connect("localhost", 8080).unwrap();
        let err = stub.invoke::<String, _>("shout", &("hi",)).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Messaging(MessagingError::NoSuchProcedure { .. })
        ));
        assert_eq!(stub.pending_calls(), 0);
    }

    #[test]
    fn test_result_decode_failure_is_codec_error() {
        let broker = MemoryBroker::new();
        let _srv = running_server(&broker, 100);
        let stub = ServiceStub::new("echo", Arc::new(broker.clone()), config(100));
        stub.connect("localhost", 8080).unwrap();
        let err = stub.invoke::<u32, _>("say", &("hi",)).unwrap_err();
        assert_eq!(err.as_label(), "service_codec");
    }

    #[test]
    fn test_silent_server_is_declared_lost() {
        let broker = MemoryBroker::new();
        let srv = running_server(&broker, 30);
        let stub = ServiceStub::new("echo", Arc::new(broker.clone()), config(30));
        let mut events = stub.bus().subscribe();
        stub.connect("localhost", 8080).unwrap();
        assert!(stub.is_connected());

        srv.stop();
        assert!(wait_for(|| !stub.is_connected()));
        let lost = std::iter::from_fn(|| events.try_recv().ok())
            .any(|e| e.kind == EventKind::AliveLost);
        assert!(lost);

        srv.run_async().unwrap();
        assert!(wait_for(|| stub.is_connected()));
    }

    #[test]
    fn test_long_call_keeps_server_alive() {
        let broker = MemoryBroker::new();
        let srv = running_server(&broker, 30);
        srv.register_call("nap", |(ms,): (u64,)| {
            std::thread::sleep(Duration::from_millis(ms));
            Ok::<_, String>(ms)
        })
        .unwrap();
        let stub = ServiceStub::new("echo", Arc::new(broker.clone()), config(30));
        let mut events = stub.bus().subscribe();
        stub.connect("localhost", 8080).unwrap();
        stub.set_call_timeout(Duration::from_secs(2));

        let slept: u64 = stub.invoke("nap", &(200u64,)).unwrap();
        assert_eq!(slept, 200);
        assert!(stub.is_connected());
        let lost = std::iter::from_fn(|| events.try_recv().ok())
            .any(|e| e.kind == EventKind::AliveLost);
        assert!(!lost);
    }
}
