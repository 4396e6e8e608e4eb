//! # Server role.
//!
//! [`ServiceImpl`] exposes typed call handlers on the broker, announces readiness and
//! publishes a heartbeat on its task loop.
//!
//! ## Registration
//! ```text
//! connect() ─► do_register()
//!                ├─► register "<name>.<uri>" for every handler (get.alive.period included)
//!                ├─► publish "<name>.notify.ready"   ReadyMsg { alive_period_ms }
//!                └─► push_repeated(alive_period, publish_alive)
//!
//! incoming call (substrate thread)
//!   suspend heartbeat ─► decode args ─► handler ─► encode result
//!        │                                 └─ Err | panic ─► publish "<name>.error.runtime"
//!        └─ last call done ─► heartbeat timer reset
//! ```
//!
//! A transport loss stops the heartbeat; when the transport comes back the registration is
//! replayed on the task loop.

use std::collections::HashMap;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::config::ServiceConfig;
use crate::error::{panic_message, LoopError, ServiceError};
use crate::events::{Bus, Event, EventKind};
use crate::messaging::{CallHandler, MessagingFactory};
use crate::scheduler::{LoopFuture, TaskLoop};
use crate::service::lifecycle::{ConnectionLifecycle, ServiceRole};
use crate::service::messages::{encode_event, AliveMsg, ReadyMsg, RuntimeErrorMsg, ServiceConnectionMsg};
use crate::service::suspension::AliveSuspension;
use crate::service::{Service, CALL_GET_ALIVE_PERIOD, TOPIC_ALIVE, TOPIC_READY, TOPIC_RUNTIME_ERROR};
use crate::tasks::TaskRef;

/// Type-erased call handler: JSON arguments in, JSON result or error text out.
type Dispatcher = Arc<dyn Fn(&str) -> Result<String, String> + Send + Sync>;

struct ServerCore {
    lifecycle: ConnectionLifecycle,
    self_ref: Weak<ServerCore>,
    calls: Mutex<HashMap<String, Dispatcher>>,
    alive_period: Mutex<Duration>,
    heartbeat: Mutex<Option<TaskRef>>,
    suspension: AliveSuspension,
}

/// Server-role service.
pub struct ServiceImpl {
    core: Arc<ServerCore>,
}

impl ServiceImpl {
    /// Creates a server owning its task loop.
    pub fn new(name: &str, factory: Arc<dyn MessagingFactory>, config: ServiceConfig) -> Self {
        Self::from_lifecycle(ConnectionLifecycle::new(name, factory, config))
    }

    /// Creates a server scheduling its heartbeat on a shared `task_loop`.
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
        let alive_period = lifecycle.config().alive_period;
        let core = Arc::new_cyclic(|self_ref| ServerCore {
            lifecycle,
            self_ref: self_ref.clone(),
            calls: Mutex::new(HashMap::new()),
            alive_period: Mutex::new(alive_period),
            heartbeat: Mutex::new(None),
            suspension: AliveSuspension::new(),
        });

        let weak = Arc::downgrade(&core);
        let builtin = core.dispatcher(move |(): ()| -> Result<u64, ServiceError> {
            let core = weak.upgrade().ok_or_else(|| ServiceError::NotConnected {
                service: "dropped".to_string(),
            })?;
            Ok(duration_ms(core.alive_period()))
        });
        core.calls
            .lock()
            .insert(CALL_GET_ALIVE_PERIOD.to_string(), builtin);

        Self { core }
    }

    /// Exposes `handler` as `<name>.<uri>`.
    ///
    /// Arguments are decoded from JSON (a tuple arrives as an array), the result is encoded
    /// back. May be called before or after connect; registering `uri` again replaces the
    /// previous handler.
    pub fn register_call<A, R, E, F>(&self, uri: &str, handler: F) -> Result<(), ServiceError>
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        E: Display + 'static,
        F: Fn(A) -> Result<R, E> + Send + Sync + 'static,
    {
        let dispatcher = self.core.dispatcher(handler);
        let replaced = self
            .core
            .calls
            .lock()
            .insert(uri.to_string(), Arc::clone(&dispatcher))
            .is_some();

        if self.core.lifecycle.has_session() {
            if replaced {
                self.core.unregister_remote(uri);
            }
            self.core.register_remote(uri, dispatcher)?;
        }
        tracing::debug!(service = %self.name(), %uri, "call registered");
        Ok(())
    }

    /// Removes the handler of `uri`.
    pub fn unregister_call(&self, uri: &str) {
        if self.core.calls.lock().remove(uri).is_some() && self.core.lifecycle.has_session() {
            self.core.unregister_remote(uri);
        }
    }

    /// Publishes `message` on `<name>.<topic>`.
    pub fn publish<T: Serialize>(&self, topic: &str, message: &T) -> Result<(), ServiceError> {
        self.core.publish_event(topic, message)
    }

    /// Connects using the broker address of the configuration.
    pub fn connect_default(&self) -> Result<(), ServiceError> {
        let (host, port) = self.core.lifecycle.config().broker_address();
        self.connect(&host, port)
    }

    /// Runs the task loop on the calling thread.
    pub fn run(&self) -> Result<(), LoopError> {
        self.core.lifecycle.task_loop().run()
    }

    /// Runs the task loop on its own thread.
    pub fn run_async(&self) -> Result<LoopFuture, LoopError> {
        self.core.lifecycle.task_loop().run_async()
    }

    /// Stops the task loop.
    pub fn stop(&self) {
        self.core.lifecycle.task_loop().stop();
    }

    /// Changes the heartbeat period; a running heartbeat restarts with it.
    pub fn set_alive_period(&self, period: Duration) {
        *self.core.alive_period.lock() = period;
        self.core.reset_heartbeat();
    }

    /// True while a call handler is executing.
    pub fn is_alive_suspended(&self) -> bool {
        self.core.suspension.is_suspended()
    }

    pub fn task_loop(&self) -> &TaskLoop {
        self.core.lifecycle.task_loop()
    }

    pub fn lifecycle(&self) -> &ConnectionLifecycle {
        &self.core.lifecycle
    }
}

impl Service for ServiceImpl {
    fn name(&self) -> &str {
        self.core.lifecycle.name()
    }

    fn connect(&self, url: &str, port: u16) -> Result<(), ServiceError> {
        let role: Weak<dyn ServiceRole> = self.core.self_ref.clone();
        self.core.lifecycle.connect(role, url, port)
    }

    fn disconnect(&self) {
        self.core.lifecycle.disconnect(self.core.as_ref());
    }

    fn is_connected(&self) -> bool {
        self.core.lifecycle.is_connected()
    }

    fn alive_period(&self) -> Duration {
        self.core.alive_period()
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

impl Drop for ServiceImpl {
    fn drop(&mut self) {
        self.disconnect();
        self.core.lifecycle.stop_owned_loop();
    }
}

impl ServerCore {
    fn alive_period(&self) -> Duration {
        *self.alive_period.lock()
    }

    fn dispatcher<A, R, E, F>(&self, handler: F) -> Dispatcher
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        E: Display + 'static,
        F: Fn(A) -> Result<R, E> + Send + Sync + 'static,
    {
        Arc::new(move |args: &str| {
            let args: A =
                serde_json::from_str(args).map_err(|e| format!("cannot decode arguments: {e}"))?;
            let result = handler(args).map_err(|e| e.to_string())?;
            serde_json::to_string(&result).map_err(|e| format!("cannot encode result: {e}"))
        })
    }

    /// Substrate handler for `uri`: runs `dispatcher` with the heartbeat suspended.
    fn call_handler(&self, uri: &str, dispatcher: Dispatcher) -> CallHandler {
        let weak = self.self_ref.clone();
        let uri = uri.to_string();
        Arc::new(move |args: &str| {
            let Some(core) = weak.upgrade() else {
                return Err("service is gone".to_string());
            };
            core.dispatch(&uri, &dispatcher, args)
        })
    }

    fn dispatch(&self, uri: &str, dispatcher: &Dispatcher, args: &str) -> Result<String, String> {
        let outcome = {
            let _suspended = self.suspension.suspend(|| self.reset_heartbeat());
            match panic::catch_unwind(AssertUnwindSafe(|| dispatcher(args))) {
                Ok(outcome) => outcome,
                Err(payload) => Err(format!(
                    "handler panicked: {}",
                    panic_message(payload.as_ref())
                )),
            }
        };

        if let Err(error) = &outcome {
            tracing::error!(service = %self.lifecycle.name(), %uri, %error, "call handler failed");
            self.lifecycle.bus().publish(
                Event::new(EventKind::RuntimeError)
                    .with_service(self.lifecycle.name())
                    .with_uri(uri)
                    .with_reason(error.as_str()),
            );
            let message = RuntimeErrorMsg {
                uri: uri.to_string(),
                error: error.clone(),
            };
            if let Err(e) = self.publish_event(TOPIC_RUNTIME_ERROR, &message) {
                tracing::warn!(service = %self.lifecycle.name(), error = %e, "cannot publish runtime error");
            }
        }
        outcome
    }

    fn register_remote(&self, uri: &str, dispatcher: Dispatcher) -> Result<(), ServiceError> {
        let full_uri = self.lifecycle.make_full_uri(uri);
        let session = self.lifecycle.session()?;
        session.register_call(
            &full_uri,
            self.call_handler(uri, dispatcher),
            self.lifecycle.error_delegate(&full_uri),
        )?;
        Ok(())
    }

    fn unregister_remote(&self, uri: &str) {
        let full_uri = self.lifecycle.make_full_uri(uri);
        let Ok(session) = self.lifecycle.session() else {
            return;
        };
        if let Err(e) = session.unregister_call(&full_uri, self.lifecycle.error_delegate(&full_uri)) {
            tracing::debug!(service = %self.lifecycle.name(), uri = %full_uri, error = %e, "unregister skipped");
        }
    }

    fn publish_event<T: Serialize>(&self, topic: &str, message: &T) -> Result<(), ServiceError> {
        let full_topic = self.lifecycle.make_full_uri(topic);
        let payload = encode_event(message)?;
        let session = self.lifecycle.session()?;
        session.publish(&full_topic, payload, self.lifecycle.error_delegate(&full_topic))?;
        Ok(())
    }

    fn publish_ready(&self) {
        let message = ReadyMsg {
            alive_period_ms: duration_ms(self.alive_period()),
        };
        if let Err(e) = self.publish_event(TOPIC_READY, &message) {
            tracing::warn!(service = %self.lifecycle.name(), error = %e, "cannot publish ready");
        }
    }

    fn publish_alive(&self) {
        let message = AliveMsg {
            alive_period_ms: duration_ms(self.alive_period()),
        };
        let published = self
            .suspension
            .run_if_idle(|| self.publish_event(TOPIC_ALIVE, &message));
        match published {
            Some(Err(e)) => {
                tracing::warn!(service = %self.lifecycle.name(), error = %e, "cannot publish alive");
            }
            Some(Ok(())) => {}
            None => {
                tracing::trace!(service = %self.lifecycle.name(), "alive suspended by call in flight");
            }
        }
    }

    fn start_heartbeat(&self) {
        let mut heartbeat = self.heartbeat.lock();
        self.install_heartbeat(&mut heartbeat);
    }

    fn stop_heartbeat(&self) {
        if let Some(task) = self.heartbeat.lock().take() {
            task.set_enabled(false);
        }
    }

    /// Restarts a running heartbeat so the next alive message is one full period away.
    fn reset_heartbeat(&self) {
        let mut heartbeat = self.heartbeat.lock();
        if heartbeat.is_some() {
            self.install_heartbeat(&mut heartbeat);
        }
    }

    /// Replaces the heartbeat task in `slot`; the caller holds the `heartbeat` lock.
    fn install_heartbeat(&self, slot: &mut Option<TaskRef>) {
        let Some(core) = self.self_ref.upgrade() else {
            return;
        };
        let period = self.alive_period();
        let task = self
            .lifecycle
            .task_loop()
            .push_repeated_method(period, &core, ServerCore::publish_alive);
        if let Some(previous) = slot.replace(task) {
            previous.set_enabled(false);
        }
    }

    fn register_all(&self) -> Result<(), ServiceError> {
        let calls: Vec<(String, Dispatcher)> = self
            .calls
            .lock()
            .iter()
            .map(|(uri, d)| (uri.clone(), Arc::clone(d)))
            .collect();
        for (uri, dispatcher) in calls {
            self.register_remote(&uri, dispatcher)?;
        }
        Ok(())
    }
}

impl ServiceRole for ServerCore {
    fn do_register(&self) -> Result<bool, ServiceError> {
        self.register_all()?;
        self.publish_ready();
        self.start_heartbeat();
        tracing::info!(
            service = %self.lifecycle.name(),
            alive_period = ?self.alive_period(),
            "server registered"
        );
        Ok(true)
    }

    fn do_unregister(&self) {
        self.stop_heartbeat();
        let uris: Vec<String> = self.calls.lock().keys().cloned().collect();
        for uri in uris {
            self.unregister_remote(&uri);
        }
    }

    fn on_messaging_connection(&self, connected: bool) {
        if !connected {
            self.stop_heartbeat();
            self.lifecycle.set_connected(false, "transport");
            return;
        }
        let Some(core) = self.self_ref.upgrade() else {
            return;
        };
        self.lifecycle
            .task_loop()
            .push_method(&core, |core: &ServerCore| {
                if !core.lifecycle.has_session() {
                    return;
                }
                match core.do_register() {
                    Ok(_) => {
                        core.lifecycle.set_connected(true, "transport");
                    }
                    Err(e) => {
                        tracing::error!(service = %core.lifecycle.name(), error = %e, "re-registration failed");
                    }
                }
            });
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::MemoryBroker;
    use crate::messaging::Messaging;
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(2);

    fn server(broker: &MemoryBroker, alive: Duration) -> ServiceImpl {
        let config = ServiceConfig {
            alive_period: alive,
            ..ServiceConfig::default()
        };
        ServiceImpl::new("calc", Arc::new(broker.clone()), config)
    }

    fn client(broker: &MemoryBroker) -> crate::messaging::memory::MemorySession {
        let session = broker.session(crate::messaging::DEFAULT_REALM);
        session.connect().unwrap();
        session
    }

    fn call(session: &dyn Messaging, uri: &str, args: &str) -> Result<String, String> {
        let (tx, rx) = mpsc::channel();
        let err_tx = tx.clone();
        session
            .invoke(
                uri,
                args.to_string(),
                Box::new(move |r| tx.send(Ok(r)).unwrap()),
                Arc::new(move |e| {
                    let _ = err_tx.send(Err(e.to_string()));
                }),
            )
            .unwrap();
        rx.recv_timeout(WAIT).unwrap()
    }

    #[test]
    fn test_registered_call_is_dispatched() {
        let broker = MemoryBroker::new();
        let srv = server(&broker, Duration::from_secs(1));
        srv.register_call("add", |(a, b): (i32, i32)| Ok::<_, String>(a + b))
            .unwrap();
        srv.connect("localhost", 8080).unwrap();
        assert!(srv.is_connected());
        assert_eq!(broker.registration_count(crate::messaging::DEFAULT_REALM), 2);

        let c = client(&broker);
        assert_eq!(call(&c, "calc.add", "[2,3]"), Ok("5".to_string()));
        assert_eq!(call(&c, "calc.get.alive.period", "null"), Ok("1000".to_string()));
    }

    #[test]
    fn test_failing_handler_publishes_runtime_error() {
        let broker = MemoryBroker::new();
        let srv = server(&broker, Duration::from_secs(1));
        srv.register_call("fail", |(): ()| Err::<(), _>("division by zero"))
            .unwrap();
        srv.connect("localhost", 8080).unwrap();

        let c = client(&broker);
        let (tx, rx) = mpsc::channel::<String>();
        c.subscribe(
            "calc.error.runtime",
            Arc::new(move |e: &str| tx.send(e.to_string()).unwrap()),
            Arc::new(|_| {}),
        )
        .unwrap();

        let outcome = call(&c, "calc.fail", "null");
        assert!(outcome.unwrap_err().contains("division by zero"));
        let published = rx.recv_timeout(WAIT).unwrap();
        assert!(published.contains("division by zero"));
        assert!(published.contains("fail"));
    }

    #[test]
    fn test_panicking_handler_reports_error() {
        let broker = MemoryBroker::new();
        let srv = server(&broker, Duration::from_secs(1));
        srv.register_call("boom", |(): ()| -> Result<(), String> { panic!("exploded") })
            .unwrap();
        srv.connect("localhost", 8080).unwrap();

        let c = client(&broker);
        assert!(call(&c, "calc.boom", "null").unwrap_err().contains("exploded"));
        assert!(!srv.is_alive_suspended());
    }

    #[test]
    fn test_bad_arguments_are_rejected() {
        let broker = MemoryBroker::new();
        let srv = server(&broker, Duration::from_secs(1));
        srv.register_call("add", |(a, b): (i32, i32)| Ok::<_, String>(a + b))
            .unwrap();
        srv.connect("localhost", 8080).unwrap();
        let c = client(&broker);
        assert!(call(&c, "calc.add", r#""x""#)
            .unwrap_err()
            .contains("cannot decode arguments"));
    }

    #[test]
    fn test_heartbeat_is_published() {
        let broker = MemoryBroker::new();
        let srv = server(&broker, Duration::from_millis(20));
        let c = client(&broker);
        let (tx, rx) = mpsc::channel::<String>();
        c.subscribe(
            "calc.notify.alive",
            Arc::new(move |e: &str| {
                let _ = tx.send(e.to_string());
            }),
            Arc::new(|_| {}),
        )
        .unwrap();

        srv.connect("localhost", 8080).unwrap();
        let _done = srv.run_async().unwrap();
        let alive = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(alive, r#"{"data":{"alive_period_ms":20}}"#);

        srv.disconnect();
        srv.stop();
        assert!(!srv.is_connected());
        assert_eq!(broker.registration_count(crate::messaging::DEFAULT_REALM), 0);
    }

    #[test]
    fn test_register_after_connect() {
        let broker = MemoryBroker::new();
        let srv = server(&broker, Duration::from_secs(1));
        srv.connect("localhost", 8080).unwrap();
        srv.register_call("echo", |(s,): (String,)| Ok::<_, String>(s))
            .unwrap();
        srv.register_call("echo", |(s,): (String,)| Ok::<_, String>(s.to_uppercase()))
            .unwrap();
        let c = client(&broker);
        assert_eq!(call(&c, "calc.echo", r#"["hi"]"#), Ok(r#""HI""#.to_string()));

        srv.unregister_call("echo");
        assert!(call(&c, "calc.echo", r#"["hi"]"#).is_err());
    }

    #[test]
    fn test_call_ending_after_disconnect_keeps_heartbeat_stopped() {
        let broker = MemoryBroker::new();
        let srv = server(&broker, Duration::from_millis(20));
        srv.register_call("nap", |(ms,): (u64,)| {
            std::thread::sleep(Duration::from_millis(ms));
            Ok::<_, String>(ms)
        })
        .unwrap();
        srv.connect("localhost", 8080).unwrap();
        let _done = srv.run_async().unwrap();
        assert!(srv.core.heartbeat.lock().is_some());

        let c = client(&broker);
        c.invoke("calc.nap", "[80]".to_string(), Box::new(|_| {}), Arc::new(|_| {}))
            .unwrap();
        let deadline = std::time::Instant::now() + WAIT;
        while !srv.is_alive_suspended() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(srv.is_alive_suspended());

        srv.disconnect();
        while srv.is_alive_suspended() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(!srv.is_alive_suspended());
        std::thread::sleep(Duration::from_millis(20));
        assert!(srv.core.heartbeat.lock().is_none());
        srv.stop();
    }
}
