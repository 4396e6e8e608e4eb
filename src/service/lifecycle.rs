//! # Connection lifecycle shared by the server and client roles.
//!
//! [`ConnectionLifecycle`] owns the messaging session of a service, its task loop handle, the
//! call timeout and the observable connection state. A role ([`ServiceRole`]) plugs into it
//! through three hooks.
//!
//! ## Connect / disconnect
//! ```text
//! connect(url, port)
//!   ├─► factory.open(ws://url:port, realm)
//!   ├─► session.connect()   fails ─► ConnectRetry event, sleep(backoff.next(n)), retry
//!   ├─► role.do_register()  Err   ─► session closed, error returned
//!   └─► live? ─► connected = true (ServiceConnected)
//!
//! disconnect()
//!   ├─► role.do_unregister()
//!   ├─► session.disconnect()
//!   └─► connected = false (ServiceDisconnected, reason "disconnect")
//!
//! transport up/down (substrate thread) ─► role.on_messaging_connection(bool)
//! ```

use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::config::ServiceConfig;
use crate::error::{MessagingError, ServiceError};
use crate::events::{Bus, Event, EventKind};
use crate::messaging::{broker_url, ErrorDelegate, Messaging, MessagingFactory};
use crate::scheduler::TaskLoop;
use crate::service::messages::ServiceConnectionMsg;

/// Role-specific hooks driven by [`ConnectionLifecycle`].
pub trait ServiceRole: Send + Sync {
    /// Registers the role on a freshly opened session.
    ///
    /// Returns `true` when the service is live as soon as registration completes.
    fn do_register(&self) -> Result<bool, ServiceError>;

    /// Undoes [`do_register`](Self::do_register) before the session is closed.
    fn do_unregister(&self);

    /// Called on a substrate thread when the transport goes down or comes back.
    fn on_messaging_connection(&self, connected: bool);
}

/// Session, task loop and connection state of one service.
pub struct ConnectionLifecycle {
    name: Arc<str>,
    config: ServiceConfig,
    factory: Arc<dyn MessagingFactory>,
    session: RwLock<Option<Arc<dyn Messaging>>>,
    task_loop: TaskLoop,
    owns_loop: bool,
    call_timeout: Mutex<Duration>,
    state: watch::Sender<ServiceConnectionMsg>,
    bus: Bus,
}

impl ConnectionLifecycle {
    /// Creates a lifecycle owning a fresh task loop.
    pub fn new(name: &str, factory: Arc<dyn MessagingFactory>, config: ServiceConfig) -> Self {
        let task_loop = TaskLoop::new(name);
        Self::build(name, factory, config, task_loop, true)
    }

    /// Creates a lifecycle scheduling its work on a shared `task_loop`.
    pub fn with_task_loop(
        name: &str,
        factory: Arc<dyn MessagingFactory>,
        config: ServiceConfig,
        task_loop: TaskLoop,
    ) -> Self {
        Self::build(name, factory, config, task_loop, false)
    }

    fn build(
        name: &str,
        factory: Arc<dyn MessagingFactory>,
        config: ServiceConfig,
        task_loop: TaskLoop,
        owns_loop: bool,
    ) -> Self {
        let (state, _) = watch::channel(ServiceConnectionMsg::default());
        Self {
            name: Arc::from(name),
            bus: Bus::new(config.bus_capacity_clamped()),
            call_timeout: Mutex::new(config.call_timeout),
            config,
            factory,
            session: RwLock::new(None),
            task_loop,
            owns_loop,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// The loop the roles schedule their periodic work on.
    pub fn task_loop(&self) -> &TaskLoop {
        &self.task_loop
    }

    /// True if the loop was created by this lifecycle.
    pub fn owns_loop(&self) -> bool {
        self.owns_loop
    }

    /// Returns `"<service>.<uri>"`.
    pub fn make_full_uri(&self, uri: &str) -> String {
        format!("{}.{}", self.name, uri)
    }

    /// Bound of client calls; `None` waits without limit.
    pub fn call_timeout(&self) -> Option<Duration> {
        let timeout = *self.call_timeout.lock();
        (timeout != Duration::ZERO).then_some(timeout)
    }

    /// Sets the bound of subsequent client calls (`Duration::ZERO` = unlimited).
    pub fn set_call_timeout(&self, timeout: Duration) {
        *self.call_timeout.lock() = timeout;
    }

    /// The open session, if any.
    pub fn session(&self) -> Result<Arc<dyn Messaging>, ServiceError> {
        self.session
            .read()
            .clone()
            .ok_or_else(|| ServiceError::NotConnected {
                service: self.name.to_string(),
            })
    }

    /// True while a session is open (independent of liveness).
    pub fn has_session(&self) -> bool {
        self.session.read().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    /// Receiver of connection changes.
    pub fn watch_connection(&self) -> watch::Receiver<ServiceConnectionMsg> {
        self.state.subscribe()
    }

    /// Updates the connection state; returns `true` if it changed.
    ///
    /// A change is published on the bus as `ServiceConnected` / `ServiceDisconnected`.
    pub fn set_connected(&self, connected: bool, reason: &str) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.connected == connected {
                return false;
            }
            state.connected = connected;
            true
        });
        if changed {
            if connected {
                tracing::info!(service = %self.name, "service connected");
                self.bus
                    .publish(Event::new(EventKind::ServiceConnected).with_service(self.name.as_ref()));
            } else {
                tracing::info!(service = %self.name, %reason, "service disconnected");
                self.bus.publish(
                    Event::new(EventKind::ServiceDisconnected)
                        .with_service(self.name.as_ref())
                        .with_reason(reason),
                );
            }
        }
        changed
    }

    /// Error delegate logging substrate failures for `uri` and publishing them on the bus.
    pub fn error_delegate(&self, uri: &str) -> ErrorDelegate {
        let name = Arc::clone(&self.name);
        let bus = self.bus.clone();
        let uri: Arc<str> = Arc::from(uri);
        Arc::new(move |error: MessagingError| {
            tracing::warn!(service = %name, uri = %uri, error = %error, "messaging request failed");
            bus.publish(
                Event::new(EventKind::TransportError)
                    .with_service(Arc::clone(&name))
                    .with_uri(Arc::clone(&uri))
                    .with_reason(error.to_string()),
            );
        })
    }

    /// Opens a session on `url:port` and registers `role` on it.
    ///
    /// No-op if a session is already open.
    pub fn connect(
        &self,
        role: Weak<dyn ServiceRole>,
        url: &str,
        port: u16,
    ) -> Result<(), ServiceError> {
        if self.has_session() {
            tracing::debug!(service = %self.name, "already connected");
            return Ok(());
        }

        let address = broker_url(url, port);
        let session = self.factory.open(&address, &self.config.realm)?;

        let observer = role.clone();
        session.set_connection_delegate(Some(Arc::new(move |connected| {
            if let Some(role) = observer.upgrade() {
                role.on_messaging_connection(connected);
            }
        })));

        if let Err(e) = self.open_with_retry(session.as_ref()) {
            session.set_connection_delegate(None);
            return Err(e);
        }
        *self.session.write() = Some(Arc::clone(&session));
        tracing::debug!(service = %self.name, %address, realm = %self.config.realm, "session open");

        let registered = match role.upgrade() {
            Some(role) => role.do_register(),
            None => Err(ServiceError::NotConnected {
                service: self.name.to_string(),
            }),
        };
        match registered {
            Ok(live) => {
                if live {
                    self.set_connected(true, "registered");
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!(service = %self.name, error = %e, "registration failed");
                self.close_session(&session);
                Err(e)
            }
        }
    }

    /// Unregisters `role` and closes the session.
    pub fn disconnect(&self, role: &dyn ServiceRole) {
        let Some(session) = self.session.read().clone() else {
            return;
        };
        role.do_unregister();
        self.close_session(&session);
        self.set_connected(false, "disconnect");
    }

    fn close_session(&self, session: &Arc<dyn Messaging>) {
        session.set_connection_delegate(None);
        session.disconnect();
        *self.session.write() = None;
    }

    fn open_with_retry(&self, session: &dyn Messaging) -> Result<(), ServiceError> {
        let attempts = self.config.connect_attempts_clamped();
        let mut attempt = 0;
        loop {
            match session.connect() {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < attempts => {
                    let delay = self.config.backoff.next(attempt);
                    attempt += 1;
                    tracing::warn!(service = %self.name, attempt, ?delay, error = %e, "connect failed; retrying");
                    self.bus.publish(
                        Event::new(EventKind::ConnectRetry)
                            .with_service(self.name.as_ref())
                            .with_attempt(attempt)
                            .with_delay(delay)
                            .with_reason(e.to_string()),
                    );
                    thread::sleep(delay);
                }
                Err(e) => {
                    tracing::error!(service = %self.name, attempts, error = %e, "connect failed");
                    return Err(e.into());
                }
            }
        }
    }

    /// Starts an owned loop on its own thread; no-op for shared or running loops.
    pub fn start_owned_loop(&self) {
        if !self.owns_loop || self.task_loop.is_running() {
            return;
        }
        if let Err(e) = self.task_loop.run_async() {
            tracing::debug!(service = %self.name, error = %e, "owned loop not started");
        }
    }

    /// Stops an owned loop; no-op for shared loops.
    pub fn stop_owned_loop(&self) {
        if self.owns_loop {
            self.task_loop.stop();
        }
    }
}

impl std::fmt::Debug for ConnectionLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLifecycle")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .field("session", &self.has_session())
            .field("owns_loop", &self.owns_loop)
            .finish()
    }
}
