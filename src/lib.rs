//! # servicevisor
//!
//! **Servicevisor** is a small service runtime: processes register as services on a broker,
//! exchange RPC calls and published events, and watch each other's liveness through a
//! periodic heartbeat.
//!
//! All service logic runs on a cooperative [`TaskLoop`]: a single thread draining a
//! time-ordered [`TaskQueue`] of immediate, delayed and periodic tasks.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   ┌────────────────────────────┐                    ┌────────────────────────────┐
//!   │ ServiceImpl (server role)  │                    │ ServiceStub (client role)  │
//!   │ - dispatch table           │                    │ - pending calls            │
//!   │ - AliveSuspension          │                    │ - subscriptions            │
//!   │ - heartbeat task ──┐       │                    │ - watchdog task ──┐        │
//!   └──────┬─────────────┼───────┘                    └──────┬────────────┼────────┘
//!          │ ConnectionLifecycle                             │ ConnectionLifecycle
//!          │             ▼                                   │            ▼
//!          │      ┌────────────┐                             │     ┌────────────┐
//!          │      │  TaskLoop  │                             │     │  TaskLoop  │
//!          │      │ (TaskQueue)│                             │     │ (TaskQueue)│
//!          │      └────────────┘                             │     └────────────┘
//!          ▼                                                 ▼
//! ┌───────────────────────────────────────────────────────────────────────────────┐
//! │                Messaging substrate (pub/sub + RPC, JSON payloads)             │
//! │            MemoryBroker / MemorySession, or any `Messaging` impl              │
//! └───────────────────────────────────────────────────────────────────────────────┘
//!
//!   each service ── publish(Event) ──► Bus ──► SubscriberSet ──► LogWriter, custom...
//!                                          └─► ConnectionTracker
//! ```
//!
//! ### Liveness
//! ```text
//! server: connect ─► register calls ─► notify.ready ─► every alive_period: notify.alive
//!                                                       (skipped while a call runs)
//! client: connect ─► subscribe ─► get.alive.period ─► arm watchdog (factor × period)
//!         any message / call result ─► watchdog deadline pushed forward
//!         watchdog fires ─► Disconnected + AliveLost event
//!         next alive    ─► Connected again
//! ```
//!
//! ## Features
//! | Area            | Description                                                   | Key types / traits                          |
//! |-----------------|---------------------------------------------------------------|---------------------------------------------|
//! | **Scheduling**  | Time-ordered queue and the single-threaded loop draining it.  | [`TaskQueue`], [`TaskLoop`]                 |
//! | **Tasks**       | Closures, bound arguments and weak-receiver method tasks.     | [`Task`], [`TaskFn`], [`MethodTask`]        |
//! | **Services**    | Server and client roles over a messaging substrate.           | [`ServiceImpl`], [`ServiceStub`], [`Service`] |
//! | **Messaging**   | Substrate boundary and an in-process broker.                  | [`Messaging`], [`MemoryBroker`]             |
//! | **Events**      | Observability events and subscribers.                         | [`Bus`], [`Event`], [`Subscribe`]           |
//! | **Policies**    | Connect retry backoff.                                        | [`BackoffPolicy`], [`JitterPolicy`]         |
//! | **Errors**      | Typed errors for tasks, loops, substrate and services.        | [`TaskError`], [`LoopError`], [`ServiceError`] |
//! | **Configuration** | Service settings.                                           | [`ServiceConfig`], [`ServiceSettings`]      |
//!
//! ## Optional features
//! - `logging`: exports a simple built-in [`LogWriter`] _(demo/reference only)_.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use servicevisor::{MemoryBroker, Service, ServiceConfig, ServiceImpl, ServiceStub};
//!
//! let broker = Arc::new(MemoryBroker::new());
//! let config = ServiceConfig {
//!     alive_period: Duration::from_millis(100),
//!     call_timeout: Duration::from_secs(1),
//!     ..ServiceConfig::default()
//! };
//!
//! let server = ServiceImpl::new("calc", broker.clone(), config.clone());
//! server
//!     .register_call("add", |(a, b): (i64, i64)| Ok::<_, String>(a + b))
//!     .unwrap();
//! server.connect("127.0.0.1", 8080).unwrap();
//! server.run_async().unwrap();
//!
//! let client = ServiceStub::new("calc", broker, config);
//! client.connect("127.0.0.1", 8080).unwrap();
//! assert!(client.is_connected());
//!
//! let sum: i64 = client.invoke("add", &(2, 3)).unwrap();
//! assert_eq!(sum, 5);
//! ```
mod config;
mod error;
mod events;
mod messaging;
mod policies;
mod scheduler;
mod service;
mod subscribers;
mod tasks;

// ---- Public re-exports ----

pub use config::{ServiceConfig, ServiceInput, ServiceSettings, DEFAULT_BROKER_URL};
pub use error::{LoopError, MessagingError, ServiceError, TaskError};
pub use events::{Bus, Event, EventKind};
pub use messaging::memory::{MemoryBroker, MemorySession};
pub use messaging::{
    broker_url, CallHandler, ConnectionDelegate, ErrorDelegate, EventDelegate, Messaging,
    MessagingFactory, ResultDelegate, DEFAULT_REALM,
};
pub use policies::{BackoffPolicy, JitterPolicy};
pub use scheduler::{LoopFuture, LoopState, RuntimeErrorHandler, TaskLoop, TaskQueue};
pub use service::{
    AliveMsg, AliveSuspension, CallResult, ConnectionLifecycle, ReadyMsg, RuntimeErrorMsg,
    Service, ServiceConnectionMsg, ServiceImpl, ServiceMsg, ServiceRole, ServiceStub,
    SuspensionGuard, CALL_GET_ALIVE_PERIOD, TOPIC_ALIVE, TOPIC_READY, TOPIC_RUNTIME_ERROR,
};
pub use subscribers::{ConnectionTracker, Subscribe, SubscriberSet};
pub use tasks::{bind, IntoTaskResult, MethodTask, Task, TaskFn, TaskRef, TaskResult};

// Optional: expose a simple built-in logger subscriber (demo/reference).
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
