//! Service protocol layer: connect/disconnect lifecycle, RPC, pub/sub and heartbeat liveness.
//!
//! ## Contents
//! - [`ConnectionLifecycle`] / [`ServiceRole`] session, loop and connection state shared by both roles
//! - [`ServiceImpl`] server role: call handlers, ready message, heartbeat
//! - [`ServiceStub`]  client role: calls with timeout, subscriptions, watchdog
//! - [`Service`]      surface common to both roles
//!
//! ## Topics
//! Every topic and procedure is qualified by the service name on the broker:
//! ```text
//! <name>.notify.ready       ReadyMsg          once per registration
//! <name>.notify.alive       AliveMsg          every alive period (skipped while a call runs)
//! <name>.error.runtime      RuntimeErrorMsg   when a call handler fails
//! <name>.get.alive.period   call () -> u64    heartbeat period in milliseconds
//! ```

mod lifecycle;
mod messages;
mod server;
mod stub;
mod suspension;

use std::time::Duration;

use tokio::sync::watch;

use crate::error::ServiceError;
use crate::events::Bus;

pub use lifecycle::{ConnectionLifecycle, ServiceRole};
pub use messages::{AliveMsg, CallResult, ReadyMsg, RuntimeErrorMsg, ServiceConnectionMsg, ServiceMsg};
pub use server::ServiceImpl;
pub use stub::ServiceStub;
pub use suspension::{AliveSuspension, SuspensionGuard};

/// Topic of the readiness message.
pub const TOPIC_READY: &str = "notify.ready";
/// Topic of the heartbeat.
pub const TOPIC_ALIVE: &str = "notify.alive";
/// Topic of handler failures.
pub const TOPIC_RUNTIME_ERROR: &str = "error.runtime";
/// Procedure returning the heartbeat period.
pub const CALL_GET_ALIVE_PERIOD: &str = "get.alive.period";

/// Surface shared by servers and clients.
pub trait Service: Send + Sync {
    /// Service name; prefixes every topic and procedure.
    fn name(&self) -> &str;

    /// Connects to the broker at `url:port` and registers the role.
    fn connect(&self, url: &str, port: u16) -> Result<(), ServiceError>;

    /// Unregisters the role and closes the session. No-op when not connected.
    fn disconnect(&self);

    /// Current connection state.
    fn is_connected(&self) -> bool;

    /// Heartbeat period.
    fn alive_period(&self) -> Duration;

    /// Bounds subsequent calls; `Duration::ZERO` waits without limit.
    fn set_call_timeout(&self, timeout: Duration);

    /// Observes connection changes.
    fn watch_connection(&self) -> watch::Receiver<ServiceConnectionMsg>;

    /// Bus carrying this service's events.
    fn bus(&self) -> &Bus;
}
