//! # Messaging substrate boundary.
//!
//! The service layer talks to a broker through the [`Messaging`] trait: a non-blocking,
//! delegate-based pub/sub + RPC session. Payloads are JSON text; the service layer owns
//! (de)serialization.
//!
//! ## Delegates
//! ```text
//! register_call(uri, CallHandler)        CallHandler:   Fn(&str)   -> Result<String, String>
//! invoke(uri, args, ResultDelegate, ..)  ResultDelegate: FnOnce(String)          (called once)
//! subscribe(topic, EventDelegate, ..)    EventDelegate:  Fn(&str)                (per event)
//! every request ............ ErrorDelegate:  Fn(MessagingError)      (async failures)
//! set_connection_delegate .. ConnectionDelegate: Fn(bool)            (transport up/down)
//! ```
//!
//! ## Rules
//! - Requests that cannot be issued (not connected, duplicate registration) fail synchronously.
//! - Failures after issue are reported through the request's error delegate, exactly once.
//! - For an invoke, exactly one of the result delegate or the error delegate is called.
//! - Delegates run on a substrate-owned thread, never on the caller of the request.
//!
//! [`memory`] provides an in-process implementation.

pub mod memory;

use std::sync::Arc;

use crate::error::MessagingError;

/// Realm used when none is configured.
pub const DEFAULT_REALM: &str = "osbase";

/// Server-side procedure: receives the JSON arguments, returns the JSON result or an error text.
pub type CallHandler = Arc<dyn Fn(&str) -> Result<String, String> + Send + Sync>;

/// Client-side completion of an invoke; receives the JSON result.
pub type ResultDelegate = Box<dyn FnOnce(String) + Send>;

/// Receives each JSON event published on a subscribed topic.
pub type EventDelegate = Arc<dyn Fn(&str) + Send + Sync>;

/// Receives failures of a request after it was issued.
pub type ErrorDelegate = Arc<dyn Fn(MessagingError) + Send + Sync>;

/// Receives transport connection changes.
pub type ConnectionDelegate = Arc<dyn Fn(bool) + Send + Sync>;

/// A session on a pub/sub + RPC broker.
pub trait Messaging: Send + Sync {
    /// Opens the session.
    fn connect(&self) -> Result<(), MessagingError>;

    /// Closes the session; registrations and subscriptions are dropped.
    fn disconnect(&self);

    /// True while the session is open.
    fn is_connected(&self) -> bool;

    /// Installs the delegate notified when the transport goes down or comes back.
    fn set_connection_delegate(&self, delegate: Option<ConnectionDelegate>);

    /// Registers `handler` as the callee of `uri`.
    fn register_call(
        &self,
        uri: &str,
        handler: CallHandler,
        on_error: ErrorDelegate,
    ) -> Result<(), MessagingError>;

    /// Removes the registration of `uri`.
    fn unregister_call(&self, uri: &str, on_error: ErrorDelegate) -> Result<(), MessagingError>;

    /// Calls `uri` with JSON `args`; completion goes to `on_result` or `on_error`.
    fn invoke(
        &self,
        uri: &str,
        args: String,
        on_result: ResultDelegate,
        on_error: ErrorDelegate,
    ) -> Result<(), MessagingError>;

    /// Subscribes to `topic`; a second subscription to the same topic replaces the first.
    fn subscribe(
        &self,
        topic: &str,
        on_event: EventDelegate,
        on_error: ErrorDelegate,
    ) -> Result<(), MessagingError>;

    /// Cancels the subscription to `topic`.
    fn unsubscribe(&self, topic: &str, on_error: ErrorDelegate) -> Result<(), MessagingError>;

    /// Publishes JSON `args` on `topic` to every other session subscribed to it.
    fn publish(&self, topic: &str, args: String, on_error: ErrorDelegate)
        -> Result<(), MessagingError>;
}

/// Builds messaging sessions for a broker address.
pub trait MessagingFactory: Send + Sync {
    /// Creates an unconnected session on `url` (e.g. `ws://host:port`) in `realm`.
    fn open(&self, url: &str, realm: &str) -> Result<Arc<dyn Messaging>, MessagingError>;
}

/// Formats the broker url used by `connect(host, port)`.
pub fn broker_url(host: &str, port: u16) -> String {
    if host.contains("://") {
        format!("{host}:{port}")
    } else {
        format!("ws://{host}:{port}")
    }
}
