//! # Runtime events emitted by services.
//!
//! The [`EventKind`] enum classifies event types across three categories:
//! - **Connection events**: connection state transitions, readiness, connect retries
//! - **Failure events**: transport errors, remote runtime errors, call timeouts
//! - **Subscriber events**: overflow / panic inside a bus subscriber
//!
//! The [`Event`] struct carries additional metadata such as timestamps, service name,
//! uri, reasons, and delays.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use servicevisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::CallTimedOut)
//!     .with_service("clock")
//!     .with_uri("clock.get.time")
//!     .with_timeout(Duration::from_millis(50));
//!
//! assert_eq!(ev.kind, EventKind::CallTimedOut);
//! assert_eq!(ev.service.as_deref(), Some("clock"));
//! assert_eq!(ev.timeout_ms, Some(50));
//! ```

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `service`: subscriber name
    /// - `reason`: panic info/message
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `service`: subscriber name
    /// - `reason`: reason string (e.g., "full", "closed")
    SubscriberOverflow,

    // === Connection events ===
    /// The service became connected (server registered, or client saw a live server).
    ///
    /// Sets:
    /// - `service`: service name
    ServiceConnected,

    /// The service became disconnected.
    ///
    /// Sets:
    /// - `service`: service name
    /// - `reason`: `"disconnect"`, `"transport"` or `"alive timeout"`
    ServiceDisconnected,

    /// A server announced readiness (published by the server, observed by clients).
    ///
    /// Sets:
    /// - `service`: service name
    /// - `delay_ms`: alive period announced by the server
    ServiceReady,

    /// The client watchdog fired without any message since its previous firing.
    ///
    /// Sets:
    /// - `service`: service name
    /// - `timeout_ms`: watchdog period
    AliveLost,

    /// A substrate connect attempt failed and another attempt is scheduled.
    ///
    /// Sets:
    /// - `service`: service name
    /// - `attempt`: failed attempt number (1-based)
    /// - `delay_ms`: delay before the next attempt
    /// - `reason`: failure message
    ConnectRetry,

    // === Failure events ===
    /// The substrate reported a transport failure through an error delegate.
    ///
    /// Sets:
    /// - `service`: service name
    /// - `uri`: topic or procedure involved, when known
    /// - `reason`: error message
    TransportError,

    /// A call handler failed on the server side (`error.runtime`).
    ///
    /// Sets:
    /// - `service`: service name
    /// - `uri`: procedure whose handler failed, when known
    /// - `reason`: handler error text
    RuntimeError,

    /// A client call exceeded its timeout.
    ///
    /// Sets:
    /// - `service`: service name
    /// - `uri`: procedure
    /// - `timeout_ms`: call timeout
    CallTimedOut,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Name of the service (or subscriber), if applicable.
    pub service: Option<Arc<str>>,
    /// Topic or procedure uri, if applicable.
    pub uri: Option<Arc<str>>,
    /// Human-readable reason (errors, overflow details, etc.).
    pub reason: Option<Arc<str>>,
    /// Timeout in milliseconds (compact).
    pub timeout_ms: Option<u32>,
    /// Delay or period in milliseconds (compact).
    pub delay_ms: Option<u32>,
    /// Attempt count (starting from 1).
    pub attempt: Option<u32>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            service: None,
            uri: None,
            reason: None,
            timeout_ms: None,
            delay_ms: None,
            attempt: None,
        }
    }

    /// Attaches a service name.
    #[inline]
    pub fn with_service(mut self, service: impl Into<Arc<str>>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Attaches a topic or procedure uri.
    #[inline]
    pub fn with_uri(mut self, uri: impl Into<Arc<str>>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches a timeout duration (stored as milliseconds).
    #[inline]
    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout_ms = Some(compact_ms(d));
        self
    }

    /// Attaches a delay or period (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay_ms = Some(compact_ms(d));
        self
    }

    /// Attaches an attempt count.
    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_service(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_service(subscriber)
            .with_reason(info)
    }

    /// True for `ServiceConnected` / `ServiceDisconnected`.
    #[inline]
    pub fn is_connection_change(&self) -> bool {
        matches!(
            self.kind,
            EventKind::ServiceConnected | EventKind::ServiceDisconnected
        )
    }

    #[inline]
    pub fn is_subscriber_overflow(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberOverflow)
    }

    #[inline]
    pub fn is_subscriber_panic(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberPanicked)
    }
}

fn compact_ms(d: Duration) -> u32 {
    d.as_millis().min(u128::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_increases() {
        let a = Event::new(EventKind::ServiceConnected);
        let b = Event::new(EventKind::ServiceDisconnected);
        assert!(b.seq > a.seq);
        assert!(a.is_connection_change());
    }

    #[test]
    fn test_durations_saturate() {
        let ev = Event::new(EventKind::AliveLost).with_timeout(Duration::from_secs(u64::MAX));
        assert_eq!(ev.timeout_ms, Some(u32::MAX));
    }
}
