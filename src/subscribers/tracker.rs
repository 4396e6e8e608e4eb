//! # Connection tracker with sequence-based ordering.
//!
//! Maintains the latest known connection state of every service publishing on a bus,
//! using event sequence numbers to handle out-of-order delivery.
//!
//! ## Architecture
//! ```text
//! Service ──► Bus ──► SubscriberSet worker ──► ConnectionTracker::update()
//!                                                     │
//!                                                     ▼
//!                                        HashMap<String, ServiceState>
//!                                          (name → {seq, connected})
//! ```
//!
//! ## Rules
//! - Only `ServiceConnected` / `ServiceDisconnected` change the connected flag
//! - Other events **update seq** but don't affect the flag
//! - Events with `seq <= last_seq` are **rejected** (stale)

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Per-service state for ordering validation.
#[derive(Debug, Clone)]
struct ServiceState {
    /// Last seen sequence number for this service.
    last_seq: u64,
    connected: bool,
}

/// Thread-safe tracker of service connection states.
#[derive(Default)]
pub struct ConnectionTracker {
    state: RwLock<HashMap<String, ServiceState>>,
}

impl ConnectionTracker {
    /// Creates a new empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `ev` if it is newer than the last event seen for its service.
    ///
    /// Returns `true` when the connected flag was (re)assigned.
    pub async fn update(&self, ev: &Event) -> bool {
        let name = match ev.service.as_deref() {
            Some(n) => n,
            None => return false,
        };

        let mut state = self.state.write().await;
        let entry = state.entry(name.to_string()).or_insert(ServiceState {
            last_seq: 0,
            connected: false,
        });

        if ev.seq < entry.last_seq {
            return false;
        }
        entry.last_seq = ev.seq;
        match ev.kind {
            EventKind::ServiceConnected => {
                entry.connected = true;
                true
            }
            EventKind::ServiceDisconnected => {
                entry.connected = false;
                true
            }
            _ => false,
        }
    }

    /// Returns the sorted names of services currently connected.
    pub async fn snapshot(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut connected: Vec<String> = state
            .iter()
            .filter(|(_, s)| s.connected)
            .map(|(name, _)| name.clone())
            .collect();
        connected.sort_unstable();
        connected
    }

    /// True if `name` is currently connected.
    pub async fn is_connected(&self, name: &str) -> bool {
        self.state
            .read()
            .await
            .get(name)
            .map(|s| s.connected)
            .unwrap_or(false)
    }
}

#[async_trait]
impl Subscribe for ConnectionTracker {
    async fn on_event(&self, event: &Event) {
        self.update(event).await;
    }

    fn name(&self) -> &'static str {
        "connection-tracker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracks_transitions() {
        let tracker = ConnectionTracker::new();
        let up = Event::new(EventKind::ServiceConnected).with_service("clock");
        let down = Event::new(EventKind::ServiceDisconnected).with_service("clock");

        assert!(tracker.update(&up).await);
        assert!(tracker.is_connected("clock").await);
        assert_eq!(tracker.snapshot().await, vec!["clock".to_string()]);

        assert!(tracker.update(&down).await);
        assert!(!tracker.is_connected("clock").await);
    }

    #[tokio::test]
    async fn test_rejects_stale_events() {
        let tracker = ConnectionTracker::new();
        let older = Event::new(EventKind::ServiceConnected).with_service("clock");
        let newer = Event::new(EventKind::ServiceDisconnected).with_service("clock");

        assert!(tracker.update(&newer).await);
        assert!(!tracker.update(&older).await);
        assert!(!tracker.is_connected("clock").await);
    }

    #[tokio::test]
    async fn test_ignores_anonymous_events() {
        let tracker = ConnectionTracker::new();
        assert!(!tracker.update(&Event::new(EventKind::ServiceConnected)).await);
        assert!(tracker.snapshot().await.is_empty());
    }
}
