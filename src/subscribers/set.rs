//! # SubscriberSet: non-blocking fan-out over multiple subscribers
//!
//! [`SubscriberSet`] distributes each [`Event`](crate::Event) to multiple
//! subscribers **without awaiting** their processing.
//!
//! ## What it guarantees
//! - `emit(&Event)` returns immediately.
//! - Per-subscriber FIFO (queue order).
//! - A panicking subscriber keeps receiving events; the panic is reported.
//!
//! ## What it does **not** guarantee
//! - No global ordering across different subscribers.
//! - No retries on per-subscriber queue overflow (events are dropped for that subscriber).
//!
//! ## Reports
//! Dropped events and subscriber panics are logged and published on the set's own
//! [`reports`](SubscriberSet::reports) bus as `SubscriberOverflow` / `SubscriberPanicked`.
//! Listen to that bus with a different set; a set listening to its own reports
//! feeds its overflow back into itself.
//!
//! ## Diagram
//! ```text
//!   Bus ──► listen() ──► emit(&Event)
//!                            │                      (Arc-clone per subscriber)
//!                            ├──────────► [queue S1] ─► worker S1 ─► on_event()
//!                            ├──────────► [queue S2] ─► worker S2 ─► on_event()
//!                            └──────────► [queue SN] ─► worker SN ─► on_event()
//!                   full queue / panic ──► reports bus
//! ```
//!
//! Workers are tokio tasks: [`SubscriberSet::new`] and [`SubscriberSet::listen`] must be
//! called from within a tokio runtime.

use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::error::panic_message;
use crate::events::{Bus, Event};

use super::Subscribe;

const REPORTS_CAPACITY: usize = 64;

struct Outlet {
    name: &'static str,
    queue: mpsc::Sender<Arc<Event>>,
}

/// Fan-out of bus events to subscribers, each behind its own bounded queue and worker.
pub struct SubscriberSet {
    outlets: Vec<Outlet>,
    workers: Vec<JoinHandle<()>>,
    reports: Bus,
}

impl SubscriberSet {
    /// Spawns one worker per subscriber.
    #[must_use]
    pub fn new(subs: Vec<Arc<dyn Subscribe>>) -> Self {
        let reports = Bus::new(REPORTS_CAPACITY);
        let (outlets, workers) = subs
            .into_iter()
            .map(|sub| {
                let (queue, rx) = mpsc::channel::<Arc<Event>>(sub.queue_capacity().max(1));
                let outlet = Outlet {
                    name: sub.name(),
                    queue,
                };
                (outlet, tokio::spawn(drive(sub, rx, reports.clone())))
            })
            .unzip();

        Self {
            outlets,
            workers,
            reports,
        }
    }

    /// Bus carrying `SubscriberOverflow` and `SubscriberPanicked` events of this set.
    pub fn reports(&self) -> &Bus {
        &self.reports
    }

    /// Queues `event` for every subscriber without waiting.
    ///
    /// A subscriber whose queue is full or whose worker ended misses the event; the drop
    /// is reported.
    pub fn emit(&self, event: &Event) {
        let shared = Arc::new(event.clone());
        for outlet in &self.outlets {
            let reason = match outlet.queue.try_send(Arc::clone(&shared)) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Full(_)) => "queue full",
                Err(mpsc::error::TrySendError::Closed(_)) => "worker closed",
            };
            tracing::warn!(subscriber = outlet.name, kind = ?event.kind, reason, "event dropped");
            self.reports
                .publish(Event::subscriber_overflow(outlet.name, reason));
        }
    }

    /// Spawns a listener forwarding every event of `bus` to this set.
    ///
    /// The listener ends when the bus is dropped; lagged events are skipped with a warning.
    pub fn listen(self: Arc<Self>, bus: &Bus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => self.emit(&ev),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "subscriber listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Closes every queue and waits for the workers to drain them.
    pub async fn shutdown(self) {
        drop(self.outlets);
        for worker in self.workers {
            let _ = worker.await;
        }
    }

    /// True if there are no subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outlets.is_empty()
    }

    /// Number of subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outlets.len()
    }
}

async fn drive(sub: Arc<dyn Subscribe>, mut rx: mpsc::Receiver<Arc<Event>>, reports: Bus) {
    while let Some(event) = rx.recv().await {
        let handled = std::panic::AssertUnwindSafe(sub.on_event(event.as_ref()))
            .catch_unwind()
            .await;
        if let Err(payload) = handled {
            let info = panic_message(payload.as_ref());
            tracing::error!(subscriber = sub.name(), panic = %info, "subscriber panicked");
            reports.publish(Event::subscriber_panicked(sub.name(), info));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Count(Arc<AtomicUsize>);

    #[async_trait]
    impl Subscribe for Count {
        async fn on_event(&self, _event: &Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn name(&self) -> &'static str {
            "count"
        }
    }

    struct Panicker;

    #[async_trait]
    impl Subscribe for Panicker {
        async fn on_event(&self, _event: &Event) {
            panic!("subscriber failure");
        }
        fn name(&self) -> &'static str {
            "panicker"
        }
    }

    struct Stuck {
        gate: tokio::sync::Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
    }

    #[async_trait]
    impl Subscribe for Stuck {
        async fn on_event(&self, _event: &Event) {
            if let Some(gate) = self.gate.lock().await.take() {
                let _ = gate.await;
            }
        }
        fn name(&self) -> &'static str {
            "stuck"
        }
        fn queue_capacity(&self) -> usize {
            1
        }
    }

    #[tokio::test]
    async fn test_fan_out_survives_panicking_subscriber() {
        let hits = Arc::new(AtomicUsize::new(0));
        let set = SubscriberSet::new(vec![
            Arc::new(Panicker) as Arc<dyn Subscribe>,
            Arc::new(Count(Arc::clone(&hits))),
        ]);
        assert_eq!(set.len(), 2);

        set.emit(&Event::new(EventKind::ServiceConnected));
        set.emit(&Event::new(EventKind::ServiceDisconnected));
        set.shutdown().await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let set = SubscriberSet::new(vec![Arc::new(Panicker) as Arc<dyn Subscribe>]);
        let mut reports = set.reports().subscribe();

        set.emit(&Event::new(EventKind::ServiceReady));
        let report = tokio::time::timeout(Duration::from_secs(1), reports.recv())
            .await
            .expect("report in time")
            .expect("reports bus open");
        assert!(report.is_subscriber_panic());
        assert_eq!(report.service.as_deref(), Some("panicker"));
        assert!(report.reason.as_deref().is_some_and(|r| r.contains("subscriber failure")));
    }

    #[tokio::test]
    async fn test_full_queue_is_reported() {
        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let set = SubscriberSet::new(vec![Arc::new(Stuck {
            gate: tokio::sync::Mutex::new(Some(gate)),
        }) as Arc<dyn Subscribe>]);
        let mut reports = set.reports().subscribe();

        // The first event parks the worker; the next fills the single slot.
        set.emit(&Event::new(EventKind::ServiceConnected));
        tokio::time::sleep(Duration::from_millis(20)).await;
        set.emit(&Event::new(EventKind::ServiceConnected));
        set.emit(&Event::new(EventKind::ServiceDisconnected));

        let report = reports.try_recv().expect("overflow reported");
        assert!(report.is_subscriber_overflow());
        assert_eq!(report.service.as_deref(), Some("stuck"));
        assert!(report.reason.as_deref().is_some_and(|r| r.contains("queue full")));

        let _ = release.send(());
        set.shutdown().await;
    }

    #[tokio::test]
    async fn test_listen_forwards_bus_events() {
        let hits = Arc::new(AtomicUsize::new(0));
        let bus = Bus::new(16);
        let set = Arc::new(SubscriberSet::new(vec![
            Arc::new(Count(Arc::clone(&hits))) as Arc<dyn Subscribe>
        ]));
        let listener = Arc::clone(&set).listen(&bus);

        bus.publish(Event::new(EventKind::ServiceReady));
        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        listener.abort();
    }
}
