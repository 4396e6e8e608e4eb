//! # Logging subscriber for debugging and demos.
//!
//! [`LogWriter`] renders bus events through `tracing` in a compact, human-readable form.
//!
//! ## Output format
//! ```text
//! [connected] service=clock
//! [disconnected] service=clock reason="alive timeout"
//! [ready] service=clock alive_ms=100
//! [alive-lost] service=clock watchdog_ms=200
//! [connect-retry] service=clock attempt=1 delay_ms=100 err="messaging session is not connected"
//! [call-timeout] service=clock uri=clock.get.time timeout_ms=50
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// `tracing`-backed logging subscriber.
///
/// Enabled via the `logging` feature.
#[derive(Default)]
pub struct LogWriter;

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let service = e.service.as_deref().unwrap_or("-");
        match e.kind {
            EventKind::ServiceConnected => {
                tracing::info!("[connected] service={service}");
            }
            EventKind::ServiceDisconnected => {
                tracing::info!("[disconnected] service={service} reason={:?}", e.reason);
            }
            EventKind::ServiceReady => {
                tracing::info!("[ready] service={service} alive_ms={:?}", e.delay_ms);
            }
            EventKind::AliveLost => {
                tracing::warn!("[alive-lost] service={service} watchdog_ms={:?}", e.timeout_ms);
            }
            EventKind::ConnectRetry => {
                tracing::warn!(
                    "[connect-retry] service={service} attempt={:?} delay_ms={:?} err={:?}",
                    e.attempt,
                    e.delay_ms,
                    e.reason
                );
            }
            EventKind::TransportError => {
                tracing::error!(
                    "[transport-error] service={service} uri={:?} err={:?}",
                    e.uri,
                    e.reason
                );
            }
            EventKind::RuntimeError => {
                tracing::error!(
                    "[runtime-error] service={service} uri={:?} err={:?}",
                    e.uri,
                    e.reason
                );
            }
            EventKind::CallTimedOut => {
                tracing::warn!(
                    "[call-timeout] service={service} uri={:?} timeout_ms={:?}",
                    e.uri,
                    e.timeout_ms
                );
            }
            EventKind::SubscriberOverflow | EventKind::SubscriberPanicked => {
                tracing::warn!("[subscriber] {:?}", e.reason);
            }
        }
    }

    fn name(&self) -> &'static str {
        "log-writer"
    }
}
