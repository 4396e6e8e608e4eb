//! Retry policies.
//!
//! ## Contents
//! - [`BackoffPolicy`] how connect retry delays evolve (first / factor / max + jitter)
//! - [`JitterPolicy`]  randomization strategy to avoid synchronized reconnects
//!
//! ## Quick wiring
//! ```text
//! ServiceConfig { connect_attempts, backoff }
//!      └─► ConnectionLifecycle::connect():
//!           attempt n fails ─► sleep(backoff.next(n)) ─► retry (until connect_attempts)
//! ```

mod backoff;
mod jitter;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
