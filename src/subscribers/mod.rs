//! # Event subscribers.
//!
//! This module provides the [`Subscribe`] trait and built-in implementations for handling
//! service events broadcast through a [`Bus`](crate::Bus).
//!
//! ## Architecture
//! ```text
//! Event flow:
//!   Service ── publish(Event) ──► Bus ──► SubscriberSet::listen()
//!                                              │
//!                                              ├──► Subscribe::on_event(&Event)
//!                                              │         │
//!                                              │    ┌────┴────┬─────────┐
//!                                              │    ▼         ▼         ▼
//!                                              │  LogWriter  Custom    ...
//!                                              │
//!                                              └──► ConnectionTracker (state tracking)
//! ```

mod set;
mod subscribe;
mod tracker;

#[cfg(feature = "logging")]
mod log;

pub use set::SubscriberSet;
pub use subscribe::Subscribe;
pub use tracker::ConnectionTracker;

#[cfg(feature = "logging")]
pub use log::LogWriter;
