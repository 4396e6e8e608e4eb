//! # Service configuration.
//!
//! Provides [`ServiceConfig`], the settings shared by the server and client roles, and
//! [`ServiceSettings`], the serde document a process reads its settings from.
//!
//! Config is used in two ways:
//! 1. **Service creation**: `ServiceImpl::new(name, factory, config)` / `ServiceStub::new(...)`
//! 2. **Connect**: `connect_default()` uses [`ServiceConfig::broker_address`]
//!
//! ## Sentinel values
//! - `call_timeout = 0s` → unlimited (a call waits until answered or disconnected)
//! - `connect_attempts = 0` → treated as 1 (a single attempt, no retry)

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::messaging::DEFAULT_REALM;
use crate::policies::BackoffPolicy;

/// Default broker url.
pub const DEFAULT_BROKER_URL: &str = "ws://127.0.0.1:8080";

/// Configuration of a service instance.
///
/// ## Field semantics
/// - `broker_url` / `realm`: where `connect_default()` goes
/// - `call_timeout`: bound for client calls (`0s` = unlimited)
/// - `alive_period`: heartbeat period of a server (clients learn it from the server)
/// - `watchdog_factor`: client declares a server lost after `factor × alive_period` of silence
/// - `bus_capacity`: event bus ring buffer size (min 1)
/// - `connect_attempts` / `backoff`: retry of the substrate connect
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceConfig {
    /// Broker address, `scheme://host:port`.
    pub broker_url: String,
    /// Realm (namespace) on the broker.
    pub realm: String,
    /// Bound for client calls; `Duration::ZERO` waits without limit.
    pub call_timeout: Duration,
    /// Period of the server heartbeat.
    pub alive_period: Duration,
    /// Multiple of the alive period after which a silent server is declared lost.
    pub watchdog_factor: u32,
    /// Capacity of the event bus broadcast channel ring buffer.
    pub bus_capacity: usize,
    /// Number of substrate connect attempts (`0` is treated as `1`).
    pub connect_attempts: u32,
    /// Delay policy between connect attempts.
    pub backoff: BackoffPolicy,
}

impl ServiceConfig {
    /// Returns the call timeout as an `Option` (`None` = unlimited).
    #[inline]
    pub fn call_timeout_opt(&self) -> Option<Duration> {
        if self.call_timeout == Duration::ZERO {
            None
        } else {
            Some(self.call_timeout)
        }
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// Number of connect attempts, at least 1.
    #[inline]
    pub fn connect_attempts_clamped(&self) -> u32 {
        self.connect_attempts.max(1)
    }

    /// Watchdog period for a server announcing `alive_period`.
    #[inline]
    pub fn watchdog_period(&self, alive_period: Duration) -> Duration {
        alive_period.saturating_mul(self.watchdog_factor.max(1))
    }

    /// Splits `broker_url` into `(host, port)`.
    ///
    /// Accepts `scheme://host:port`, `host:port`, or a bare host (port `8080`).
    pub fn broker_address(&self) -> (String, u16) {
        let rest = self
            .broker_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.broker_url);
        let rest = rest.trim_end_matches('/');
        match rest.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (rest.to_string(), 8080),
            },
            None => (rest.to_string(), 8080),
        }
    }

    /// Builds a config from a settings document, keeping defaults for absent fields.
    pub fn from_settings(settings: &ServiceSettings) -> Self {
        let mut config = ServiceConfig::default();
        if let Some(input) = &settings.service_input {
            if !input.broker_url.is_empty() {
                config.broker_url = input.broker_url.clone();
            }
            if !input.realm.is_empty() {
                config.realm = input.realm.clone();
            }
        }
        if let Some(ms) = settings.call_timeout_ms {
            config.call_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.alive_period_ms {
            config.alive_period = Duration::from_millis(ms);
        }
        config
    }
}

impl Default for ServiceConfig {
    /// Default configuration:
    ///
    /// - `broker_url = ws://127.0.0.1:8080`, `realm = osbase`
    /// - `call_timeout = 0s` (unlimited)
    /// - `alive_period = 1s`, `watchdog_factor = 2`
    /// - `bus_capacity = 1024`
    /// - `connect_attempts = 1`, `backoff = BackoffPolicy::default()`
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            realm: DEFAULT_REALM.to_string(),
            call_timeout: Duration::ZERO,
            alive_period: Duration::from_millis(1000),
            watchdog_factor: 2,
            bus_capacity: 1024,
            connect_attempts: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Service input section of a settings document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceInput {
    /// Ask a running service to stop.
    pub stop: bool,
    /// Broker address.
    pub broker_url: String,
    /// Broker realm.
    pub realm: String,
}

/// Settings document of a service process.
///
/// ```
/// use servicevisor::ServiceSettings;
///
/// let settings = ServiceSettings::from_json(
///     r#"{ "service_input": { "broker_url": "ws://broker:9000", "realm": "lab" }, "alive_period_ms": 250 }"#,
/// ).unwrap();
/// assert_eq!(settings.alive_period_ms, Some(250));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Connection section; absent when the process only reads local settings.
    pub service_input: Option<ServiceInput>,
    /// Call timeout in milliseconds (`0` = unlimited).
    pub call_timeout_ms: Option<u64>,
    /// Heartbeat period in milliseconds.
    pub alive_period_ms: Option<u64>,
}

impl ServiceSettings {
    /// Parses a JSON settings document.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// True if the document asks the service to stop.
    pub fn is_stop_requested(&self) -> bool {
        self.service_input.as_ref().is_some_and(|i| i.stop)
    }
}
