//! Error types used by the scheduler, the messaging substrate and the service layer.
//!
//! This module defines four enums:
//!
//! - [`TaskError`]: errors raised by a scheduled task body.
//! - [`LoopError`]: errors raised by the [`TaskLoop`](crate::TaskLoop) itself.
//! - [`MessagingError`]: failures reported by a messaging substrate.
//! - [`ServiceError`]: failures surfaced to callers of the service API.
//!
//! All of them provide helper methods (`as_label`, `as_message`) for logging.

use std::time::Duration;
use thiserror::Error;

/// # Errors produced by task execution.
///
/// A task body returns `Result<(), TaskError>`. The loop treats the variants differently:
/// - [`TaskError::Runtime`] is a recoverable application error. It is handed to the loop's
///   runtime-error handler if one is installed, otherwise it terminates the loop.
/// - [`TaskError::Logic`] signals a programming error inside the task. It is logged and absorbed.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Recoverable runtime error raised by the task body.
    #[error("runtime error: {error}")]
    Runtime {
        /// The underlying error message.
        error: String,
    },

    /// Logic error raised by the task body (logged, never propagated).
    #[error("logic error: {error}")]
    Logic {
        /// The underlying error message.
        error: String,
    },
}

impl TaskError {
    /// Shorthand for [`TaskError::Runtime`].
    pub fn runtime(error: impl Into<String>) -> Self {
        TaskError::Runtime {
            error: error.into(),
        }
    }

    /// Shorthand for [`TaskError::Logic`].
    pub fn logic(error: impl Into<String>) -> Self {
        TaskError::Logic {
            error: error.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use servicevisor::TaskError;
    ///
    /// let err = TaskError::runtime("boom");
    /// assert_eq!(err.as_label(), "task_runtime");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Runtime { .. } => "task_runtime",
            TaskError::Logic { .. } => "task_logic",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            TaskError::Runtime { error } => format!("runtime: {error}"),
            TaskError::Logic { error } => format!("logic: {error}"),
        }
    }
}

/// # Errors produced by the task loop.
///
/// `Clone` because the outcome of [`TaskLoop::run_async`](crate::TaskLoop::run_async)
/// travels through a shared future.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoopError {
    /// `run()` or `run_async()` was called while the loop was already running.
    #[error("TaskLoop error: loop is already running!")]
    AlreadyRunning,

    /// A task raised a runtime error and no runtime-error handler was installed.
    #[error("TaskLoop error: {error}")]
    Runtime {
        /// The underlying error message.
        error: String,
    },

    /// The loop thread went away without reporting an outcome.
    #[error("TaskLoop error: loop thread aborted")]
    Aborted,
}

impl LoopError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use servicevisor::LoopError;
    ///
    /// assert_eq!(LoopError::AlreadyRunning.as_label(), "loop_already_running");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            LoopError::AlreadyRunning => "loop_already_running",
            LoopError::Runtime { .. } => "loop_runtime",
            LoopError::Aborted => "loop_aborted",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            LoopError::AlreadyRunning => "loop is already running".to_string(),
            LoopError::Runtime { error } => format!("runtime: {error}"),
            LoopError::Aborted => "loop thread aborted".to_string(),
        }
    }
}

/// # Errors reported by a messaging substrate.
///
/// Returned synchronously when a request cannot even be issued, and handed to the
/// error delegate when a request fails after being issued.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// The substrate session is not connected.
    #[error("messaging session is not connected")]
    NotConnected,

    /// A procedure with the same uri is already registered in the realm.
    #[error("procedure already registered: {uri}")]
    AlreadyRegistered {
        /// Fully qualified procedure uri.
        uri: String,
    },

    /// No callee is registered for the invoked uri.
    #[error("no such procedure: {uri}")]
    NoSuchProcedure {
        /// Fully qualified procedure uri.
        uri: String,
    },

    /// The remote handler reported an application error.
    #[error("remote error: {error}")]
    Remote {
        /// Error text produced by the callee.
        error: String,
    },

    /// Transport level failure (open, push, subscribe...).
    #[error("transport error: {error}")]
    Transport {
        /// The underlying error message.
        error: String,
    },
}

impl MessagingError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            MessagingError::NotConnected => "messaging_not_connected",
            MessagingError::AlreadyRegistered { .. } => "messaging_already_registered",
            MessagingError::NoSuchProcedure { .. } => "messaging_no_such_procedure",
            MessagingError::Remote { .. } => "messaging_remote",
            MessagingError::Transport { .. } => "messaging_transport",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            MessagingError::NotConnected => "not connected".to_string(),
            MessagingError::AlreadyRegistered { uri } => format!("already registered: {uri}"),
            MessagingError::NoSuchProcedure { uri } => format!("no such procedure: {uri}"),
            MessagingError::Remote { error } => format!("remote: {error}"),
            MessagingError::Transport { error } => format!("transport: {error}"),
        }
    }
}

/// # Errors surfaced by the service API.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The service is not connected to the broker.
    #[error("service '{service}' is not connected")]
    NotConnected {
        /// Service name.
        service: String,
    },

    /// An RPC did not complete within the configured call timeout.
    #[error("call '{uri}' timed out after {timeout:?}")]
    Timeout {
        /// Fully qualified procedure uri.
        uri: String,
        /// The timeout that was exceeded.
        timeout: Duration,
    },

    /// The substrate rejected or failed the request.
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    /// The remote handler failed; the text is the handler's error.
    #[error("remote handler failed: {error}")]
    Remote {
        /// Error text produced by the handler.
        error: String,
    },

    /// Arguments or results could not be (de)serialized.
    #[error("codec error: {error}")]
    Codec {
        /// The underlying serde error message.
        error: String,
    },

    /// The service was disconnected while the call was pending.
    #[error("service disconnected while call '{uri}' was pending")]
    Disconnected {
        /// Fully qualified procedure uri.
        uri: String,
    },
}

impl ServiceError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use servicevisor::ServiceError;
    /// use std::time::Duration;
    ///
    /// let err = ServiceError::Timeout { uri: "svc.get".into(), timeout: Duration::from_millis(50) };
    /// assert_eq!(err.as_label(), "service_timeout");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            ServiceError::NotConnected { .. } => "service_not_connected",
            ServiceError::Timeout { .. } => "service_timeout",
            ServiceError::Messaging(_) => "service_messaging",
            ServiceError::Remote { .. } => "service_remote",
            ServiceError::Codec { .. } => "service_codec",
            ServiceError::Disconnected { .. } => "service_disconnected",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            ServiceError::NotConnected { service } => format!("not connected: {service}"),
            ServiceError::Timeout { uri, timeout } => format!("timeout: {uri} after {timeout:?}"),
            ServiceError::Messaging(e) => e.as_message(),
            ServiceError::Remote { error } => format!("remote: {error}"),
            ServiceError::Codec { error } => format!("codec: {error}"),
            ServiceError::Disconnected { uri } => format!("disconnected: {uri}"),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        ServiceError::Codec {
            error: e.to_string(),
        }
    }
}

impl From<MessagingError> for TaskError {
    fn from(e: MessagingError) -> Self {
        TaskError::runtime(e.to_string())
    }
}

impl From<ServiceError> for TaskError {
    fn from(e: ServiceError) -> Self {
        TaskError::runtime(e.to_string())
    }
}

/// Renders a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
