//! # Task abstractions.
//!
//! This module provides the task-related types:
//! - [`Task`] - trait for deferred, cancellable units of work
//! - [`TaskFn`] - closure-backed implementation (plus [`bind`] for owned arguments)
//! - [`MethodTask`] - closure bound to a weakly held receiver
//! - [`TaskRef`] - shared handle stored by the scheduler (`Arc<dyn Task<Output = TaskResult>>`)

mod method;
mod task;
mod task_fn;

pub use method::MethodTask;
pub use task::{IntoTaskResult, Task, TaskRef, TaskResult};
pub use task_fn::{bind, TaskFn};
