//! # Task abstraction.
//!
//! This module defines the [`Task`] trait: a deferred unit of work with an `enabled` gate.
//! The shared handle type stored by the scheduler is [`TaskRef`], an
//! `Arc<dyn Task<Output = TaskResult>>`.
//!
//! Tasks are polymorphic over their result type: the scheduler only stores tasks whose
//! output is [`TaskResult`], but typed tasks (`Task<Output = i32>`, ...) can be executed
//! directly by their owner.

use std::sync::Arc;

use crate::error::TaskError;

/// Result of a task that can be placed on a [`TaskQueue`](crate::TaskQueue).
pub type TaskResult = Result<(), TaskError>;

/// Shared handle to a schedulable task.
pub type TaskRef = Arc<dyn Task<Output = TaskResult>>;

/// # Deferred, cancellable unit of work.
///
/// A `Task` has an [`execute`](Task::execute) method and an enabled flag. Disabling is
/// cooperative: the scheduler checks the flag when the task becomes due and silently drops
/// disabled tasks (a repeated task is then not rescheduled).
///
/// # Example
/// ```
/// use servicevisor::{Task, TaskFn};
///
/// let t = TaskFn::new(|| 6 * 7);
/// assert_eq!(t.execute(), 42);
///
/// t.set_enabled(false);
/// assert!(!t.is_enabled());
/// ```
pub trait Task: Send + Sync + 'static {
    /// Value produced by one execution.
    type Output;

    /// Runs the stored callback once.
    fn execute(&self) -> Self::Output;

    /// Returns `false` once the task has been disabled.
    fn is_enabled(&self) -> bool;

    /// Enables or disables the task.
    ///
    /// Safe to call from any thread while the task is queued.
    fn set_enabled(&self, enabled: bool);
}

/// Conversion of a callback's return value into a [`TaskResult`].
///
/// Implemented for `()` (always `Ok`) and for `Result<(), E>` where `E: Into<TaskError>`,
/// so plain closures and fallible closures can both be scheduled.
pub trait IntoTaskResult {
    /// Converts `self` into a task result.
    fn into_task_result(self) -> TaskResult;
}

impl IntoTaskResult for () {
    #[inline]
    fn into_task_result(self) -> TaskResult {
        Ok(())
    }
}

impl<E: Into<TaskError>> IntoTaskResult for Result<(), E> {
    #[inline]
    fn into_task_result(self) -> TaskResult {
        self.map_err(Into::into)
    }
}
