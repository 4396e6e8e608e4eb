//! # Function-backed task (`TaskFn`)
//!
//! [`TaskFn`] wraps a closure `F: Fn() -> R`. Arguments are captured by value, either by the
//! closure itself or through [`bind`], which clones the bound arguments on every execution
//! so a repeated task always sees the original values.
//!
//! ## Example
//! ```rust
//! use servicevisor::{bind, Task, TaskFn, TaskRef};
//!
//! let typed = TaskFn::new(bind(|(a, b): (i32, i32)| a + b, (40, 2)));
//! assert_eq!(typed.execute(), 42);
//!
//! let queued: TaskRef = TaskFn::task_ref(|| println!("tick"));
//! assert!(queued.is_enabled());
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::tasks::task::{IntoTaskResult, Task, TaskRef, TaskResult};

/// Function-backed task implementation.
pub struct TaskFn<F> {
    f: F,
    enabled: AtomicBool,
}

impl<F> TaskFn<F> {
    /// Creates a new, enabled function-backed task.
    pub fn new(f: F) -> Self {
        Self {
            f,
            enabled: AtomicBool::new(true),
        }
    }

    /// Creates the task and returns it as a shared handle.
    pub fn arc(f: F) -> Arc<Self> {
        Arc::new(Self::new(f))
    }
}

impl<F, O> TaskFn<F>
where
    F: Fn() -> O + Send + Sync + 'static,
    O: IntoTaskResult,
{
    /// Creates a schedulable task from a closure returning `()` or `Result<(), E>`.
    pub fn task_ref(f: F) -> TaskRef {
        Arc::new(TaskFn::new(move || -> TaskResult { f().into_task_result() }))
    }
}

impl<F, R> Task for TaskFn<F>
where
    F: Fn() -> R + Send + Sync + 'static,
{
    type Output = R;

    fn execute(&self) -> R {
        (self.f)()
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

impl<F> fmt::Debug for TaskFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFn")
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Binds owned arguments to a callback.
///
/// The returned closure clones `args` for each call, so it can back a repeated task.
pub fn bind<A, G, R>(f: G, args: A) -> impl Fn() -> R + Send + Sync + 'static
where
    A: Clone + Send + Sync + 'static,
    G: Fn(A) -> R + Send + Sync + 'static,
{
    move || f(args.clone())
}
