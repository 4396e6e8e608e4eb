//! # Weak-receiver task (`MethodTask`)
//!
//! [`MethodTask`] binds a closure to an object through a [`Weak`] handle. The receiver is
//! resolved at `execute()` time; if it has been dropped the call is skipped and the task
//! returns its fallback value (`Default::default()` unless built with
//! [`MethodTask::with_fallback`]).
//!
//! Scheduling a method task therefore never extends the receiver's lifetime.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::tasks::task::{IntoTaskResult, Task, TaskRef, TaskResult};

/// Task invoking a closure on a weakly held receiver.
pub struct MethodTask<T, F, R> {
    receiver: Weak<T>,
    f: F,
    fallback: R,
    enabled: AtomicBool,
}

impl<T, F, R> MethodTask<T, F, R>
where
    F: Fn(&T) -> R,
    R: Default,
{
    /// Creates a method task returning `R::default()` when the receiver has expired.
    pub fn new(receiver: &Arc<T>, f: F) -> Self {
        Self::with_fallback(receiver, f, R::default())
    }
}

impl<T, F, R> MethodTask<T, F, R> {
    /// Creates a method task returning `fallback` when the receiver has expired.
    pub fn with_fallback(receiver: &Arc<T>, f: F, fallback: R) -> Self
    where
        F: Fn(&T) -> R,
    {
        Self {
            receiver: Arc::downgrade(receiver),
            f,
            fallback,
            enabled: AtomicBool::new(true),
        }
    }

    /// True while the receiver is still alive.
    pub fn is_bound(&self) -> bool {
        self.receiver.strong_count() > 0
    }
}

impl<T, F, O> MethodTask<T, F, TaskResult>
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> O + Send + Sync + 'static,
    O: IntoTaskResult,
{
    /// Creates a schedulable method task; an expired receiver yields `Ok(())`.
    pub fn task_ref(receiver: &Arc<T>, f: F) -> TaskRef {
        Arc::new(MethodTask::with_fallback(
            receiver,
            move |t: &T| f(t).into_task_result(),
            Ok(()),
        ))
    }
}

impl<T, F, R> Task for MethodTask<T, F, R>
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> R + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    type Output = R;

    fn execute(&self) -> R {
        match self.receiver.upgrade() {
            Some(receiver) => (self.f)(&receiver),
            None => {
                tracing::trace!("method task receiver expired; skipping");
                self.fallback.clone()
            }
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

impl<T, F, R> fmt::Debug for MethodTask<T, F, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTask")
            .field("bound", &self.is_bound())
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        hits: AtomicUsize,
    }

    impl Counter {
        fn bump(&self) -> usize {
            self.hits.fetch_add(1, Ordering::SeqCst) + 1
        }
    }

    #[test]
    fn test_calls_live_receiver() {
        let counter = Arc::new(Counter {
            hits: AtomicUsize::new(0),
        });
        let task = MethodTask::new(&counter, Counter::bump);
        assert_eq!(task.execute(), 1);
        assert_eq!(task.execute(), 2);
    }

    #[test]
    fn test_expired_receiver_returns_default() {
        let counter = Arc::new(Counter {
            hits: AtomicUsize::new(0),
        });
        let task = MethodTask::new(&counter, Counter::bump);
        drop(counter);
        assert!(!task.is_bound());
        assert_eq!(task.execute(), 0);
    }

    #[test]
    fn test_expired_receiver_task_ref_is_ok() {
        let counter = Arc::new(Counter {
            hits: AtomicUsize::new(0),
        });
        let task = MethodTask::task_ref(&counter, |c: &Counter| {
            c.bump();
        });
        assert_eq!(task.execute(), Ok(()));
        assert_eq!(counter.hits.load(Ordering::SeqCst), 1);

        drop(counter);
        assert_eq!(task.execute(), Ok(()));
    }

    #[test]
    fn test_custom_fallback() {
        let s = Arc::new(String::from("abc"));
        let task = MethodTask::with_fallback(&s, |s: &String| s.len() as i64, -1);
        assert_eq!(task.execute(), 3);
        drop(s);
        assert_eq!(task.execute(), -1);
    }
}
