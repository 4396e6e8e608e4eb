//! # TaskLoop: single-threaded cooperative executor over a [`TaskQueue`].
//!
//! A [`TaskLoop`] pulls due tasks from its queue and executes them one at a time, either on
//! the calling thread ([`TaskLoop::run`]) or on a dedicated thread ([`TaskLoop::run_async`]).
//!
//! ## Lifecycle
//! ```text
//!            run()                     stop()
//!   Idle ───────────► RunningSync  ─────────────► Idle
//!     │
//!     │  run_async()                  stop()
//!     └───────────► RunningAsync ─────────────► Idle   (shared future resolves)
//!
//! run()/run_async() while running ─► Err(LoopError::AlreadyRunning), state unchanged
//! ```
//!
//! ## Error flow
//! ```text
//! task.execute()
//!   ├─ Ok(())                  ─► continue
//!   ├─ Err(Logic)              ─► tracing::error!, continue
//!   ├─ Err(Runtime) | panic    ─► handler installed? ─ yes ─► handler(&err), continue
//!   │                                                └ no  ─► loop ends with LoopError::Runtime
//! ```
//!
//! ## Rules
//! - Only one task of a given loop executes at a time.
//! - `stop()` is idempotent, callable from any thread (including a task of the loop) and wakes
//!   a blocked loop immediately through [`TaskQueue::interrupt`].
//! - Called from a foreign thread, `stop()` also joins the async loop thread.
//! - A stopped loop can be run again; tasks left in the queue are kept.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{panic_message, LoopError, TaskError};
use crate::scheduler::queue::TaskQueue;
use crate::tasks::{IntoTaskResult, MethodTask, TaskFn, TaskRef};

/// Callback receiving runtime errors raised by tasks.
pub type RuntimeErrorHandler = Arc<dyn Fn(&TaskError) + Send + Sync>;

/// Future returned by [`TaskLoop::run_async`]; resolves when the loop stops.
pub type LoopFuture = Shared<BoxFuture<'static, Result<(), LoopError>>>;

/// Execution state of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Not running.
    Idle,
    /// Running on the thread that called `run()`.
    RunningSync,
    /// Running on the loop's own thread.
    RunningAsync,
}

struct Control {
    state: LoopState,
    token: Option<CancellationToken>,
    thread: Option<JoinHandle<()>>,
    thread_id: Option<ThreadId>,
    done: Option<LoopFuture>,
}

struct LoopInner {
    name: Arc<str>,
    queue: TaskQueue,
    control: Mutex<Control>,
    on_runtime_error: RwLock<Option<RuntimeErrorHandler>>,
}

/// Handle to a task loop.
///
/// Cheap to clone; clones drive the same queue. Services share a loop by cloning the handle.
#[derive(Clone)]
pub struct TaskLoop {
    inner: Arc<LoopInner>,
}

impl Default for TaskLoop {
    fn default() -> Self {
        Self::new("taskloop")
    }
}

impl TaskLoop {
    /// Creates an idle loop with an empty queue.
    ///
    /// `name` is used for the async thread name and in logs.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            inner: Arc::new(LoopInner {
                name: name.into(),
                queue: TaskQueue::new(),
                control: Mutex::new(Control {
                    state: LoopState::Idle,
                    token: None,
                    thread: None,
                    thread_id: None,
                    done: None,
                }),
                on_runtime_error: RwLock::new(None),
            }),
        }
    }

    /// Loop name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The underlying queue.
    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    /// Current execution state.
    pub fn state(&self) -> LoopState {
        self.inner.control.lock().state
    }

    /// True unless [`LoopState::Idle`].
    pub fn is_running(&self) -> bool {
        self.state() != LoopState::Idle
    }

    /// True when called from the thread currently driving this loop.
    pub fn is_loop_thread(&self) -> bool {
        self.inner.control.lock().thread_id == Some(thread::current().id())
    }

    /// Installs the runtime-error handler; the loop keeps running after reporting to it.
    pub fn set_runtime_error_handler<F>(&self, handler: F)
    where
        F: Fn(&TaskError) + Send + Sync + 'static,
    {
        *self.inner.on_runtime_error.write() = Some(Arc::new(handler));
    }

    /// Removes the runtime-error handler; runtime errors then end the loop.
    pub fn clear_runtime_error_handler(&self) {
        *self.inner.on_runtime_error.write() = None;
    }

    /// Runs the loop on the calling thread until [`stop`](Self::stop).
    ///
    /// ### Errors
    /// - [`LoopError::AlreadyRunning`] if the loop is running.
    /// - [`LoopError::Runtime`] if a task failed and no handler is installed.
    pub fn run(&self) -> Result<(), LoopError> {
        let token = {
            let mut control = self.inner.control.lock();
            if control.state != LoopState::Idle {
                return Err(LoopError::AlreadyRunning);
            }
            let token = CancellationToken::new();
            control.state = LoopState::RunningSync;
            control.token = Some(token.clone());
            control.thread_id = Some(thread::current().id());
            token
        };

        let _guard = RunGuard(&self.inner);
        self.inner.drive(&token)
    }

    /// Runs the loop on a dedicated thread.
    ///
    /// Returns a shared future resolving with the loop outcome once it stops.
    pub fn run_async(&self) -> Result<LoopFuture, LoopError> {
        let mut control = self.inner.control.lock();
        if control.state != LoopState::Idle {
            return Err(LoopError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let thread_token = token.clone();

        let handle = thread::Builder::new()
            .name(format!("{}-loop", self.inner.name))
            .spawn(move || {
                let outcome = {
                    let _guard = RunGuard(&inner);
                    inner.drive(&thread_token)
                };
                let _ = tx.send(outcome);
            })
            .map_err(|e| LoopError::Runtime {
                error: format!("cannot spawn loop thread: {e}"),
            })?;

        let done = rx
            .map(|outcome| outcome.unwrap_or(Err(LoopError::Aborted)))
            .boxed()
            .shared();

        control.state = LoopState::RunningAsync;
        control.token = Some(token);
        control.thread_id = Some(handle.thread().id());
        control.thread = Some(handle);
        control.done = Some(done.clone());
        Ok(done)
    }

    /// Future of the current async run, if any.
    pub fn completion(&self) -> Option<LoopFuture> {
        self.inner.control.lock().done.clone()
    }

    /// Stops the loop after its current task.
    ///
    /// No-op when idle. From a thread other than the loop thread, waits for the async loop
    /// thread to exit.
    pub fn stop(&self) {
        let (token, handle) = {
            let mut control = self.inner.control.lock();
            let Some(token) = control.token.clone() else {
                return;
            };
            let foreign = control.thread_id != Some(thread::current().id());
            let handle = if foreign && control.state == LoopState::RunningAsync {
                control.thread.take()
            } else {
                None
            };
            (token, handle)
        };

        if !token.is_cancelled() {
            tracing::debug!(task_loop = %self.inner.name, "stopping loop");
            token.cancel();
            self.inner.queue.interrupt();
        }

        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!(task_loop = %self.inner.name, "loop thread panicked");
            }
        }
    }

    /// Schedules `f` now.
    pub fn push<F, O>(&self, f: F) -> TaskRef
    where
        F: Fn() -> O + Send + Sync + 'static,
        O: IntoTaskResult,
    {
        self.inner.queue.push_task(TaskFn::task_ref(f))
    }

    /// Schedules `f` before everything already queued.
    pub fn push_immediate<F, O>(&self, f: F) -> TaskRef
    where
        F: Fn() -> O + Send + Sync + 'static,
        O: IntoTaskResult,
    {
        self.inner.queue.push_immediate_task(TaskFn::task_ref(f))
    }

    /// Schedules `f` once after `delay`.
    pub fn push_single_shot<F, O>(&self, delay: Duration, f: F) -> TaskRef
    where
        F: Fn() -> O + Send + Sync + 'static,
        O: IntoTaskResult,
    {
        self.inner
            .queue
            .push_single_shot_task(delay, TaskFn::task_ref(f))
    }

    /// Schedules `f` every `period`; disable the returned handle to stop it.
    pub fn push_repeated<F, O>(&self, period: Duration, f: F) -> TaskRef
    where
        F: Fn() -> O + Send + Sync + 'static,
        O: IntoTaskResult,
    {
        self.inner
            .queue
            .push_repeated_task(period, TaskFn::task_ref(f))
    }

    /// Schedules `f(&receiver)` now; skipped if `receiver` is dropped before it runs.
    pub fn push_method<T, F, O>(&self, receiver: &Arc<T>, f: F) -> TaskRef
    where
        T: Send + Sync + 'static,
        F: Fn(&T) -> O + Send + Sync + 'static,
        O: IntoTaskResult,
    {
        self.inner
            .queue
            .push_task(MethodTask::task_ref(receiver, f))
    }

    /// Schedules `f(&receiver)` every `period` while `receiver` is alive.
    pub fn push_repeated_method<T, F, O>(&self, period: Duration, receiver: &Arc<T>, f: F) -> TaskRef
    where
        T: Send + Sync + 'static,
        F: Fn(&T) -> O + Send + Sync + 'static,
        O: IntoTaskResult,
    {
        self.inner
            .queue
            .push_repeated_task(period, MethodTask::task_ref(receiver, f))
    }
}

impl std::fmt::Debug for TaskLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLoop")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("queue", &self.inner.queue)
            .finish()
    }
}

impl LoopInner {
    fn drive(&self, token: &CancellationToken) -> Result<(), LoopError> {
        tracing::trace!(task_loop = %self.name, "loop started");
        loop {
            let generation = self.queue.generation();
            if token.is_cancelled() {
                break;
            }
            if let Some(task) = self.queue.wait_interruptible(generation) {
                self.execute(&task)?;
            }
        }
        tracing::trace!(task_loop = %self.name, "loop finished");
        Ok(())
    }

    fn execute(&self, task: &TaskRef) -> Result<(), LoopError> {
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| task.execute())) {
            Ok(outcome) => outcome,
            Err(payload) => Err(TaskError::runtime(format!(
                "task crashed: {}",
                panic_message(payload.as_ref())
            ))),
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(TaskError::Logic { error }) => {
                tracing::error!(task_loop = %self.name, %error, "logic error in task");
                Ok(())
            }
            Err(err) => {
                let handler = self.on_runtime_error.read().clone();
                match handler {
                    Some(handler) => {
                        handler(&err);
                        Ok(())
                    }
                    None => {
                        tracing::error!(task_loop = %self.name, error = %err, "unhandled runtime error; loop ends");
                        Err(LoopError::Runtime {
                            error: match err {
                                TaskError::Runtime { error } => error,
                                other => other.to_string(),
                            },
                        })
                    }
                }
            }
        }
    }
}

/// Returns the loop to `Idle` when a run ends, whatever the exit path.
struct RunGuard<'a>(&'a LoopInner);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut control = self.0.control.lock();
        control.state = LoopState::Idle;
        control.token = None;
        control.thread_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_stop_when_idle_is_noop() {
        let tl = TaskLoop::new("idle");
        tl.stop();
        tl.stop();
        assert_eq!(tl.state(), LoopState::Idle);
        assert!(tl.queue().is_empty());
    }

    #[test]
    fn test_logic_error_is_absorbed() {
        let tl = TaskLoop::new("logic");
        let hits = Arc::new(AtomicUsize::new(0));
        tl.push(|| Err::<(), _>(TaskError::logic("bad state")));
        let h = Arc::clone(&hits);
        let stopper = tl.clone();
        tl.push(move || {
            h.fetch_add(1, Ordering::SeqCst);
            stopper.stop();
        });
        assert_eq!(tl.run(), Ok(()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_is_reported_as_runtime_error() {
        let tl = TaskLoop::new("crash");
        tl.push(|| -> () { panic!("kaboom") });
        match tl.run() {
            Err(LoopError::Runtime { error }) => assert!(error.contains("kaboom")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(tl.state(), LoopState::Idle);
    }

    #[test]
    fn test_is_loop_thread() {
        let tl = TaskLoop::new("thread");
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let inner = tl.clone();
        tl.push(move || {
            if inner.is_loop_thread() {
                s.store(1, Ordering::SeqCst);
            }
            inner.stop();
        });
        tl.run().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!tl.is_loop_thread());
    }
}
