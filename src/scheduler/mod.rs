//! Cooperative scheduling: the time-ordered queue and the loop that drains it.
//!
//! ## Contents
//! - [`TaskQueue`] ordered schedule with immediate / delayed / periodic pushes and blocking waits
//! - [`TaskLoop`]  single-threaded executor (`run` on the caller, `run_async` on its own thread)
//!
//! ## Quick wiring
//! ```text
//! any thread ── push_*(task) ──► TaskQueue ◄── wait ── TaskLoop::drive() ──► task.execute()
//!                                                         │
//!                                                         └─ runtime error ─► handler | LoopError
//! ```

mod queue;
mod task_loop;

pub use queue::TaskQueue;
pub use task_loop::{LoopFuture, LoopState, RuntimeErrorHandler, TaskLoop};
