//! # Time-ordered task queue.
//!
//! [`TaskQueue`] stores scheduled tasks sorted by due time and hands them out to a consumer
//! (usually a [`TaskLoop`](crate::TaskLoop)) once they are due.
//!
//! ## Architecture
//! ```text
//! producers (any thread)                       consumer (one loop thread)
//!   push_task ──────────┐
//!   push_immediate_task ┼──► Mutex<Schedule> ◄──── wait_for_task / pull_task
//!   push_single_shot ───┤      │ entries: [ts0 ≤ ts1 ≤ ts2 ...]
//!   push_repeated ──────┘      │ last:    watermark
//!                              └── Condvar (notify on push / interrupt)
//! ```
//!
//! ## Rules
//! - Entries are always sorted by timestamp; equal timestamps keep insertion order.
//! - `push_immediate_task` is scheduled at `min(front, now) - 1ms`, so it is the next task popped.
//! - A repeated entry is rescheduled at `its own timestamp + period` under the same lock that pops it.
//!   A consumer that falls behind therefore pops the missed occurrences back to back.
//! - Disabled tasks are dropped when they become due and never reported (nor rescheduled).
//! - The `last` watermark only moves forward and only on a successful pop.
//! - The lock is never held while a task executes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::tasks::TaskRef;

/// Offset used to place an immediate task in front of everything already queued.
const IMMEDIATE_EPSILON: Duration = Duration::from_millis(1);

/// One entry of the schedule.
struct Scheduled {
    timestamp: Instant,
    task: TaskRef,
    /// `None` for one-shot entries.
    repeat: Option<Duration>,
}

/// State guarded by the queue mutex.
#[derive(Default)]
struct Schedule {
    entries: VecDeque<Scheduled>,
    last: Option<Instant>,
    /// Bumped by `interrupt()`; waiters that observe a change return `None`.
    generation: u64,
}

impl Schedule {
    fn insert(&mut self, entry: Scheduled) {
        let idx = self
            .entries
            .partition_point(|e| e.timestamp <= entry.timestamp);
        self.entries.insert(idx, entry);
    }

    fn next_due(&self) -> Option<Instant> {
        self.entries.front().map(|e| e.timestamp)
    }

    /// Pops the first enabled entry due at `now`, rescheduling it if it repeats.
    fn pop_due(&mut self, now: Instant) -> Option<TaskRef> {
        loop {
            if self.entries.front()?.timestamp > now {
                return None;
            }
            let entry = self.entries.pop_front()?;
            if !entry.task.is_enabled() {
                tracing::trace!("dropping disabled task");
                continue;
            }

            self.last = Some(match self.last {
                Some(last) => last.max(entry.timestamp),
                None => entry.timestamp,
            });

            if let Some(period) = entry.repeat {
                self.insert(Scheduled {
                    timestamp: entry.timestamp + period,
                    task: entry.task.clone(),
                    repeat: entry.repeat,
                });
            }
            return Some(entry.task);
        }
    }
}

/// Thread-safe, time-ordered collection of scheduled tasks.
///
/// ### Properties
/// - **One mutex** guards the ordered list; producers may push from any thread.
/// - **Blocking retrieval** via a condition variable and a "wait, recheck" loop.
/// - **Stable ordering** for equal timestamps.
#[derive(Default)]
pub struct TaskQueue {
    schedule: Mutex<Schedule>,
    ready: Condvar,
}

impl TaskQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `task` now, after every pending task with the same timestamp.
    pub fn push_task(&self, task: TaskRef) -> TaskRef {
        self.schedule_at(Instant::now(), task, None)
    }

    /// Schedules `task` in front of everything already queued.
    ///
    /// The timestamp is `min(earliest pending, now) - 1ms` (or `now` on an empty queue).
    pub fn push_immediate_task(&self, task: TaskRef) -> TaskRef {
        let mut schedule = self.schedule.lock();
        let now = Instant::now();
        let timestamp = match schedule.next_due() {
            Some(front) => {
                let anchor = front.min(now);
                anchor.checked_sub(IMMEDIATE_EPSILON).unwrap_or(anchor)
            }
            None => now,
        };
        schedule.entries.push_front(Scheduled {
            timestamp,
            task: task.clone(),
            repeat: None,
        });
        drop(schedule);
        self.ready.notify_all();
        task
    }

    /// Schedules `task` once, `delay` from now.
    pub fn push_single_shot_task(&self, delay: Duration, task: TaskRef) -> TaskRef {
        self.schedule_at(Instant::now() + delay, task, None)
    }

    /// Schedules `task` every `period`, first occurrence `period` from now.
    ///
    /// Disable the returned handle to stop the repetition.
    pub fn push_repeated_task(&self, period: Duration, task: TaskRef) -> TaskRef {
        self.schedule_at(Instant::now() + period, task, Some(period))
    }

    /// Returns the earliest task if it is due, without blocking.
    pub fn pull_task(&self) -> Option<TaskRef> {
        self.schedule.lock().pop_due(Instant::now())
    }

    /// Blocks until a task is due or `delay` elapses (`None` waits indefinitely).
    pub fn wait_for_task(&self, delay: Option<Duration>) -> Option<TaskRef> {
        let deadline = delay.and_then(|d| Instant::now().checked_add(d));
        self.wait(deadline, None)
    }

    /// Blocks until a task is due or `deadline` is reached.
    pub fn wait_until_task(&self, deadline: Instant) -> Option<TaskRef> {
        self.wait(Some(deadline), None)
    }

    /// True if any entry (due or not) is still scheduled.
    pub fn is_remaining_tasks(&self) -> bool {
        !self.schedule.lock().entries.is_empty()
    }

    /// Number of scheduled entries.
    pub fn len(&self) -> usize {
        self.schedule.lock().entries.len()
    }

    /// True if nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        !self.is_remaining_tasks()
    }

    /// Removes every scheduled entry.
    pub fn clear_tasks(&self) {
        self.schedule.lock().entries.clear();
        self.ready.notify_all();
    }

    /// Timestamp of the most recently popped entry, if any.
    pub fn last_timestamp(&self) -> Option<Instant> {
        self.schedule.lock().last
    }

    /// Wakes every blocked waiter; each returns `None`.
    pub fn interrupt(&self) {
        let mut schedule = self.schedule.lock();
        schedule.generation = schedule.generation.wrapping_add(1);
        drop(schedule);
        self.ready.notify_all();
    }

    /// Current interrupt generation.
    pub(crate) fn generation(&self) -> u64 {
        self.schedule.lock().generation
    }

    /// Waits indefinitely unless interrupted after `since` was observed.
    pub(crate) fn wait_interruptible(&self, since: u64) -> Option<TaskRef> {
        self.wait(None, Some(since))
    }

    fn schedule_at(&self, timestamp: Instant, task: TaskRef, repeat: Option<Duration>) -> TaskRef {
        self.schedule.lock().insert(Scheduled {
            timestamp,
            task: task.clone(),
            repeat,
        });
        self.ready.notify_all();
        task
    }

    fn wait(&self, deadline: Option<Instant>, since: Option<u64>) -> Option<TaskRef> {
        let mut schedule = self.schedule.lock();
        let generation = since.unwrap_or(schedule.generation);
        loop {
            if schedule.generation != generation {
                return None;
            }
            let now = Instant::now();
            if let Some(task) = schedule.pop_due(now) {
                return Some(task);
            }
            if deadline.is_some_and(|d| now >= d) {
                return None;
            }

            let target = match (schedule.next_due(), deadline) {
                (Some(due), Some(deadline)) => Some(due.min(deadline)),
                (due, deadline) => due.or(deadline),
            };
            match target {
                Some(target) => {
                    self.ready.wait_until(&mut schedule, target);
                }
                None => self.ready.wait(&mut schedule),
            }
        }
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let schedule = self.schedule.lock();
        f.debug_struct("TaskQueue")
            .field("len", &schedule.entries.len())
            .field("last", &schedule.last)
            .finish()
    }
}
