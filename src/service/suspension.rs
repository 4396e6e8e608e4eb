//! Alive-suspension counter.
//!
//! Counts the calls executing on a server. While the count is above zero the heartbeat is
//! skipped; the heartbeat publication itself runs under the counter lock, so a call never
//! starts while an alive message is going out.

use parking_lot::Mutex;

/// In-flight call counter gating the heartbeat.
#[derive(Debug, Default)]
pub struct AliveSuspension {
    count: Mutex<usize>,
}

impl AliveSuspension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspends the heartbeat until the returned guard is dropped.
    ///
    /// `on_resume` runs after the last outstanding guard is dropped, outside the lock.
    pub fn suspend<'a>(&'a self, on_resume: impl FnOnce() + 'a) -> SuspensionGuard<'a> {
        *self.count.lock() += 1;
        SuspensionGuard {
            owner: self,
            on_resume: Some(Box::new(on_resume)),
        }
    }

    /// Number of outstanding suspensions.
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    pub fn is_suspended(&self) -> bool {
        self.count() > 0
    }

    /// Runs `f` unless suspended; no suspension can start while `f` runs.
    pub fn run_if_idle<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let count = self.count.lock();
        if *count > 0 {
            return None;
        }
        Some(f())
    }
}

/// Scope guard returned by [`AliveSuspension::suspend`].
pub struct SuspensionGuard<'a> {
    owner: &'a AliveSuspension,
    on_resume: Option<Box<dyn FnOnce() + 'a>>,
}

impl Drop for SuspensionGuard<'_> {
    fn drop(&mut self) {
        let resumed = {
            let mut count = self.owner.count.lock();
            *count = count.saturating_sub(1);
            *count == 0
        };
        if resumed {
            if let Some(on_resume) = self.on_resume.take() {
                on_resume();
            }
        }
    }
}
