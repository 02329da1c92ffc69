//! Thin adapters to the worker pools.
//!
//! Every cross-machine hand-off (child start, child→parent event, timer
//! firing) goes through these adapters rather than running inline, which
//! keeps transition locks decoupled and stack depth bounded.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// The two process-scoped executors of the engine: a dispatch pool for
/// event-handler work and a scheduler pool for one-shot timers.
///
/// Both are plain tokio runtime handles so tests and embedders can inject
/// their own (e.g. a paused-time runtime). `Pools` is cheap to clone and
/// every [`Machine`](crate::Machine) of one operation shares the same
/// pair.
#[derive(Clone)]
pub struct Pools {
    dispatch: Handle,
    scheduler: Handle,
}

impl Pools {
    /// Capture the ambient tokio runtime for both pools.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, like
    /// [`Handle::current`].
    pub fn current() -> Self {
        let handle = Handle::current();
        Self {
            dispatch: handle.clone(),
            scheduler: handle,
        }
    }

    /// Build from explicit handles. The scheduler handle should belong to
    /// a runtime with an active timer driver.
    pub fn new(dispatch: Handle, scheduler: Handle) -> Self {
        Self { dispatch, scheduler }
    }

    /// Run `task` on the dispatch pool. An uncaught panic is logged and
    /// the task exits; it never tears down the pool.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        self.dispatch.spawn(async move {
            report_panics("dispatch", task);
        });
    }

    /// Arm a one-shot timer: after `delay`, run `task` on the scheduler
    /// pool. The returned handle cancels the timer best-effort.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerHandle {
        let handle = self.scheduler.spawn(async move {
            tokio::time::sleep(delay).await;
            report_panics("scheduler", task);
        });
        TimerHandle { task: handle }
    }
}

/// Cancellable handle to a one-shot timer armed via [`Pools::schedule`].
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancel the timer. Best-effort: a timer that has already fired has
    /// already delivered, and the delivery path treats it as stale.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

fn report_panics(pool: &'static str, task: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
        log::error!("{pool} task panicked: {}", panic_message(&payload));
    }
}

/// Render a panic payload for logs and step errors.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn execute_runs_the_task() {
        let pools = Pools::current();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        pools.execute(move || flag.store(true, Ordering::SeqCst));
        settle().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_does_not_fire() {
        let pools = Pools::current();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let timer = pools.schedule(Duration::from_millis(50), move || {
            flag.store(true, Ordering::SeqCst)
        });
        timer.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_task_is_contained() {
        let pools = Pools::current();
        pools.execute(|| panic!("boom"));
        settle().await;
        // The pool is still usable afterwards.
        let ok = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ok);
        pools.execute(move || flag.store(true, Ordering::SeqCst));
        settle().await;
        assert!(ok.load(Ordering::SeqCst));
    }
}
