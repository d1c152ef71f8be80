//! Deferred task scheduler.
//!
//! Tasks are closures run once on the runtime's worker pool at or after a
//! delay measured on the monotonic clock. Every scheduled task hands back a
//! [`CancelHandle`]; cancelling is idempotent and race-safe against the task
//! starting — a task that already began runs to completion.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tracing::error;

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;
const FINISHED: u8 = 3;

/// Handle to a scheduled task.
///
/// Cloneable; any clone may cancel. Dropping the handle does NOT cancel.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<AtomicU8>,
}

impl CancelHandle {
    /// Prevent a pending task from ever running. No effect once the task has
    /// started, finished, or was already cancelled.
    pub fn cancel(&self) {
        let _ = self.state.compare_exchange(
            PENDING,
            CANCELLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// A no-op handle for default-initialized slots.
    pub fn noop() -> Self {
        CancelHandle {
            state: Arc::new(AtomicU8::new(CANCELLED)),
        }
    }
}

/// Schedules closures for deferred one-shot execution.
///
/// Owns nothing but a handle to the runtime it was created on; dropping the
/// scheduler does not cancel outstanding tasks.
#[derive(Clone)]
pub struct Scheduler {
    handle: tokio::runtime::Handle,
}

impl Scheduler {
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Scheduler {
            handle: tokio::runtime::Handle::current(),
        }
    }

    /// Run `task` once, at or after `delay` from now.
    ///
    /// A panic inside `task` is caught and logged; it never takes the
    /// scheduler (or the runtime) down with it.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> CancelHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(PENDING));
        let task_state = Arc::clone(&state);
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            // Claim the task; loses to a concurrent cancel().
            if task_state
                .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_owned());
                error!(panic = %msg, "scheduled task panicked");
            }
            task_state.store(FINISHED, Ordering::Release);
        });
        CancelHandle { state }
    }
}
