use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::task::AbortHandle;
use tokio::time::{Duration, Instant};

/// Milliseconds on a process-wide monotonic clock. Only differences and
/// orderings of these values are meaningful.
pub fn monotonic_ms() -> u64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let origin = *ORIGIN.get_or_init(Instant::now);
    Instant::now().duration_since(origin).as_millis() as u64
}

/// Schedules `task` to run once after `delay` on the tokio runtime.
///
/// The returned handle cancels best-effort: once the timer task has claimed
/// the firing, `cancel()` returns false and the task runs (or already ran).
pub(crate) fn schedule<F>(delay: Duration, task: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    let claimed = Arc::new(AtomicBool::new(false));
    let task_claimed = Arc::clone(&claimed);

    let join = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if task_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            task();
        }
    });

    TimerHandle {
        claimed,
        abort: join.abort_handle(),
    }
}

/// Handle to a scheduled one-shot timer.
pub(crate) struct TimerHandle {
    claimed: Arc<AtomicBool>,
    abort: AbortHandle,
}

impl TimerHandle {
    /// Attempts to cancel the timer. Returns true when the cancellation won
    /// the race with the firing, false when the task has already claimed it.
    pub(crate) fn cancel(&self) -> bool {
        let won = self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.abort.abort();
        won
    }
}
