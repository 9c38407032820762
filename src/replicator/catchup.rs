use crate::replicator::error::{CatchUpClosure, CatchUpResult};
use crate::timer::TimerHandle;

/// The single-occupancy catch-up notification slot.
///
/// `error_was_set` arbitrates the race between the success path and the
/// timeout timer: the success path sets it under the latch, and when it
/// cannot cancel an already-firing timer it leaves the slot occupied so the
/// timer delivers the (already decided) result instead. Whichever path takes
/// the slot out dispatches the closure, so it runs exactly once.
pub(crate) struct CatchUp {
    pub max_margin: u64,
    pub timer: Option<TimerHandle>,
    pub error_was_set: bool,
    pub result: CatchUpResult,
    done: CatchUpClosure,
}

impl CatchUp {
    pub fn new(max_margin: u64, done: CatchUpClosure) -> Self {
        CatchUp {
            max_margin,
            timer: None,
            error_was_set: false,
            result: Ok(()),
            done,
        }
    }

    /// Runs the closure with the accumulated result on a spawned task, off
    /// the latch.
    pub fn dispatch(self) {
        let done = self.done;
        let result = self.result;
        tokio::spawn(async move {
            done(result);
        });
    }
}
