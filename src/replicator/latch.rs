use crate::replicator::error::ErrorCode;
use crate::replicator::replicator::Replicator;
use crate::replicator::stats::SharedStats;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Cloneable opaque identity of a replicator. All public operations re-enter
/// the replicator through this token; after destruction every re-entry
/// observes the sentinel and becomes a no-op.
#[derive(Clone)]
pub struct ReplicatorId {
    latch: Arc<Latch>,
}

struct Latch {
    state: Mutex<LatchState>,
    stats: Arc<SharedStats>,
    destroyed: watch::Sender<bool>,
}

enum LatchState {
    Alive(Box<Replicator>),
    Destroyed,
}

/// Exclusive access to the replicator for the duration of one step. Guards
/// are never held across an await point; anything that could re-enter is
/// dispatched to a spawned task instead.
pub(crate) struct LatchGuard<'a> {
    latch: &'a Latch,
    state: MutexGuard<'a, LatchState>,
}

impl ReplicatorId {
    pub(crate) fn create(replicator: Replicator, stats: Arc<SharedStats>) -> Self {
        let (destroyed, _) = watch::channel(false);
        ReplicatorId {
            latch: Arc::new(Latch {
                state: Mutex::new(LatchState::Alive(Box::new(replicator))),
                stats,
                destroyed,
            }),
        }
    }

    /// Takes the latch. Returns None once the replicator is destroyed.
    pub(crate) fn lock(&self) -> Option<LatchGuard<'_>> {
        let state = self.latch.state.lock().expect("replicator latch mutex guard poison");
        if matches!(*state, LatchState::Destroyed) {
            return None;
        }
        Some(LatchGuard {
            latch: &self.latch,
            state,
        })
    }

    /// Delivers an error code to the replicator's error handler under the
    /// latch. Ignored after destruction.
    pub(crate) fn set_error(&self, code: ErrorCode) {
        if let Some(guard) = self.lock() {
            Replicator::on_error(self, guard, code);
        }
    }

    /// Resolves once the replicator has been destroyed.
    pub async fn join(&self) {
        let mut rx = self.latch.destroyed.subscribe();
        // wait_for fails only when the sender drops, and the sender lives in
        // the latch this token holds.
        let _ = rx.wait_for(|destroyed| *destroyed).await;
    }

    pub(crate) fn shared_stats(&self) -> &SharedStats {
        &self.latch.stats
    }
}

impl<'a> LatchGuard<'a> {
    /// One-way transition to the destroyed sentinel. Returns the replicator
    /// for teardown and wakes every `join()` waiter.
    pub(crate) fn destroy(mut self) -> Box<Replicator> {
        let prev = std::mem::replace(&mut *self.state, LatchState::Destroyed);
        let _ = self.latch.destroyed.send(true);
        match prev {
            LatchState::Alive(replicator) => replicator,
            LatchState::Destroyed => unreachable!("latch guard cannot outlive destruction"),
        }
    }
}

impl<'a> Deref for LatchGuard<'a> {
    type Target = Replicator;

    fn deref(&self) -> &Replicator {
        match &*self.state {
            LatchState::Alive(replicator) => replicator,
            LatchState::Destroyed => unreachable!("latch guard cannot outlive destruction"),
        }
    }
}

impl<'a> DerefMut for LatchGuard<'a> {
    fn deref_mut(&mut self) -> &mut Replicator {
        match &mut *self.state {
            LatchState::Alive(replicator) => replicator,
            LatchState::Destroyed => unreachable!("latch guard cannot outlive destruction"),
        }
    }
}
