use crate::types::{Index, Term};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free mirror of the replicator fields that external observers (metric
/// gauges, `last_rpc_send_ms()`) read without taking the latch. All writes
/// happen under the latch, so writers never race each other.
#[derive(Default)]
pub(crate) struct SharedStats {
    next_index: AtomicU64,
    last_rpc_send_ms: AtomicU64,
    heartbeat_times: AtomicU64,
    append_entries_times: AtomicU64,
    install_snapshot_times: AtomicU64,
    mismatch_at_one: AtomicU64,
}

impl SharedStats {
    pub fn next_index(&self) -> u64 {
        self.next_index.load(Ordering::Acquire)
    }

    pub fn set_next_index(&self, value: u64) {
        self.next_index.store(value, Ordering::Release);
    }

    pub fn last_rpc_send_ms(&self) -> u64 {
        self.last_rpc_send_ms.load(Ordering::Acquire)
    }

    pub fn set_last_rpc_send_ms(&self, value: u64) {
        self.last_rpc_send_ms.store(value, Ordering::Release);
    }

    pub fn heartbeat_times(&self) -> u64 {
        self.heartbeat_times.load(Ordering::Relaxed)
    }

    pub fn incr_heartbeat_times(&self) {
        self.heartbeat_times.fetch_add(1, Ordering::Relaxed);
    }

    pub fn append_entries_times(&self) -> u64 {
        self.append_entries_times.load(Ordering::Relaxed)
    }

    pub fn incr_append_entries_times(&self) {
        self.append_entries_times.fetch_add(1, Ordering::Relaxed);
    }

    pub fn install_snapshot_times(&self) -> u64 {
        self.install_snapshot_times.load(Ordering::Relaxed)
    }

    pub fn incr_install_snapshot_times(&self) {
        self.install_snapshot_times.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mismatch_at_one(&self) -> u64 {
        self.mismatch_at_one.load(Ordering::Relaxed)
    }

    pub fn incr_mismatch_at_one(&self) {
        self.mismatch_at_one.fetch_add(1, Ordering::Relaxed);
    }
}

/// Coarse activity description, kept for log lines and `Display`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RunningState {
    Idle,
    Blocking,
    AppendingEntries,
    InstallingSnapshot,
}

pub(crate) struct Stat {
    pub running_state: RunningState,
    pub first_log_index: Index,
    pub last_log_index: Index,
    pub last_log_included: Index,
    pub last_term_included: Term,
}

impl Stat {
    pub fn new() -> Self {
        Stat {
            running_state: RunningState::Idle,
            first_log_index: Index::ZERO,
            last_log_index: Index::ZERO,
            last_log_included: Index::ZERO,
            last_term_included: Term::ZERO,
        }
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<running={:?}, firstLogIndex={}, lastLogIncluded={}, lastLogIndex={}, lastTermIncluded={}>",
            self.running_state, self.first_log_index, self.last_log_included, self.last_log_index, self.last_term_included
        )
    }
}
