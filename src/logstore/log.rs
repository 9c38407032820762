use crate::types::{Index, PeerId, Term};
use bytes::Bytes;

/// Kind of a log entry. Configuration entries carry the new (and during a
/// joint transition, old) peer sets.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryKind {
    NoOp,
    Data,
    Configuration,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub index: Index,
    pub term: Term,
    pub kind: EntryKind,
    pub data: Bytes,
    pub peers: Vec<PeerId>,
    pub old_peers: Vec<PeerId>,
}

impl LogEntry {
    pub fn data_entry(index: Index, term: Term, data: Bytes) -> Self {
        LogEntry {
            index,
            term,
            kind: EntryKind::Data,
            data,
            peers: Vec::new(),
            old_peers: Vec::new(),
        }
    }
}

pub type WaitId = u64;

/// Why a registered log waiter fired.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LogWaitOutcome {
    /// Entries past the awaited index have been appended.
    NewEntries,
    /// The log store is shutting down.
    Stopped,
}

/// One-shot callback registered with [`LogStore::wait`].
///
/// Implementations must dispatch waiters asynchronously (e.g. on a spawned
/// task), never inline from `wait()` or from the appending thread: waiters
/// re-enter the replicator and would deadlock against locks the caller holds.
pub type LogWaiter = Box<dyn FnOnce(LogWaitOutcome) + Send>;

/// Leader-side view of the log manager.
pub trait LogStore: Send + Sync {
    /// Index of the first entry still present (older entries are compacted).
    fn first_index(&self) -> Index;

    /// Index of the last appended entry, or 0 for an empty log.
    fn last_index(&self) -> Index;

    /// Term of the entry at `index`. Returns [`Term::ZERO`] for compacted or
    /// unknown indexes; index 0 also reports term 0.
    fn term_of(&self, index: Index) -> Term;

    fn entry_at(&self, index: Index) -> Option<LogEntry>;

    /// Registers a one-shot waiter fired with `NewEntries` once
    /// `last_index()` exceeds `expected_last_index`, or with `Stopped` on
    /// shutdown. Fires immediately (still asynchronously) when entries are
    /// already available.
    fn wait(&self, expected_last_index: Index, waiter: LogWaiter) -> WaitId;

    /// Removes a registered waiter. Returns false when it already fired or
    /// never existed.
    fn remove_waiter(&self, wait_id: WaitId) -> bool;
}
