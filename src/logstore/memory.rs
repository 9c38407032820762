use crate::logstore::{EntryKind, LogEntry, LogStore, LogWaitOutcome, LogWaiter, WaitId};
use crate::types::{Index, Term};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;

// In-memory log store, used by the test suites and by embedders that keep
// their durable log elsewhere. Indexing is 1-based; `first_index` moves
// forward when a prefix is compacted away.
pub struct InMemoryLogStore {
    inner: Mutex<Inner>,
}

struct Inner {
    first_index: u64,
    entries: Vec<LogEntry>,
    next_wait_id: WaitId,
    waiters: HashMap<WaitId, Waiter>,
    stopped: bool,
}

struct Waiter {
    expected_last_index: Index,
    callback: LogWaiter,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        InMemoryLogStore {
            inner: Mutex::new(Inner {
                first_index: 1,
                entries: Vec::new(),
                next_wait_id: 0,
                waiters: HashMap::new(),
                stopped: false,
            }),
        }
    }

    /// Appends a data entry at the next index and wakes any waiter whose
    /// awaited index is now exceeded.
    pub fn append(&self, term: Term, data: Bytes) -> Index {
        let mut inner = self.lock();
        let index = Index::new(inner.first_index + inner.entries.len() as u64);
        inner.entries.push(LogEntry::data_entry(index, term, data));
        Self::wake_waiters(&mut inner);
        index
    }

    pub fn append_entry(&self, mut entry: LogEntry) -> Index {
        let mut inner = self.lock();
        let index = Index::new(inner.first_index + inner.entries.len() as u64);
        entry.index = index;
        inner.entries.push(entry);
        Self::wake_waiters(&mut inner);
        index
    }

    /// Discards all entries below `new_first_index`, simulating snapshot
    /// compaction.
    pub fn compact_to(&self, new_first_index: Index) {
        let mut inner = self.lock();
        if new_first_index.val() <= inner.first_index {
            return;
        }
        let drop_count = (new_first_index.val() - inner.first_index) as usize;
        let drop_count = drop_count.min(inner.entries.len());
        inner.entries.drain(..drop_count);
        inner.first_index = new_first_index.val();
    }

    /// Fires every outstanding waiter with `Stopped` and rejects new waits.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.stopped = true;
        for (_, waiter) in inner.waiters.drain() {
            dispatch(waiter.callback, LogWaitOutcome::Stopped);
        }
    }

    fn wake_waiters(inner: &mut Inner) {
        let last_index = Index::new(inner.first_index + inner.entries.len() as u64 - 1);
        let ready: Vec<WaitId> = inner
            .waiters
            .iter()
            .filter(|(_, w)| w.expected_last_index < last_index)
            .map(|(id, _)| *id)
            .collect();
        for id in ready {
            let waiter = inner.waiters.remove(&id).expect("waiter id just listed");
            dispatch(waiter.callback, LogWaitOutcome::NewEntries);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("InMemoryLogStore mutex guard poison")
    }
}

impl Default for InMemoryLogStore {
    fn default() -> Self {
        InMemoryLogStore::new()
    }
}

// Waiters re-enter the replicator; never run them on the appender's stack.
fn dispatch(callback: LogWaiter, outcome: LogWaitOutcome) {
    tokio::spawn(async move {
        callback(outcome);
    });
}

impl LogStore for InMemoryLogStore {
    fn first_index(&self) -> Index {
        Index::new(self.lock().first_index)
    }

    fn last_index(&self) -> Index {
        let inner = self.lock();
        if inner.entries.is_empty() {
            Index::new(inner.first_index - 1)
        } else {
            Index::new(inner.first_index + inner.entries.len() as u64 - 1)
        }
    }

    fn term_of(&self, index: Index) -> Term {
        let inner = self.lock();
        if index.val() < inner.first_index {
            return Term::ZERO;
        }
        let offset = (index.val() - inner.first_index) as usize;
        inner.entries.get(offset).map(|e| e.term).unwrap_or(Term::ZERO)
    }

    fn entry_at(&self, index: Index) -> Option<LogEntry> {
        let inner = self.lock();
        if index.val() < inner.first_index {
            return None;
        }
        let offset = (index.val() - inner.first_index) as usize;
        inner.entries.get(offset).cloned()
    }

    fn wait(&self, expected_last_index: Index, waiter: LogWaiter) -> WaitId {
        let mut inner = self.lock();
        let wait_id = inner.next_wait_id;
        inner.next_wait_id += 1;

        if inner.stopped {
            dispatch(waiter, LogWaitOutcome::Stopped);
            return wait_id;
        }

        let last_index = Index::new(inner.first_index + inner.entries.len() as u64)
            .prev();
        if expected_last_index < last_index {
            dispatch(waiter, LogWaitOutcome::NewEntries);
            return wait_id;
        }

        inner.waiters.insert(
            wait_id,
            Waiter {
                expected_last_index,
                callback: waiter,
            },
        );
        wait_id
    }

    fn remove_waiter(&self, wait_id: WaitId) -> bool {
        self.lock().waiters.remove(&wait_id).is_some()
    }
}
