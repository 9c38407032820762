use crate::types::{Index, PeerId, Term};

/// Metadata describing a snapshot: the last log position it covers and the
/// configuration in force at that point.
#[derive(Debug, Clone)]
pub struct SnapshotMeta {
    pub last_included_index: Index,
    pub last_included_term: Term,
    pub peers: Vec<PeerId>,
}

/// An open snapshot, readable by a remote peer through a copy URI.
///
/// The replicator owns the reader only while an `InstallSnapshot` is
/// outstanding and drops it on every exit from that state; `Drop` is the
/// release point for whatever resources the reader pins (file handles,
/// throttles, refcounts on the snapshot itself).
pub trait SnapshotReader: Send {
    /// Loads the snapshot metadata, or None when the snapshot is unreadable.
    fn load(&self) -> Option<SnapshotMeta>;

    /// Produces the URI a remote peer uses to copy this snapshot, or None
    /// when one cannot be generated (e.g. the copy server failed to start).
    fn generate_uri_for_copy(&self) -> Option<String>;

    /// Local path of the snapshot, for diagnostics.
    fn path(&self) -> String;
}

pub trait SnapshotStorage: Send + Sync {
    /// Opens the latest snapshot, or None when there is none or opening
    /// failed.
    fn open(&self) -> Option<Box<dyn SnapshotReader>>;
}
