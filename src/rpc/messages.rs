use crate::logstore::EntryKind;
use crate::snapshot::SnapshotMeta;
use crate::types::{GroupId, Index, PeerId, Term};
use bytes::Bytes;

/// Per-entry metadata carried in an AppendEntries request. The entry
/// payloads themselves are concatenated, in request order, into the
/// request-level `data` blob; `data_len` delimits each entry's slice.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub term: Term,
    pub kind: EntryKind,
    pub data_len: usize,
    pub peers: Vec<PeerId>,
    pub old_peers: Vec<PeerId>,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub group_id: GroupId,
    pub server_id: PeerId,
    pub peer_id: PeerId,
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    pub committed_index: Index,
    pub entries: Vec<EntryMeta>,
    pub data: Bytes,
}

impl AppendEntriesRequest {
    pub fn entries_count(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// The peer's last log index; meaningful on `success = false` so the
    /// leader can jump back to the right probe point.
    pub last_log_index: Index,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub group_id: GroupId,
    pub server_id: PeerId,
    pub peer_id: PeerId,
    pub meta: SnapshotMeta,
    pub uri: String,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct TimeoutNowRequest {
    pub term: Term,
    pub group_id: GroupId,
    pub server_id: PeerId,
    pub peer_id: PeerId,
}

#[derive(Debug, Clone)]
pub struct TimeoutNowResponse {
    pub term: Term,
    pub success: bool,
}
