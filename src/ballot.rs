use crate::types::{Index, PeerId};

/// Leader-side commit tracker. The replicator reports each acknowledged
/// entry range on behalf of its peer; the ballot box decides when a quorum
/// has been reached.
pub trait BallotBox: Send + Sync {
    fn last_committed_index(&self) -> Index;

    /// Records that `peer` has acknowledged entries `[first, last]`
    /// inclusive.
    fn commit_at(&self, first: Index, last: Index, peer: &PeerId);
}
