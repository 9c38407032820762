use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, RpcError,
};
use crate::types::Index;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use tokio::task::AbortHandle;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RequestType {
    AppendEntries,
    Snapshot,
}

/// An issued RPC whose response has not yet been applied. `count = 0` means
/// probe (AppendEntries with no entries) or snapshot.
pub(crate) struct Inflight {
    pub seq: i32,
    pub request_type: RequestType,
    pub start_index: Index,
    pub count: usize,
    pub size_bytes: usize,
    pub rpc_handle: AbortHandle,
}

impl Inflight {
    pub fn is_sending_log_entries(&self) -> bool {
        self.request_type == RequestType::AppendEntries && self.count > 0
    }
}

/// An arrived response parked until its sequence number comes up.
pub(crate) struct RpcResponse {
    pub seq: i32,
    pub send_ms: u64,
    pub payload: ResponsePayload,
}

pub(crate) enum ResponsePayload {
    AppendEntries {
        request: Arc<AppendEntriesRequest>,
        result: Result<AppendEntriesResponse, RpcError>,
    },
    Snapshot {
        request: Arc<InstallSnapshotRequest>,
        result: Result<InstallSnapshotResponse, RpcError>,
    },
}

// Heap ordering is by sequence alone; sequences are unique within a version
// epoch so ties cannot occur.
impl PartialEq for RpcResponse {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for RpcResponse {}

impl PartialOrd for RpcResponse {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RpcResponse {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq.cmp(&other.seq)
    }
}

/// Sequencing state shared by the inflight queue and the reorder buffer:
/// monotonically assigned request sequences, the next response sequence the
/// state machine may consume, and the version epoch that invalidates both on
/// reset.
pub(crate) struct Pipeline {
    req_seq: i32,
    required_next_seq: i32,
    version: u64,
    inflights: VecDeque<Inflight>,
    pending_responses: BinaryHeap<Reverse<RpcResponse>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline {
            req_seq: 0,
            required_next_seq: 0,
            version: 0,
            inflights: VecDeque::new(),
            pending_responses: BinaryHeap::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn req_seq(&self) -> i32 {
        self.req_seq
    }

    pub fn required_next_seq(&self) -> i32 {
        self.required_next_seq
    }

    /// Returns the sequence to assign to the next request, then advances the
    /// counter (wrapping negatives back to 0).
    pub fn next_req_seq(&mut self) -> i32 {
        let prev = self.req_seq;
        self.req_seq = self.req_seq.wrapping_add(1);
        if self.req_seq < 0 {
            self.req_seq = 0;
        }
        prev
    }

    pub fn advance_required_seq(&mut self) {
        self.required_next_seq = self.required_next_seq.wrapping_add(1);
        if self.required_next_seq < 0 {
            self.required_next_seq = 0;
        }
    }

    pub fn push_inflight(&mut self, inflight: Inflight) {
        self.inflights.push_back(inflight);
    }

    pub fn pop_inflight(&mut self) -> Option<Inflight> {
        self.inflights.pop_front()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflights.len()
    }

    /// The latest queued request (the only one allowed to extend the
    /// pipeline).
    pub fn rpc_in_fly(&self) -> Option<&Inflight> {
        self.inflights.back()
    }

    /// The next log index to send, or None when the pipeline cannot accept
    /// more requests right now (at the inflight cap, or its tail is a
    /// probe/snapshot that must complete first).
    pub fn next_send_index(&self, next_index: Index, max_inflight_msgs: usize) -> Option<Index> {
        if self.inflights.is_empty() {
            return Some(next_index);
        }
        if self.inflights.len() >= max_inflight_msgs {
            return None;
        }
        match self.rpc_in_fly() {
            Some(tail) if tail.is_sending_log_entries() => Some(tail.start_index.plus(tail.count as u64)),
            _ => None,
        }
    }

    pub fn push_response(&mut self, response: RpcResponse) {
        self.pending_responses.push(Reverse(response));
    }

    pub fn pending_responses_len(&self) -> usize {
        self.pending_responses.len()
    }

    pub fn peek_response_seq(&self) -> Option<i32> {
        self.pending_responses.peek().map(|Reverse(r)| r.seq)
    }

    pub fn pop_response(&mut self) -> Option<RpcResponse> {
        self.pending_responses.pop().map(|Reverse(r)| r)
    }

    /// Invalidates every outstanding sequence: bumps the version epoch,
    /// clears both queues, and joins the two counters at their maximum.
    /// Outstanding RPCs keep running; their responses are discarded by the
    /// version gate.
    pub fn reset(&mut self) {
        self.version += 1;
        self.inflights.clear();
        self.pending_responses.clear();
        let joined = self.req_seq.max(self.required_next_seq);
        self.req_seq = joined;
        self.required_next_seq = joined;
    }

    /// Drains the inflight queue for cancellation on stop.
    pub fn drain_inflights(&mut self) -> impl Iterator<Item = Inflight> + '_ {
        self.inflights.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abort_handle() -> AbortHandle {
        tokio::spawn(async {}).abort_handle()
    }

    fn inflight(seq: i32, request_type: RequestType, start_index: u64, count: usize) -> Inflight {
        Inflight {
            seq,
            request_type,
            start_index: Index::new(start_index),
            count,
            size_bytes: 0,
            rpc_handle: abort_handle(),
        }
    }

    fn response(seq: i32) -> RpcResponse {
        RpcResponse {
            seq,
            send_ms: 0,
            payload: ResponsePayload::Snapshot {
                request: Arc::new(crate::rpc::InstallSnapshotRequest {
                    term: crate::types::Term::new(1),
                    group_id: crate::types::GroupId::new("g"),
                    server_id: crate::types::PeerId::new("s"),
                    peer_id: crate::types::PeerId::new("p"),
                    meta: crate::snapshot::SnapshotMeta {
                        last_included_index: Index::new(1),
                        last_included_term: crate::types::Term::new(1),
                        peers: vec![],
                    },
                    uri: String::new(),
                }),
                result: Err(RpcError::Timeout),
            },
        }
    }

    #[tokio::test]
    async fn sequences_are_strictly_increasing_within_an_epoch() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.next_req_seq();
        let b = pipeline.next_req_seq();
        let c = pipeline.next_req_seq();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn req_seq_wraps_to_zero_instead_of_negative() {
        let mut pipeline = Pipeline::new();
        pipeline.req_seq = i32::MAX;
        assert_eq!(pipeline.next_req_seq(), i32::MAX);
        assert_eq!(pipeline.req_seq(), 0);
    }

    #[tokio::test]
    async fn empty_pipeline_admits_at_next_index() {
        let pipeline = Pipeline::new();
        assert_eq!(pipeline.next_send_index(Index::new(10), 3), Some(Index::new(10)));
    }

    #[tokio::test]
    async fn pipeline_at_the_cap_stops_sending() {
        let mut pipeline = Pipeline::new();
        for i in 0..3 {
            pipeline.push_inflight(inflight(i, RequestType::AppendEntries, 10 + 4 * i as u64, 4));
        }
        assert_eq!(pipeline.next_send_index(Index::new(10), 3), None);
    }

    #[tokio::test]
    async fn entry_bearing_tail_extends_the_pipeline() {
        let mut pipeline = Pipeline::new();
        pipeline.push_inflight(inflight(0, RequestType::AppendEntries, 10, 4));
        assert_eq!(pipeline.next_send_index(Index::new(10), 3), Some(Index::new(14)));
    }

    #[tokio::test]
    async fn probe_tail_stops_sending() {
        let mut pipeline = Pipeline::new();
        pipeline.push_inflight(inflight(0, RequestType::AppendEntries, 10, 0));
        assert_eq!(pipeline.next_send_index(Index::new(10), 3), None);
    }

    #[tokio::test]
    async fn snapshot_tail_stops_sending() {
        let mut pipeline = Pipeline::new();
        pipeline.push_inflight(inflight(0, RequestType::Snapshot, 10, 0));
        assert_eq!(pipeline.next_send_index(Index::new(10), 3), None);
    }

    #[tokio::test]
    async fn responses_pop_in_seq_order_regardless_of_arrival() {
        let mut pipeline = Pipeline::new();
        pipeline.push_response(response(2));
        pipeline.push_response(response(0));
        pipeline.push_response(response(1));

        assert_eq!(pipeline.peek_response_seq(), Some(0));
        assert_eq!(pipeline.pop_response().map(|r| r.seq), Some(0));
        assert_eq!(pipeline.pop_response().map(|r| r.seq), Some(1));
        assert_eq!(pipeline.pop_response().map(|r| r.seq), Some(2));
        assert_eq!(pipeline.pop_response().map(|r| r.seq), None);
    }

    #[tokio::test]
    async fn reset_bumps_version_and_joins_counters() {
        let mut pipeline = Pipeline::new();
        pipeline.push_inflight(inflight(0, RequestType::AppendEntries, 10, 4));
        pipeline.push_inflight(inflight(1, RequestType::AppendEntries, 14, 4));
        pipeline.next_req_seq();
        pipeline.next_req_seq();
        pipeline.push_response(response(0));

        let version_before = pipeline.version();
        pipeline.reset();

        assert_eq!(pipeline.version(), version_before + 1);
        assert_eq!(pipeline.inflight_count(), 0);
        assert_eq!(pipeline.pending_responses_len(), 0);
        assert_eq!(pipeline.req_seq(), pipeline.required_next_seq());
        assert_eq!(pipeline.req_seq(), 2);
    }
}
