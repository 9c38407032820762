use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, TimeoutNowRequest,
    TimeoutNowResponse,
};
use crate::types::PeerId;
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("rpc deadline exceeded")]
    Timeout,
    #[error("replicator destroyed")]
    ReplicatorGone,
}

/// Transport used to reach the remote peer. Implementations resolve the
/// `PeerId` to an endpoint themselves and must be safe to call from many
/// replicators concurrently.
///
/// `timeout` of None leaves the deadline to the transport's own default.
#[async_trait::async_trait]
pub trait RaftRpcService: Send + Sync {
    /// Establishes (or verifies) the sending channel to the peer. Called
    /// once at replicator start; a false return aborts the start.
    fn connect(&self, peer: &PeerId) -> bool;

    async fn append_entries(
        &self,
        peer: &PeerId,
        request: Arc<AppendEntriesRequest>,
        timeout: Option<Duration>,
    ) -> Result<AppendEntriesResponse, RpcError>;

    async fn install_snapshot(
        &self,
        peer: &PeerId,
        request: Arc<InstallSnapshotRequest>,
    ) -> Result<InstallSnapshotResponse, RpcError>;

    async fn timeout_now(
        &self,
        peer: &PeerId,
        request: TimeoutNowRequest,
        timeout: Option<Duration>,
    ) -> Result<TimeoutNowResponse, RpcError>;
}
