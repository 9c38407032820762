mod messages;
mod service;

pub use messages::AppendEntriesRequest;
pub use messages::AppendEntriesResponse;
pub use messages::EntryMeta;
pub use messages::InstallSnapshotRequest;
pub use messages::InstallSnapshotResponse;
pub use messages::TimeoutNowRequest;
pub use messages::TimeoutNowResponse;
pub use service::RaftRpcService;
pub use service::RpcError;
