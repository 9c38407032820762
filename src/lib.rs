mod ballot;
mod logstore;
mod metrics;
mod node;
mod replicator;
mod rpc;
mod snapshot;
mod timer;
mod types;

pub use ballot::BallotBox;
pub use logstore::EntryKind;
pub use logstore::InMemoryLogStore;
pub use logstore::LogEntry;
pub use logstore::LogStore;
pub use logstore::LogWaitOutcome;
pub use logstore::LogWaiter;
pub use logstore::WaitId;
pub use metrics::Gauge;
pub use metrics::GaugeSet;
pub use metrics::HistogramSnapshot;
pub use metrics::MetricsRegistry;
pub use node::NodeHandle;
pub use replicator::CatchUpClosure;
pub use replicator::CatchUpResult;
pub use replicator::ErrorCode;
pub use replicator::HeartbeatClosure;
pub use replicator::Replicator;
pub use replicator::ReplicatorId;
pub use replicator::ReplicatorOptions;
pub use replicator::ReplicatorTuning;
pub use replicator::ReplicatorView;
pub use replicator::StartError;
pub use replicator::State;
pub use rpc::AppendEntriesRequest;
pub use rpc::AppendEntriesResponse;
pub use rpc::EntryMeta;
pub use rpc::InstallSnapshotRequest;
pub use rpc::InstallSnapshotResponse;
pub use rpc::RaftRpcService;
pub use rpc::RpcError;
pub use rpc::TimeoutNowRequest;
pub use rpc::TimeoutNowResponse;
pub use snapshot::SnapshotMeta;
pub use snapshot::SnapshotReader;
pub use snapshot::SnapshotStorage;
pub use timer::monotonic_ms;
pub use types::GroupId;
pub use types::Index;
pub use types::PeerId;
pub use types::Term;
