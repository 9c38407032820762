mod catchup;
mod error;
mod latch;
mod options;
mod pipeline;
mod replicator;
mod stats;

pub use error::CatchUpClosure;
pub use error::CatchUpResult;
pub use error::ErrorCode;
pub use error::StartError;
pub use latch::ReplicatorId;
pub use options::ReplicatorOptions;
pub use options::ReplicatorTuning;
pub use replicator::HeartbeatClosure;
pub use replicator::Replicator;
pub use replicator::ReplicatorView;
pub use replicator::State;
