use crate::ballot::BallotBox;
use crate::logstore::LogStore;
use crate::metrics::MetricsRegistry;
use crate::node::NodeHandle;
use crate::rpc::RaftRpcService;
use crate::snapshot::SnapshotStorage;
use crate::types::{GroupId, PeerId, Term};
use std::convert::TryFrom;
use std::sync::Arc;
use tokio::time::Duration;

/// Everything a replicator needs to drive one follower: its identity within
/// the group, the leader's current term, and handles to the shared
/// collaborators.
pub struct ReplicatorOptions {
    pub logger: slog::Logger,
    pub group_id: GroupId,
    pub server_id: PeerId,
    pub peer_id: PeerId,
    pub term: Term,
    pub election_timeout: Duration,
    pub log: Arc<dyn LogStore>,
    pub ballot_box: Arc<dyn BallotBox>,
    pub snapshot_storage: Arc<dyn SnapshotStorage>,
    pub rpc: Arc<dyn RaftRpcService>,
    pub node: Arc<dyn NodeHandle>,
    pub metrics: Arc<MetricsRegistry>,
}

impl ReplicatorOptions {
    /// Idle-liveness interval: a fraction of the election timeout so a
    /// healthy follower never times out, floored to keep pathological
    /// configurations from busy-looping.
    pub(crate) fn heartbeat_timeout(&self) -> Duration {
        std::cmp::max(self.election_timeout / 10, Duration::from_millis(10))
    }
}

/// Pipeline tuning knobs. Unset fields take the defaults.
#[derive(Clone, Default)]
pub struct ReplicatorTuning {
    /// Cap on outstanding AppendEntries/InstallSnapshot requests.
    pub max_inflight_msgs: Option<usize>,
    /// Cap on entries batched into one AppendEntries request.
    pub max_entries_per_request: Option<usize>,
    /// Cap on accumulated entry payload bytes per request.
    pub max_body_size: Option<usize>,
}

pub(crate) struct ReplicatorTuningValidated {
    pub max_inflight_msgs: usize,
    pub max_entries_per_request: usize,
    pub max_body_size: usize,
}

impl ReplicatorTuningValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.max_inflight_msgs == 0 {
            return Err("max_inflight_msgs must be at least 1");
        }
        if self.max_entries_per_request == 0 {
            return Err("max_entries_per_request must be at least 1");
        }
        if self.max_body_size == 0 {
            return Err("max_body_size must be at least 1 byte");
        }
        Ok(())
    }
}

impl TryFrom<ReplicatorTuning> for ReplicatorTuningValidated {
    type Error = &'static str;

    fn try_from(tuning: ReplicatorTuning) -> Result<Self, Self::Error> {
        let values = ReplicatorTuningValidated {
            max_inflight_msgs: tuning.max_inflight_msgs.unwrap_or(256),
            max_entries_per_request: tuning.max_entries_per_request.unwrap_or(1024),
            max_body_size: tuning.max_body_size.unwrap_or(512 * 1024),
        };

        values.validate()?;
        Ok(values)
    }
}
