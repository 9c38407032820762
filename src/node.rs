use crate::types::Term;

/// Callbacks into the node that owns this replicator. Implementations must
/// not assume they are invoked on any particular task; the replicator
/// dispatches them off its latch.
pub trait NodeHandle: Send + Sync {
    /// A response carried a term higher than ours: the node must step down
    /// as leader and adopt `observed_term`. The replicator destroys itself
    /// before calling this.
    fn step_down(&self, observed_term: Term);

    /// Opening or reading the local snapshot failed while trying to install
    /// it on the peer. The replicator does not retry; the node decides what
    /// to do (typically surface a storage error).
    fn report_snapshot_failure(&self, message: String);
}
