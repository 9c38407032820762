use crate::types::PeerId;

/// Protocol-level outcome codes delivered through the latch and to catch-up
/// closures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorCode {
    #[error("operation timed out")]
    Timeout,
    #[error("replicator stopped")]
    Stopped,
    #[error("peer responded with a higher term")]
    HigherTerm,
    #[error("another catch-up wait is already registered")]
    Busy,
    #[error("replicator is destroyed")]
    Gone,
}

pub type CatchUpResult = Result<(), ErrorCode>;

/// One-shot notification invoked when the peer catches up (or definitively
/// cannot). Always dispatched on a spawned task, never under the latch.
pub type CatchUpClosure = Box<dyn FnOnce(CatchUpResult) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to initialize sending channel to peer {0}")]
    ConnectFailed(PeerId),
    #[error("invalid replicator tuning: {0}")]
    InvalidTuning(&'static str),
}
