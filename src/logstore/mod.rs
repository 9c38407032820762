mod log;
mod memory;

pub use log::EntryKind;
pub use log::LogEntry;
pub use log::LogStore;
pub use log::LogWaitOutcome;
pub use log::LogWaiter;
pub use log::WaitId;
pub use memory::InMemoryLogStore;
