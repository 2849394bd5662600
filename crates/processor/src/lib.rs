//! Task processor: the comparison protocol plus the sweep that runs it over
//! the queue with per-task failure isolation, session recovery and quota
//! backoff.

pub mod backoff;
pub mod processor;
pub mod prompts;
pub mod protocol;

pub use backoff::{parse_cooldown, BackoffWindow};
pub use processor::{SweepReport, TaskProcessor};
pub use protocol::{ComparisonProtocol, ProtocolOutcome, ProtocolRun, ProtocolSettings, ProtocolState};
