pub mod audit;
pub mod queue;

pub use audit::{AuditEvent, AuditLogger};
pub use queue::QueueStore;
