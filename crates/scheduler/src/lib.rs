pub mod run_loop;

pub use run_loop::{CycleReport, QueueService};
