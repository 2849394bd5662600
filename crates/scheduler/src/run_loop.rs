use aimatch_core::config::RunLoopConfig;
use aimatch_core::Result;
use aimatch_processor::{SweepReport, TaskProcessor};
use aimatch_sync::RemoteSync;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, info_span, warn, Instrument};

/// Outcome of one Sync-In, sweep, Sync-Out cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// New tasks pulled, `None` if Sync-In failed.
    pub pulled: Option<usize>,
    pub sweep: SweepReport,
    /// Statuses pushed, `None` if Sync-Out failed.
    pub pushed: Option<usize>,
}

/// The forever loop: Sync-In, sweep, Sync-Out, idle.
pub struct QueueService {
    sync: RemoteSync,
    processor: TaskProcessor,
    idle: Duration,
    error_penalty: Duration,
}

impl QueueService {
    pub fn new(sync: RemoteSync, processor: TaskProcessor) -> Self {
        let defaults = RunLoopConfig::default();
        Self {
            sync,
            processor,
            idle: defaults.idle(),
            error_penalty: defaults.error_penalty(),
        }
    }

    pub fn with_run_loop_config(mut self, config: &RunLoopConfig) -> Self {
        self.idle = config.idle();
        self.error_penalty = config.error_penalty();
        self
    }

    pub fn with_intervals(mut self, idle: Duration, error_penalty: Duration) -> Self {
        self.idle = idle;
        self.error_penalty = error_penalty;
        self
    }

    /// One cycle. Sync failures are logged and tolerated; a sweep that cannot
    /// start is returned as an error.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let pulled = match self.sync.pull_pending().await {
            Ok(added) => Some(added.len()),
            Err(e) => {
                warn!(error = %e, "Sync-In failed, proceeding with local queue");
                None
            }
        };

        let sweep = self.processor.sweep().await?;

        let pushed = match self.sync.push_statuses().await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "Sync-Out failed, will retry next cycle");
                None
            }
        };

        Ok(CycleReport {
            pulled,
            sweep,
            pushed,
        })
    }

    pub async fn run_loop(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            idle_secs = self.idle.as_secs(),
            penalty_secs = self.error_penalty.as_secs(),
            "QueueService started"
        );

        loop {
            let cycle_id = uuid::Uuid::new_v4();
            let span = info_span!("cycle", id = %cycle_id);

            let wait = match self.run_cycle().instrument(span.clone()).await {
                Ok(report) => {
                    span.in_scope(|| {
                        info!(
                            pulled = ?report.pulled,
                            attempted = report.sweep.attempted,
                            pushed = ?report.pushed,
                            "Cycle complete, sleeping"
                        )
                    });
                    self.idle
                }
                Err(e) => {
                    span.in_scope(|| error!(error = %e, "Cycle failed"));
                    if let Err(e) = self.sync.push_statuses().instrument(span).await {
                        warn!(error = %e, "Best-effort Sync-Out failed");
                    }
                    self.error_penalty
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.recv() => {
                    info!("QueueService shutting down");
                    break;
                }
            }
        }
    }
}
