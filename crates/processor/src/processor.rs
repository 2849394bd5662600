use crate::backoff::BackoffWindow;
use crate::protocol::{ComparisonProtocol, ProtocolOutcome};
use aimatch_browser::{SessionHandle, SessionProvider};
use aimatch_core::{Error, ReprocessPolicy, Result, Task, TaskId, Verdict};
use aimatch_storage::{AuditLogger, QueueStore};
use aimatch_sync::RemoteSync;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub candidates: usize,
    pub attempted: usize,
    pub verified: usize,
    pub ignored: usize,
    pub unresolved: usize,
    pub failed: usize,
    pub rate_limited: usize,
    pub session_restarts: usize,
    /// The sweep stopped before the last candidate because no session could
    /// be (re)opened.
    pub ended_early: bool,
}

impl SweepReport {
    fn count_verdict(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Verified => self.verified += 1,
            Verdict::Ignored => self.ignored += 1,
            Verdict::Unresolved => self.unresolved += 1,
        }
    }
}

/// Runs the comparison protocol over every queued task, one at a time, on a
/// single session.
pub struct TaskProcessor {
    provider: Arc<dyn SessionProvider>,
    store: QueueStore,
    protocol: ComparisonProtocol,
    policy: ReprocessPolicy,
    restart_delay: Duration,
    sync: Option<RemoteSync>,
    audit: Option<AuditLogger>,
    backoff: BackoffWindow,
}

impl TaskProcessor {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        store: QueueStore,
        protocol: ComparisonProtocol,
    ) -> Self {
        Self {
            provider,
            store,
            protocol,
            policy: ReprocessPolicy::default(),
            restart_delay: Duration::from_secs(30),
            sync: None,
            audit: None,
            backoff: BackoffWindow::new(),
        }
    }

    pub fn with_policy(mut self, policy: ReprocessPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Pause between closing a lost session and opening its replacement.
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Sync client used to report progress before a quota cooldown.
    pub fn with_sync(mut self, sync: RemoteSync) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn backoff(&self) -> &BackoffWindow {
        &self.backoff
    }

    /// Process every candidate task. Task-scoped failures are recorded on the
    /// task and never end the sweep; only failing to (re)open a session does.
    pub async fn sweep(&mut self) -> Result<SweepReport> {
        let tasks = self.store.sweep_candidates(self.policy)?;
        let mut report = SweepReport {
            candidates: tasks.len(),
            ..Default::default()
        };
        info!(count = tasks.len(), policy = ?self.policy, "Found tasks in queue");
        if tasks.is_empty() {
            return Ok(report);
        }

        let mut session = self.provider.open().await?;

        for task in &tasks {
            report.attempted += 1;
            let started = Instant::now();

            let outcome = self.process_task(session.as_mut(), task).await;
            match outcome {
                Ok(ProtocolOutcome::Verdict(verdict)) => {
                    report.count_verdict(verdict);
                    let duration_ms = started.elapsed().as_millis() as u64;
                    info!(task_id = %task.id, status = %verdict.status(), duration_ms, "Task resolved");
                    self.audit_with(|a| a.log_verdict(task.id, verdict.status(), Some(duration_ms)));
                }
                Ok(ProtocolOutcome::RateLimited { cooldown }) => {
                    report.rate_limited += 1;
                    self.audit_with(|a| a.log_rate_limited(task.id, cooldown.as_secs()));
                    match self.cool_down(session, cooldown).await {
                        Some(fresh) => session = fresh,
                        None => {
                            report.ended_early = true;
                            return Ok(report);
                        }
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    let lost = e.is_session_lost();
                    error!(task_id = %task.id, error = %e, session_lost = lost, "Error processing task");
                    self.note_failure(task.id, &e, lost);

                    if lost {
                        report.session_restarts += 1;
                        match self.restart(session).await {
                            Some(fresh) => session = fresh,
                            None => {
                                report.ended_early = true;
                                return Ok(report);
                            }
                        }
                    }
                }
            }
        }

        close_quietly(session.as_mut()).await;
        info!(?report, "Sweep finished");
        Ok(report)
    }

    async fn process_task(
        &self,
        session: &mut dyn SessionHandle,
        task: &Task,
    ) -> Result<ProtocolOutcome> {
        info!(task_id = %task.id, url = %task.competitor_url, "Processing task");
        self.store.mark_attempt(task.id)?;

        let run = self.protocol.run(session, task).await?;
        if let ProtocolOutcome::Verdict(verdict) = run.outcome {
            self.store.set_status(task.id, verdict.status())?;
        }
        Ok(run.outcome)
    }

    fn note_failure(&self, id: TaskId, err: &Error, session_lost: bool) {
        if let Err(e) = self.store.record_failure(id, &err.to_string()) {
            warn!(task_id = %id, error = %e, "Failed to record task failure");
        }
        self.audit_with(|a| a.log_failure(id, &err.to_string(), session_lost));
    }

    /// Close the lost session and open a replacement. `None` if that fails.
    async fn restart(&self, mut session: Box<dyn SessionHandle>) -> Option<Box<dyn SessionHandle>> {
        warn!(delay_secs = self.restart_delay.as_secs(), "Session lost, restarting");
        close_quietly(session.as_mut()).await;
        drop(session);
        tokio::time::sleep(self.restart_delay).await;

        match self.provider.open().await {
            Ok(fresh) => {
                info!("Session restarted");
                self.audit_with(|a| a.log_session_restart(true, None));
                Some(fresh)
            }
            Err(e) => {
                error!(error = %e, "Session restart failed, ending sweep");
                self.audit_with(|a| a.log_session_restart(false, Some(e.to_string())));
                None
            }
        }
    }

    /// Quota hit: close the session, report progress, wait out the window,
    /// then reopen. `None` if the reopen fails.
    async fn cool_down(
        &mut self,
        mut session: Box<dyn SessionHandle>,
        cooldown: Duration,
    ) -> Option<Box<dyn SessionHandle>> {
        warn!(cooldown_secs = cooldown.as_secs(), "Deep analysis limit reached, stopping session");
        close_quietly(session.as_mut()).await;
        drop(session);

        if let Some(sync) = &self.sync {
            if let Err(e) = sync.push_statuses().await {
                warn!(error = %e, "Sync-Out before cooldown failed");
            }
        }

        self.backoff.set(cooldown);
        self.backoff.wait().await;

        match self.provider.open().await {
            Ok(fresh) => Some(fresh),
            Err(e) => {
                error!(error = %e, "Could not reopen session after cooldown, ending sweep");
                self.audit_with(|a| a.log_session_restart(false, Some(e.to_string())));
                None
            }
        }
    }

    fn audit_with<F>(&self, write: F)
    where
        F: FnOnce(&AuditLogger) -> Result<()>,
    {
        if let Some(audit) = &self.audit {
            if let Err(e) = write(audit) {
                warn!(error = %e, "Failed to write audit event");
            }
        }
    }
}

async fn close_quietly(session: &mut dyn SessionHandle) {
    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to close session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::fast_settings;
    use aimatch_browser::scripted::ScriptedProvider;
    use aimatch_core::{Paths, TaskStatus};
    use aimatch_storage::AuditEvent;
    use aimatch_sync::{RemoteTask, StatusUpdate, SyncEndpoint};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Quota notice without a stated period, so the configured default applies.
    const NOTICE: &str =
        "You've reached your limit of 30 Grok DeepSearch questions for now. Please check back later to continue.";

    #[derive(Default)]
    struct RecordingEndpoint {
        tasks: Mutex<Vec<RemoteTask>>,
        pushed: Mutex<Vec<Vec<StatusUpdate>>>,
    }

    #[async_trait]
    impl SyncEndpoint for RecordingEndpoint {
        async fn fetch_tasks(&self) -> Result<Vec<RemoteTask>> {
            Ok(self.tasks.lock().unwrap().clone())
        }

        async fn post_statuses(&self, updates: &[StatusUpdate]) -> Result<()> {
            self.pushed.lock().unwrap().push(updates.to_vec());
            Ok(())
        }
    }

    struct Harness {
        provider: ScriptedProvider,
        store: QueueStore,
        endpoint: Arc<RecordingEndpoint>,
        sync: RemoteSync,
    }

    impl Harness {
        fn new() -> Self {
            let provider = ScriptedProvider::new();
            let store = QueueStore::open_in_memory().unwrap();
            let endpoint = Arc::new(RecordingEndpoint::default());
            let sync = RemoteSync::new(endpoint.clone(), store.clone());
            Self {
                provider,
                store,
                endpoint,
                sync,
            }
        }

        fn offer(&self, id: i64, url: &str, client_url: &str) {
            self.endpoint.tasks.lock().unwrap().push(RemoteTask {
                id: TaskId(id),
                url: url.to_string(),
                client_url: client_url.to_string(),
            });
        }

        fn processor(&self) -> TaskProcessor {
            TaskProcessor::new(
                Arc::new(self.provider.clone()),
                self.store.clone(),
                ComparisonProtocol::new(fast_settings()),
            )
            .with_restart_delay(Duration::ZERO)
            .with_sync(self.sync.clone())
        }

        fn status(&self, id: i64) -> TaskStatus {
            self.store.get(TaskId(id)).unwrap().unwrap().status
        }
    }

    #[tokio::test]
    async fn test_category_page_is_ignored_and_reported() {
        let h = Harness::new();
        h.offer(7, "cat.html", "p1.html");
        h.provider.reply("cat.html", "ANSWER: {NO}");

        h.sync.pull_pending().await.unwrap();
        let report = h.processor().sweep().await.unwrap();
        assert_eq!(report.ignored, 1);
        assert_eq!(h.status(7), TaskStatus::Ignored);

        h.sync.push_statuses().await.unwrap();
        let pushed = h.endpoint.pushed.lock().unwrap();
        assert_eq!(
            pushed.last().unwrap(),
            &vec![StatusUpdate {
                id: TaskId(7),
                tracking: TaskStatus::Ignored
            }]
        );
    }

    #[tokio::test]
    async fn test_both_markers_commit_verified() {
        let h = Harness::new();
        h.store.insert_if_absent(TaskId(1), "p1.html", "c1.html").unwrap();
        h.provider.reply("p1.html", "{YES} or maybe {NO}");

        h.processor().sweep().await.unwrap();
        assert_eq!(h.status(1), TaskStatus::Verified);
    }

    #[tokio::test]
    async fn test_quota_notice_keeps_task_pending_until_next_sweep() {
        let h = Harness::new();
        h.store.insert_if_absent(TaskId(3), "p3.html", "c3.html").unwrap();
        h.store.insert_if_absent(TaskId(4), "p4.html", "c4.html").unwrap();
        h.store.set_status(TaskId(4), TaskStatus::Verified).unwrap();
        h.provider.reply("p3.html", "{YES}");
        h.provider.quota_notice("p3.html", NOTICE, 1);

        let mut settings = fast_settings();
        settings.default_cooldown = Duration::from_millis(20);
        let mut processor = TaskProcessor::new(
            Arc::new(h.provider.clone()),
            h.store.clone(),
            ComparisonProtocol::new(settings),
        )
        .with_sync(h.sync.clone());

        let report = processor.sweep().await.unwrap();
        assert_eq!(report.rate_limited, 1);
        assert_eq!(h.status(3), TaskStatus::Pending);
        // Session closed, progress pushed, session reopened
        assert_eq!(h.provider.opens(), 2);
        assert_eq!(h.provider.closes(), 2);
        let pushed = h.endpoint.pushed.lock().unwrap().clone();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0][0].id, TaskId(4));
        assert!(!processor.backoff().is_active());

        let report = processor.sweep().await.unwrap();
        assert_eq!(report.verified, 1);
        assert_eq!(h.status(3), TaskStatus::Verified);
    }

    #[tokio::test]
    async fn test_session_loss_restarts_and_continues() {
        let h = Harness::new();
        h.store.insert_if_absent(TaskId(1), "a.html", "ca.html").unwrap();
        h.store.insert_if_absent(TaskId(2), "b.html", "cb.html").unwrap();
        h.provider.lose_session_on("a.html");
        h.provider.reply("b.html", "{YES}");

        let report = h.processor().sweep().await.unwrap();
        assert_eq!(report.session_restarts, 1);
        assert!(!report.ended_early);
        assert_eq!(h.provider.opens(), 2);

        let failed = h.store.get(TaskId(1)).unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Pending);
        assert!(failed.last_error.is_some());
        assert_eq!(h.status(2), TaskStatus::Verified);
    }

    #[tokio::test]
    async fn test_failed_restart_ends_sweep() {
        let h = Harness::new();
        for (id, url) in [(1, "a.html"), (2, "b.html"), (3, "c.html")] {
            h.store.insert_if_absent(TaskId(id), url, "client.html").unwrap();
        }
        h.provider.lose_session_on("a.html");
        h.provider.reply("b.html", "{YES}");
        h.provider.reply("c.html", "{NO}");

        let temp = TempDir::new().unwrap();
        let audit = AuditLogger::new(Paths::with_base(temp.path().to_path_buf()));
        let mut processor = FailingRestart::wrap(&h, audit.clone());
        let report = processor.sweep().await.unwrap();

        assert!(report.ended_early);
        assert_eq!(report.attempted, 1);
        for id in 1..=3 {
            assert_eq!(h.status(id), TaskStatus::Pending);
        }
        let events = audit.read_today().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, AuditEvent::SessionRestarted { succeeded: false, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, AuditEvent::TaskFailed { session_lost: true, .. })));
    }

    /// Provider that opens once and then refuses.
    struct FailingRestart;

    impl FailingRestart {
        fn wrap(h: &Harness, audit: AuditLogger) -> TaskProcessor {
            TaskProcessor::new(
                Arc::new(OpenOnce {
                    inner: h.provider.clone(),
                    opened: Mutex::new(false),
                }),
                h.store.clone(),
                ComparisonProtocol::new(fast_settings()),
            )
            .with_restart_delay(Duration::ZERO)
            .with_audit(audit)
        }
    }

    struct OpenOnce {
        inner: ScriptedProvider,
        opened: Mutex<bool>,
    }

    #[async_trait]
    impl SessionProvider for OpenOnce {
        async fn open(&self) -> Result<Box<dyn SessionHandle>> {
            {
                let mut opened = self.opened.lock().unwrap();
                if *opened {
                    return Err(Error::Browser("browser failed to launch".into()));
                }
                *opened = true;
            }
            self.inner.open().await
        }
    }

    #[tokio::test]
    async fn test_missing_input_skips_task_only() {
        let h = Harness::new();
        h.store.insert_if_absent(TaskId(1), "a.html", "ca.html").unwrap();
        h.store.insert_if_absent(TaskId(2), "b.html", "cb.html").unwrap();
        h.provider.fail_input(2);
        h.provider.reply("b.html", "{NO}");

        let report = h.processor().sweep().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.session_restarts, 0);

        let skipped = h.store.get(TaskId(1)).unwrap().unwrap();
        assert_eq!(skipped.status, TaskStatus::Pending);
        assert_eq!(skipped.attempts, 1);
        assert!(skipped.last_error.unwrap().contains("UI element not found"));
        assert_eq!(h.status(2), TaskStatus::Ignored);
    }

    #[tokio::test]
    async fn test_unresolved_is_final_under_one_shot() {
        let h = Harness::new();
        h.store.insert_if_absent(TaskId(5), "p5.html", "c5.html").unwrap();
        h.provider.reply("p5.html", "no idea");

        let mut processor = h.processor();
        let report = processor.sweep().await.unwrap();
        assert_eq!(report.unresolved, 1);
        assert_eq!(h.status(5), TaskStatus::Unresolved);

        let report = processor.sweep().await.unwrap();
        assert_eq!(report.candidates, 0);
        assert_eq!(h.provider.opens(), 1);

        let mut retrying = h.processor().with_policy(ReprocessPolicy::RetryUnresolved);
        assert_eq!(retrying.sweep().await.unwrap().candidates, 1);
    }

    #[tokio::test]
    async fn test_empty_queue_opens_no_session() {
        let h = Harness::new();
        let report = h.processor().sweep().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(h.provider.opens(), 0);
    }

    #[tokio::test]
    async fn test_open_failure_is_sweep_error() {
        let h = Harness::new();
        h.store.insert_if_absent(TaskId(1), "a.html", "ca.html").unwrap();
        h.provider.fail_opens(1);
        assert!(h.processor().sweep().await.is_err());
        assert_eq!(h.status(1), TaskStatus::Pending);
    }
}
