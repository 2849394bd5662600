use crate::endpoint::{StatusUpdate, SyncEndpoint};
use aimatch_core::{Result, Task};
use aimatch_storage::{AuditLogger, QueueStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sync-In / Sync-Out between the server and the local queue.
#[derive(Clone)]
pub struct RemoteSync {
    endpoint: Arc<dyn SyncEndpoint>,
    store: QueueStore,
    audit: Option<AuditLogger>,
}

impl RemoteSync {
    pub fn new(endpoint: Arc<dyn SyncEndpoint>, store: QueueStore) -> Self {
        Self {
            endpoint,
            store,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Insert every server task not already queued as `PENDING`. Known ids are
    /// left untouched. Returns the newly queued tasks.
    pub async fn pull_pending(&self) -> Result<Vec<Task>> {
        let result = self.pull_inner().await;
        self.record("pull", result.as_ref().map(|t| t.len()));
        result
    }

    async fn pull_inner(&self) -> Result<Vec<Task>> {
        let remote = self.endpoint.fetch_tasks().await?;
        let offered = remote.len();
        let mut added = Vec::new();

        for task in remote {
            if self
                .store
                .insert_if_absent(task.id, &task.url, &task.client_url)?
            {
                info!(task_id = %task.id, "Adding task to the queue");
                added.push(Task::new(task.id, task.url, task.client_url));
            } else {
                debug!(task_id = %task.id, "Task already queued, skipping");
            }
        }

        info!(offered, added = added.len(), "Sync-In complete");
        Ok(added)
    }

    /// Report every non-`PENDING` task. An empty report still goes out.
    /// Returns the number of statuses pushed.
    pub async fn push_statuses(&self) -> Result<usize> {
        let result = self.push_inner().await;
        self.record("push", result.as_ref().map(|n| *n));
        result
    }

    async fn push_inner(&self) -> Result<usize> {
        let updates: Vec<StatusUpdate> = self
            .store
            .resolved()?
            .into_iter()
            .map(|t| StatusUpdate {
                id: t.id,
                tracking: t.status,
            })
            .collect();

        self.endpoint.post_statuses(&updates).await?;
        info!(count = updates.len(), "Sync-Out complete");
        Ok(updates.len())
    }

    fn record(&self, direction: &str, outcome: std::result::Result<usize, &aimatch_core::Error>) {
        let Some(audit) = &self.audit else {
            return;
        };
        let logged = match outcome {
            Ok(count) => audit.log_sync(direction, count, None),
            Err(e) => audit.log_sync(direction, 0, Some(e.to_string())),
        };
        if let Err(e) = logged {
            warn!(error = %e, "Failed to write sync audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::RemoteTask;
    use aimatch_core::{Error, Paths, TaskId, TaskStatus};
    use aimatch_storage::AuditEvent;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeEndpoint {
        tasks: Mutex<Vec<RemoteTask>>,
        pushed: Mutex<Vec<Vec<StatusUpdate>>>,
        fail: Mutex<bool>,
    }

    impl FakeEndpoint {
        fn offer(&self, id: i64, url: &str, client_url: &str) {
            self.tasks.lock().unwrap().push(RemoteTask {
                id: TaskId(id),
                url: url.to_string(),
                client_url: client_url.to_string(),
            });
        }
    }

    #[async_trait]
    impl SyncEndpoint for FakeEndpoint {
        async fn fetch_tasks(&self) -> Result<Vec<RemoteTask>> {
            if *self.fail.lock().unwrap() {
                return Err(Error::Sync("503".into()));
            }
            Ok(self.tasks.lock().unwrap().clone())
        }

        async fn post_statuses(&self, updates: &[StatusUpdate]) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(Error::Sync("503".into()));
            }
            self.pushed.lock().unwrap().push(updates.to_vec());
            Ok(())
        }
    }

    fn setup() -> (Arc<FakeEndpoint>, QueueStore, RemoteSync) {
        let endpoint = Arc::new(FakeEndpoint::default());
        let store = QueueStore::open_in_memory().unwrap();
        let sync = RemoteSync::new(endpoint.clone(), store.clone());
        (endpoint, store, sync)
    }

    #[tokio::test]
    async fn test_pull_is_idempotent() {
        let (endpoint, store, sync) = setup();
        endpoint.offer(7, "cat.html", "p1.html");

        let added = sync.pull_pending().await.unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].status, TaskStatus::Pending);

        store.set_status(TaskId(7), TaskStatus::Ignored).unwrap();
        endpoint.tasks.lock().unwrap()[0].url = "changed.html".to_string();

        assert!(sync.pull_pending().await.unwrap().is_empty());
        let task = store.get(TaskId(7)).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Ignored);
        assert_eq!(task.competitor_url, "cat.html");
    }

    #[tokio::test]
    async fn test_push_reports_only_resolved() {
        let (endpoint, store, sync) = setup();
        endpoint.offer(7, "cat.html", "p1.html");
        endpoint.offer(8, "p2.html", "p2.html");
        sync.pull_pending().await.unwrap();
        store.set_status(TaskId(7), TaskStatus::Ignored).unwrap();

        assert_eq!(sync.push_statuses().await.unwrap(), 1);
        let pushed = endpoint.pushed.lock().unwrap();
        assert_eq!(
            pushed[0],
            vec![StatusUpdate {
                id: TaskId(7),
                tracking: TaskStatus::Ignored
            }]
        );
    }

    #[tokio::test]
    async fn test_empty_push_succeeds() {
        let (endpoint, _store, sync) = setup();
        assert_eq!(sync.push_statuses().await.unwrap(), 0);
        assert_eq!(endpoint.pushed.lock().unwrap().len(), 1);
        assert!(endpoint.pushed.lock().unwrap()[0].is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_sync_errors_and_audited() {
        let temp_dir = TempDir::new().unwrap();
        let audit = AuditLogger::new(Paths::with_base(temp_dir.path().to_path_buf()));
        let (endpoint, store, sync) = setup();
        let sync = sync.with_audit(audit.clone());
        endpoint.offer(7, "cat.html", "p1.html");
        *endpoint.fail.lock().unwrap() = true;

        assert!(matches!(sync.pull_pending().await, Err(Error::Sync(_))));
        assert!(matches!(sync.push_statuses().await, Err(Error::Sync(_))));
        assert!(store.get(TaskId(7)).unwrap().is_none());

        let events = audit.read_today().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            AuditEvent::SyncCompleted { error: Some(_), .. }
        ));
    }
}
