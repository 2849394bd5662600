pub mod login;
pub mod logs_cmd;
pub mod onboard;
pub mod queue_cmd;
pub mod run;
pub mod status;
pub mod sync_cmd;

use aimatch_core::{Config, Paths};
use aimatch_storage::QueueStore;
use aimatch_sync::{HttpSyncEndpoint, RemoteSync};
use std::sync::Arc;

/// Open the queue database named by the config (or the default location).
pub fn open_store(config: &Config, paths: &Paths) -> anyhow::Result<QueueStore> {
    let db_path = config.queue_db_path(paths);
    Ok(QueueStore::open(&db_path)?)
}

/// Sync client for the configured server.
pub fn build_sync(config: &Config, store: QueueStore) -> RemoteSync {
    let endpoint = HttpSyncEndpoint::from_config(&config.sync);
    RemoteSync::new(Arc::new(endpoint), store)
}
