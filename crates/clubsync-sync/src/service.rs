use std::sync::Arc;

use clubsync_storage::ImportStore;
use clubsync_upstream::ClubApi;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::triggers::{AutoImportScheduler, StaleEventRefresher};
use crate::worker::ImportWorker;
use crate::SyncConfig;

/// Owns the background loops: the import worker and, when enabled, the
/// auto-import and staleness triggers. Each loop watches a child of one
/// shared cancellation token.
pub struct Supervisor {
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn start(store: Arc<dyn ImportStore>, api: Arc<dyn ClubApi>, config: &SyncConfig) -> Self {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let worker = ImportWorker::new(store.clone(), api.clone(), config);
        let token = cancel.child_token();
        tasks.push(("import_worker", tokio::spawn(async move { worker.run(token).await })));

        if config.triggers_enabled {
            let scheduler = AutoImportScheduler::new(store.clone(), api.clone(), config);
            let token = cancel.child_token();
            tasks.push(("auto_import", tokio::spawn(async move { scheduler.run(token).await })));

            let refresher = StaleEventRefresher::new(store, api, config);
            let token = cancel.child_token();
            tasks.push(("stale_refresh", tokio::spawn(async move { refresher.run(token).await })));
        }

        info!(tasks = tasks.len(), "supervisor started");
        Self { cancel, tasks }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every loop and wait for them to wind down.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, handle) in self.tasks {
            if let Err(err) = handle.await {
                error!(task = name, error = %err, "background task did not stop cleanly");
            }
        }
        info!("supervisor stopped");
    }
}
