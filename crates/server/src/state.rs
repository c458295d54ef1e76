use std::sync::Arc;

use library::{JobSender, LibraryError, Orchestrator, ScanJob};
use notify::RecommendedWatcher;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::IndexerConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<IndexerConfig>>,
    pub orchestrator: Arc<Orchestrator>,
    pub scans: JobSender<ScanJob>,
    pub watchers: Arc<Mutex<Vec<RecommendedWatcher>>>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn request_scan(&self, mut job: ScanJob) -> Result<(), LibraryError> {
        if job.request_id.is_none() {
            job.request_id = Some(common::new_id());
        }
        debug!(
            "Queued {:?} scan of {} (incremental={})",
            job.trigger, job.library_id, job.incremental
        );
        self.scans.send(job)
    }
}
