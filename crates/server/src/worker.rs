use std::sync::Arc;

use library::{
    EmbeddingJob, JobReceiver, LibraryError, Orchestrator, ScanJob, ScanMode, ScanReport,
    ScanRequest, ScanState, Store,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::AppState;

const PROGRESS_EVERY: usize = 250;

/// Runs queued scans one at a time until the queue closes or shutdown.
pub async fn run_scan_worker(state: AppState, mut jobs: JobReceiver<ScanJob>) {
    loop {
        let job = tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = state.shutdown.cancelled() => break,
        };
        run_scan_job(&state, job).await;
    }
    info!("Scan worker stopped");
}

async fn run_scan_job(state: &AppState, job: ScanJob) {
    let orchestrator = Arc::clone(&state.orchestrator);
    let cancel = state.shutdown.child_token();
    let label = job
        .request_id
        .clone()
        .unwrap_or_else(|| job.library_id.clone());
    info!(
        "Scan {} of {} started ({:?}, incremental={})",
        label, job.library_id, job.trigger, job.incremental
    );
    let result =
        tokio::task::spawn_blocking(move || scan_blocking(&orchestrator, &job, cancel)).await;
    match result {
        Ok(Ok(report)) if report.state == ScanState::Cancelled => {
            info!("Scan {} cancelled before commit", label);
        }
        Ok(Ok(report)) => {
            info!(
                "Scan {} finished: {} tracks, {} inserted, {} updated, {} skipped in {} ms",
                label,
                report.tracks_indexed,
                report.flush.entities_inserted(),
                report.flush.entities_updated(),
                report.files_skipped,
                report.elapsed_ms
            );
        }
        Ok(Err(err)) => warn!("Scan {} failed: {}", label, err),
        Err(err) => warn!("Scan {} join error: {}", label, err),
    }
}

fn scan_blocking(
    orchestrator: &Orchestrator,
    job: &ScanJob,
    cancel: CancellationToken,
) -> Result<ScanReport, LibraryError> {
    let mode = if job.incremental {
        ScanMode::Incremental
    } else {
        ScanMode::Full
    };
    let total = orchestrator.count_files(&job.library_id, mode)?;
    let request = ScanRequest {
        mode,
        directory: job.directory.clone(),
    };
    let mut stream = orchestrator.stream(&job.library_id, request, cancel)?;
    let root = stream.library().path.clone();
    let mut indexed = 0usize;
    for track in stream.by_ref() {
        track?;
        indexed += 1;
        if indexed % PROGRESS_EVERY == 0 {
            info!("{}: indexed {} of about {} files", root, indexed, total);
        }
    }
    stream.finalize()
}

/// Stores embeddings handed over with their job. Jobs without a vector wait
/// for an extractor; none ships with the daemon.
pub async fn run_embedding_worker(
    store: Store,
    mut jobs: JobReceiver<EmbeddingJob>,
    shutdown: CancellationToken,
) {
    let mut stored = 0usize;
    let mut deferred = 0usize;
    loop {
        let job = tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        let EmbeddingJob {
            track_id,
            embedding,
        } = job;
        let vector = match embedding {
            Some(vector) => vector,
            None => {
                deferred += 1;
                debug!("No embedding extractor for track {}", track_id);
                continue;
            }
        };
        let store = store.clone();
        let id = track_id.clone();
        match tokio::task::spawn_blocking(move || store.put_embedding(&id, &vector)).await {
            Ok(Ok(())) => stored += 1,
            Ok(Err(err)) => warn!("Failed to store embedding for {}: {}", track_id, err),
            Err(err) => warn!("Embedding join error for {}: {}", track_id, err),
        }
    }
    info!(
        "Embedding worker stopped: {} stored, {} deferred",
        stored, deferred
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use library::{job_queue, IndexOptions, ScanTrigger, Services};
    use metadata::LoftyReader;
    use notify::RecommendedWatcher;
    use parking_lot::{Mutex, RwLock};
    use std::time::Duration;

    use crate::config::IndexerConfig;

    #[tokio::test]
    async fn embedding_worker_stores_precomputed_vectors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("catalog.redb")).expect("store");
        let (tx, rx) = job_queue();
        tx.send(EmbeddingJob {
            track_id: "t1".to_string(),
            embedding: Some(vec![0.5, 1.5]),
        })
        .expect("send");
        tx.send(EmbeddingJob {
            track_id: "t2".to_string(),
            embedding: None,
        })
        .expect("send");
        drop(tx);

        run_embedding_worker(store.clone(), rx, CancellationToken::new()).await;
        assert_eq!(store.embedding("t1").expect("read"), Some(vec![0.5, 1.5]));
        assert_eq!(store.embedding("t2").expect("read"), None);
    }

    #[tokio::test]
    async fn scan_worker_runs_queued_jobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let music = dir.path().join("music");
        std::fs::create_dir_all(&music).expect("music");
        let store = Store::open(&dir.path().join("catalog.redb")).expect("store");
        let library = store.ensure_library(&music, false).expect("library");
        let orchestrator = Orchestrator::new(
            store.clone(),
            Services::new(Arc::new(LoftyReader)),
            IndexOptions::new(1, Duration::ZERO),
        );
        let (tx, rx) = job_queue();
        let (idle_tx, _idle_rx) = job_queue();
        let state = AppState {
            config: Arc::new(RwLock::new(IndexerConfig::default())),
            orchestrator: Arc::new(orchestrator),
            scans: idle_tx,
            watchers: Arc::new(Mutex::new(Vec::<RecommendedWatcher>::new())),
            shutdown: CancellationToken::new(),
        };
        tx.send(ScanJob::full(&library.id, ScanTrigger::Manual))
            .expect("queue");
        drop(tx);
        let worker = tokio::spawn(run_scan_worker(state, rx));

        tokio::time::timeout(Duration::from_secs(10), worker)
            .await
            .expect("worker finished")
            .expect("join");
        let library = store.library(&library.id).expect("library");
        assert!(library.last_scan.is_some());
    }
}
