use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{now_millis, Album, MusicLibrary, Track};
use metadata::RetryPolicy;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ResolutionCache;
use crate::indexer::ScanSession;
use crate::jobs::EmbeddingJob;
use crate::locks::{ScanGuard, ScanLocks};
use crate::reconcile::{OrphanReconciler, ReconcileStats};
use crate::scanner::{DirectoryGroup, DirectoryScanner, ScanMode};
use crate::services::Services;
use crate::store::Store;
use crate::writer::{BulkWriter, FlushStats};
use crate::LibraryError;

#[derive(Clone, Copy, Debug)]
pub struct IndexOptions {
    pub retry: RetryPolicy,
}

impl IndexOptions {
    pub fn new(read_attempts: u32, read_backoff: Duration) -> Self {
        IndexOptions {
            retry: RetryPolicy {
                attempts: read_attempts,
                step: read_backoff,
            },
        }
    }
}

impl Default for IndexOptions {
    fn default() -> Self {
        IndexOptions {
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Scanning,
    Flushing,
    Enriching,
    Finalized,
    Cancelled,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanRequest {
    pub mode: ScanMode,
    pub directory: Option<PathBuf>,
}

impl ScanRequest {
    pub fn full() -> Self {
        ScanRequest {
            mode: ScanMode::Full,
            directory: None,
        }
    }

    pub fn incremental() -> Self {
        ScanRequest {
            mode: ScanMode::Incremental,
            directory: None,
        }
    }

    pub fn within(mut self, directory: &Path) -> Self {
        self.directory = Some(directory.to_path_buf());
        self
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ScanReport {
    pub library_id: String,
    pub mode: ScanMode,
    pub state: ScanState,
    pub groups_indexed: usize,
    pub tracks_indexed: usize,
    pub files_skipped: usize,
    pub reconcile: ReconcileStats,
    pub flush: FlushStats,
    pub pruned: ReconcileStats,
    pub artworks_created: usize,
    pub search_entries: usize,
    pub embeddings_queued: usize,
    pub elapsed_ms: u64,
}

/// Drives scans: reconcile, walk, index per directory, flush once, enrich,
/// then record the scan time on the library.
#[derive(Clone)]
pub struct Orchestrator {
    store: Store,
    services: Services,
    options: IndexOptions,
    locks: ScanLocks,
}

impl Orchestrator {
    pub fn new(store: Store, services: Services, options: IndexOptions) -> Self {
        Orchestrator {
            store,
            services,
            options,
            locks: ScanLocks::new(),
        }
    }

    /// Shares scan locks with other orchestrators over the same store.
    pub fn with_locks(mut self, locks: ScanLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn scan(&self, library_id: &str, mode: ScanMode) -> Result<ScanReport, LibraryError> {
        self.run(
            library_id,
            ScanRequest {
                mode,
                directory: None,
            },
        )
    }

    pub fn run(&self, library_id: &str, request: ScanRequest) -> Result<ScanReport, LibraryError> {
        self.stream(library_id, request, CancellationToken::new())?
            .finalize()
    }

    /// Starts a scan whose tracks are handed out as each directory is
    /// indexed. Cancellation is checked between directories; a cancelled
    /// scan writes nothing and leaves the last scan time alone.
    pub fn stream(
        &self,
        library_id: &str,
        request: ScanRequest,
        cancel: CancellationToken,
    ) -> Result<ScanStream<'_>, LibraryError> {
        let guard = self.locks.acquire(library_id);
        let started = Instant::now();
        let library = self.store.library(library_id)?;
        let reconcile = {
            let permit = guard.exclusive();
            self.reconciler(permit.is_some()).reconcile(&library)?
        };
        let groups = DirectoryScanner::new(&self.store).scan(
            &library,
            request.mode,
            request.directory.as_deref(),
        )?;
        info!(
            "Scanning {} ({:?}, {} directories)",
            library.path,
            request.mode,
            groups.len()
        );
        let session = ScanSession::new(library, ResolutionCache::new(self.store.clone()));
        Ok(ScanStream {
            orchestrator: self,
            guard,
            session,
            groups: groups.into_iter(),
            ready: VecDeque::new(),
            cancel,
            state: ScanState::Scanning,
            mode: request.mode,
            reconcile,
            started,
        })
    }

    pub fn count_files(&self, library_id: &str, mode: ScanMode) -> Result<usize, LibraryError> {
        let library = self.store.library(library_id)?;
        DirectoryScanner::new(&self.store).count_files(&library, mode)
    }

    pub fn remove_file(&self, library_id: &str, path: &Path) -> Result<bool, LibraryError> {
        let guard = self.locks.acquire(library_id);
        let library = self.store.library(library_id)?;
        let permit = guard.exclusive();
        self.reconciler(permit.is_some()).delete_file(&library, path)
    }

    pub fn rename_file(
        &self,
        library_id: &str,
        old_path: &Path,
        new_path: &Path,
    ) -> Result<bool, LibraryError> {
        let _guard = self.locks.acquire(library_id);
        let library = self.store.library(library_id)?;
        self.reconciler(false).rename_file(&library, old_path, new_path)
    }

    fn reconciler(&self, prune: bool) -> OrphanReconciler<'_> {
        OrphanReconciler::new(&self.store, self.services.artwork.as_ref()).pruning(prune)
    }
}

/// An in-progress scan. Iterating yields indexed tracks directory by
/// directory; [`ScanStream::finalize`] indexes whatever is left and commits.
pub struct ScanStream<'a> {
    orchestrator: &'a Orchestrator,
    guard: ScanGuard,
    session: ScanSession,
    groups: std::vec::IntoIter<DirectoryGroup>,
    ready: VecDeque<Arc<Track>>,
    cancel: CancellationToken,
    state: ScanState,
    mode: ScanMode,
    reconcile: ReconcileStats,
    started: Instant,
}

impl<'a> Iterator for ScanStream<'a> {
    type Item = Result<Arc<Track>, LibraryError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(track) = self.ready.pop_front() {
                return Some(Ok(track));
            }
            if self.state != ScanState::Scanning {
                return None;
            }
            if self.cancel.is_cancelled() {
                self.cancel_scan();
                return None;
            }
            let group = self.groups.next()?;
            let orchestrator = self.orchestrator;
            match self
                .session
                .index_group(&orchestrator.services, orchestrator.options.retry, &group)
            {
                Ok(tracks) => self.ready.extend(tracks),
                Err(err) => {
                    error!("Indexing {} failed: {}", group.directory.display(), err);
                    self.state = ScanState::Failed;
                    return Some(Err(err));
                }
            }
        }
    }
}

impl<'a> ScanStream<'a> {
    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn library(&self) -> &MusicLibrary {
        &self.session.library
    }

    /// Entities indexed but not yet written.
    pub fn pending_entities(&self) -> usize {
        self.session.cache.batch().entity_count()
    }

    fn cancel_scan(&mut self) {
        self.state = ScanState::Cancelled;
        info!(
            "Scan of {} cancelled; discarded {} pending entities",
            self.session.library.path,
            self.pending_entities()
        );
        self.ready.clear();
        self.session.cache.batch_mut().clear();
    }

    /// Indexes any remaining directories, flushes, runs enrichment and
    /// records the scan time. A stream whose iteration already failed
    /// reports [`ScanState::Failed`] without writing.
    pub fn finalize(mut self) -> Result<ScanReport, LibraryError> {
        while self.state == ScanState::Scanning {
            match self.next() {
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err),
                None => break,
            }
        }
        let mut report = self.report();
        if self.state != ScanState::Scanning {
            return Ok(report);
        }

        self.state = ScanState::Flushing;
        let orchestrator = self.orchestrator;
        let store = &orchestrator.store;
        report.flush = match BulkWriter::new(store).flush(self.session.cache.batch_mut()) {
            Ok(stats) => stats,
            Err(err) => {
                self.state = ScanState::Failed;
                error!(
                    "Flush failed for {}; last scan time not advanced: {}",
                    self.session.library.path, err
                );
                return Err(err);
            }
        };

        self.state = ScanState::Enriching;
        self.enrich(&mut report);

        let mut library = self.session.library.clone();
        library.last_scan = Some(now_millis());
        store.put(&library)?;
        self.session.library = library;
        self.state = ScanState::Finalized;

        report.state = self.state;
        report.elapsed_ms = self.started.elapsed().as_millis() as u64;
        info!(
            "Scan of {} finished in {} ms: {} directories, {} tracks, {} files skipped",
            self.session.library.path,
            report.elapsed_ms,
            report.groups_indexed,
            report.tracks_indexed,
            report.files_skipped
        );
        Ok(report)
    }

    fn report(&self) -> ScanReport {
        ScanReport {
            library_id: self.session.library.id.clone(),
            mode: self.mode,
            state: self.state,
            groups_indexed: self.session.groups_indexed,
            tracks_indexed: self.session.indexed_tracks().len(),
            files_skipped: self.session.files_skipped,
            reconcile: self.reconcile.clone(),
            flush: FlushStats::default(),
            pruned: ReconcileStats::default(),
            artworks_created: 0,
            search_entries: 0,
            embeddings_queued: 0,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    /// Post-flush work against freshly re-read rows. Failures are logged;
    /// the indexed entities are already committed.
    fn enrich(&self, report: &mut ScanReport) {
        let orchestrator = self.orchestrator;
        let store = &orchestrator.store;
        let services = &orchestrator.services;

        let sources: HashMap<&str, &PathBuf> = self
            .session
            .artwork_sources()
            .iter()
            .map(|(album_id, source)| (album_id.as_str(), source))
            .collect();
        if !sources.is_empty() {
            let ids: Vec<String> = self
                .session
                .artwork_sources()
                .iter()
                .map(|(album_id, _)| album_id.clone())
                .collect();
            match store.get_many::<Album>(&ids) {
                Ok(albums) => {
                    let items: Vec<(Album, PathBuf)> = albums
                        .into_iter()
                        .filter_map(|album| {
                            let source = sources.get(album.id.as_str())?;
                            Some((album, source.to_path_buf()))
                        })
                        .collect();
                    match services.artwork.process_bulk(&items) {
                        Ok(artworks) => {
                            for artwork in artworks {
                                match store.put(&artwork) {
                                    Ok(()) => report.artworks_created += 1,
                                    Err(err) => warn!(
                                        "Failed to store artwork for album {}: {}",
                                        artwork.album_id, err
                                    ),
                                }
                            }
                        }
                        Err(err) => warn!("Artwork processing failed: {}", err),
                    }
                }
                Err(err) => warn!("Failed to re-read albums for artwork: {}", err),
            }
        }

        let track_ids: Vec<String> = self
            .session
            .indexed_tracks()
            .iter()
            .map(|track| track.id.clone())
            .collect();
        if !track_ids.is_empty() {
            match store.track_details(&track_ids) {
                Ok(details) => match services.search.insert_tracks(&details) {
                    Ok(count) => report.search_entries = count,
                    Err(err) => warn!("Search indexing failed: {}", err),
                },
                Err(err) => warn!("Failed to re-read tracks for search: {}", err),
            }
            if let Some(sender) = &services.embeddings {
                for track_id in &track_ids {
                    let job = EmbeddingJob {
                        track_id: track_id.clone(),
                        embedding: None,
                    };
                    if let Err(err) = sender.send(job) {
                        warn!("Embedding queue unavailable: {}", err);
                        break;
                    }
                    report.embeddings_queued += 1;
                }
            }
        }

        match self.guard.exclusive() {
            Some(_permit) => match orchestrator.reconciler(true).prune_empty() {
                Ok(stats) => report.pruned = stats,
                Err(err) => warn!("Pruning after scan failed: {}", err),
            },
            None => debug!(
                "Other scans are open; pruning after {} deferred",
                self.guard.library_id()
            ),
        }
    }
}
