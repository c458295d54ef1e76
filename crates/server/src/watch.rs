use std::path::PathBuf;
use std::time::Duration;

use common::{is_audio_file, MusicLibrary};
use library::{ScanJob, ScanTrigger};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use crate::state::AppState;

pub fn configure_watcher(state: &AppState, library: &MusicLibrary, root: PathBuf) {
    let debounce = state.config.read().watch_debounce();
    match setup_watcher(state.clone(), library.clone(), root.clone(), debounce) {
        Ok(watcher) => {
            info!(
                "Watching {} for changes (debounce {}s)",
                root.display(),
                debounce.as_secs()
            );
            state.watchers.lock().push(watcher);
        }
        Err(err) => warn!("Failed to watch {}: {}", root.display(), err),
    }
}

fn setup_watcher(
    state: AppState,
    library: MusicLibrary,
    root: PathBuf,
    debounce: Duration,
) -> Result<RecommendedWatcher, Box<dyn std::error::Error>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        NotifyConfig::default(),
    )?;

    watcher.watch(&root, RecursiveMode::Recursive)?;

    tokio::spawn(async move {
        watch_loop(state, library, rx, debounce).await;
    });

    Ok(watcher)
}

/// File moves and deletions seen during one debounce window.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub renamed: Vec<(PathBuf, PathBuf)>,
    pub removed: Vec<PathBuf>,
    pub touched: bool,
}

impl ChangeSet {
    pub fn record(&mut self, event: &Event) {
        match &event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                let (from, to) = (&event.paths[0], &event.paths[1]);
                if is_audio_file(from) && is_audio_file(to) {
                    self.renamed.push((from.clone(), to.clone()));
                }
                self.touched = true;
            }
            EventKind::Remove(_) => {
                self.removed
                    .extend(event.paths.iter().filter(|path| is_audio_file(path)).cloned());
                self.touched = true;
            }
            EventKind::Create(_) | EventKind::Modify(_) => self.touched = true,
            _ => {}
        }
    }
}

async fn watch_loop(
    state: AppState,
    library: MusicLibrary,
    mut rx: UnboundedReceiver<Event>,
    debounce: Duration,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = state.shutdown.cancelled() => break,
        };
        let mut changes = ChangeSet::default();
        changes.record(&event);
        if !changes.touched {
            continue;
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => {
                    apply_changes(&state, &library, changes).await;
                    break;
                }
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => changes.record(&event),
                        None => return,
                    }
                }
            }
        }
    }
}

async fn apply_changes(state: &AppState, library: &MusicLibrary, changes: ChangeSet) {
    let orchestrator = state.orchestrator.clone();
    let library_id = library.id.clone();
    let renamed = changes.renamed;
    let removed = changes.removed;
    let result = tokio::task::spawn_blocking(move || {
        let mut applied = 0usize;
        for (from, to) in &renamed {
            if orchestrator.rename_file(&library_id, from, to)? {
                applied += 1;
            }
        }
        for path in &removed {
            if orchestrator.remove_file(&library_id, path)? {
                applied += 1;
            }
        }
        Ok::<usize, library::LibraryError>(applied)
    })
    .await;
    match result {
        Ok(Ok(applied)) if applied > 0 => info!("Applied {} file moves and removals", applied),
        Ok(Ok(_)) => {}
        Ok(Err(err)) => warn!("Applying file changes failed: {}", err),
        Err(err) => warn!("File change join error: {}", err),
    }

    let incremental = state.config.read().incremental_watch_scans;
    let job = if incremental {
        ScanJob::incremental(&library.id, None, ScanTrigger::FileSystemEvent)
    } else {
        ScanJob::full(&library.id, ScanTrigger::FileSystemEvent)
    };
    if let Err(err) = state.request_scan(job) {
        warn!("Auto-rescan of {} not queued: {}", library.path, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn collects_audio_moves_and_removals() {
        let mut changes = ChangeSet::default();
        changes.record(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/m/a/1.flac", "/m/a/01.flac"],
        ));
        changes.record(&event(EventKind::Remove(RemoveKind::File), &["/m/a/2.mp3", "/m/a/cover.jpg"]));
        assert_eq!(
            changes.renamed,
            vec![(PathBuf::from("/m/a/1.flac"), PathBuf::from("/m/a/01.flac"))]
        );
        assert_eq!(changes.removed, vec![PathBuf::from("/m/a/2.mp3")]);
        assert!(changes.touched);
    }

    #[test]
    fn access_events_are_ignored() {
        let mut changes = ChangeSet::default();
        changes.record(&event(EventKind::Access(AccessKind::Any), &["/m/a/1.flac"]));
        assert_eq!(changes, ChangeSet::default());

        changes.record(&event(EventKind::Create(CreateKind::File), &["/m/b/1.flac"]));
        assert!(changes.touched);
        assert!(changes.renamed.is_empty());
    }
}
