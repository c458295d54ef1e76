use std::fs;
use std::path::Path;

use common::{path_string, system_time_millis, AudioFile, MusicLibrary};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::records::AudioFileKey;
use crate::services::ArtworkService;
use crate::store::Store;
use crate::LibraryError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub missing_files: usize,
    pub tracks_deleted: usize,
    pub artist_roles_deleted: usize,
    pub artists_deleted: usize,
    pub albums_deleted: usize,
    pub artworks_deleted: usize,
    pub audio_files_deleted: usize,
}

impl ReconcileStats {
    pub fn merge(&mut self, other: &ReconcileStats) {
        self.missing_files += other.missing_files;
        self.tracks_deleted += other.tracks_deleted;
        self.artist_roles_deleted += other.artist_roles_deleted;
        self.artists_deleted += other.artists_deleted;
        self.albums_deleted += other.albums_deleted;
        self.artworks_deleted += other.artworks_deleted;
        self.audio_files_deleted += other.audio_files_deleted;
    }

    pub fn is_empty(&self) -> bool {
        *self == ReconcileStats::default()
    }
}

/// Removes catalog rows whose backing files are gone. Every step commits on
/// its own so later steps observe the earlier deletions.
pub struct OrphanReconciler<'a> {
    store: &'a Store,
    artwork: &'a dyn ArtworkService,
    prune: bool,
}

impl<'a> OrphanReconciler<'a> {
    pub fn new(store: &'a Store, artwork: &'a dyn ArtworkService) -> Self {
        OrphanReconciler {
            store,
            artwork,
            prune: true,
        }
    }

    /// With `false`, file removals leave empty albums, roles and artists in
    /// place for a later [`OrphanReconciler::prune_empty`].
    pub fn pruning(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    fn prune_after_delete(&self, library: &MusicLibrary) -> Result<ReconcileStats, LibraryError> {
        if self.prune {
            return self.prune_empty();
        }
        debug!("Other scans are open; leaving empty entities from {} for later", library.path);
        Ok(ReconcileStats::default())
    }

    pub fn reconcile(&self, library: &MusicLibrary) -> Result<ReconcileStats, LibraryError> {
        let mut stats = ReconcileStats::default();
        let missing: Vec<AudioFile> = self
            .store
            .audio_files_in_library(&library.id)?
            .into_iter()
            .filter(|file| !Path::new(&file.path).exists())
            .collect();
        stats.missing_files = missing.len();
        if missing.is_empty() {
            debug!("No missing files in {}", library.path);
            return Ok(stats);
        }

        let file_ids: Vec<String> = missing.into_iter().map(|file| file.id).collect();
        stats.tracks_deleted = self.store.delete_tracks_for_files(&file_ids)?;
        stats.merge(&self.prune_after_delete(library)?);
        stats.audio_files_deleted = self.store.delete_audio_files(&file_ids)?;
        info!(
            "Reconciled {}: {} missing files, {} tracks, {} roles, {} artists, {} albums removed",
            library.path,
            stats.missing_files,
            stats.tracks_deleted,
            stats.artist_roles_deleted,
            stats.artists_deleted,
            stats.albums_deleted
        );
        Ok(stats)
    }

    /// Deletes roles without tracks, artists without roles, and albums
    /// without tracks along with their artwork.
    pub fn prune_empty(&self) -> Result<ReconcileStats, LibraryError> {
        let mut stats = ReconcileStats {
            artist_roles_deleted: self.store.delete_unreferenced_roles()?,
            ..ReconcileStats::default()
        };
        stats.artists_deleted = self.store.delete_unreferenced_artists()?;

        let albums = self.store.empty_albums()?;
        if !albums.is_empty() {
            for album in &albums {
                if let Some(artwork) = self.store.artwork_for_album(&album.id)? {
                    if let Err(err) = self.artwork.delete(&artwork) {
                        warn!("Failed to delete artwork for album {}: {}", album.id, err);
                    }
                }
            }
            let ids: Vec<String> = albums.into_iter().map(|album| album.id).collect();
            let (albums_deleted, artworks_deleted) = self.store.delete_albums(&ids)?;
            stats.albums_deleted = albums_deleted;
            stats.artworks_deleted = artworks_deleted;
        }
        if !stats.is_empty() {
            debug!(
                "Pruned {} roles, {} artists, {} albums",
                stats.artist_roles_deleted, stats.artists_deleted, stats.albums_deleted
            );
        }
        Ok(stats)
    }

    /// Drops the track indexed from `path`, then prunes what it leaves empty.
    pub fn delete_file(&self, library: &MusicLibrary, path: &Path) -> Result<bool, LibraryError> {
        let key = AudioFileKey {
            library_id: library.id.clone(),
            path: path_string(path),
        };
        let file = match self.store.find::<AudioFile>(&key)? {
            Some(file) => file,
            None => return Ok(false),
        };
        let ids = vec![file.id];
        self.store.delete_tracks_for_files(&ids)?;
        self.prune_after_delete(library)?;
        self.store.delete_audio_files(&ids)?;
        info!("Removed {} from {}", path.display(), library.path);
        Ok(true)
    }

    /// Points the audio file at `new_path`, keeping its track.
    pub fn rename_file(
        &self,
        library: &MusicLibrary,
        old_path: &Path,
        new_path: &Path,
    ) -> Result<bool, LibraryError> {
        let modified = fs::metadata(new_path)
            .and_then(|meta| meta.modified())
            .ok()
            .map(system_time_millis);
        let renamed = self.store.rename_audio_file(
            &library.id,
            &path_string(old_path),
            &path_string(new_path),
            modified,
        )?;
        if renamed.is_some() {
            info!("Moved {} to {}", old_path.display(), new_path.display());
        }
        Ok(renamed.is_some())
    }
}
