use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{Album, Artwork};
use metadata::{LoftyReader, MetadataReader};
use tracing::warn;

use crate::indexer::{AlbumTypePolicy, DefaultAlbumTypes};
use crate::jobs::{EmbeddingJob, JobSender};
use crate::store::TrackDetails;

/// Produces and removes cover images for albums.
pub trait ArtworkService: Send + Sync {
    /// Pulls an embedded picture out of an audio file and stores it somewhere
    /// readable, returning that location.
    fn extract_embedded(&self, audio_path: &Path) -> Result<Option<PathBuf>, String>;

    /// Builds the artwork record for an album from a source image.
    fn process(&self, album: &Album, source: &Path) -> Result<Option<Artwork>, String>;

    fn process_bulk(&self, items: &[(Album, PathBuf)]) -> Result<Vec<Artwork>, String> {
        let mut out = Vec::with_capacity(items.len());
        for (album, source) in items {
            match self.process(album, source) {
                Ok(Some(artwork)) => out.push(artwork),
                Ok(None) => {}
                Err(err) => warn!(
                    "Artwork failed for album {} from {}: {}",
                    album.id,
                    source.display(),
                    err
                ),
            }
        }
        Ok(out)
    }

    fn delete(&self, artwork: &Artwork) -> Result<(), String>;
}

/// Receives searchable text for freshly indexed tracks.
pub trait SearchService: Send + Sync {
    fn insert_tracks(&self, tracks: &[TrackDetails]) -> Result<usize, String>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoArtwork;

impl ArtworkService for NoArtwork {
    fn extract_embedded(&self, _audio_path: &Path) -> Result<Option<PathBuf>, String> {
        Ok(None)
    }

    fn process(&self, _album: &Album, _source: &Path) -> Result<Option<Artwork>, String> {
        Ok(None)
    }

    fn delete(&self, _artwork: &Artwork) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoSearch;

impl SearchService for NoSearch {
    fn insert_tracks(&self, _tracks: &[TrackDetails]) -> Result<usize, String> {
        Ok(0)
    }
}

/// Everything a scan talks to besides the store.
#[derive(Clone)]
pub struct Services {
    pub reader: Arc<dyn MetadataReader>,
    pub artwork: Arc<dyn ArtworkService>,
    pub search: Arc<dyn SearchService>,
    pub album_types: Arc<dyn AlbumTypePolicy>,
    pub embeddings: Option<JobSender<EmbeddingJob>>,
}

impl Services {
    pub fn new(reader: Arc<dyn MetadataReader>) -> Self {
        Services {
            reader,
            artwork: Arc::new(NoArtwork),
            search: Arc::new(NoSearch),
            album_types: Arc::new(DefaultAlbumTypes),
            embeddings: None,
        }
    }

    pub fn with_artwork(mut self, artwork: Arc<dyn ArtworkService>) -> Self {
        self.artwork = artwork;
        self
    }

    pub fn with_search(mut self, search: Arc<dyn SearchService>) -> Self {
        self.search = search;
        self
    }

    pub fn with_album_types(mut self, policy: Arc<dyn AlbumTypePolicy>) -> Self {
        self.album_types = policy;
        self
    }

    pub fn with_embeddings(mut self, sender: JobSender<EmbeddingJob>) -> Self {
        self.embeddings = Some(sender);
        self
    }
}

impl Default for Services {
    fn default() -> Self {
        Services::new(Arc::new(LoftyReader))
    }
}
