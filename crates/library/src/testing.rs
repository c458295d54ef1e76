use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::{new_id, Album, Artwork, ArtworkPath, ArtworkSize, MusicLibrary};
use metadata::{AudioTags, MetadataError, MetadataReader, RetryPolicy};
use parking_lot::Mutex;

use crate::orchestrator::{IndexOptions, Orchestrator};
use crate::services::{ArtworkService, Services};
use crate::store::Store;

/// Serves tags from memory, keyed by path.
#[derive(Default)]
pub(crate) struct FakeReader {
    tags: Mutex<HashMap<PathBuf, AudioTags>>,
}

impl FakeReader {
    pub(crate) fn set(&self, path: &Path, tags: AudioTags) {
        self.tags.lock().insert(path.to_path_buf(), tags);
    }
}

impl MetadataReader for FakeReader {
    fn read(&self, path: &Path) -> Result<AudioTags, MetadataError> {
        self.tags.lock().get(path).cloned().ok_or_else(|| {
            MetadataError::Io(io::Error::new(io::ErrorKind::NotFound, "no tags"))
        })
    }
}

/// Records artwork calls and answers with an artwork per processed album.
#[derive(Default)]
pub(crate) struct RecordingArtwork {
    pub(crate) processed: Mutex<Vec<(String, PathBuf)>>,
    pub(crate) deleted: Mutex<Vec<String>>,
}

impl ArtworkService for RecordingArtwork {
    fn extract_embedded(&self, _audio_path: &Path) -> Result<Option<PathBuf>, String> {
        Ok(None)
    }

    fn process(&self, album: &Album, source: &Path) -> Result<Option<Artwork>, String> {
        self.processed
            .lock()
            .push((album.id.clone(), source.to_path_buf()));
        Ok(Some(Artwork {
            id: new_id(),
            album_id: album.id.clone(),
            paths: vec![ArtworkPath {
                size: ArtworkSize::Original,
                width: 1,
                height: 1,
                path: source.to_string_lossy().to_string(),
            }],
            colors: Vec::new(),
        }))
    }

    fn delete(&self, artwork: &Artwork) -> Result<(), String> {
        self.deleted.lock().push(artwork.album_id.clone());
        Ok(())
    }
}

pub(crate) fn tags(title: &str, artist: &str, album: Option<&str>) -> AudioTags {
    AudioTags {
        title: Some(title.to_string()),
        artist: Some(artist.to_string()),
        album: album.map(str::to_string),
        duration_seconds: 180,
        codec: "FLAC".to_string(),
        bitrate: Some(900),
        sample_rate: Some(44_100),
        channels: Some(2),
        bit_depth: Some(16),
        ..AudioTags::default()
    }
}

pub(crate) struct Fixture {
    _dir: tempfile::TempDir,
    pub(crate) music: PathBuf,
    pub(crate) store: Store,
    pub(crate) library: MusicLibrary,
    pub(crate) reader: Arc<FakeReader>,
    pub(crate) artwork: Arc<RecordingArtwork>,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let music = dir.path().join("music");
        fs::create_dir_all(&music).expect("music dir");
        let store = Store::open(&dir.path().join("index").join("catalog.redb")).expect("store");
        let library = store.ensure_library(&music, false).expect("library");
        Fixture {
            _dir: dir,
            music,
            store,
            library,
            reader: Arc::new(FakeReader::default()),
            artwork: Arc::new(RecordingArtwork::default()),
        }
    }

    /// Creates an empty file under the library root and registers its tags.
    pub(crate) fn add(&self, relative: &str, tags: AudioTags) -> PathBuf {
        let path = self.music.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("parent dir");
        }
        fs::write(&path, b"").expect("audio file");
        self.reader.set(&path, tags);
        path
    }

    pub(crate) fn services(&self) -> Services {
        Services::new(self.reader.clone()).with_artwork(self.artwork.clone())
    }

    pub(crate) fn orchestrator(&self) -> Orchestrator {
        let options = IndexOptions {
            retry: RetryPolicy {
                attempts: 1,
                step: Duration::ZERO,
            },
        };
        Orchestrator::new(self.store.clone(), self.services(), options)
    }
}
