use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{
    is_image_file, path_string, system_time_millis, Album, AlbumType, Artist, ArtistRole,
    ArtistWithRole, AudioFile, AudioMetadata, Genre, MusicLibrary, RecordLabel, Track,
};
use metadata::{read_with_retry, AudioTags, RetryPolicy};
use tracing::{debug, warn};

use crate::cache::ResolutionCache;
use crate::heuristics::parse_track_artists;
use crate::records::{
    AlbumKey, ArtistKey, ArtistRoleKey, AudioFileKey, AudioProfileKey, GenreKey, LabelKey,
    RelationKind, TrackKey,
};
use crate::scanner::DirectoryGroup;
use crate::services::Services;
use crate::LibraryError;

/// Decides an album's type from its Main artist count and track count.
pub trait AlbumTypePolicy: Send + Sync {
    fn classify(&self, main_artists: usize, tracks: usize) -> AlbumType;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultAlbumTypes;

impl AlbumTypePolicy for DefaultAlbumTypes {
    fn classify(&self, main_artists: usize, tracks: usize) -> AlbumType {
        if main_artists > 4 {
            return AlbumType::Compilation;
        }
        match tracks {
            0..=2 => AlbumType::Single,
            3..=4 => AlbumType::Ep,
            5..=9 => AlbumType::MiniAlbum,
            _ => AlbumType::Album,
        }
    }
}

#[derive(Debug)]
struct ReadFile {
    path: PathBuf,
    tags: AudioTags,
    size: u64,
    modified: u64,
}

impl ReadFile {
    fn title(&self) -> String {
        self.tags.title.clone().unwrap_or_else(|| {
            self.path
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_default()
        })
    }
}

/// State owned by one scan of one library.
pub(crate) struct ScanSession {
    pub(crate) library: MusicLibrary,
    pub(crate) cache: ResolutionCache,
    artwork_sources: Vec<(String, PathBuf)>,
    artwork_seen: HashSet<String>,
    indexed: Vec<Arc<Track>>,
    pub(crate) files_skipped: usize,
    pub(crate) groups_indexed: usize,
}

impl ScanSession {
    pub(crate) fn new(library: MusicLibrary, cache: ResolutionCache) -> Self {
        ScanSession {
            library,
            cache,
            artwork_sources: Vec::new(),
            artwork_seen: HashSet::new(),
            indexed: Vec::new(),
            files_skipped: 0,
            groups_indexed: 0,
        }
    }

    /// Tracks created or changed by this scan, in indexing order.
    pub(crate) fn indexed_tracks(&self) -> &[Arc<Track>] {
        &self.indexed
    }

    /// Album id and source image for albums still lacking artwork.
    pub(crate) fn artwork_sources(&self) -> &[(String, PathBuf)] {
        &self.artwork_sources
    }

    /// Reads every file of a directory and indexes it as one album when all
    /// files agree on the album tag, otherwise as independent singles.
    pub(crate) fn index_group(
        &mut self,
        services: &Services,
        retry: RetryPolicy,
        group: &DirectoryGroup,
    ) -> Result<Vec<Arc<Track>>, LibraryError> {
        let files = self.read_group(services, retry, group);
        if files.is_empty() {
            warn!("No readable audio files in {}", group.directory.display());
            return Ok(Vec::new());
        }
        let album_tags: HashSet<Option<&str>> =
            files.iter().map(|file| file.tags.album.as_deref()).collect();
        let tracks = if album_tags.len() == 1 {
            self.index_album(services, group, &files)?
        } else {
            debug!(
                "{} holds {} album tags; indexing as singles",
                group.directory.display(),
                album_tags.len()
            );
            self.index_singles(services, group, &files)?
        };
        self.groups_indexed += 1;
        Ok(tracks)
    }

    fn read_group(
        &mut self,
        services: &Services,
        retry: RetryPolicy,
        group: &DirectoryGroup,
    ) -> Vec<ReadFile> {
        let mut out = Vec::with_capacity(group.files.len());
        for path in &group.files {
            let tags = match read_with_retry(services.reader.as_ref(), path, retry) {
                Ok(tags) => tags,
                Err(err) => {
                    warn!("Skipping {}: {}", path.display(), err);
                    self.files_skipped += 1;
                    continue;
                }
            };
            if tags.duration_seconds == 0 {
                warn!("Skipping {}: no playable duration", path.display());
                self.files_skipped += 1;
                continue;
            }
            let meta = match fs::metadata(path) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!("Skipping {}: {}", path.display(), err);
                    self.files_skipped += 1;
                    continue;
                }
            };
            out.push(ReadFile {
                path: path.clone(),
                tags,
                size: meta.len(),
                modified: meta.modified().map(system_time_millis).unwrap_or(0),
            });
        }
        out
    }

    fn index_album(
        &mut self,
        services: &Services,
        group: &DirectoryGroup,
        files: &[ReadFile],
    ) -> Result<Vec<Arc<Track>>, LibraryError> {
        let mut per_track = Vec::with_capacity(files.len());
        for file in files {
            per_track.push(self.resolve_artists(file)?);
        }

        let mut album_artists: Vec<Arc<ArtistWithRole>> = Vec::new();
        for role in per_track.iter().flatten() {
            if !album_artists
                .iter()
                .any(|existing| existing.artist_id == role.artist_id)
            {
                album_artists.push(Arc::clone(role));
            }
        }
        let main_count = count_main(&album_artists);
        let album_type = services.album_types.classify(main_count, files.len());

        let album = match self.resolve_album(group, &files[0], &album_artists, album_type) {
            Ok(album) => album,
            Err(err) => return self.skip_files(err, files.len()).map(|_| Vec::new()),
        };
        self.queue_artwork(services, group, &album, files)?;

        let mut tracks = Vec::with_capacity(files.len());
        for (file, roles) in files.iter().zip(per_track) {
            match self.index_track(file, &album, &roles) {
                Ok(track) => tracks.push(track),
                Err(err) => self.skip_files(err, 1)?,
            }
        }
        Ok(tracks)
    }

    fn index_singles(
        &mut self,
        services: &Services,
        group: &DirectoryGroup,
        files: &[ReadFile],
    ) -> Result<Vec<Arc<Track>>, LibraryError> {
        let mut tracks = Vec::with_capacity(files.len());
        for file in files {
            let roles = self.resolve_artists(file)?;
            let album_type = services.album_types.classify(count_main(&roles), 1);
            let album = match self.resolve_album(group, file, &roles, album_type) {
                Ok(album) => album,
                Err(err) => {
                    self.skip_files(err, 1)?;
                    continue;
                }
            };
            self.queue_artwork(services, group, &album, std::slice::from_ref(file))?;
            match self.index_track(file, &album, &roles) {
                Ok(track) => tracks.push(track),
                Err(err) => self.skip_files(err, 1)?,
            }
        }
        Ok(tracks)
    }

    /// Entity-level failures skip the affected files; store failures abort.
    fn skip_files(&mut self, err: LibraryError, count: usize) -> Result<(), LibraryError> {
        match err {
            LibraryError::InvalidEntity(message) => {
                warn!("Skipping {} file(s): {}", count, message);
                self.files_skipped += count;
                Ok(())
            }
            other => Err(other),
        }
    }

    fn resolve_artists(&mut self, file: &ReadFile) -> Result<Vec<Arc<ArtistWithRole>>, LibraryError> {
        let parsed = parse_track_artists(file.tags.artist.as_deref(), &file.title());
        let mut out: Vec<Arc<ArtistWithRole>> = Vec::new();
        for (name, role) in parsed.ordered() {
            let artist = self.cache.resolve::<Artist, _>(
                ArtistKey {
                    name: name.to_string(),
                },
                |id| {
                    Ok(Artist {
                        id,
                        name: name.to_string(),
                    })
                },
            )?;
            let entry = self.cache.resolve::<ArtistWithRole, _>(
                ArtistRoleKey {
                    artist_id: artist.id.clone(),
                    role,
                },
                |id| {
                    Ok(ArtistWithRole {
                        id,
                        artist_id: artist.id.clone(),
                        role,
                    })
                },
            )?;
            if !out.iter().any(|existing| existing.id == entry.id) {
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn resolve_album(
        &mut self,
        group: &DirectoryGroup,
        file: &ReadFile,
        artists: &[Arc<ArtistWithRole>],
        album_type: AlbumType,
    ) -> Result<Arc<Album>, LibraryError> {
        let tags = &file.tags;
        let name = tags.album.clone().or_else(|| group.name()).ok_or_else(|| {
            LibraryError::InvalidEntity(format!(
                "no album name for {}",
                group.directory.display()
            ))
        })?;
        let label = match tags.label.as_deref() {
            Some(label) => Some(self.cache.resolve::<RecordLabel, _>(
                LabelKey {
                    name: label.to_string(),
                },
                |id| {
                    Ok(RecordLabel {
                        id,
                        name: label.to_string(),
                    })
                },
            )?),
            None => None,
        };
        let key = AlbumKey {
            name,
            release_year: tags.year,
            disc_total: tags.disc_total,
            track_total: tags.track_total,
        };
        let album = self.cache.resolve::<Album, _>(key.clone(), |id| {
            Ok(Album {
                id,
                name: key.name,
                release_year: key.release_year,
                disc_total: key.disc_total,
                track_total: key.track_total,
                catalog_number: tags.catalog_number.clone(),
                label_id: label.map(|label| label.id.clone()),
                album_type,
            })
        })?;
        for role in artists {
            self.cache
                .add_relationship(RelationKind::AlbumArtist, &album.id, &role.id)?;
        }
        Ok(album)
    }

    fn index_track(
        &mut self,
        file: &ReadFile,
        album: &Album,
        roles: &[Arc<ArtistWithRole>],
    ) -> Result<Arc<Track>, LibraryError> {
        let tags = &file.tags;
        let genre = match tags.genre.as_deref() {
            Some(name) => Some(self.cache.resolve::<Genre, _>(
                GenreKey {
                    name: name.to_string(),
                },
                |id| {
                    Ok(Genre {
                        id,
                        name: name.to_string(),
                    })
                },
            )?),
            None => None,
        };
        let profile = self.cache.resolve::<AudioMetadata, _>(
            AudioProfileKey {
                codec: tags.codec.clone(),
                bitrate: tags.bitrate,
                sample_rate: tags.sample_rate,
            },
            |id| {
                Ok(AudioMetadata {
                    id,
                    codec: tags.codec.clone(),
                    bitrate: tags.bitrate,
                    sample_rate: tags.sample_rate,
                    channels: tags.channels,
                    bit_depth: tags.bit_depth,
                })
            },
        )?;

        let library_id = self.library.id.clone();
        let path = path_string(&file.path);
        let audio_file = self.cache.resolve::<AudioFile, _>(
            AudioFileKey {
                library_id: library_id.clone(),
                path: path.clone(),
            },
            |id| {
                Ok(AudioFile {
                    id,
                    library_id,
                    metadata_id: profile.id.clone(),
                    path,
                    size: file.size,
                    modified: file.modified,
                })
            },
        )?;
        let audio_file = if !self.cache.is_new(&audio_file.id)
            && (audio_file.size != file.size
                || audio_file.modified != file.modified
                || audio_file.metadata_id != profile.id)
        {
            self.cache.update_audio_file(AudioFile {
                size: file.size,
                modified: file.modified,
                metadata_id: profile.id.clone(),
                ..audio_file.as_ref().clone()
            })
        } else {
            audio_file
        };

        let title = file.title();
        let make_track = |id: String| Track {
            id,
            album_id: album.id.clone(),
            genre_id: genre.as_ref().map(|genre| genre.id.clone()),
            audio_file_id: audio_file.id.clone(),
            title: title.clone(),
            track_number: tags.track_number,
            disc_number: tags.disc_number,
            duration_seconds: tags.duration_seconds,
            comment: tags.comment.clone(),
            isrc: tags.isrc.clone(),
        };
        let track = self.cache.resolve::<Track, _>(
            TrackKey {
                audio_file_id: audio_file.id.clone(),
            },
            |id| Ok(make_track(id)),
        )?;
        let track = if self.cache.is_new(&track.id) {
            track
        } else {
            self.cache.update_track(make_track(track.id.clone()))
        };

        for role in roles {
            self.cache
                .add_relationship(RelationKind::TrackArtist, &track.id, &role.id)?;
        }
        self.indexed.push(Arc::clone(&track));
        Ok(track)
    }

    fn queue_artwork(
        &mut self,
        services: &Services,
        group: &DirectoryGroup,
        album: &Album,
        files: &[ReadFile],
    ) -> Result<(), LibraryError> {
        if !self.artwork_seen.insert(album.id.clone()) {
            return Ok(());
        }
        if !self.cache.is_new(&album.id)
            && self.cache.store().artwork_for_album(&album.id)?.is_some()
        {
            return Ok(());
        }
        let mut source = find_cover_image(&group.directory);
        if source.is_none() {
            for file in files {
                match services.artwork.extract_embedded(&file.path) {
                    Ok(Some(path)) => {
                        source = Some(path);
                        break;
                    }
                    Ok(None) => {}
                    Err(err) => warn!(
                        "Embedded artwork extraction failed for {}: {}",
                        file.path.display(),
                        err
                    ),
                }
            }
        }
        if let Some(source) = source {
            self.artwork_sources.push((album.id.clone(), source));
        }
        Ok(())
    }
}

fn count_main(roles: &[Arc<ArtistWithRole>]) -> usize {
    roles
        .iter()
        .filter(|role| role.role == ArtistRole::Main)
        .count()
}

/// First image file in `dir` by name.
fn find_cover_image(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    let mut images: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_image_file(path))
        .collect();
    images.sort();
    images.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::testing::{tags, Fixture};

    #[test]
    fn default_policy_thresholds() {
        let policy = DefaultAlbumTypes;
        assert_eq!(policy.classify(1, 1), AlbumType::Single);
        assert_eq!(policy.classify(1, 2), AlbumType::Single);
        assert_eq!(policy.classify(1, 4), AlbumType::Ep);
        assert_eq!(policy.classify(2, 7), AlbumType::MiniAlbum);
        assert_eq!(policy.classify(1, 12), AlbumType::Album);
        assert_eq!(policy.classify(5, 12), AlbumType::Compilation);
    }

    fn session(fixture: &Fixture) -> ScanSession {
        ScanSession::new(
            fixture.library.clone(),
            ResolutionCache::new(fixture.store.clone()),
        )
    }

    fn group(dir: &Path, files: Vec<PathBuf>) -> DirectoryGroup {
        DirectoryGroup {
            directory: dir.to_path_buf(),
            files,
        }
    }

    #[test]
    fn shared_album_tag_yields_one_album() {
        let fixture = Fixture::new();
        let a = fixture.add("Record/01.flac", tags("One", "Band", Some("Record")));
        let b = fixture.add("Record/02.flac", tags("Two", "Band", Some("Record")));
        let mut session = session(&fixture);
        let tracks = session
            .index_group(&fixture.services(), RetryPolicy::default(), &group(&fixture.music.join("Record"), vec![a, b]))
            .expect("index");
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].album_id, tracks[1].album_id);
        let batch = session.cache.batch();
        assert_eq!(batch.albums.len(), 1);
        assert_eq!(batch.albums[0].album_type, AlbumType::Single);
        assert_eq!(batch.artists.len(), 1);
    }

    struct AlwaysAlbum;

    impl AlbumTypePolicy for AlwaysAlbum {
        fn classify(&self, _main_artists: usize, _tracks: usize) -> AlbumType {
            AlbumType::Album
        }
    }

    #[test]
    fn custom_album_type_policy_is_used() {
        let fixture = Fixture::new();
        let a = fixture.add("Record/01.flac", tags("One", "Band", Some("Record")));
        let services = fixture.services().with_album_types(Arc::new(AlwaysAlbum));
        let mut session = session(&fixture);
        session
            .index_group(&services, RetryPolicy::default(), &group(&fixture.music.join("Record"), vec![a]))
            .expect("index");
        assert_eq!(session.cache.batch().albums[0].album_type, AlbumType::Album);
    }

    #[test]
    fn mixed_album_tags_become_singles() {
        let fixture = Fixture::new();
        let a = fixture.add("Loose/a.mp3", tags("A", "X", Some("First")));
        let b = fixture.add("Loose/b.mp3", tags("B", "Y", Some("Second")));
        let c = fixture.add("Loose/c.mp3", tags("C", "Y", None));
        let mut session = session(&fixture);
        let tracks = session
            .index_group(
                &fixture.services(),
                RetryPolicy::default(),
                &group(&fixture.music.join("Loose"), vec![a, b, c]),
            )
            .expect("index");
        assert_eq!(tracks.len(), 3);
        let names: Vec<&str> = session
            .cache
            .batch()
            .albums
            .iter()
            .map(|album| album.name.as_str())
            .collect();
        assert_eq!(names, vec!["First", "Second", "Loose"]);
    }

    #[test]
    fn missing_title_falls_back_to_file_stem() {
        let fixture = Fixture::new();
        let mut untitled = tags("", "Band", Some("Record"));
        untitled.title = None;
        let path = fixture.add("Record/07 - Hidden.flac", untitled);
        let mut session = session(&fixture);
        let tracks = session
            .index_group(
                &fixture.services(),
                RetryPolicy::default(),
                &group(&fixture.music.join("Record"), vec![path]),
            )
            .expect("index");
        assert_eq!(tracks[0].title, "07 - Hidden");
    }

    #[test]
    fn unreadable_files_are_counted_and_skipped() {
        let fixture = Fixture::new();
        let good = fixture.add("Record/01.flac", tags("One", "Band", Some("Record")));
        let missing = fixture.music.join("Record").join("02.flac");
        fs::write(&missing, b"").expect("write");
        let mut session = session(&fixture);
        let retry = RetryPolicy {
            attempts: 1,
            step: std::time::Duration::ZERO,
        };
        let tracks = session
            .index_group(
                &fixture.services(),
                retry,
                &group(&fixture.music.join("Record"), vec![good, missing]),
            )
            .expect("index");
        assert_eq!(tracks.len(), 1);
        assert_eq!(session.files_skipped, 1);
    }

    #[test]
    fn zero_length_tracks_are_skipped() {
        let fixture = Fixture::new();
        let good = fixture.add("Record/01.flac", tags("One", "Band", Some("Record")));
        let mut silent = tags("Two", "Band", Some("Record"));
        silent.duration_seconds = 0;
        let empty = fixture.add("Record/02.flac", silent);
        let mut session = session(&fixture);
        let tracks = session
            .index_group(
                &fixture.services(),
                RetryPolicy::default(),
                &group(&fixture.music.join("Record"), vec![good, empty]),
            )
            .expect("index");
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].title, "One");
        assert_eq!(session.files_skipped, 1);
    }

    #[test]
    fn cover_image_in_directory_is_queued_once_per_album() {
        let fixture = Fixture::new();
        let a = fixture.add("Record/01.flac", tags("One", "Band", Some("Record")));
        let b = fixture.add("Record/02.flac", tags("Two", "Band", Some("Record")));
        let cover = fixture.music.join("Record").join("folder.jpg");
        fs::write(&cover, b"jpg").expect("write");
        let mut session = session(&fixture);
        session
            .index_group(
                &fixture.services(),
                RetryPolicy::default(),
                &group(&fixture.music.join("Record"), vec![a, b]),
            )
            .expect("index");
        assert_eq!(session.artwork_sources().len(), 1);
        assert_eq!(session.artwork_sources()[0].1, cover);
    }

    #[test]
    fn label_and_catalog_number_are_resolved() {
        let fixture = Fixture::new();
        let mut labelled = tags("One", "Band", Some("Record"));
        labelled.label = Some("Warp".to_string());
        labelled.catalog_number = Some("WARP123".to_string());
        let path = fixture.add("Record/01.flac", labelled);
        let mut session = session(&fixture);
        session
            .index_group(
                &fixture.services(),
                RetryPolicy::default(),
                &group(&fixture.music.join("Record"), vec![path]),
            )
            .expect("index");
        let batch = session.cache.batch();
        assert_eq!(batch.labels.len(), 1);
        assert_eq!(batch.albums[0].label_id.as_deref(), Some(batch.labels[0].id.as_str()));
        assert_eq!(batch.albums[0].catalog_number.as_deref(), Some("WARP123"));
    }

    #[test]
    fn store_is_consulted_for_existing_entities() {
        let fixture = Fixture::new();
        let existing = Artist {
            id: common::new_id(),
            name: "Band".to_string(),
        };
        let store: &Store = &fixture.store;
        store.put(&existing).expect("put");
        let path = fixture.add("Record/01.flac", tags("One", "Band", Some("Record")));
        let mut session = session(&fixture);
        session
            .index_group(
                &fixture.services(),
                RetryPolicy::default(),
                &group(&fixture.music.join("Record"), vec![path]),
            )
            .expect("index");
        let batch = session.cache.batch();
        assert!(batch.artists.is_empty());
        assert_eq!(batch.artist_roles[0].artist_id, existing.id);
    }
}
