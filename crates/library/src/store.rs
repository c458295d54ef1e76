use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::{
    new_id, path_string, Album, Artist, ArtistRole, ArtistWithRole, Artwork, AudioFile, Genre,
    MusicLibrary, RecordLabel, Track,
};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::records::{join_key, AudioFileKey, CatalogRecord, EntityKind, LibraryKey, RelationKind};
use crate::LibraryError;

pub(crate) type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

const SCHEMA_VERSION: u32 = 1;
pub(crate) const KEY_SEP: char = '\x1f';
const META_VERSION_KEY: &str = "version";
const EMPTY: &[u8] = &[];

const META_TABLE: RecordTable = TableDefinition::new("meta");
pub(crate) const LIBRARIES_TABLE: RecordTable = TableDefinition::new("libraries");
pub(crate) const LIBRARIES_BY_PATH_TABLE: RecordTable = TableDefinition::new("libraries_by_path");
pub(crate) const GENRES_TABLE: RecordTable = TableDefinition::new("genres");
pub(crate) const GENRES_BY_NAME_TABLE: RecordTable = TableDefinition::new("genres_by_name");
pub(crate) const ARTISTS_TABLE: RecordTable = TableDefinition::new("artists");
pub(crate) const ARTISTS_BY_NAME_TABLE: RecordTable = TableDefinition::new("artists_by_name");
pub(crate) const ARTIST_ROLES_TABLE: RecordTable = TableDefinition::new("artist_roles");
pub(crate) const ARTIST_ROLES_BY_KEY_TABLE: RecordTable =
    TableDefinition::new("artist_roles_by_key");
pub(crate) const LABELS_TABLE: RecordTable = TableDefinition::new("record_labels");
pub(crate) const LABELS_BY_NAME_TABLE: RecordTable = TableDefinition::new("record_labels_by_name");
pub(crate) const AUDIO_METADATA_TABLE: RecordTable = TableDefinition::new("audio_metadata");
pub(crate) const AUDIO_METADATA_BY_PROFILE_TABLE: RecordTable =
    TableDefinition::new("audio_metadata_by_profile");
pub(crate) const AUDIO_FILES_TABLE: RecordTable = TableDefinition::new("audio_files");
pub(crate) const AUDIO_FILES_BY_PATH_TABLE: RecordTable =
    TableDefinition::new("audio_files_by_path");
pub(crate) const ALBUMS_TABLE: RecordTable = TableDefinition::new("albums");
pub(crate) const ALBUMS_BY_KEY_TABLE: RecordTable = TableDefinition::new("albums_by_key");
pub(crate) const TRACKS_TABLE: RecordTable = TableDefinition::new("tracks");
pub(crate) const TRACKS_BY_FILE_TABLE: RecordTable = TableDefinition::new("tracks_by_file");
pub(crate) const ARTWORKS_TABLE: RecordTable = TableDefinition::new("artworks");
pub(crate) const ARTWORKS_BY_ALBUM_TABLE: RecordTable = TableDefinition::new("artworks_by_album");
pub(crate) const ALBUM_ARTISTS_TABLE: RecordTable = TableDefinition::new("album_artists");
pub(crate) const TRACK_ARTISTS_TABLE: RecordTable = TableDefinition::new("track_artists");
const ALBUM_TRACKS_TABLE: RecordTable = TableDefinition::new("album_tracks");
const ROLE_TRACKS_TABLE: RecordTable = TableDefinition::new("role_tracks");
const SEARCH_TEXT_TABLE: RecordTable = TableDefinition::new("search_text");
const EMBEDDINGS_TABLE: RecordTable = TableDefinition::new("track_embeddings");

const ALL_TABLES: &[RecordTable] = &[
    META_TABLE,
    LIBRARIES_TABLE,
    LIBRARIES_BY_PATH_TABLE,
    GENRES_TABLE,
    GENRES_BY_NAME_TABLE,
    ARTISTS_TABLE,
    ARTISTS_BY_NAME_TABLE,
    ARTIST_ROLES_TABLE,
    ARTIST_ROLES_BY_KEY_TABLE,
    LABELS_TABLE,
    LABELS_BY_NAME_TABLE,
    AUDIO_METADATA_TABLE,
    AUDIO_METADATA_BY_PROFILE_TABLE,
    AUDIO_FILES_TABLE,
    AUDIO_FILES_BY_PATH_TABLE,
    ALBUMS_TABLE,
    ALBUMS_BY_KEY_TABLE,
    TRACKS_TABLE,
    TRACKS_BY_FILE_TABLE,
    ARTWORKS_TABLE,
    ARTWORKS_BY_ALBUM_TABLE,
    ALBUM_ARTISTS_TABLE,
    TRACK_ARTISTS_TABLE,
    ALBUM_TRACKS_TABLE,
    ROLE_TRACKS_TABLE,
    SEARCH_TEXT_TABLE,
    EMBEDDINGS_TABLE,
];

/// A track joined with everything it points at.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackDetails {
    pub track: Track,
    pub album: Option<Album>,
    pub genre: Option<Genre>,
    pub audio_file: Option<AudioFile>,
    pub artists: Vec<(Artist, ArtistRole)>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AlbumDetails {
    pub album: Album,
    pub label: Option<RecordLabel>,
    pub artists: Vec<(Artist, ArtistRole)>,
    pub tracks: Vec<Track>,
    pub artwork: Option<Artwork>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogCounts {
    pub libraries: u64,
    pub audio_files: u64,
    pub audio_metadata: u64,
    pub genres: u64,
    pub artists: u64,
    pub artist_roles: u64,
    pub record_labels: u64,
    pub albums: u64,
    pub tracks: u64,
    pub artworks: u64,
}

/// Handle to the catalog database. Cloning shares the same database.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, LibraryError> {
        let db = open_or_create_db(path)?;
        let store = Store { db: Arc::new(db) };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        {
            for table in ALL_TABLES {
                write_txn.open_table(*table)?;
            }
            let mut meta = write_txn.open_table(META_TABLE)?;
            let stored: Option<u32> = match meta.get(META_VERSION_KEY)? {
                Some(value) => Some(decode_value(value.value())?),
                None => None,
            };
            match stored {
                Some(version) if version != SCHEMA_VERSION => {
                    return Err(LibraryError::SchemaVersion(version));
                }
                Some(_) => {}
                None => {
                    let bytes = encode_value(&SCHEMA_VERSION)?;
                    meta.insert(META_VERSION_KEY, bytes.as_slice())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub(crate) fn begin_write(&self) -> Result<WriteTransaction, LibraryError> {
        Ok(self.db.begin_write()?)
    }

    pub fn get<R: CatalogRecord>(&self, id: &str) -> Result<Option<R>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(R::KIND.table())?;
        let record = load(&table, id)?;
        Ok(record)
    }

    pub fn get_many<R: CatalogRecord>(&self, ids: &[String]) -> Result<Vec<R>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(R::KIND.table())?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = load(&table, id)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Looks an entity up by its natural key.
    pub fn find<R: CatalogRecord>(&self, key: &R::Key) -> Result<Option<R>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let keys = read_txn.open_table(R::KEY_TABLE)?;
        let id = match keys.get(R::index_key(key).as_str())? {
            Some(value) => id_from_bytes(value.value())?,
            None => return Ok(None),
        };
        let table = read_txn.open_table(R::KIND.table())?;
        let record = load(&table, &id)?;
        Ok(record)
    }

    pub fn list<R: CatalogRecord>(&self) -> Result<Vec<R>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(R::KIND.table())?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            out.push(decode_value(value.value())?);
        }
        Ok(out)
    }

    pub fn count<R: CatalogRecord>(&self) -> Result<u64, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(R::KIND.table())?;
        let count = table.len()?;
        Ok(count)
    }

    /// Inserts or replaces a single record in its own transaction.
    pub fn put<R: CatalogRecord>(&self, record: &R) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        replace_records(&write_txn, std::slice::from_ref(record))?;
        write_txn.commit()?;
        Ok(())
    }

    pub fn counts(&self) -> Result<CatalogCounts, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let len = |kind: EntityKind| -> Result<u64, LibraryError> {
            let table = read_txn.open_table(kind.table())?;
            let count = table.len()?;
            Ok(count)
        };
        Ok(CatalogCounts {
            libraries: len(EntityKind::Library)?,
            audio_files: len(EntityKind::AudioFile)?,
            audio_metadata: len(EntityKind::AudioMetadata)?,
            genres: len(EntityKind::Genre)?,
            artists: len(EntityKind::Artist)?,
            artist_roles: len(EntityKind::ArtistRole)?,
            record_labels: len(EntityKind::RecordLabel)?,
            albums: len(EntityKind::Album)?,
            tracks: len(EntityKind::Track)?,
            artworks: len(EntityKind::Artwork)?,
        })
    }

    /// Returns the library registered at `path`, creating it when missing.
    pub fn ensure_library(&self, path: &Path, watch: bool) -> Result<MusicLibrary, LibraryError> {
        let key = LibraryKey {
            path: path_string(path),
        };
        if let Some(mut library) = self.find::<MusicLibrary>(&key)? {
            if library.watch_for_changes != watch {
                library.watch_for_changes = watch;
                self.put(&library)?;
            }
            return Ok(library);
        }
        let library = MusicLibrary {
            id: new_id(),
            path: key.path,
            last_scan: None,
            watch_for_changes: watch,
        };
        self.put(&library)?;
        info!("Registered library {} at {}", library.id, library.path);
        Ok(library)
    }

    pub fn library(&self, library_id: &str) -> Result<MusicLibrary, LibraryError> {
        self.get::<MusicLibrary>(library_id)?
            .ok_or_else(|| LibraryError::LibraryNotFound(library_id.to_string()))
    }

    pub fn audio_files_in_library(&self, library_id: &str) -> Result<Vec<AudioFile>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let by_path = read_txn.open_table(AUDIO_FILES_BY_PATH_TABLE)?;
        let files = read_txn.open_table(AUDIO_FILES_TABLE)?;
        let mut out = Vec::new();
        for (_, id) in child_entries(&by_path, library_id)? {
            let id = id_from_bytes(&id)?;
            if let Some(file) = load(&files, &id)? {
                out.push(file);
            }
        }
        Ok(out)
    }

    pub fn track_details(&self, track_ids: &[String]) -> Result<Vec<TrackDetails>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let tracks = read_txn.open_table(TRACKS_TABLE)?;
        let albums = read_txn.open_table(ALBUMS_TABLE)?;
        let genres = read_txn.open_table(GENRES_TABLE)?;
        let files = read_txn.open_table(AUDIO_FILES_TABLE)?;
        let track_artists = read_txn.open_table(TRACK_ARTISTS_TABLE)?;
        let roles = read_txn.open_table(ARTIST_ROLES_TABLE)?;
        let artists = read_txn.open_table(ARTISTS_TABLE)?;

        let mut out = Vec::with_capacity(track_ids.len());
        for track_id in track_ids {
            let track: Track = match load(&tracks, track_id)? {
                Some(track) => track,
                None => continue,
            };
            let album = load(&albums, &track.album_id)?;
            let genre = match track.genre_id.as_deref() {
                Some(genre_id) => load(&genres, genre_id)?,
                None => None,
            };
            let audio_file = load(&files, &track.audio_file_id)?;
            let artists = ordered_artists(&track_artists, &roles, &artists, track_id)?;
            out.push(TrackDetails {
                track,
                album,
                genre,
                audio_file,
                artists,
            });
        }
        Ok(out)
    }

    pub fn album_details(&self, album_id: &str) -> Result<Option<AlbumDetails>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let albums = read_txn.open_table(ALBUMS_TABLE)?;
        let album: Album = match load(&albums, album_id)? {
            Some(album) => album,
            None => return Ok(None),
        };
        let labels = read_txn.open_table(LABELS_TABLE)?;
        let label = match album.label_id.as_deref() {
            Some(label_id) => load(&labels, label_id)?,
            None => None,
        };
        let album_artists = read_txn.open_table(ALBUM_ARTISTS_TABLE)?;
        let roles = read_txn.open_table(ARTIST_ROLES_TABLE)?;
        let artists_table = read_txn.open_table(ARTISTS_TABLE)?;
        let artists = ordered_artists(&album_artists, &roles, &artists_table, album_id)?;

        let album_tracks = read_txn.open_table(ALBUM_TRACKS_TABLE)?;
        let tracks_table = read_txn.open_table(TRACKS_TABLE)?;
        let mut tracks: Vec<Track> = Vec::new();
        for (track_id, _) in child_entries(&album_tracks, album_id)? {
            if let Some(track) = load(&tracks_table, &track_id)? {
                tracks.push(track);
            }
        }
        tracks.sort_by(|a, b| {
            (a.disc_number, a.track_number, &a.title).cmp(&(b.disc_number, b.track_number, &b.title))
        });

        let artwork_keys = read_txn.open_table(ARTWORKS_BY_ALBUM_TABLE)?;
        let artworks = read_txn.open_table(ARTWORKS_TABLE)?;
        let artwork = match artwork_keys.get(album_id)? {
            Some(value) => load(&artworks, &id_from_bytes(value.value())?)?,
            None => None,
        };

        Ok(Some(AlbumDetails {
            album,
            label,
            artists,
            tracks,
            artwork,
        }))
    }

    pub fn artwork_for_album(&self, album_id: &str) -> Result<Option<Artwork>, LibraryError> {
        self.find::<Artwork>(&album_id.to_string())
    }

    pub fn put_search_text(&self, entries: &[(String, String)]) -> Result<usize, LibraryError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SEARCH_TEXT_TABLE)?;
            for (track_id, text) in entries {
                table.insert(track_id.as_str(), text.as_bytes())?;
            }
        }
        write_txn.commit()?;
        Ok(entries.len())
    }

    pub fn search_text(&self, track_id: &str) -> Result<Option<String>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SEARCH_TEXT_TABLE)?;
        let text = match table.get(track_id)? {
            Some(value) => Some(String::from_utf8_lossy(value.value()).to_string()),
            None => None,
        };
        Ok(text)
    }

    pub fn put_embedding(&self, track_id: &str, embedding: &[f32]) -> Result<(), LibraryError> {
        let bytes = encode_value(&embedding)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(EMBEDDINGS_TABLE)?;
            table.insert(track_id, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Position following the last stored `kind` edge of `parent_id`.
    pub fn next_position(&self, kind: RelationKind, parent_id: &str) -> Result<u32, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(kind.table())?;
        let mut next = 0;
        for (_, value) in child_entries(&table, parent_id)? {
            let position: u32 = decode_value(&value)?;
            next = next.max(position + 1);
        }
        Ok(next)
    }

    pub fn embedding(&self, track_id: &str) -> Result<Option<Vec<f32>>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EMBEDDINGS_TABLE)?;
        let embedding = match table.get(track_id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(embedding)
    }

    /// Removes the tracks backed by the given audio files, along with their
    /// artist edges and derived rows. Returns the number of tracks deleted.
    pub fn delete_tracks_for_files(&self, file_ids: &[String]) -> Result<usize, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let mut track_ids = Vec::new();
        {
            let mut tracks = write_txn.open_table(TRACKS_TABLE)?;
            let mut by_file = write_txn.open_table(TRACKS_BY_FILE_TABLE)?;
            let mut album_tracks = write_txn.open_table(ALBUM_TRACKS_TABLE)?;
            let mut search = write_txn.open_table(SEARCH_TEXT_TABLE)?;
            let mut embeddings = write_txn.open_table(EMBEDDINGS_TABLE)?;
            for file_id in file_ids {
                let track_id = match by_file.get(file_id.as_str())? {
                    Some(value) => id_from_bytes(value.value())?,
                    None => continue,
                };
                let track: Option<Track> = load(&tracks, &track_id)?;
                by_file.remove(file_id.as_str())?;
                tracks.remove(track_id.as_str())?;
                if let Some(track) = track {
                    album_tracks.remove(join_key(&[&track.album_id, &track_id]).as_str())?;
                }
                search.remove(track_id.as_str())?;
                embeddings.remove(track_id.as_str())?;
                track_ids.push(track_id);
            }
        }
        for track_id in &track_ids {
            clear_track_artists(&write_txn, track_id)?;
        }
        write_txn.commit()?;
        Ok(track_ids.len())
    }

    /// Deletes artist roles no track points at, plus album edges to them.
    pub fn delete_unreferenced_roles(&self) -> Result<usize, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut roles = write_txn.open_table(ARTIST_ROLES_TABLE)?;
            let mut role_keys = write_txn.open_table(ARTIST_ROLES_BY_KEY_TABLE)?;
            let role_tracks = write_txn.open_table(ROLE_TRACKS_TABLE)?;
            let mut album_artists = write_txn.open_table(ALBUM_ARTISTS_TABLE)?;

            let mut orphaned: Vec<ArtistWithRole> = Vec::new();
            for entry in roles.iter()? {
                let (key, value) = entry?;
                if child_entries(&role_tracks, key.value())?.is_empty() {
                    orphaned.push(decode_value(value.value())?);
                }
            }
            let orphan_ids: HashSet<&str> = orphaned.iter().map(|role| role.id.as_str()).collect();

            let mut stale_edges = Vec::new();
            for entry in album_artists.iter()? {
                let (key, _) = entry?;
                let (_, role_id) = split_key_last(key.value())?;
                if orphan_ids.contains(role_id) {
                    stale_edges.push(key.value().to_string());
                }
            }
            for key in &stale_edges {
                album_artists.remove(key.as_str())?;
            }
            for role in &orphaned {
                roles.remove(role.id.as_str())?;
                role_keys.remove(ArtistWithRole::index_key(&role.natural_key()).as_str())?;
            }
            orphaned.len()
        };
        write_txn.commit()?;
        Ok(deleted)
    }

    /// Deletes artists that no longer hold any role.
    pub fn delete_unreferenced_artists(&self) -> Result<usize, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let roles = write_txn.open_table(ARTIST_ROLES_TABLE)?;
            let mut referenced = HashSet::new();
            for entry in roles.iter()? {
                let (_, value) = entry?;
                let role: ArtistWithRole = decode_value(value.value())?;
                referenced.insert(role.artist_id);
            }

            let mut artists = write_txn.open_table(ARTISTS_TABLE)?;
            let mut by_name = write_txn.open_table(ARTISTS_BY_NAME_TABLE)?;
            let mut orphaned: Vec<Artist> = Vec::new();
            for entry in artists.iter()? {
                let (_, value) = entry?;
                let artist: Artist = decode_value(value.value())?;
                if !referenced.contains(&artist.id) {
                    orphaned.push(artist);
                }
            }
            for artist in &orphaned {
                artists.remove(artist.id.as_str())?;
                by_name.remove(Artist::index_key(&artist.natural_key()).as_str())?;
            }
            orphaned.len()
        };
        write_txn.commit()?;
        Ok(deleted)
    }

    /// Albums with no tracks left.
    pub fn empty_albums(&self) -> Result<Vec<Album>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let albums = read_txn.open_table(ALBUMS_TABLE)?;
        let album_tracks = read_txn.open_table(ALBUM_TRACKS_TABLE)?;
        let mut out = Vec::new();
        for entry in albums.iter()? {
            let (key, value) = entry?;
            if child_entries(&album_tracks, key.value())?.is_empty() {
                out.push(decode_value(value.value())?);
            }
        }
        Ok(out)
    }

    /// Deletes albums with their artist edges and artwork rows. Returns
    /// (albums deleted, artworks deleted).
    pub fn delete_albums(&self, album_ids: &[String]) -> Result<(usize, usize), LibraryError> {
        let write_txn = self.db.begin_write()?;
        let counts = {
            let mut albums = write_txn.open_table(ALBUMS_TABLE)?;
            let mut album_keys = write_txn.open_table(ALBUMS_BY_KEY_TABLE)?;
            let mut album_artists = write_txn.open_table(ALBUM_ARTISTS_TABLE)?;
            let mut artworks = write_txn.open_table(ARTWORKS_TABLE)?;
            let mut artwork_keys = write_txn.open_table(ARTWORKS_BY_ALBUM_TABLE)?;

            let mut album_count = 0;
            let mut artwork_count = 0;
            for album_id in album_ids {
                let album: Album = match load(&albums, album_id)? {
                    Some(album) => album,
                    None => continue,
                };
                albums.remove(album_id.as_str())?;
                album_keys.remove(Album::index_key(&album.natural_key()).as_str())?;
                for (role_id, _) in child_entries(&album_artists, album_id)? {
                    album_artists.remove(join_key(&[album_id, &role_id]).as_str())?;
                }
                let artwork_id = match artwork_keys.remove(album_id.as_str())? {
                    Some(value) => Some(id_from_bytes(value.value())?),
                    None => None,
                };
                if let Some(artwork_id) = artwork_id {
                    if artworks.remove(artwork_id.as_str())?.is_some() {
                        artwork_count += 1;
                    }
                }
                album_count += 1;
            }
            (album_count, artwork_count)
        };
        write_txn.commit()?;
        Ok(counts)
    }

    pub fn delete_audio_files(&self, file_ids: &[String]) -> Result<usize, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut files = write_txn.open_table(AUDIO_FILES_TABLE)?;
            let mut by_path = write_txn.open_table(AUDIO_FILES_BY_PATH_TABLE)?;
            let mut deleted = 0;
            for file_id in file_ids {
                let file: AudioFile = match load(&files, file_id)? {
                    Some(file) => file,
                    None => continue,
                };
                files.remove(file_id.as_str())?;
                by_path.remove(AudioFile::index_key(&file.natural_key()).as_str())?;
                deleted += 1;
            }
            deleted
        };
        write_txn.commit()?;
        Ok(deleted)
    }

    /// Moves an audio file row to a new path, keeping its identifier and
    /// everything that references it.
    pub fn rename_audio_file(
        &self,
        library_id: &str,
        old_path: &str,
        new_path: &str,
        modified: Option<u64>,
    ) -> Result<Option<AudioFile>, LibraryError> {
        let old_key = AudioFile::index_key(&AudioFileKey {
            library_id: library_id.to_string(),
            path: old_path.to_string(),
        });
        let new_key = AudioFile::index_key(&AudioFileKey {
            library_id: library_id.to_string(),
            path: new_path.to_string(),
        });
        let write_txn = self.db.begin_write()?;
        let renamed = {
            let mut files = write_txn.open_table(AUDIO_FILES_TABLE)?;
            let mut by_path = write_txn.open_table(AUDIO_FILES_BY_PATH_TABLE)?;
            let file_id = match by_path.get(old_key.as_str())? {
                Some(value) => id_from_bytes(value.value())?,
                None => return Ok(None),
            };
            if by_path.get(new_key.as_str())?.is_some() {
                return Err(LibraryError::DuplicateKey {
                    kind: EntityKind::AudioFile,
                    key: new_key,
                });
            }
            let mut file: AudioFile = match load(&files, &file_id)? {
                Some(file) => file,
                None => return Ok(None),
            };
            file.path = new_path.to_string();
            if let Some(modified) = modified {
                file.modified = modified;
            }
            let bytes = encode_value(&file)?;
            files.insert(file_id.as_str(), bytes.as_slice())?;
            by_path.remove(old_key.as_str())?;
            by_path.insert(new_key.as_str(), file_id.as_bytes())?;
            file
        };
        write_txn.commit()?;
        Ok(Some(renamed))
    }
}

/// Inserts records that must not exist yet. A natural key already mapped to
/// another identifier is a [`LibraryError::DuplicateKey`].
pub(crate) fn insert_records<R: CatalogRecord>(
    txn: &WriteTransaction,
    records: &[Arc<R>],
) -> Result<usize, LibraryError> {
    let mut table = txn.open_table(R::KIND.table())?;
    let mut keys = txn.open_table(R::KEY_TABLE)?;
    let mut inserted = 0;
    for record in records.iter().map(Arc::as_ref) {
        let key = R::index_key(&record.natural_key());
        claim_key::<R>(&keys, &key, record.id())?;
        let bytes = encode_value(record)?;
        if table.insert(record.id(), bytes.as_slice())?.is_none() {
            inserted += 1;
        }
        keys.insert(key.as_str(), record.id().as_bytes())?;
    }
    Ok(inserted)
}

/// Overwrites records by identifier, moving their natural key entries when
/// the key changed. Returns the previous versions in input order.
pub(crate) fn replace_records<R: CatalogRecord>(
    txn: &WriteTransaction,
    records: &[R],
) -> Result<Vec<Option<R>>, LibraryError> {
    let mut table = txn.open_table(R::KIND.table())?;
    let mut keys = txn.open_table(R::KEY_TABLE)?;
    let mut previous = Vec::with_capacity(records.len());
    for record in records {
        let old: Option<R> = load(&table, record.id())?;
        let key = R::index_key(&record.natural_key());
        if let Some(old) = &old {
            let old_key = R::index_key(&old.natural_key());
            if old_key != key {
                keys.remove(old_key.as_str())?;
            }
        }
        claim_key::<R>(&keys, &key, record.id())?;
        let bytes = encode_value(record)?;
        table.insert(record.id(), bytes.as_slice())?;
        keys.insert(key.as_str(), record.id().as_bytes())?;
        previous.push(old);
    }
    Ok(previous)
}

fn claim_key<R: CatalogRecord>(
    keys: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
    id: &str,
) -> Result<(), LibraryError> {
    let owner = match keys.get(key)? {
        Some(value) => Some(id_from_bytes(value.value())?),
        None => None,
    };
    match owner {
        Some(owner) if owner != id => Err(LibraryError::DuplicateKey {
            kind: R::KIND,
            key: key.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Fails with [`LibraryError::MissingReference`] when any referenced
/// identifier is absent from its table inside `txn`.
pub(crate) fn check_references<'a>(
    txn: &WriteTransaction,
    references: impl IntoIterator<Item = (EntityKind, &'a str)>,
) -> Result<(), LibraryError> {
    let mut by_kind: HashMap<EntityKind, Vec<&str>> = HashMap::new();
    for (kind, id) in references {
        by_kind.entry(kind).or_default().push(id);
    }
    for (kind, ids) in by_kind {
        let table = txn.open_table(kind.table())?;
        for id in ids {
            if table.get(id)?.is_none() {
                return Err(LibraryError::MissingReference {
                    kind,
                    id: id.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Writes an edge. Track edges also maintain the role to track index.
pub(crate) fn link(
    txn: &WriteTransaction,
    kind: RelationKind,
    parent_id: &str,
    child_id: &str,
    position: u32,
) -> Result<bool, LibraryError> {
    let bytes = encode_value(&position)?;
    let added = {
        let mut table = txn.open_table(kind.table())?;
        let key = join_key(&[parent_id, child_id]);
        let existed = table.get(key.as_str())?.is_some();
        if !existed {
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        !existed
    };
    if kind == RelationKind::TrackArtist {
        let mut reverse = txn.open_table(ROLE_TRACKS_TABLE)?;
        reverse.insert(join_key(&[child_id, parent_id]).as_str(), EMPTY)?;
    }
    Ok(added)
}

pub(crate) fn link_album_track(
    txn: &WriteTransaction,
    album_id: &str,
    track_id: &str,
) -> Result<(), LibraryError> {
    let mut table = txn.open_table(ALBUM_TRACKS_TABLE)?;
    table.insert(join_key(&[album_id, track_id]).as_str(), EMPTY)?;
    Ok(())
}

pub(crate) fn unlink_album_track(
    txn: &WriteTransaction,
    album_id: &str,
    track_id: &str,
) -> Result<(), LibraryError> {
    let mut table = txn.open_table(ALBUM_TRACKS_TABLE)?;
    table.remove(join_key(&[album_id, track_id]).as_str())?;
    Ok(())
}

/// Drops every artist edge of a track along with the reverse index rows.
pub(crate) fn clear_track_artists(
    txn: &WriteTransaction,
    track_id: &str,
) -> Result<usize, LibraryError> {
    let mut track_artists = txn.open_table(TRACK_ARTISTS_TABLE)?;
    let mut role_tracks = txn.open_table(ROLE_TRACKS_TABLE)?;
    let edges = child_entries(&track_artists, track_id)?;
    for (role_id, _) in &edges {
        track_artists.remove(join_key(&[track_id, role_id]).as_str())?;
        role_tracks.remove(join_key(&[role_id, track_id]).as_str())?;
    }
    Ok(edges.len())
}

fn ordered_artists(
    edges: &impl ReadableTable<&'static str, &'static [u8]>,
    roles: &impl ReadableTable<&'static str, &'static [u8]>,
    artists: &impl ReadableTable<&'static str, &'static [u8]>,
    parent_id: &str,
) -> Result<Vec<(Artist, ArtistRole)>, LibraryError> {
    let mut positioned = Vec::new();
    for (role_id, value) in child_entries(edges, parent_id)? {
        let position: u32 = decode_value(&value)?;
        let role: ArtistWithRole = match load(roles, &role_id)? {
            Some(role) => role,
            None => continue,
        };
        if let Some(artist) = load::<Artist>(artists, &role.artist_id)? {
            positioned.push((position, artist, role.role));
        }
    }
    positioned.sort_by_key(|(position, _, _)| *position);
    Ok(positioned
        .into_iter()
        .map(|(_, artist, role)| (artist, role))
        .collect())
}

/// Entries stored under `parent␟child`, as (child, value).
fn child_entries(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    parent: &str,
) -> Result<Vec<(String, Vec<u8>)>, LibraryError> {
    let start = prefix_key(parent);
    let mut end = parent.to_string();
    end.push(char::from(KEY_SEP as u8 + 1));
    let mut out = Vec::new();
    for entry in table.range(start.as_str()..end.as_str())? {
        let (key, value) = entry?;
        let child = &key.value()[start.len()..];
        out.push((child.to_string(), value.value().to_vec()));
    }
    Ok(out)
}

fn load<R: for<'de> Deserialize<'de>>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    id: &str,
) -> Result<Option<R>, LibraryError> {
    let record = match table.get(id)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(record)
}

fn open_or_create_db(path: &Path) -> Result<Database, LibraryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, LibraryError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, LibraryError> {
    Ok(bincode::deserialize(bytes)?)
}

fn id_from_bytes(bytes: &[u8]) -> Result<String, LibraryError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| LibraryError::KeyParse(String::from_utf8_lossy(bytes).to_string()))
}

fn prefix_key(prefix: &str) -> String {
    let mut out = String::new();
    out.push_str(prefix);
    out.push(KEY_SEP);
    out
}

fn split_key_last(value: &str) -> Result<(&str, &str), LibraryError> {
    let idx = value
        .rfind(KEY_SEP)
        .ok_or_else(|| LibraryError::KeyParse(value.to_string()))?;
    let next = idx + KEY_SEP.len_utf8();
    Ok((&value[..idx], &value[next..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ArtistKey;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("index.redb")).expect("open store");
        (dir, store)
    }

    fn artist(name: &str) -> Arc<Artist> {
        Arc::new(Artist {
            id: new_id(),
            name: name.to_string(),
        })
    }

    #[test]
    fn reopen_keeps_schema_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("index.redb");
        {
            let store = Store::open(&path).expect("open store");
            store.ensure_library(dir.path(), false).expect("library");
        }
        let store = Store::open(&path).expect("reopen store");
        assert_eq!(store.counts().expect("counts").libraries, 1);
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("index.redb");
        {
            let db = Database::create(&path).expect("create");
            let txn = db.begin_write().expect("txn");
            {
                let mut meta = txn.open_table(META_TABLE).expect("meta");
                let bytes = encode_value(&(SCHEMA_VERSION + 1)).expect("encode");
                meta.insert(META_VERSION_KEY, bytes.as_slice()).expect("insert");
            }
            txn.commit().expect("commit");
        }
        match Store::open(&path) {
            Err(LibraryError::SchemaVersion(version)) => assert_eq!(version, SCHEMA_VERSION + 1),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("mismatched schema must not open"),
        }
    }

    #[test]
    fn ensure_library_is_idempotent_by_path() {
        let (dir, store) = open_store();
        let first = store.ensure_library(dir.path(), false).expect("first");
        let second = store.ensure_library(dir.path(), true).expect("second");
        assert_eq!(first.id, second.id);
        assert!(second.watch_for_changes);
        assert_eq!(store.list::<MusicLibrary>().expect("list").len(), 1);
    }

    #[test]
    fn insert_rejects_natural_key_owned_by_another_id() {
        let (_dir, store) = open_store();
        let txn = store.begin_write().expect("txn");
        insert_records(&txn, &[artist("Björk")]).expect("insert");
        txn.commit().expect("commit");

        let txn = store.begin_write().expect("txn");
        match insert_records(&txn, &[artist("Björk")]) {
            Err(LibraryError::DuplicateKey { kind, key }) => {
                assert_eq!(kind, EntityKind::Artist);
                assert_eq!(key, "Björk");
            }
            other => panic!("expected duplicate key, got {other:?}"),
        }
        drop(txn);

        let found = store
            .find::<Artist>(&ArtistKey {
                name: "Björk".to_string(),
            })
            .expect("find");
        assert!(found.is_some());
        assert_eq!(store.count::<Artist>().expect("count"), 1);
    }

    #[test]
    fn replace_moves_natural_key() {
        let (_dir, store) = open_store();
        let original = artist("Prince");
        let txn = store.begin_write().expect("txn");
        insert_records(&txn, &[original.clone()]).expect("insert");
        txn.commit().expect("commit");

        let renamed = Artist {
            id: original.id.clone(),
            name: "The Artist".to_string(),
        };
        store.put(&renamed).expect("put");
        let old_key = ArtistKey {
            name: "Prince".to_string(),
        };
        let new_key = ArtistKey {
            name: "The Artist".to_string(),
        };
        assert!(store.find::<Artist>(&old_key).expect("find").is_none());
        assert_eq!(store.find::<Artist>(&new_key).expect("find"), Some(renamed));
    }

    #[test]
    fn missing_reference_is_reported() {
        let (_dir, store) = open_store();
        let txn = store.begin_write().expect("txn");
        let err = check_references(&txn, [(EntityKind::Album, "nope")]).unwrap_err();
        assert!(matches!(err, LibraryError::MissingReference { kind: EntityKind::Album, .. }));
    }

    #[test]
    fn relinking_keeps_the_first_position() {
        let (_dir, store) = open_store();
        assert_eq!(store.next_position(RelationKind::AlbumArtist, "a").expect("next"), 0);
        let txn = store.begin_write().expect("txn");
        assert!(link(&txn, RelationKind::AlbumArtist, "a", "r1", 0).expect("link"));
        assert!(link(&txn, RelationKind::AlbumArtist, "a", "r2", 1).expect("link"));
        assert!(!link(&txn, RelationKind::AlbumArtist, "a", "r1", 5).expect("relink"));
        txn.commit().expect("commit");
        assert_eq!(store.next_position(RelationKind::AlbumArtist, "a").expect("next"), 2);
        assert_eq!(store.next_position(RelationKind::TrackArtist, "a").expect("next"), 0);
    }

    #[test]
    fn child_entries_stop_at_parent_boundary() {
        let (_dir, store) = open_store();
        let txn = store.begin_write().expect("txn");
        link(&txn, RelationKind::AlbumArtist, "a", "r1", 0).expect("link");
        link(&txn, RelationKind::AlbumArtist, "a", "r2", 1).expect("link");
        link(&txn, RelationKind::AlbumArtist, "ab", "r3", 0).expect("link");
        {
            let table = txn.open_table(ALBUM_ARTISTS_TABLE).expect("table");
            let children: Vec<String> = child_entries(&table, "a")
                .expect("children")
                .into_iter()
                .map(|(child, _)| child)
                .collect();
            assert_eq!(children, vec!["r1".to_string(), "r2".to_string()]);
        }
        txn.commit().expect("commit");
    }

    #[test]
    fn rename_audio_file_keeps_identifier() {
        let (dir, store) = open_store();
        let library = store.ensure_library(dir.path(), false).expect("library");
        let file = AudioFile {
            id: new_id(),
            library_id: library.id.clone(),
            metadata_id: new_id(),
            path: "/music/a.flac".to_string(),
            size: 10,
            modified: 1,
        };
        store.put(&file).expect("put");

        let renamed = store
            .rename_audio_file(&library.id, "/music/a.flac", "/music/b.flac", Some(7))
            .expect("rename")
            .expect("renamed row");
        assert_eq!(renamed.id, file.id);
        assert_eq!(renamed.modified, 7);
        let files = store.audio_files_in_library(&library.id).expect("files");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "/music/b.flac");
        assert!(store
            .rename_audio_file(&library.id, "/music/a.flac", "/music/c.flac", None)
            .expect("rename")
            .is_none());
    }

    #[test]
    fn embeddings_and_search_text_round_trip() {
        let (_dir, store) = open_store();
        store.put_embedding("t1", &[0.5, 1.5]).expect("embedding");
        store
            .put_search_text(&[("t1".to_string(), "song artist".to_string())])
            .expect("search");
        assert_eq!(store.embedding("t1").expect("get"), Some(vec![0.5, 1.5]));
        assert_eq!(
            store.search_text("t1").expect("get").as_deref(),
            Some("song artist")
        );
    }
}
