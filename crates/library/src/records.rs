use std::fmt;
use std::hash::Hash;

use common::{
    Album, Artist, ArtistRole, ArtistWithRole, Artwork, AudioFile, AudioMetadata, Genre,
    MusicLibrary, RecordLabel, Track,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::store::{self, RecordTable, KEY_SEP};

/// Every persisted entity type, in the order a flush writes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Library,
    Genre,
    Artist,
    ArtistRole,
    RecordLabel,
    AudioMetadata,
    AudioFile,
    Album,
    Track,
    Artwork,
}

impl EntityKind {
    pub fn name(&self) -> &'static str {
        match self {
            EntityKind::Library => "library",
            EntityKind::Genre => "genre",
            EntityKind::Artist => "artist",
            EntityKind::ArtistRole => "artist role",
            EntityKind::RecordLabel => "record label",
            EntityKind::AudioMetadata => "audio metadata",
            EntityKind::AudioFile => "audio file",
            EntityKind::Album => "album",
            EntityKind::Track => "track",
            EntityKind::Artwork => "artwork",
        }
    }

    pub(crate) fn table(&self) -> RecordTable {
        match self {
            EntityKind::Library => store::LIBRARIES_TABLE,
            EntityKind::Genre => store::GENRES_TABLE,
            EntityKind::Artist => store::ARTISTS_TABLE,
            EntityKind::ArtistRole => store::ARTIST_ROLES_TABLE,
            EntityKind::RecordLabel => store::LABELS_TABLE,
            EntityKind::AudioMetadata => store::AUDIO_METADATA_TABLE,
            EntityKind::AudioFile => store::AUDIO_FILES_TABLE,
            EntityKind::Album => store::ALBUMS_TABLE,
            EntityKind::Track => store::TRACKS_TABLE,
            EntityKind::Artwork => store::ARTWORKS_TABLE,
        }
    }
}

/// A catalog entity with a stable identifier and a natural key that
/// identifies it across scans.
pub trait CatalogRecord: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Key: Clone + Eq + Hash + fmt::Debug + Send + Sync;

    const KIND: EntityKind;
    /// Maps the encoded natural key to the entity id.
    const KEY_TABLE: RecordTable;

    fn id(&self) -> &str;

    fn natural_key(&self) -> Self::Key;

    fn index_key(key: &Self::Key) -> String;

    /// Identifiers this record points at; each must exist once a flush commits.
    fn references(&self) -> Vec<(EntityKind, &str)> {
        Vec::new()
    }
}

/// Many-to-many edges persisted alongside the entities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    AlbumArtist,
    TrackArtist,
}

impl RelationKind {
    pub fn name(&self) -> &'static str {
        match self {
            RelationKind::AlbumArtist => "album artist",
            RelationKind::TrackArtist => "track artist",
        }
    }

    pub(crate) fn table(&self) -> RecordTable {
        match self {
            RelationKind::AlbumArtist => store::ALBUM_ARTISTS_TABLE,
            RelationKind::TrackArtist => store::TRACK_ARTISTS_TABLE,
        }
    }

    pub(crate) fn parent_kind(&self) -> EntityKind {
        match self {
            RelationKind::AlbumArtist => EntityKind::Album,
            RelationKind::TrackArtist => EntityKind::Track,
        }
    }
}

/// An edge from an album or track to an artist role. `position` keeps the
/// order artists were registered in for the parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relationship {
    pub kind: RelationKind,
    pub parent_id: String,
    pub child_id: String,
    pub position: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LibraryKey {
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GenreKey {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArtistKey {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArtistRoleKey {
    pub artist_id: String,
    pub role: ArtistRole,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LabelKey {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AudioProfileKey {
    pub codec: String,
    pub bitrate: Option<u32>,
    pub sample_rate: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AudioFileKey {
    pub library_id: String,
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AlbumKey {
    pub name: String,
    pub release_year: Option<i32>,
    pub disc_total: Option<u16>,
    pub track_total: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TrackKey {
    pub audio_file_id: String,
}

pub(crate) fn join_key(parts: &[&str]) -> String {
    let mut out = String::new();
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            out.push(KEY_SEP);
        }
        out.push_str(part);
    }
    out
}

fn opt_part<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl CatalogRecord for MusicLibrary {
    type Key = LibraryKey;
    const KIND: EntityKind = EntityKind::Library;
    const KEY_TABLE: RecordTable = store::LIBRARIES_BY_PATH_TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> LibraryKey {
        LibraryKey {
            path: self.path.clone(),
        }
    }

    fn index_key(key: &LibraryKey) -> String {
        key.path.clone()
    }
}

impl CatalogRecord for Genre {
    type Key = GenreKey;
    const KIND: EntityKind = EntityKind::Genre;
    const KEY_TABLE: RecordTable = store::GENRES_BY_NAME_TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> GenreKey {
        GenreKey {
            name: self.name.clone(),
        }
    }

    fn index_key(key: &GenreKey) -> String {
        key.name.clone()
    }
}

impl CatalogRecord for Artist {
    type Key = ArtistKey;
    const KIND: EntityKind = EntityKind::Artist;
    const KEY_TABLE: RecordTable = store::ARTISTS_BY_NAME_TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> ArtistKey {
        ArtistKey {
            name: self.name.clone(),
        }
    }

    fn index_key(key: &ArtistKey) -> String {
        key.name.clone()
    }
}

impl CatalogRecord for ArtistWithRole {
    type Key = ArtistRoleKey;
    const KIND: EntityKind = EntityKind::ArtistRole;
    const KEY_TABLE: RecordTable = store::ARTIST_ROLES_BY_KEY_TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> ArtistRoleKey {
        ArtistRoleKey {
            artist_id: self.artist_id.clone(),
            role: self.role,
        }
    }

    fn index_key(key: &ArtistRoleKey) -> String {
        join_key(&[&key.artist_id, key.role.as_str()])
    }

    fn references(&self) -> Vec<(EntityKind, &str)> {
        vec![(EntityKind::Artist, self.artist_id.as_str())]
    }
}

impl CatalogRecord for RecordLabel {
    type Key = LabelKey;
    const KIND: EntityKind = EntityKind::RecordLabel;
    const KEY_TABLE: RecordTable = store::LABELS_BY_NAME_TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> LabelKey {
        LabelKey {
            name: self.name.clone(),
        }
    }

    fn index_key(key: &LabelKey) -> String {
        key.name.clone()
    }
}

impl CatalogRecord for AudioMetadata {
    type Key = AudioProfileKey;
    const KIND: EntityKind = EntityKind::AudioMetadata;
    const KEY_TABLE: RecordTable = store::AUDIO_METADATA_BY_PROFILE_TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> AudioProfileKey {
        AudioProfileKey {
            codec: self.codec.clone(),
            bitrate: self.bitrate,
            sample_rate: self.sample_rate,
        }
    }

    fn index_key(key: &AudioProfileKey) -> String {
        join_key(&[
            &key.codec,
            &opt_part(key.bitrate),
            &opt_part(key.sample_rate),
        ])
    }
}

impl CatalogRecord for AudioFile {
    type Key = AudioFileKey;
    const KIND: EntityKind = EntityKind::AudioFile;
    const KEY_TABLE: RecordTable = store::AUDIO_FILES_BY_PATH_TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> AudioFileKey {
        AudioFileKey {
            library_id: self.library_id.clone(),
            path: self.path.clone(),
        }
    }

    fn index_key(key: &AudioFileKey) -> String {
        join_key(&[&key.library_id, &key.path])
    }

    fn references(&self) -> Vec<(EntityKind, &str)> {
        vec![
            (EntityKind::Library, self.library_id.as_str()),
            (EntityKind::AudioMetadata, self.metadata_id.as_str()),
        ]
    }
}

impl CatalogRecord for Album {
    type Key = AlbumKey;
    const KIND: EntityKind = EntityKind::Album;
    const KEY_TABLE: RecordTable = store::ALBUMS_BY_KEY_TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> AlbumKey {
        AlbumKey {
            name: self.name.clone(),
            release_year: self.release_year,
            disc_total: self.disc_total,
            track_total: self.track_total,
        }
    }

    fn index_key(key: &AlbumKey) -> String {
        join_key(&[
            &key.name,
            &opt_part(key.release_year),
            &opt_part(key.disc_total),
            &opt_part(key.track_total),
        ])
    }

    fn references(&self) -> Vec<(EntityKind, &str)> {
        match self.label_id.as_deref() {
            Some(label_id) => vec![(EntityKind::RecordLabel, label_id)],
            None => Vec::new(),
        }
    }
}

impl CatalogRecord for Track {
    type Key = TrackKey;
    const KIND: EntityKind = EntityKind::Track;
    const KEY_TABLE: RecordTable = store::TRACKS_BY_FILE_TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> TrackKey {
        TrackKey {
            audio_file_id: self.audio_file_id.clone(),
        }
    }

    fn index_key(key: &TrackKey) -> String {
        key.audio_file_id.clone()
    }

    fn references(&self) -> Vec<(EntityKind, &str)> {
        let mut refs = vec![
            (EntityKind::Album, self.album_id.as_str()),
            (EntityKind::AudioFile, self.audio_file_id.as_str()),
        ];
        if let Some(genre_id) = self.genre_id.as_deref() {
            refs.push((EntityKind::Genre, genre_id));
        }
        refs
    }
}

impl CatalogRecord for Artwork {
    type Key = String;
    const KIND: EntityKind = EntityKind::Artwork;
    const KEY_TABLE: RecordTable = store::ARTWORKS_BY_ALBUM_TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> String {
        self.album_id.clone()
    }

    fn index_key(key: &String) -> String {
        key.clone()
    }

    fn references(&self) -> Vec<(EntityKind, &str)> {
        vec![(EntityKind::Album, self.album_id.as_str())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn album_key_distinguishes_missing_parts() {
        let with_year = AlbumKey {
            name: "Blue".to_string(),
            release_year: Some(1999),
            disc_total: None,
            track_total: Some(10),
        };
        let without_year = AlbumKey {
            release_year: None,
            ..with_year.clone()
        };
        assert_ne!(Album::index_key(&with_year), Album::index_key(&without_year));
        assert_eq!(
            Album::index_key(&with_year),
            format!("Blue{0}1999{0}{0}10", KEY_SEP)
        );
    }

    #[test]
    fn role_key_separates_roles() {
        let main = ArtistRoleKey {
            artist_id: "a1".to_string(),
            role: ArtistRole::Main,
        };
        let guest = ArtistRoleKey {
            role: ArtistRole::Guest,
            ..main.clone()
        };
        assert_ne!(
            ArtistWithRole::index_key(&main),
            ArtistWithRole::index_key(&guest)
        );
    }

    #[test]
    fn track_references_include_optional_genre() {
        let mut track = Track {
            id: "t".to_string(),
            album_id: "al".to_string(),
            genre_id: None,
            audio_file_id: "f".to_string(),
            title: "x".to_string(),
            track_number: None,
            disc_number: None,
            duration_seconds: 0,
            comment: None,
            isrc: None,
        };
        assert_eq!(track.references().len(), 2);
        track.genre_id = Some("g".to_string());
        assert!(track
            .references()
            .contains(&(EntityKind::Genre, "g")));
    }
}
