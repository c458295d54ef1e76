use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

pub const AUDIO_EXTENSIONS: &[&str] = &[
    "flac", "mp3", "mp2", "wav", "m4a", "ogg", "alac", "aif", "opus",
];

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "png"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusicLibrary {
    pub id: String,
    pub path: String,
    /// Unix millis of the last scan that ran to completion.
    pub last_scan: Option<u64>,
    pub watch_for_changes: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFile {
    pub id: String,
    pub library_id: String,
    pub metadata_id: String,
    pub path: String,
    pub size: u64,
    pub modified: u64,
}

/// Technical profile of an encoded stream, shared by every file with the
/// same (codec, bitrate, sample rate).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioMetadata {
    pub id: String,
    pub codec: String,
    pub bitrate: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub bit_depth: Option<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genre {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtistRole {
    Main,
    Guest,
    Remixer,
}

impl ArtistRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtistRole::Main => "main",
            ArtistRole::Guest => "guest",
            ArtistRole::Remixer => "remixer",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistWithRole {
    pub id: String,
    pub artist_id: String,
    pub role: ArtistRole,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLabel {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlbumType {
    Single,
    Ep,
    MiniAlbum,
    Album,
    Compilation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub name: String,
    pub release_year: Option<i32>,
    pub disc_total: Option<u16>,
    pub track_total: Option<u16>,
    pub catalog_number: Option<String>,
    pub label_id: Option<String>,
    pub album_type: AlbumType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub album_id: String,
    pub genre_id: Option<String>,
    pub audio_file_id: String,
    pub title: String,
    pub track_number: Option<u16>,
    pub disc_number: Option<u16>,
    pub duration_seconds: u32,
    pub comment: Option<String>,
    pub isrc: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtworkSize {
    Small,
    Medium,
    Original,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtworkPath {
    pub size: ArtworkSize,
    pub width: u32,
    pub height: u32,
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artwork {
    pub id: String,
    pub album_id: String,
    pub paths: Vec<ArtworkPath>,
    pub colors: Vec<String>,
}

impl Artwork {
    pub fn path(&self, size: ArtworkSize) -> Option<&str> {
        self.paths
            .iter()
            .find(|entry| entry.size == size)
            .map(|entry| entry.path.as_str())
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn content_id(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

pub fn now_millis() -> u64 {
    system_time_millis(SystemTime::now())
}

pub fn system_time_millis(time: SystemTime) -> u64 {
    let since = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    since.as_millis().min(u128::from(u64::MAX)) as u64
}

pub fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

pub fn is_audio_file(path: &Path) -> bool {
    has_extension(path, AUDIO_EXTENSIONS)
}

pub fn is_image_file(path: &Path) -> bool {
    has_extension(path, IMAGE_EXTENSIONS)
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    let ext = match path.extension() {
        Some(ext) => ext.to_string_lossy().to_ascii_lowercase(),
        None => return false,
    };
    allowed.iter().any(|candidate| *candidate == ext)
}
