use std::path::Path;
use std::thread;
use std::time::Duration;

use lofty::error::{ErrorKind, LoftyError};
use lofty::file::FileType;
use lofty::picture::{Picture, PictureType};
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};
use tracing::{error, warn};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct AudioTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub track_number: Option<u16>,
    pub track_total: Option<u16>,
    pub disc_number: Option<u16>,
    pub disc_total: Option<u16>,
    pub year: Option<i32>,
    pub duration_seconds: u32,
    pub codec: String,
    pub bitrate: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub bit_depth: Option<u8>,
    pub isrc: Option<String>,
    pub comment: Option<String>,
    pub label: Option<String>,
    pub catalog_number: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CoverArt {
    pub data: Vec<u8>,
    pub mime: Option<String>,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
}

impl MetadataError {
    /// Errors worth retrying: the file may be readable on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            MetadataError::Io(_) => true,
            MetadataError::Lofty(err) => matches!(err.kind(), ErrorKind::Io(_)),
        }
    }
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

/// Source of per-file tag and stream information.
pub trait MetadataReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<AudioTags, MetadataError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoftyReader;

impl MetadataReader for LoftyReader {
    fn read(&self, path: &Path) -> Result<AudioTags, MetadataError> {
        read_tags(path)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay after the n-th failure is `step * n`.
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            step: Duration::from_millis(100),
        }
    }
}

pub fn read_with_retry(
    reader: &dyn MetadataReader,
    path: &Path,
    policy: RetryPolicy,
) -> Result<AudioTags, MetadataError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match reader.read(path) {
            Ok(tags) => return Ok(tags),
            Err(err) if err.is_transient() && attempt < attempts => {
                warn!(
                    "Failed to read {:?} (attempt {}/{}): {}",
                    path, attempt, attempts, err
                );
                thread::sleep(policy.step * attempt);
                attempt += 1;
            }
            Err(err) => {
                error!("Failed to read {:?} after {} attempts: {}", path, attempt, err);
                return Err(err);
            }
        }
    }
}

pub fn read_tags(path: &Path) -> Result<AudioTags, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let properties = tagged_file.properties();

    let mut tags = AudioTags {
        codec: codec_name(tagged_file.file_type()).to_string(),
        ..AudioTags::default()
    };

    let seconds = properties.duration().as_secs();
    tags.duration_seconds = seconds.min(u64::from(u32::MAX)) as u32;
    tags.sample_rate = properties.sample_rate();
    tags.channels = properties.channels();
    tags.bit_depth = properties.bit_depth();
    tags.bitrate = properties.audio_bitrate().or(properties.overall_bitrate());

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        tags.title = tag.get_string(&ItemKey::TrackTitle).and_then(clean_text);
        tags.album = tag.get_string(&ItemKey::AlbumTitle).and_then(clean_text);
        let album_artist = tag.get_string(&ItemKey::AlbumArtist).and_then(clean_text);
        let track_artist = tag.get_string(&ItemKey::TrackArtist).and_then(clean_text);
        tags.artist = track_artist.or(album_artist);

        if let Some((number, total)) = tag.get_string(&ItemKey::TrackNumber).and_then(parse_pair) {
            tags.track_number = Some(number);
            tags.track_total = total;
        }
        if tags.track_total.is_none() {
            tags.track_total = tag.get_string(&ItemKey::TrackTotal).and_then(parse_u16);
        }
        if let Some((number, total)) = tag.get_string(&ItemKey::DiscNumber).and_then(parse_pair) {
            tags.disc_number = Some(number);
            tags.disc_total = total;
        }
        if tags.disc_total.is_none() {
            tags.disc_total = tag.get_string(&ItemKey::DiscTotal).and_then(parse_u16);
        }

        tags.year = tag
            .get_string(&ItemKey::Year)
            .or_else(|| tag.get_string(&ItemKey::RecordingDate))
            .and_then(parse_year);
        tags.genre = tag.get_string(&ItemKey::Genre).and_then(primary_genre);
        tags.comment = tag.get_string(&ItemKey::Comment).and_then(clean_text);
        tags.isrc = tag.get_string(&ItemKey::Isrc).and_then(clean_text);
        tags.label = tag.get_string(&ItemKey::Label).and_then(clean_text);
        tags.catalog_number = tag.get_string(&ItemKey::CatalogNumber).and_then(clean_text);
    }

    Ok(tags)
}

pub fn read_cover(path: &Path) -> Result<Option<CoverArt>, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let tag = match tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        Some(tag) => tag,
        None => return Ok(None),
    };

    let picture = match pick_picture(tag.pictures()) {
        Some(picture) => picture,
        None => return Ok(None),
    };

    let data = picture.data().to_vec();
    let mime = guess_mime(&data);
    Ok(Some(CoverArt { data, mime }))
}

fn codec_name(file_type: FileType) -> &'static str {
    match file_type {
        FileType::Flac => "flac",
        FileType::Mpeg => "mp3",
        FileType::Mp4 => "m4a",
        FileType::Opus => "opus",
        FileType::Vorbis => "vorbis",
        FileType::Wav => "wav",
        FileType::Aiff => "aiff",
        FileType::Aac => "aac",
        FileType::Ape => "ape",
        FileType::WavPack => "wavpack",
        FileType::Speex => "speex",
        _ => "unknown",
    }
}

fn clean_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_u16(text: &str) -> Option<u16> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok()
}

/// "3/12" -> (3, Some(12)); "3" -> (3, None).
fn parse_pair(text: &str) -> Option<(u16, Option<u16>)> {
    let mut parts = text.splitn(2, '/');
    let number = parts.next()?.trim().parse().ok()?;
    let total = parts.next().and_then(|rest| rest.trim().parse().ok());
    Some((number, total))
}

fn parse_year(text: &str) -> Option<i32> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 4 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn primary_genre(text: &str) -> Option<String> {
    text.split(&[';', ',', '/', '|', '\0'][..])
        .map(str::trim)
        .find(|part| !part.is_empty())
        .map(|part| part.to_string())
}

fn pick_picture(pictures: &[Picture]) -> Option<&Picture> {
    for picture in pictures {
        if picture.pic_type() == PictureType::CoverFront {
            return Some(picture);
        }
    }
    pictures.first()
}

fn guess_mime(bytes: &[u8]) -> Option<String> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg".to_string())
    } else if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        Some("image/png".to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyReader {
        failures: u32,
        calls: AtomicU32,
    }

    impl MetadataReader for FlakyReader {
        fn read(&self, _path: &Path) -> Result<AudioTags, MetadataError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                let err = std::io::Error::new(std::io::ErrorKind::Interrupted, "busy");
                return Err(MetadataError::Io(err));
            }
            Ok(AudioTags {
                title: Some("ok".to_string()),
                ..AudioTags::default()
            })
        }
    }

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            step: Duration::from_millis(0),
        }
    }

    #[test]
    fn parses_number_with_total() {
        assert_eq!(parse_pair("3/12"), Some((3, Some(12))));
        assert_eq!(parse_pair(" 7 "), Some((7, None)));
        assert_eq!(parse_pair("x/2"), None);
        assert_eq!(parse_u16("04/10"), Some(4));
    }

    #[test]
    fn parses_year_prefix() {
        assert_eq!(parse_year("2019-04-01"), Some(2019));
        assert_eq!(parse_year("unknown"), None);
    }

    #[test]
    fn takes_first_genre() {
        assert_eq!(primary_genre("Techno; House"), Some("Techno".to_string()));
        assert_eq!(primary_genre(" ; "), None);
    }

    #[test]
    fn retries_until_read_succeeds() {
        let reader = FlakyReader {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let tags = read_with_retry(&reader, Path::new("/a.flac"), quick(5)).unwrap();
        assert_eq!(tags.title.as_deref(), Some("ok"));
        assert_eq!(reader.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn gives_up_after_bounded_attempts() {
        let reader = FlakyReader {
            failures: 10,
            calls: AtomicU32::new(0),
        };
        assert!(read_with_retry(&reader, Path::new("/a.flac"), quick(3)).is_err());
        assert_eq!(reader.calls.load(Ordering::SeqCst), 3);
    }
}
