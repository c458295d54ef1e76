use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use common::{content_id, new_id, path_string, Album, Artwork, ArtworkPath, ArtworkSize};
use image::{ImageFormat, ImageReader};
use library::ArtworkService;
use tracing::debug;

/// Keeps album covers as files under one directory. Embedded pictures are
/// extracted next to them so every cover has an on-disk source.
pub struct FsArtworkService {
    root: PathBuf,
}

impl FsArtworkService {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn covers_dir(&self) -> PathBuf {
        self.root.join("covers")
    }

    fn embedded_dir(&self) -> PathBuf {
        self.root.join("embedded")
    }
}

impl ArtworkService for FsArtworkService {
    fn extract_embedded(&self, audio_path: &Path) -> Result<Option<PathBuf>, String> {
        let cover = match metadata::read_cover(audio_path)
            .map_err(|e| format!("failed to read embedded cover: {}", e))?
        {
            Some(cover) => cover,
            None => return Ok(None),
        };
        let ext = cover
            .mime
            .as_deref()
            .and_then(image_ext_from_mime)
            .or_else(|| sniff_ext(&cover.data))
            .unwrap_or("jpg");
        let dir = self.embedded_dir();
        fs::create_dir_all(&dir).map_err(|e| e.to_string())?;
        let path = dir.join(format!("{}.{}", content_id(&cover.data), ext));
        if !path.exists() {
            fs::write(&path, &cover.data).map_err(|e| e.to_string())?;
        }
        Ok(Some(path))
    }

    fn process(&self, album: &Album, source: &Path) -> Result<Option<Artwork>, String> {
        let data = fs::read(source)
            .map_err(|e| format!("failed to read cover {}: {}", source.display(), e))?;
        if data.is_empty() {
            return Ok(None);
        }
        let ext = sniff_ext(&data)
            .or_else(|| source.extension().and_then(|ext| ext.to_str()))
            .unwrap_or("jpg")
            .to_ascii_lowercase();
        let hash = content_id(&data);
        let dir = self.covers_dir();
        fs::create_dir_all(&dir).map_err(|e| e.to_string())?;
        let path = dir.join(format!("{}-{}.{}", album.id, &hash[..16], ext));
        fs::write(&path, &data).map_err(|e| e.to_string())?;
        let (width, height) = image_dimensions(&data).unwrap_or((0, 0));
        debug!("Stored cover for album {} at {}", album.id, path.display());
        Ok(Some(Artwork {
            id: new_id(),
            album_id: album.id.clone(),
            paths: vec![ArtworkPath {
                size: ArtworkSize::Original,
                width,
                height,
                path: path_string(&path),
            }],
            colors: Vec::new(),
        }))
    }

    fn delete(&self, artwork: &Artwork) -> Result<(), String> {
        for entry in &artwork.paths {
            let path = Path::new(&entry.path);
            if !path.starts_with(&self.root) {
                continue;
            }
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(format!("failed to remove {}: {}", path.display(), err)),
            }
        }
        Ok(())
    }
}

fn image_ext_from_mime(mime: &str) -> Option<&'static str> {
    match mime {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        _ => None,
    }
}

fn sniff_ext(data: &[u8]) -> Option<&'static str> {
    match image::guess_format(data).ok()? {
        ImageFormat::Png => Some("png"),
        ImageFormat::Jpeg => Some("jpg"),
        _ => None,
    }
}

/// Width and height read from the image header without decoding pixels.
fn image_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}
