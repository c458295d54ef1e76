use library::{SearchService, Store, TrackDetails};

/// Writes one lowercase text blob per track into the catalog's search table.
pub struct StoreSearch {
    store: Store,
}

impl StoreSearch {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl SearchService for StoreSearch {
    fn insert_tracks(&self, tracks: &[TrackDetails]) -> Result<usize, String> {
        let entries: Vec<(String, String)> = tracks
            .iter()
            .map(|details| (details.track.id.clone(), search_text(details)))
            .collect();
        self.store
            .put_search_text(&entries)
            .map_err(|e| e.to_string())
    }
}

fn search_text(details: &TrackDetails) -> String {
    let mut parts: Vec<&str> = vec![details.track.title.as_str()];
    for (artist, _) in &details.artists {
        parts.push(&artist.name);
    }
    if let Some(album) = &details.album {
        parts.push(&album.name);
    }
    if let Some(genre) = &details.genre {
        parts.push(&genre.name);
    }
    let mut text = String::new();
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(&part.to_lowercase());
    }
    text
}
