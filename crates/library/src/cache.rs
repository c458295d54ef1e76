use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use common::{
    new_id, Album, Artist, ArtistWithRole, AudioFile, AudioMetadata, Genre, RecordLabel, Track,
};

use crate::records::{CatalogRecord, RelationKind, Relationship};
use crate::store::Store;
use crate::LibraryError;

/// Entities and edges created or changed during a scan and not yet written.
/// One list per entity type plus one list of relationship edges.
#[derive(Debug, Default)]
pub struct PendingBatch {
    pub(crate) genres: Vec<Arc<Genre>>,
    pub(crate) artists: Vec<Arc<Artist>>,
    pub(crate) artist_roles: Vec<Arc<ArtistWithRole>>,
    pub(crate) labels: Vec<Arc<RecordLabel>>,
    pub(crate) audio_metadata: Vec<Arc<AudioMetadata>>,
    pub(crate) audio_files: Vec<Arc<AudioFile>>,
    pub(crate) albums: Vec<Arc<Album>>,
    pub(crate) tracks: Vec<Arc<Track>>,
    pub(crate) audio_file_updates: Vec<AudioFile>,
    pub(crate) track_updates: Vec<Track>,
    pub(crate) relationships: Vec<Relationship>,
    edge_keys: HashSet<(RelationKind, String, String)>,
    edge_positions: HashMap<(RelationKind, String), u32>,
}

impl PendingBatch {
    pub fn entity_count(&self) -> usize {
        self.genres.len()
            + self.artists.len()
            + self.artist_roles.len()
            + self.labels.len()
            + self.audio_metadata.len()
            + self.audio_files.len()
            + self.albums.len()
            + self.tracks.len()
            + self.audio_file_updates.len()
            + self.track_updates.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_count() == 0 && self.relationships.is_empty()
    }

    pub fn clear(&mut self) {
        *self = PendingBatch::default();
    }

    /// Registers an edge once per (kind, parent, child).
    /// Continues numbering after edges already stored for `parent_id`.
    fn seed_position(&mut self, kind: RelationKind, parent_id: &str, next: u32) {
        self.edge_positions
            .entry((kind, parent_id.to_string()))
            .or_insert(next);
    }

    fn has_positions(&self, kind: RelationKind, parent_id: &str) -> bool {
        self.edge_positions
            .contains_key(&(kind, parent_id.to_string()))
    }

    pub(crate) fn add_relationship(&mut self, kind: RelationKind, parent_id: &str, child_id: &str) {
        let key = (kind, parent_id.to_string(), child_id.to_string());
        if !self.edge_keys.insert(key) {
            return;
        }
        let next = self
            .edge_positions
            .entry((kind, parent_id.to_string()))
            .or_insert(0);
        let position = *next;
        *next += 1;
        self.relationships.push(Relationship {
            kind,
            parent_id: parent_id.to_string(),
            child_id: child_id.to_string(),
            position,
        });
    }
}

/// Binds an entity type to its cache slot and pending list.
pub(crate) trait Pending: CatalogRecord {
    fn slot(cache: &mut ResolutionCache) -> &mut HashMap<Self::Key, Arc<Self>>;
    fn pending(batch: &mut PendingBatch) -> &mut Vec<Arc<Self>>;
}

macro_rules! pending_slot {
    ($ty:ty, $field:ident) => {
        impl Pending for $ty {
            fn slot(cache: &mut ResolutionCache) -> &mut HashMap<Self::Key, Arc<Self>> {
                &mut cache.slots.$field
            }

            fn pending(batch: &mut PendingBatch) -> &mut Vec<Arc<Self>> {
                &mut batch.$field
            }
        }
    };
}

pending_slot!(Genre, genres);
pending_slot!(Artist, artists);
pending_slot!(ArtistWithRole, artist_roles);
pending_slot!(RecordLabel, labels);
pending_slot!(AudioMetadata, audio_metadata);
pending_slot!(AudioFile, audio_files);
pending_slot!(Album, albums);
pending_slot!(Track, tracks);

#[derive(Default)]
struct Slots {
    genres: HashMap<<Genre as CatalogRecord>::Key, Arc<Genre>>,
    artists: HashMap<<Artist as CatalogRecord>::Key, Arc<Artist>>,
    artist_roles: HashMap<<ArtistWithRole as CatalogRecord>::Key, Arc<ArtistWithRole>>,
    labels: HashMap<<RecordLabel as CatalogRecord>::Key, Arc<RecordLabel>>,
    audio_metadata: HashMap<<AudioMetadata as CatalogRecord>::Key, Arc<AudioMetadata>>,
    audio_files: HashMap<<AudioFile as CatalogRecord>::Key, Arc<AudioFile>>,
    albums: HashMap<<Album as CatalogRecord>::Key, Arc<Album>>,
    tracks: HashMap<<Track as CatalogRecord>::Key, Arc<Track>>,
}

/// Per-scan identity map. Resolving a natural key twice yields the same
/// entity, whether it came from this scan or from the store.
pub struct ResolutionCache {
    store: Store,
    slots: Slots,
    created: HashSet<String>,
    batch: PendingBatch,
}

impl ResolutionCache {
    pub fn new(store: Store) -> Self {
        ResolutionCache {
            store,
            slots: Slots::default(),
            created: HashSet::new(),
            batch: PendingBatch::default(),
        }
    }

    /// Returns the entity for `key`, looking in memory, then the store, and
    /// finally building it with `factory`. The factory receives the new
    /// identifier. A failing factory leaves the cache untouched.
    pub(crate) fn resolve<R, F>(&mut self, key: R::Key, factory: F) -> Result<Arc<R>, LibraryError>
    where
        R: Pending,
        F: FnOnce(String) -> Result<R, LibraryError>,
    {
        if let Some(found) = R::slot(self).get(&key) {
            return Ok(Arc::clone(found));
        }
        if let Some(stored) = self.store.find::<R>(&key)? {
            let stored = Arc::new(stored);
            R::slot(self).insert(key, Arc::clone(&stored));
            return Ok(stored);
        }
        let entity = factory(new_id())?;
        if entity.natural_key() != key {
            return Err(LibraryError::InvalidEntity(format!(
                "{} built for {:?} has key {:?}",
                R::KIND.name(),
                key,
                entity.natural_key()
            )));
        }
        let entity = Arc::new(entity);
        self.created.insert(entity.id().to_string());
        R::slot(self).insert(key, Arc::clone(&entity));
        R::pending(&mut self.batch).push(Arc::clone(&entity));
        Ok(entity)
    }

    /// True when the entity was created during this scan.
    pub fn is_new(&self, id: &str) -> bool {
        self.created.contains(id)
    }

    /// Queues a changed version of an already persisted audio file.
    pub(crate) fn update_audio_file(&mut self, file: AudioFile) -> Arc<AudioFile> {
        let file = Arc::new(file);
        self.slots
            .audio_files
            .insert(file.natural_key(), Arc::clone(&file));
        self.batch.audio_file_updates.push(file.as_ref().clone());
        file
    }

    /// Queues a changed version of an already persisted track. Its artist
    /// edges are rewritten from whatever this scan registers.
    pub(crate) fn update_track(&mut self, track: Track) -> Arc<Track> {
        let track = Arc::new(track);
        self.slots.tracks.insert(track.natural_key(), Arc::clone(&track));
        self.batch.track_updates.push(track.as_ref().clone());
        track
    }

    /// Stored albums keep their artist edges, so new ones are numbered
    /// after them. Track artist edges of updated tracks are rewritten from
    /// scratch at flush and start over.
    pub(crate) fn add_relationship(
        &mut self,
        kind: RelationKind,
        parent_id: &str,
        child_id: &str,
    ) -> Result<(), LibraryError> {
        if kind == RelationKind::AlbumArtist
            && !self.is_new(parent_id)
            && !self.batch.has_positions(kind, parent_id)
        {
            let next = self.store.next_position(kind, parent_id)?;
            self.batch.seed_position(kind, parent_id, next);
        }
        self.batch.add_relationship(kind, parent_id, child_id);
        Ok(())
    }

    pub fn batch(&self) -> &PendingBatch {
        &self.batch
    }

    pub(crate) fn batch_mut(&mut self) -> &mut PendingBatch {
        &mut self.batch
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{ArtistKey, GenreKey};

    fn cache() -> (tempfile::TempDir, ResolutionCache) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("index.redb")).expect("open store");
        (dir, ResolutionCache::new(store))
    }

    fn genre_key(name: &str) -> GenreKey {
        GenreKey {
            name: name.to_string(),
        }
    }

    #[test]
    fn resolving_twice_returns_the_same_entity() {
        let (_dir, mut cache) = cache();
        let first = cache
            .resolve::<Genre, _>(genre_key("Jazz"), |id| {
                Ok(Genre {
                    id,
                    name: "Jazz".to_string(),
                })
            })
            .expect("first");
        let second = cache
            .resolve::<Genre, _>(genre_key("Jazz"), |_| panic!("factory must not run twice"))
            .expect("second");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(cache.is_new(&first.id));
        assert_eq!(cache.batch().genres.len(), 1);
    }

    #[test]
    fn stored_entities_are_reused_without_queueing() {
        let (_dir, mut cache) = cache();
        let stored = Artist {
            id: new_id(),
            name: "Nina Simone".to_string(),
        };
        cache.store().put(&stored).expect("put");

        let resolved = cache
            .resolve::<Artist, _>(
                ArtistKey {
                    name: "Nina Simone".to_string(),
                },
                |_| panic!("stored artist must be reused"),
            )
            .expect("resolve");
        assert_eq!(resolved.id, stored.id);
        assert!(!cache.is_new(&stored.id));
        assert!(cache.batch().is_empty());
    }

    #[test]
    fn failing_factory_leaves_cache_clean() {
        let (_dir, mut cache) = cache();
        let err = cache
            .resolve::<Genre, _>(genre_key("Broken"), |_| {
                Err(LibraryError::InvalidEntity("no name".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, LibraryError::InvalidEntity(_)));
        assert!(cache.batch().is_empty());

        let recovered = cache
            .resolve::<Genre, _>(genre_key("Broken"), |id| {
                Ok(Genre {
                    id,
                    name: "Broken".to_string(),
                })
            })
            .expect("retry");
        assert_eq!(recovered.name, "Broken");
        assert_eq!(cache.batch().genres.len(), 1);
    }

    #[test]
    fn factory_must_match_requested_key() {
        let (_dir, mut cache) = cache();
        let err = cache
            .resolve::<Genre, _>(genre_key("Rock"), |id| {
                Ok(Genre {
                    id,
                    name: "Pop".to_string(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, LibraryError::InvalidEntity(_)));
        assert!(cache.batch().is_empty());
    }

    #[test]
    fn relationships_are_deduplicated_and_positioned() {
        let mut batch = PendingBatch::default();
        batch.add_relationship(RelationKind::TrackArtist, "t1", "r1");
        batch.add_relationship(RelationKind::TrackArtist, "t1", "r2");
        batch.add_relationship(RelationKind::TrackArtist, "t1", "r1");
        batch.add_relationship(RelationKind::AlbumArtist, "t1", "r1");
        assert_eq!(batch.relationship_count(), 3);
        let positions: Vec<u32> = batch
            .relationships
            .iter()
            .filter(|edge| edge.kind == RelationKind::TrackArtist)
            .map(|edge| edge.position)
            .collect();
        assert_eq!(positions, vec![0, 1]);
    }

    #[test]
    fn stored_album_edges_continue_numbering() {
        let (_dir, mut cache) = cache();
        let txn = cache.store().begin_write().expect("txn");
        crate::store::link(&txn, RelationKind::AlbumArtist, "album-1", "r0", 0).expect("link");
        txn.commit().expect("commit");

        cache
            .add_relationship(RelationKind::AlbumArtist, "album-1", "r1")
            .expect("edge");
        cache
            .add_relationship(RelationKind::AlbumArtist, "album-1", "r2")
            .expect("edge");
        cache
            .add_relationship(RelationKind::TrackArtist, "track-1", "r1")
            .expect("edge");
        let positions: Vec<(RelationKind, u32)> = cache
            .batch()
            .relationships
            .iter()
            .map(|edge| (edge.kind, edge.position))
            .collect();
        assert_eq!(
            positions,
            vec![
                (RelationKind::AlbumArtist, 1),
                (RelationKind::AlbumArtist, 2),
                (RelationKind::TrackArtist, 0),
            ]
        );
    }
}
