use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use redb::WriteTransaction;
use serde::Serialize;
use tracing::{debug, info};

use crate::cache::PendingBatch;
use crate::records::{CatalogRecord, EntityKind, RelationKind};
use crate::store::{self, Store};
use crate::LibraryError;

/// Counts from one flush.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FlushStats {
    pub inserted: BTreeMap<EntityKind, usize>,
    pub updated: BTreeMap<EntityKind, usize>,
    pub relationships: BTreeMap<RelationKind, usize>,
    pub elapsed_ms: u64,
}

impl FlushStats {
    pub fn entities_inserted(&self) -> usize {
        self.inserted.values().sum()
    }

    /// New albums, artists and tracks; the entities a listener browses.
    pub fn catalog_entities_inserted(&self) -> usize {
        [EntityKind::Album, EntityKind::Artist, EntityKind::Track]
            .iter()
            .filter_map(|kind| self.inserted.get(kind))
            .sum()
    }

    pub fn entities_updated(&self) -> usize {
        self.updated.values().sum()
    }

    pub fn relationships_written(&self) -> usize {
        self.relationships.values().sum()
    }

    pub fn entities_per_sec(&self) -> f64 {
        let entities = (self.entities_inserted() + self.entities_updated()) as f64;
        if self.elapsed_ms == 0 {
            return entities * 1000.0;
        }
        entities * 1000.0 / self.elapsed_ms as f64
    }

    pub fn log_summary(&self) {
        info!(
            "Flushed {} new ({} catalog) and {} updated entities plus {} relationships in {} ms ({:.0} entities/sec)",
            self.entities_inserted(),
            self.catalog_entities_inserted(),
            self.entities_updated(),
            self.relationships_written(),
            self.elapsed_ms,
            self.entities_per_sec()
        );
        for (kind, count) in &self.inserted {
            debug!("  inserted {} {}", count, kind.name());
        }
        for (kind, count) in &self.updated {
            debug!("  updated {} {}", count, kind.name());
        }
    }
}

/// Persists a [`PendingBatch`] in a single write transaction. Either the whole
/// batch commits or nothing does.
pub struct BulkWriter<'a> {
    store: &'a Store,
}

impl<'a> BulkWriter<'a> {
    pub fn new(store: &'a Store) -> Self {
        BulkWriter { store }
    }

    /// Writes referenced types before the types that point at them, then the
    /// relationship rows. The batch is cleared only after the commit.
    pub fn flush(&self, batch: &mut PendingBatch) -> Result<FlushStats, LibraryError> {
        let started = Instant::now();
        let mut stats = FlushStats::default();
        if batch.is_empty() {
            debug!("Nothing to flush");
            return Ok(stats);
        }

        let txn = self.store.begin_write()?;
        insert_kind(&txn, &batch.genres, &mut stats)?;
        insert_kind(&txn, &batch.artists, &mut stats)?;
        insert_kind(&txn, &batch.artist_roles, &mut stats)?;
        insert_kind(&txn, &batch.labels, &mut stats)?;
        insert_kind(&txn, &batch.audio_metadata, &mut stats)?;
        insert_kind(&txn, &batch.audio_files, &mut stats)?;
        update_audio_files(&txn, batch, &mut stats)?;
        insert_kind(&txn, &batch.albums, &mut stats)?;
        insert_kind(&txn, &batch.tracks, &mut stats)?;
        for track in &batch.tracks {
            store::link_album_track(&txn, &track.album_id, &track.id)?;
        }
        update_tracks(&txn, batch, &mut stats)?;
        write_relationships(&txn, batch, &mut stats)?;
        txn.commit()?;

        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        stats.log_summary();
        batch.clear();
        Ok(stats)
    }
}

fn insert_kind<R: CatalogRecord>(
    txn: &WriteTransaction,
    records: &[Arc<R>],
    stats: &mut FlushStats,
) -> Result<(), LibraryError> {
    if records.is_empty() {
        return Ok(());
    }
    store::check_references(txn, records.iter().flat_map(|record| record.references()))?;
    let inserted = store::insert_records(txn, records)?;
    stats.inserted.insert(R::KIND, inserted);
    Ok(())
}

fn update_audio_files(
    txn: &WriteTransaction,
    batch: &PendingBatch,
    stats: &mut FlushStats,
) -> Result<(), LibraryError> {
    let files = &batch.audio_file_updates;
    if files.is_empty() {
        return Ok(());
    }
    store::check_references(txn, files.iter().flat_map(|file| file.references()))?;
    store::replace_records(txn, files)?;
    stats.updated.insert(EntityKind::AudioFile, files.len());
    Ok(())
}

/// Rewrites changed tracks, moving their album index entry and dropping their
/// previous artist edges so the batch's edges replace them.
fn update_tracks(
    txn: &WriteTransaction,
    batch: &PendingBatch,
    stats: &mut FlushStats,
) -> Result<(), LibraryError> {
    let tracks = &batch.track_updates;
    if tracks.is_empty() {
        return Ok(());
    }
    store::check_references(txn, tracks.iter().flat_map(|track| track.references()))?;
    let previous = store::replace_records(txn, tracks)?;
    for (track, old) in tracks.iter().zip(previous) {
        if let Some(old) = old {
            if old.album_id != track.album_id {
                store::unlink_album_track(txn, &old.album_id, &track.id)?;
            }
        }
        store::link_album_track(txn, &track.album_id, &track.id)?;
        store::clear_track_artists(txn, &track.id)?;
    }
    stats.updated.insert(EntityKind::Track, tracks.len());
    Ok(())
}

fn write_relationships(
    txn: &WriteTransaction,
    batch: &PendingBatch,
    stats: &mut FlushStats,
) -> Result<(), LibraryError> {
    if batch.relationships.is_empty() {
        return Ok(());
    }
    store::check_references(
        txn,
        batch.relationships.iter().flat_map(|edge| {
            [
                (edge.kind.parent_kind(), edge.parent_id.as_str()),
                (EntityKind::ArtistRole, edge.child_id.as_str()),
            ]
        }),
    )?;
    for edge in &batch.relationships {
        if store::link(txn, edge.kind, &edge.parent_id, &edge.child_id, edge.position)? {
            *stats.relationships.entry(edge.kind).or_insert(0) += 1;
        }
    }
    Ok(())
}
