mod cache;
mod heuristics;
mod indexer;
mod jobs;
mod locks;
mod orchestrator;
mod records;
mod reconcile;
mod scanner;
mod services;
mod store;
mod writer;

#[cfg(test)]
mod testing;

pub use cache::{PendingBatch, ResolutionCache};
pub use heuristics::{parse_featuring, parse_remixers, parse_track_artists, split_artists, ParsedArtists};
pub use indexer::{AlbumTypePolicy, DefaultAlbumTypes};
pub use jobs::{job_queue, EmbeddingJob, JobReceiver, JobSender, ScanJob, ScanTrigger};
pub use locks::{PrunePermit, ScanGuard, ScanLocks};
pub use orchestrator::{IndexOptions, Orchestrator, ScanReport, ScanRequest, ScanState, ScanStream};
pub use records::{
    AlbumKey, ArtistKey, ArtistRoleKey, AudioFileKey, AudioProfileKey, CatalogRecord, EntityKind,
    GenreKey, LabelKey, LibraryKey, RelationKind, Relationship, TrackKey,
};
pub use reconcile::{OrphanReconciler, ReconcileStats};
pub use scanner::{DirectoryGroup, DirectoryScanner, ScanMode};
pub use services::{ArtworkService, NoArtwork, NoSearch, SearchService, Services};
pub use store::{AlbumDetails, CatalogCounts, Store, TrackDetails};
pub use writer::{BulkWriter, FlushStats};

#[derive(Debug)]
pub enum LibraryError {
    Io(std::io::Error),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
    KeyParse(String),
    SchemaVersion(u32),
    DuplicateKey { kind: EntityKind, key: String },
    MissingReference { kind: EntityKind, id: String },
    InvalidEntity(String),
    LibraryNotFound(String),
    QueueClosed,
}

impl std::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::Io(err) => write!(f, "io error: {}", err),
            LibraryError::Redb(err) => write!(f, "db error: {}", err),
            LibraryError::Bincode(err) => write!(f, "bincode error: {}", err),
            LibraryError::KeyParse(value) => write!(f, "key parse error: {}", value),
            LibraryError::SchemaVersion(version) => {
                write!(f, "index schema version mismatch: {}", version)
            }
            LibraryError::DuplicateKey { kind, key } => {
                write!(f, "duplicate {} for natural key {:?}", kind.name(), key)
            }
            LibraryError::MissingReference { kind, id } => {
                write!(f, "reference to unwritten {} {}", kind.name(), id)
            }
            LibraryError::InvalidEntity(message) => write!(f, "invalid entity: {}", message),
            LibraryError::LibraryNotFound(id) => write!(f, "library not found: {}", id),
            LibraryError::QueueClosed => write!(f, "job queue closed"),
        }
    }
}

impl std::error::Error for LibraryError {}

impl From<std::io::Error> for LibraryError {
    fn from(err: std::io::Error) -> Self {
        LibraryError::Io(err)
    }
}

impl From<redb::Error> for LibraryError {
    fn from(err: redb::Error) -> Self {
        LibraryError::Redb(err)
    }
}

impl From<redb::DatabaseError> for LibraryError {
    fn from(err: redb::DatabaseError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<redb::TableError> for LibraryError {
    fn from(err: redb::TableError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<redb::TransactionError> for LibraryError {
    fn from(err: redb::TransactionError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<redb::StorageError> for LibraryError {
    fn from(err: redb::StorageError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<redb::CommitError> for LibraryError {
    fn from(err: redb::CommitError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for LibraryError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        LibraryError::Bincode(err)
    }
}
