use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use crate::LibraryError;

/// Why a scan was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanTrigger {
    Manual,
    LibraryAdded,
    Scheduled,
    FileSystemEvent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanJob {
    pub library_id: String,
    /// Restricts the walk to one directory inside the library.
    pub directory: Option<PathBuf>,
    pub incremental: bool,
    pub request_id: Option<String>,
    pub trigger: ScanTrigger,
}

impl ScanJob {
    pub fn full(library_id: &str, trigger: ScanTrigger) -> Self {
        ScanJob {
            library_id: library_id.to_string(),
            directory: None,
            incremental: false,
            request_id: None,
            trigger,
        }
    }

    pub fn incremental(library_id: &str, directory: Option<PathBuf>, trigger: ScanTrigger) -> Self {
        ScanJob {
            library_id: library_id.to_string(),
            directory,
            incremental: true,
            request_id: None,
            trigger,
        }
    }
}

/// Asks the embedding worker to compute or store a vector for a track.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingJob {
    pub track_id: String,
    pub embedding: Option<Vec<f32>>,
}

pub struct JobSender<T> {
    tx: UnboundedSender<T>,
}

impl<T> Clone for JobSender<T> {
    fn clone(&self) -> Self {
        JobSender {
            tx: self.tx.clone(),
        }
    }
}

impl<T> JobSender<T> {
    pub fn send(&self, job: T) -> Result<(), LibraryError> {
        self.tx.send(job).map_err(|_| LibraryError::QueueClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct JobReceiver<T> {
    rx: UnboundedReceiver<T>,
}

impl<T> JobReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Returns `None` when the queue is empty or closed.
    pub fn try_recv(&mut self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(job) => Some(job),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Unbounded queue; jobs are consumed in order by a single worker.
pub fn job_queue<T>() -> (JobSender<T>, JobReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (JobSender { tx }, JobReceiver { rx })
}
