use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct Held {
    libraries: HashSet<String>,
    pruning: bool,
}

#[derive(Default)]
struct LockState {
    held: Mutex<Held>,
    released: Condvar,
}

/// One scan at a time per library. Scans of different libraries run
/// concurrently, except while a catalog-wide prune is in progress.
#[derive(Clone, Default)]
pub struct ScanLocks {
    state: Arc<LockState>,
}

impl ScanLocks {
    pub fn new() -> Self {
        ScanLocks::default()
    }

    /// Blocks until no other scan holds `library_id` and no prune runs.
    pub fn acquire(&self, library_id: &str) -> ScanGuard {
        let mut held = self.state.held.lock();
        while held.pruning || held.libraries.contains(library_id) {
            self.state.released.wait(&mut held);
        }
        held.libraries.insert(library_id.to_string());
        ScanGuard {
            state: Arc::clone(&self.state),
            library_id: library_id.to_string(),
        }
    }

    pub fn try_acquire(&self, library_id: &str) -> Option<ScanGuard> {
        let mut held = self.state.held.lock();
        if held.pruning || !held.libraries.insert(library_id.to_string()) {
            return None;
        }
        Some(ScanGuard {
            state: Arc::clone(&self.state),
            library_id: library_id.to_string(),
        })
    }

    pub fn is_held(&self, library_id: &str) -> bool {
        self.state.held.lock().libraries.contains(library_id)
    }
}

/// Releases the library lock on drop.
pub struct ScanGuard {
    state: Arc<LockState>,
    library_id: String,
}

impl ScanGuard {
    pub fn library_id(&self) -> &str {
        &self.library_id
    }

    /// Grants catalog-wide pruning when this is the only open scan. Other
    /// scans may hold entities resolved from the store, so pruning under
    /// them could delete rows their pending batch references. New scans
    /// wait until the returned permit is dropped.
    pub fn exclusive(&self) -> Option<PrunePermit> {
        let mut held = self.state.held.lock();
        if held.pruning || held.libraries.len() != 1 {
            return None;
        }
        held.pruning = true;
        Some(PrunePermit {
            state: Arc::clone(&self.state),
        })
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.state.held.lock().libraries.remove(&self.library_id);
        self.state.released.notify_all();
    }
}

/// Held while orphaned albums, roles and artists are deleted.
pub struct PrunePermit {
    state: Arc<LockState>,
}

impl Drop for PrunePermit {
    fn drop(&mut self) {
        self.state.held.lock().pruning = false;
        self.state.released.notify_all();
    }
}
