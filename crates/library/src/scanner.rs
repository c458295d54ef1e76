use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use common::{is_audio_file, path_string, system_time_millis, MusicLibrary};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::store::Store;
use crate::LibraryError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Every file whose stored modification time differs.
    Full,
    /// Only files touched since the library's last completed scan.
    Incremental,
}

/// Audio files sharing a parent directory, sorted by path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryGroup {
    pub directory: PathBuf,
    pub files: Vec<PathBuf>,
}

impl DirectoryGroup {
    /// Directory name used when an album carries no album tag.
    pub fn name(&self) -> Option<String> {
        self.directory
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
    }
}

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    modified: u64,
    created: Option<u64>,
}

pub struct DirectoryScanner<'a> {
    store: &'a Store,
}

impl<'a> DirectoryScanner<'a> {
    pub fn new(store: &'a Store) -> Self {
        DirectoryScanner { store }
    }

    /// Files the scan would index, grouped by directory.
    pub fn scan(
        &self,
        library: &MusicLibrary,
        mode: ScanMode,
        within: Option<&Path>,
    ) -> Result<Vec<DirectoryGroup>, LibraryError> {
        let selected = self.select(library, mode, within)?;
        let mut groups: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
        for path in selected {
            let directory = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(&library.path));
            groups.entry(directory).or_default().push(path);
        }
        let groups: Vec<DirectoryGroup> = groups
            .into_iter()
            .map(|(directory, mut files)| {
                files.sort();
                DirectoryGroup { directory, files }
            })
            .collect();
        info!(
            "Scan of {} ({:?}) selected {} directories",
            library.path,
            mode,
            groups.len()
        );
        Ok(groups)
    }

    /// Number of files a scan in `mode` would pick up.
    pub fn count_files(&self, library: &MusicLibrary, mode: ScanMode) -> Result<usize, LibraryError> {
        Ok(self.select(library, mode, None)?.len())
    }

    fn select(
        &self,
        library: &MusicLibrary,
        mode: ScanMode,
        within: Option<&Path>,
    ) -> Result<Vec<PathBuf>, LibraryError> {
        let root = PathBuf::from(&library.path);
        let start = match within {
            Some(dir) if dir.starts_with(&root) => dir.to_path_buf(),
            Some(dir) => {
                warn!(
                    "Directory {} is outside library {}; nothing to scan",
                    dir.display(),
                    library.path
                );
                return Ok(Vec::new());
            }
            None => root,
        };
        let candidates = collect_candidates(&start);

        let selected = match mode {
            ScanMode::Full => {
                let known: HashMap<String, u64> = self
                    .store
                    .audio_files_in_library(&library.id)?
                    .into_iter()
                    .map(|file| (file.path, file.modified))
                    .collect();
                candidates
                    .into_iter()
                    .filter(|candidate| {
                        known.get(&path_string(&candidate.path)) != Some(&candidate.modified)
                    })
                    .map(|candidate| candidate.path)
                    .collect()
            }
            ScanMode::Incremental => match library.last_scan {
                None => candidates.into_iter().map(|c| c.path).collect(),
                Some(last_scan) => candidates
                    .into_iter()
                    .filter(|candidate| {
                        candidate.modified > last_scan
                            || candidate.created.map(|c| c > last_scan).unwrap_or(false)
                    })
                    .map(|candidate| candidate.path)
                    .collect(),
            },
        };
        Ok(selected)
    }
}

fn collect_candidates(root: &Path) -> Vec<Candidate> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Skipping unreadable entry under {}: {}", root.display(), err);
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_audio_file(entry.path()) {
            continue;
        }
        let meta = match fs::metadata(entry.path()) {
            Ok(meta) => meta,
            Err(err) => {
                warn!("Failed to stat {}: {}", entry.path().display(), err);
                continue;
            }
        };
        let modified = match meta.modified() {
            Ok(time) => system_time_millis(time),
            Err(err) => {
                debug!("No modification time for {}: {}", entry.path().display(), err);
                0
            }
        };
        out.push(Candidate {
            path: entry.into_path(),
            modified,
            created: meta.created().ok().map(system_time_millis),
        });
    }
    out
}
