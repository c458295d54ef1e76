use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use library::{IndexOptions, Orchestrator, ScanMode, Services, Store};
use metadata::LoftyReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut incremental = false;
    let mut positional = Vec::new();
    for arg in env::args().skip(1) {
        if arg == "--incremental" {
            incremental = true;
        } else {
            positional.push(arg);
        }
    }
    let mut positional = positional.into_iter();
    let music_root = positional
        .next()
        .or_else(|| env::var("MUSIC_ROOT").ok())
        .ok_or("MUSIC_ROOT not set and no path argument")?;
    let index_path = positional
        .next()
        .or_else(|| env::var("INDEX_PATH").ok())
        .unwrap_or_else(|| "data/catalog.redb".to_string());

    let index_path = PathBuf::from(index_path);
    if let Some(parent) = index_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = Store::open(&index_path)?;
    let library = store.ensure_library(&PathBuf::from(&music_root), false)?;
    let mode = if incremental && library.last_scan.is_some() {
        ScanMode::Incremental
    } else {
        ScanMode::Full
    };
    info!("Scanning {} into {}", library.path, index_path.display());

    let orchestrator = Orchestrator::new(
        store,
        Services::new(Arc::new(LoftyReader)),
        IndexOptions::default(),
    );
    let report = orchestrator.scan(&library.id, mode)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    let counts = orchestrator.store().counts()?;
    println!(
        "Indexed: {} artists, {} albums, {} tracks",
        counts.artists, counts.albums, counts.tracks
    );
    Ok(())
}
