mod artwork;
mod config;
mod search;
mod state;
mod watch;
mod worker;

use std::sync::Arc;

use artwork::FsArtworkService;
use config::{config_path_from_env, load_or_create_config, resolve_path};
use library::{
    job_queue, EmbeddingJob, Orchestrator, ScanJob, ScanTrigger, Services, Store,
};
use metadata::LoftyReader;
use parking_lot::{Mutex, RwLock};
use search::StoreSearch;
use state::AppState;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use watch::configure_watcher;
use worker::{run_embedding_worker, run_scan_worker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }

    let index_path = resolve_path(&config_path, &config.index_path);
    if let Some(parent) = index_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = Store::open(&index_path)?;
    let counts = store.counts()?;
    info!(
        "Opened catalog at {}: {} libraries, {} albums, {} tracks",
        index_path.display(),
        counts.libraries,
        counts.albums,
        counts.tracks
    );

    let artwork_root = resolve_path(&config_path, &config.artwork_path);
    std::fs::create_dir_all(&artwork_root)?;

    let (embed_tx, embed_rx) = job_queue::<EmbeddingJob>();
    let (scan_tx, scan_rx) = job_queue::<ScanJob>();
    let services = Services::new(Arc::new(LoftyReader))
        .with_artwork(Arc::new(FsArtworkService::new(artwork_root)))
        .with_search(Arc::new(StoreSearch::new(store.clone())))
        .with_embeddings(embed_tx);
    let orchestrator = Orchestrator::new(store.clone(), services, config.index_options());

    let shutdown = CancellationToken::new();
    let state = AppState {
        config: Arc::new(RwLock::new(config.clone())),
        orchestrator: Arc::new(orchestrator),
        scans: scan_tx,
        watchers: Arc::new(Mutex::new(Vec::new())),
        shutdown: shutdown.clone(),
    };

    let scan_worker = tokio::spawn(run_scan_worker(state.clone(), scan_rx));
    let embedding_worker = tokio::spawn(run_embedding_worker(
        store.clone(),
        embed_rx,
        shutdown.clone(),
    ));

    if config.libraries.is_empty() {
        info!("No libraries configured; add one under `libraries` in {:?}", config_path);
    }
    for entry in &config.libraries {
        let root = resolve_path(&config_path, &entry.path);
        if !root.is_dir() {
            warn!("Library {} is missing; skipping", root.display());
            continue;
        }
        let library = store.ensure_library(&root, entry.watch)?;
        let job = if library.last_scan.is_none() {
            ScanJob::full(&library.id, ScanTrigger::LibraryAdded)
        } else {
            ScanJob::incremental(&library.id, None, ScanTrigger::Scheduled)
        };
        state.request_scan(job)?;
        if entry.watch {
            configure_watcher(&state, &library, root);
        } else {
            info!("Watcher disabled for {}", root.display());
        }
    }

    shutdown_signal().await;
    shutdown.cancel();
    state.watchers.lock().clear();
    if let Err(err) = scan_worker.await {
        warn!("Scan worker join error: {}", err);
    }
    if let Err(err) = embedding_worker.await {
        warn!("Embedding worker join error: {}", err);
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
}
