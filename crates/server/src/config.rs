use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use library::IndexOptions;
use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub path: String,
    pub watch: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            watch: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub version: u32,
    pub index_path: String,
    pub artwork_path: String,
    pub libraries: Vec<LibraryConfig>,
    pub watch_debounce_secs: u64,
    pub read_retries: u32,
    pub read_backoff_ms: u64,
    pub incremental_watch_scans: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            index_path: "catalog.redb".to_string(),
            artwork_path: "artwork".to_string(),
            libraries: Vec::new(),
            watch_debounce_secs: 2,
            read_retries: 10,
            read_backoff_ms: 100,
            incremental_watch_scans: true,
        }
    }
}

impl IndexerConfig {
    pub fn index_options(&self) -> IndexOptions {
        let attempts = if self.read_retries == 0 {
            1
        } else {
            self.read_retries
        };
        IndexOptions::new(attempts, Duration::from_millis(self.read_backoff_ms))
    }

    pub fn watch_debounce(&self) -> Duration {
        let secs = if self.watch_debounce_secs == 0 {
            2
        } else {
            self.watch_debounce_secs
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("INDEXER_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(IndexerConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: IndexerConfig = serde_yaml::from_str(&contents)?;
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        if config.index_path.trim().is_empty() {
            config.index_path = "catalog.redb".to_string();
        }
        if config.artwork_path.trim().is_empty() {
            config.artwork_path = "artwork".to_string();
        }
        config.libraries.retain(|library| !library.path.trim().is_empty());
        return Ok((config, false));
    }

    let config = IndexerConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &IndexerConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value.trim());
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("conf").join("config.yaml");
        let (config, created) = load_or_create_config(&path).expect("load");
        assert!(created);
        assert_eq!(config, IndexerConfig::default());
        assert!(path.exists());

        let (reloaded, created) = load_or_create_config(&path).expect("reload");
        assert!(!created);
        assert_eq!(reloaded, config);
    }

    #[test]
    fn partial_file_is_filled_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "version: 0\nindex_path: ''\nlibraries:\n  - path: /music\n  - path: ''\n    watch: false\nread_retries: 3\n",
        )
        .expect("write");
        let (config, created) = load_or_create_config(&path).expect("load");
        assert!(!created);
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.index_path, "catalog.redb");
        assert_eq!(config.read_retries, 3);
        assert_eq!(config.read_backoff_ms, 100);
        assert_eq!(
            config.libraries,
            vec![LibraryConfig {
                path: "/music".to_string(),
                watch: true,
            }]
        );
    }

    #[test]
    fn relative_paths_resolve_next_to_config() {
        let config_path = Path::new("/etc/indexer/config.yaml");
        assert_eq!(
            resolve_path(config_path, "catalog.redb"),
            PathBuf::from("/etc/indexer/catalog.redb")
        );
        assert_eq!(
            resolve_path(config_path, "/var/lib/art"),
            PathBuf::from("/var/lib/art")
        );
        assert_eq!(
            resolve_path(Path::new("config.yaml"), "art"),
            PathBuf::from("./art")
        );
    }

    #[test]
    fn zero_settings_fall_back() {
        let config = IndexerConfig {
            read_retries: 0,
            watch_debounce_secs: 0,
            ..IndexerConfig::default()
        };
        assert_eq!(config.index_options().retry.attempts, 1);
        assert_eq!(config.watch_debounce(), Duration::from_secs(2));
    }
}
