//! Runtime configuration: `.trellis.toml` plus environment overrides

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::snapshot::{SNAPSHOT_FILE, STATE_DIR};

/// Config file looked up in the repository root.
pub const CONFIG_FILE: &str = ".trellis.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TrellisConfig {
    pub rename: RenameConfig,
    pub query: QueryConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
    pub watch: WatchConfig,
    pub secrets: SecretsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenameConfig {
    /// Minimum content similarity for two nodes to be treated as the same entity.
    pub similarity_threshold: f64,
    /// Treat equal qualified names as a match regardless of content.
    pub match_qualified_name: bool,
    /// How long removed nodes stay available for cross-batch rename matching.
    pub window_ms: u64,
    pub window_capacity: usize,
}

impl Default for RenameConfig {
    fn default() -> Self {
        RenameConfig {
            similarity_threshold: 0.7,
            match_qualified_name: true,
            window_ms: 2_000,
            window_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub max_page_size: usize,
    pub default_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            max_page_size: 500,
            default_limit: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub snapshot_path: PathBuf,
    /// Save a snapshot after indexing and on shutdown.
    pub autosave: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            snapshot_path: PathBuf::from(STATE_DIR).join(SNAPSHOT_FILE),
            autosave: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 7890,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub debounce_ms: u64,
    pub ignore_dirs: Vec<String>,
    /// Glob patterns excluded from scans and watch events.
    pub ignore_globs: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            debounce_ms: 150,
            ignore_dirs: ["target", ".git", "node_modules", "__pycache__", STATE_DIR]
                .into_iter()
                .map(String::from)
                .collect(),
            ignore_globs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    pub mask: bool,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        SecretsConfig { mask: true }
    }
}

impl TrellisConfig {
    /// Load `<root>/.trellis.toml` (if present), then apply `TRELLIS_*` overrides.
    ///
    /// A `.env` file in the root is loaded into the process environment first.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let _ = dotenvy::from_path(root.join(".env"));

        let path = root.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            Self::from_toml_str(&text)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        tracing::debug!("Loaded configuration for {}", root.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(host) = lookup("TRELLIS_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("TRELLIS_PORT") {
            self.server.port = parse_env("TRELLIS_PORT", &port)?;
        }
        if let Some(path) = lookup("TRELLIS_SNAPSHOT") {
            self.storage.snapshot_path = PathBuf::from(path);
        }
        if let Some(threshold) = lookup("TRELLIS_RENAME_THRESHOLD") {
            self.rename.similarity_threshold = parse_env("TRELLIS_RENAME_THRESHOLD", &threshold)?;
        }
        if let Some(size) = lookup("TRELLIS_MAX_PAGE_SIZE") {
            self.query.max_page_size = parse_env("TRELLIS_MAX_PAGE_SIZE", &size)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.rename.similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(invalid("rename.similarity_threshold", "must be within 0.0..=1.0"));
        }
        if self.query.max_page_size == 0 {
            return Err(invalid("query.max_page_size", "must be greater than zero"));
        }
        if self.query.default_limit == 0 || self.query.default_limit > self.query.max_page_size {
            return Err(invalid("query.default_limit", "must be within 1..=max_page_size"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(key, &format!("cannot parse `{}`", value)))
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
