use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::storage::SqliteStorage;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL relative request paths are resolved against
  pub origin: String,
  /// Database file (defaults to $XDG_DATA_HOME/fieldlink/fieldlink.db)
  pub database: Option<PathBuf>,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub network: NetworkConfig,
  pub features: FeaturesConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      database: None,
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
      network: NetworkConfig::default(),
      features: FeaturesConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Cache names are `{prefix}-static-{version}` and `{prefix}-dynamic-{version}`
  pub prefix: String,
  /// Cache generation. Derived from the manifest when unset.
  pub version: Option<String>,
  /// Paths prefetched into the static cache on install
  pub manifest: Vec<String>,
  #[serde(deserialize_with = "deserialize_extensions")]
  pub static_extensions: Vec<String>,
  pub api_prefixes: Vec<String>,
  /// Hostname fragments treated as API traffic (case-insensitive)
  pub api_hosts: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "field-smart-link".to_string(),
      version: None,
      manifest: [
        "/",
        "/index.html",
        "/manifest.json",
        "/favicon.ico",
        "/logo.svg",
        "/offline.html",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      static_extensions: [
        "js", "css", "png", "jpg", "jpeg", "gif", "svg", "ico", "woff", "woff2", "ttf", "eot",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      api_prefixes: ["/api/farms", "/api/crops", "/api/weather"]
        .into_iter()
        .map(String::from)
        .collect(),
      api_hosts: vec!["supabase.co".to_string()],
    }
  }
}

fn deserialize_extensions<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// How often the pending count is recomputed from storage
  pub poll_interval_secs: u64,
  /// Artificial latency of the simulated replay
  pub replay_delay_ms: u64,
  /// Consecutive failures on the same change before it is reported as blocking
  pub starvation_threshold: u32,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      poll_interval_secs: 30,
      replay_delay_ms: 100,
      starvation_threshold: 3,
    }
  }
}

impl SyncConfig {
  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs.max(1))
  }

  pub fn replay_delay(&self) -> Duration {
    Duration::from_millis(self.replay_delay_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_ms: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_ms: 30_000 }
  }
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
  /// When off, nothing is persisted and every cache lookup misses
  pub offline_mode: bool,
}

impl Default for FeaturesConfig {
  fn default() -> Self {
    Self { offline_mode: true }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldlink.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldlink/config.yaml
  ///
  /// Built-in defaults are used when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("fieldlink.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldlink").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.origin)
      .map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;

    if self.cache.prefix.trim().is_empty() {
      return Err(eyre!("cache.prefix must not be empty"));
    }

    Ok(())
  }

  /// Database location, honouring the `database` override.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(p) => Ok(p.clone()),
      None => SqliteStorage::default_path(),
    }
  }

  /// Directory for log files, next to the database.
  pub fn log_dir(&self) -> Result<PathBuf> {
    let db = self.database_path()?;
    Ok(
      db.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")),
    )
  }

  /// Get the API key sent to API hosts.
  ///
  /// Checks FIELDLINK_API_KEY. Requests go out unauthenticated when unset.
  pub fn get_api_key() -> Option<String> {
    std::env::var("FIELDLINK_API_KEY")
      .ok()
      .filter(|k| !k.trim().is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults_match_web_client() {
    let config = Config::default();
    assert_eq!(config.cache.manifest.len(), 6);
    assert!(config.cache.static_extensions.contains(&"woff2".to_string()));
    assert_eq!(config.network.timeout(), Duration::from_secs(30));
    assert!(config.features.offline_mode);
  }

  #[test]
  fn test_partial_file_keeps_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
      file,
      "origin: https://app.fieldlink.test\ncache:\n  version: v7\n  static_extensions: [\".JS\", css]\nsync:\n  starvation_threshold: 5\n"
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.origin, "https://app.fieldlink.test");
    assert_eq!(config.cache.version.as_deref(), Some("v7"));
    assert_eq!(config.cache.static_extensions, vec!["js", "css"]);
    assert_eq!(config.cache.prefix, "field-smart-link");
    assert_eq!(config.sync.starvation_threshold, 5);
    assert_eq!(config.sync.replay_delay_ms, 100);
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/fieldlink.yaml"))).is_err());
  }

  #[test]
  fn test_invalid_origin_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "origin: not a url").unwrap();
    assert!(Config::load(Some(file.path())).is_err());
  }
}
