use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub app: AppConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Backend tables and the local partitions that mirror them
  #[serde(default = "default_resources")]
  pub resources: Vec<ResourceConfig>,
  #[serde(default)]
  pub location: LocationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base URL of the hosted backend (e.g. "https://xyz.supabase.co")
  pub url: String,
  #[serde(default = "default_backend_timeout")]
  pub timeout_secs: u64,
}

fn default_backend_timeout() -> u64 {
  15
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
  /// Origin the application is served from
  pub origin: String,
  /// Where local databases, the HTTP cache and logs live
  pub data_dir: Option<PathBuf>,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      origin: "http://localhost:5173".to_string(),
      data_dir: None,
    }
  }
}

impl AppConfig {
  /// Resolve the data directory ($XDG_DATA_HOME/sanur unless configured).
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("sanur"))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Cache generation; bump on every deployment to retire old caches
  pub generation: u32,
  /// URL fragments of backend GETs whose responses may be cached
  pub api_allow_list: Vec<String>,
  /// URL fragments identifying map tile servers
  pub tile_patterns: Vec<String>,
  /// Hosts treated as backend APIs besides the backend itself
  pub api_hosts: Vec<String>,
  /// Foreign hosts whose requests are still intercepted
  pub trusted_hosts: Vec<String>,
  /// Paths precached into the critical cache at install
  pub critical_assets: Vec<String>,
  /// Paths precached into the dynamic cache at install (map assets)
  pub precache_dynamic: Vec<String>,
  pub shell_path: String,
  pub offline_path: String,
  /// Activate right after install instead of waiting for SKIP_WAITING
  pub auto_activate: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      generation: 1,
      api_allow_list: vec![
        "supabase.co/auth/v1/user".to_string(),
        "supabase.co/rest/v1/user_profiles".to_string(),
        "nominatim.openstreetmap.org/reverse".to_string(),
      ],
      tile_patterns: vec![
        "tile.openstreetmap.org".to_string(),
        "google.com/vt/".to_string(),
        "maptiler.com".to_string(),
      ],
      api_hosts: vec!["nominatim.openstreetmap.org".to_string()],
      trusted_hosts: vec![
        "tile.openstreetmap.org".to_string(),
        "google.com".to_string(),
        "maptiler.com".to_string(),
      ],
      critical_assets: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/manifest.json".to_string(),
        "/offline.html".to_string(),
      ],
      precache_dynamic: vec![
        "/leaflet.css".to_string(),
        "/marker-icon.png".to_string(),
        "/marker-icon-2x.png".to_string(),
        "/marker-shadow.png".to_string(),
      ],
      shell_path: "/index.html".to_string(),
      offline_path: "/offline.html".to_string(),
      auto_activate: true,
    }
  }
}

/// What to do with a mutation the backend keeps rejecting.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedPolicy {
  /// Keep it pending and retry on every pass
  #[default]
  Retain,
  /// Drop it from the queue
  Discard,
  /// Move it to the dead-letter partition for the UI to surface
  DeadLetter,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Keep confirmed mutations (flagged synced) instead of deleting them
  pub retain_synced: bool,
  /// Rejections allowed before `on_exhausted` applies; unlimited when unset
  pub max_attempts: Option<u32>,
  pub on_exhausted: ExhaustedPolicy,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ResourceConfig {
  /// Backend table name
  pub name: String,
  /// Column identifying a row for updates and deletes
  #[serde(default = "default_key_column")]
  pub key_column: String,
  /// Local partition mirroring rows of this table
  pub partition: Option<String>,
}

fn default_key_column() -> String {
  "id".to_string()
}

fn default_resources() -> Vec<ResourceConfig> {
  vec![ResourceConfig {
    name: "user_profiles".to_string(),
    key_column: "user_id".to_string(),
    partition: Some("profile".to_string()),
  }]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
  pub geolocation_timeout_ms: u64,
  pub reverse_geocode_timeout_ms: u64,
  pub reverse_geocode_url: String,
}

impl Default for LocationConfig {
  fn default() -> Self {
    Self {
      geolocation_timeout_ms: 5_000,
      reverse_geocode_timeout_ms: 10_000,
      reverse_geocode_url: "https://nominatim.openstreetmap.org/reverse".to_string(),
    }
  }
}

impl Config {
  /// Configuration with defaults for everything but the backend URL.
  pub fn with_backend(url: &str) -> Self {
    Self {
      backend: BackendConfig {
        url: url.to_string(),
        timeout_secs: default_backend_timeout(),
      },
      app: AppConfig::default(),
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
      resources: default_resources(),
      location: LocationConfig::default(),
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./sanur.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/sanur/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/sanur/config.yaml\n\
                 with at least a `backend.url` entry."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("sanur.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("sanur").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Look up the binding for a backend table.
  pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
    self.resources.iter().find(|r| r.name == name)
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks SANUR_BACKEND_KEY first, then SUPABASE_ANON_KEY as fallback.
  /// Requests go out unauthenticated when neither is set.
  pub fn api_key() -> Option<String> {
    std::env::var("SANUR_BACKEND_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .ok()
  }
}
