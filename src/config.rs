use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{CachePolicy, ResourceType};

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api/v1/";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheConfig,
  pub session: SessionConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  pub timeout_secs: u64,
  /// Login email used when `login` is run without `--email`
  pub email: Option<String>,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: DEFAULT_API_URL.to_string(),
      timeout_secs: 30,
      email: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Maximum number of cached queries
  pub capacity: usize,
  pub default_ttl_secs: u64,
  /// Per-resource TTL overrides, keyed by resource name (e.g. `invoices`)
  pub ttl_secs: BTreeMap<String, u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      capacity: 256,
      default_ttl_secs: 60,
      ttl_secs: BTreeMap::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
  /// Keep the session across runs (sqlite under the data dir)
  pub persist: bool,
  /// Matches the server's access token lifetime
  pub token_lifetime_minutes: Option<i64>,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      persist: true,
      token_lifetime_minutes: Some(30),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter directive used when FLOWTO_LOG is unset
  pub level: String,
  /// Log directory (default: $XDG_DATA_HOME/flowto/logs)
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./flowto.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/flowto/config.yaml
  ///
  /// Without a file every setting takes its default. `FLOWTO_API_URL`
  /// overrides the API base URL either way.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(url) = std::env::var("FLOWTO_API_URL") {
      config.api.base_url = url;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("flowto.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("flowto").join("config.yaml");
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

  fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.api_url()?;
    if self.api.timeout_secs == 0 {
      return Err(eyre!("api.timeout_secs must be at least 1"));
    }
    self.cache_policy()?;
    Ok(())
  }

  pub fn api_url(&self) -> Result<Url> {
    Url::parse(&self.api.base_url)
      .map_err(|e| eyre!("Invalid API base URL '{}': {}", self.api.base_url, e))
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  pub fn cache_policy(&self) -> Result<CachePolicy> {
    let capacity = NonZeroUsize::new(self.cache.capacity)
      .ok_or_else(|| eyre!("cache.capacity must be at least 1"))?;

    let mut policy = CachePolicy {
      capacity,
      default_ttl: Duration::from_secs(self.cache.default_ttl_secs),
      ..CachePolicy::default()
    };
    for (name, secs) in &self.cache.ttl_secs {
      let resource = ResourceType::ALL
        .into_iter()
        .find(|r| r.as_str() == name)
        .ok_or_else(|| eyre!("Unknown resource '{}' in cache.ttl_secs", name))?;
      policy = policy.with_ttl(resource, Duration::from_secs(*secs));
    }
    Ok(policy)
  }

  pub fn token_lifetime(&self) -> Option<chrono::Duration> {
    self
      .session
      .token_lifetime_minutes
      .filter(|m| *m > 0)
      .map(chrono::Duration::minutes)
  }

  /// Get the login password from the environment.
  ///
  /// Checks FLOWTO_PASSWORD.
  pub fn get_password() -> Result<String> {
    std::env::var("FLOWTO_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set the FLOWTO_PASSWORD environment variable."))
  }
}
