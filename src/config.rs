//! Configuration for stepchain.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STEPCHAIN_HOME, STEPCHAIN_SNAPSHOTS)
//! 2. Config file (.stepchain/config.yaml)
//! 3. Defaults (~/.stepchain)
//!
//! Config file discovery:
//! - Searches current directory and parents for .stepchain/config.yaml
//! - Paths in config file are relative to the .stepchain/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory
    pub home: Option<String>,
    /// Snapshot directory (defaults to <home>/snapshots)
    pub snapshots: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to stepchain home
    pub home: PathBuf,
    /// Directory used by the file snapshot store
    pub snapshots: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Default retry settings
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    fn merge(config: Option<&RetryConfig>) -> Self {
        let defaults = Self::default();
        let Some(config) = config else {
            return defaults;
        };

        Self {
            max_attempts: config.max_attempts.unwrap_or(defaults.max_attempts),
            initial_delay_ms: config.initial_delay_ms.unwrap_or(defaults.initial_delay_ms),
            max_delay_ms: config.max_delay_ms.unwrap_or(defaults.max_delay_ms),
            backoff_multiplier: config
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".stepchain").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".stepchain");

    let config_file = find_config_file();

    let (home, snapshots, retry) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;
        let stepchain_dir = config_path.parent().unwrap_or(Path::new("."));

        let home = if let Ok(env_home) = std::env::var("STEPCHAIN_HOME") {
            PathBuf::from(env_home)
        } else if let Some(ref home_path) = config.paths.home {
            resolve_path(stepchain_dir, home_path)
        } else {
            default_home.clone()
        };

        let snapshots = if let Ok(env_snapshots) = std::env::var("STEPCHAIN_SNAPSHOTS") {
            PathBuf::from(env_snapshots)
        } else if let Some(ref snapshots_path) = config.paths.snapshots {
            resolve_path(stepchain_dir, snapshots_path)
        } else {
            home.join("snapshots")
        };

        let retry = RetrySettings::merge(config.retry.as_ref());

        (home, snapshots, retry)
    } else {
        let home = std::env::var("STEPCHAIN_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home.clone());

        let snapshots = std::env::var("STEPCHAIN_SNAPSHOTS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join("snapshots"));

        (home, snapshots, RetrySettings::default())
    };

    Ok(ResolvedConfig {
        home,
        snapshots,
        config_file,
        retry,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the stepchain home directory
pub fn stepchain_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the snapshot directory
pub fn snapshots_dir() -> Result<PathBuf> {
    Ok(config()?.snapshots.clone())
}

/// Get the default retry settings
pub fn retry_settings() -> Result<RetrySettings> {
    Ok(config()?.retry.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let stepchain_dir = temp.path().join(".stepchain");
        std::fs::create_dir_all(&stepchain_dir).unwrap();

        let config_path = stepchain_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./
  snapshots: ./checkpoints
retry:
  max_attempts: 5
  initial_delay_ms: 50
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.home, Some("./".to_string()));
        assert_eq!(config.paths.snapshots, Some("./checkpoints".to_string()));

        let retry = RetrySettings::merge(config.retry.as_ref());
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.initial_delay_ms, 50);
        // Unset fields fall back to defaults
        assert_eq!(retry.max_delay_ms, 5000);
        assert_eq!(retry.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_retry_defaults_without_section() {
        assert_eq!(RetrySettings::merge(None), RetrySettings::default());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
