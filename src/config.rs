//! Configuration for oprelay runs.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (OPRELAY_MODE, OPRELAY_LOG, OPRELAY_DEFAULT_PREFIX)
//! 2. Config file (.oprelay/config.yaml)
//! 3. Defaults (library mode, `info` logging, `ref` prefix)
//!
//! Config file discovery:
//! - Searches the starting directory and its parents for .oprelay/config.yaml
//! - Falls back to ~/.oprelay/config.yaml
//!
//! Nothing is cached globally; the resolved config is handed to
//! `RunContext::from_config`.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::Connection;
use crate::core::registry::DEFAULT_PREFIX;
use crate::domain::Mode;

const CONFIG_DIR: &str = ".oprelay";
const CONFIG_FILE: &str = "config.yaml";

pub const ENV_MODE: &str = "OPRELAY_MODE";
pub const ENV_LOG: &str = "OPRELAY_LOG";
pub const ENV_DEFAULT_PREFIX: &str = "OPRELAY_DEFAULT_PREFIX";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub default_prefix: Option<String>,
    #[serde(default)]
    pub show_errors: Option<bool>,
    #[serde(default)]
    pub connection: Option<Connection>,
}

/// Resolved configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayConfig {
    pub mode: Mode,
    /// Fallback tracing filter when RUST_LOG is unset
    pub log_level: String,
    /// Prefix for literal payloads registered without one
    pub default_prefix: String,
    /// Write display-to-user errors to the user channel (interactive only)
    pub show_errors: bool,
    pub connection: Option<Connection>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Library,
            log_level: "info".to_string(),
            default_prefix: DEFAULT_PREFIX.to_string(),
            show_errors: true,
            connection: None,
            config_file: None,
        }
    }
}

impl RelayConfig {
    /// Load from the current directory and the process environment
    pub fn load() -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        Self::load_from(&cwd)
    }

    /// Load starting the config file search at `start`
    pub fn load_from(start: &Path) -> Result<Self> {
        let config_file = find_config_file(start);
        let file = match &config_file {
            Some(path) => Some(load_config_file(path)?),
            None => None,
        };

        let mut config = resolve(file, |key| std::env::var(key).ok())?;
        config.config_file = config_file;
        Ok(config)
    }
}

/// Merge a parsed file and environment lookups over the defaults
pub fn resolve(file: Option<ConfigFile>, env: impl Fn(&str) -> Option<String>) -> Result<RelayConfig> {
    let mut config = RelayConfig::default();

    if let Some(file) = file {
        if let Some(mode) = file.mode {
            config.mode = mode;
        }
        if let Some(level) = file.log_level {
            config.log_level = level;
        }
        if let Some(prefix) = file.default_prefix {
            config.default_prefix = prefix;
        }
        if let Some(show) = file.show_errors {
            config.show_errors = show;
        }
        config.connection = file.connection;
    }

    if let Some(mode) = env(ENV_MODE) {
        config.mode = mode
            .parse()
            .map_err(|e: String| anyhow!(e))
            .with_context(|| format!("Invalid {}", ENV_MODE))?;
    }
    if let Some(level) = env(ENV_LOG) {
        config.log_level = level;
    }
    if let Some(prefix) = env(ENV_DEFAULT_PREFIX) {
        config.default_prefix = prefix;
    }

    if config.default_prefix.is_empty() {
        anyhow::bail!("default_prefix must not be empty");
    }
    Ok(config)
}

/// Find config file by searching `start` and its parents, then the home directory
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    dirs::home_dir()
        .map(|home| home.join(CONFIG_DIR).join(CONFIG_FILE))
        .filter(|path| path.exists())
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file_or_env() {
        let config = resolve(None, no_env).unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.default_prefix, "ref");
        assert_eq!(config.mode, Mode::Library);
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(".oprelay");
        std::fs::create_dir_all(&dir).unwrap();

        let config_path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1"
mode: interactive
log_level: debug
show_errors: false
connection:
  alias: dev
  api_version: "59.0"
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        assert_eq!(parsed.mode, Some(Mode::Interactive));
        assert_eq!(parsed.connection.as_ref().unwrap().alias, "dev");

        let config = resolve(Some(parsed), no_env).unwrap();
        assert!(config.mode.is_interactive());
        assert_eq!(config.log_level, "debug");
        assert!(!config.show_errors);
        assert_eq!(
            config.connection.unwrap().api_version.as_deref(),
            Some("59.0")
        );
    }

    #[test]
    fn test_discovery_walks_up_parents() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(".oprelay");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.yaml"), "default_prefix: rec\n").unwrap();

        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config_file(&nested), Some(dir.join("config.yaml")));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = ConfigFile {
            mode: Some(Mode::Interactive),
            default_prefix: Some("rec".into()),
            ..Default::default()
        };
        let env: HashMap<&str, &str> = [(ENV_MODE, "library"), (ENV_DEFAULT_PREFIX, "item")]
            .into_iter()
            .collect();

        let config = resolve(Some(file), |key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.mode, Mode::Library);
        assert_eq!(config.default_prefix, "item");
    }

    #[test]
    fn test_invalid_env_mode_is_rejected() {
        let err = resolve(None, |key| (key == ENV_MODE).then(|| "batch".to_string())).unwrap_err();
        assert!(err.to_string().contains(ENV_MODE));
    }

    #[test]
    fn test_empty_prefix_is_rejected() {
        let file = ConfigFile {
            default_prefix: Some(String::new()),
            ..Default::default()
        };
        assert!(resolve(Some(file), no_env).is_err());
    }
}
