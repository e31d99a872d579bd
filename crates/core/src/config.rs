use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::paths::Paths;

/// Where components are discovered and downloaded from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    #[serde(default = "default_org")]
    pub org: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_raw_base")]
    pub raw_base: String,
    #[serde(default = "default_web_base")]
    pub web_base: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Optional bearer token for the listing API (raises rate limits).
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Serve repositories from this directory instead of the network.
    #[serde(default)]
    pub local_dir: Option<PathBuf>,
}

fn default_org() -> String {
    "alfred-project".to_string()
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_raw_base() -> String {
    "https://raw.githubusercontent.com".to_string()
}

fn default_web_base() -> String {
    "https://github.com".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            org: default_org(),
            api_base: default_api_base(),
            raw_base: default_raw_base(),
            web_base: default_web_base(),
            branch: default_branch(),
            token: None,
            timeout_secs: default_timeout_secs(),
            local_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default = "default_sync_enabled")]
    pub enabled: bool,
    /// Local wall-clock time of the daily resync, "HH:MM".
    #[serde(default = "default_sync_time")]
    pub time: String,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    #[serde(default = "default_discovery_ttl_secs")]
    pub discovery_ttl_secs: u64,
}

fn default_sync_enabled() -> bool {
    true
}

fn default_sync_time() -> String {
    "03:00".to_string()
}

fn default_max_backups() -> usize {
    7
}

fn default_discovery_ttl_secs() -> u64 {
    3600
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_sync_enabled(),
            time: default_sync_time(),
            max_backups: default_max_backups(),
            discovery_ttl_secs: default_discovery_ttl_secs(),
        }
    }
}

impl SyncConfig {
    /// Parses `time` into (hour, minute).
    pub fn hour_minute(&self) -> Result<(u32, u32)> {
        let (h, m) = self
            .time
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("Invalid sync time '{}', expected HH:MM", self.time)))?;
        let hour: u32 = h
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("Invalid hour in sync time '{}'", self.time)))?;
        let minute: u32 = m
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("Invalid minute in sync time '{}'", self.time)))?;
        if hour > 23 || minute > 59 {
            return Err(Error::Config(format!("Sync time '{}' out of range", self.time)));
        }
        Ok((hour, minute))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub startup_modules: Vec<String>,
    #[serde(default)]
    pub startup_agents: Vec<String>,
    /// Per-component configuration, handed to start/initialize.
    #[serde(default)]
    pub components: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_name() -> String {
    "Alfred".to_string()
}

fn default_version() -> String {
    "0.1.0".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: default_version(),
            source: SourceConfig::default(),
            sync: SyncConfig::default(),
            startup_modules: Vec::new(),
            startup_agents: Vec::new(),
            components: HashMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Configuration for one component, or an empty object.
    pub fn component_config(&self, id: &str) -> serde_json::Value {
        self.components
            .get(id)
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_empty_object() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.source.org, "alfred-project");
        assert_eq!(cfg.source.branch, "main");
        assert_eq!(cfg.sync.time, "03:00");
        assert_eq!(cfg.sync.max_backups, 7);
        assert_eq!(cfg.sync.discovery_ttl_secs, 3600);
        assert!(cfg.startup_modules.is_empty());
    }

    #[test]
    fn test_camel_case_fields() {
        let raw = r#"{
  "source": { "org": "my-org", "apiBase": "http://localhost:9000" },
  "sync": { "time": "04:30", "maxBackups": 3 },
  "startupModules": ["geo"],
  "components": { "weather": { "units": "metric" } }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.source.org, "my-org");
        assert_eq!(cfg.source.api_base, "http://localhost:9000");
        assert_eq!(cfg.source.raw_base, "https://raw.githubusercontent.com");
        assert_eq!(cfg.sync.max_backups, 3);
        assert_eq!(cfg.sync.hour_minute().unwrap(), (4, 30));
        assert_eq!(cfg.startup_modules, vec!["geo".to_string()]);
        assert_eq!(cfg.component_config("weather")["units"], "metric");
        assert!(cfg.component_config("geo").as_object().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_sync_time() {
        let mut sync = SyncConfig::default();
        sync.time = "25:00".to_string();
        assert!(sync.hour_minute().is_err());
        sync.time = "noon".to_string();
        assert!(sync.hour_minute().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let paths = Paths::with_base(temp_dir.path().join("nested"));
        let mut cfg = Config::default();
        cfg.startup_agents.push("heartbeat".to_string());
        cfg.save(&paths.config_file()).unwrap();

        let loaded = Config::load_or_default(&paths).unwrap();
        assert_eq!(loaded.startup_agents, vec!["heartbeat".to_string()]);
    }
}
