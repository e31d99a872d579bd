use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Kind of a distributable component.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Passive unit with initialize/cleanup.
    Module,
    /// Autonomous unit with start/stop.
    Agent,
    /// Contributes code and capabilities only.
    Provider,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 3] = [ComponentKind::Module, ComponentKind::Agent, ComponentKind::Provider];

    /// Repository name prefix used on the remote source, e.g. `alfred-agent-`.
    pub fn repo_prefix(&self) -> &'static str {
        match self {
            ComponentKind::Module => "alfred-module-",
            ComponentKind::Agent => "alfred-agent-",
            ComponentKind::Provider => "alfred-provider-",
        }
    }

    /// Splits `alfred-{kind}-{id}` into its kind and id.
    pub fn parse_repo_name(repo: &str) -> Option<(ComponentKind, String)> {
        Self::ALL.iter().find_map(|kind| {
            repo.strip_prefix(kind.repo_prefix())
                .filter(|id| !id.is_empty())
                .map(|id| (*kind, id.to_string()))
        })
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentKind::Module => write!(f, "module"),
            ComponentKind::Agent => write!(f, "agent"),
            ComponentKind::Provider => write!(f, "provider"),
        }
    }
}

impl std::str::FromStr for ComponentKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "module" => Ok(ComponentKind::Module),
            "agent" => Ok(ComponentKind::Agent),
            "provider" => Ok(ComponentKind::Provider),
            other => Err(crate::Error::Validation(format!("Unknown component kind: {}", other))),
        }
    }
}

fn default_component_version() -> String {
    "0.1.0".to_string()
}

fn default_category() -> String {
    "general".to_string()
}

/// Contents of a component repository's `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentMetadata {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_component_version")]
    pub version: String,
    #[serde(default, alias = "component_type")]
    pub kind: Option<ComponentKind>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default = "default_category")]
    pub category: String,
}

impl ComponentMetadata {
    /// Metadata for a fresh component skeleton.
    pub fn scaffold(id: &str, kind: ComponentKind, name: &str, description: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            name: Some(name.to_string()),
            description: description.to_string(),
            version: default_component_version(),
            kind: Some(kind),
            dependencies: Vec::new(),
            provides: Vec::new(),
            category: default_category(),
        }
    }
}

/// One entry of the persisted registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_component_version")]
    pub version: String,
    #[serde(alias = "component_type")]
    pub kind: ComponentKind,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,

    #[serde(default)]
    pub locally_available: bool,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    /// Version present in the local cache.
    #[serde(default)]
    pub local_version: Option<String>,
    #[serde(default)]
    pub download_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fallback_used: bool,
    #[serde(default)]
    pub fallback_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub from_backup: bool,
}

impl ComponentRecord {
    pub fn new(id: &str, kind: ComponentKind) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            version: default_component_version(),
            kind,
            dependencies: Vec::new(),
            provides: Vec::new(),
            category: default_category(),
            repo_url: None,
            last_updated: None,
            locally_available: false,
            local_path: None,
            local_version: None,
            download_time: None,
            fallback_used: false,
            fallback_time: None,
            from_backup: false,
        }
    }

    /// Builds a record from repository metadata. `kind` comes from the
    /// repository name and wins over any kind declared in the metadata.
    pub fn from_metadata(id: &str, kind: ComponentKind, repo: &str, meta: ComponentMetadata) -> Self {
        let mut record = Self::new(id, kind);
        record.name = meta.name.unwrap_or_else(|| repo.to_string());
        record.description = meta.description;
        record.version = meta.version;
        record.dependencies = meta.dependencies;
        record.provides = meta.provides;
        record.category = meta.category;
        record
    }

    /// Replaces the descriptive fields with `remote`, keeping local cache state.
    pub fn merge_remote(&mut self, remote: ComponentRecord) {
        let local = std::mem::replace(self, remote);
        self.locally_available = local.locally_available;
        self.local_path = local.local_path;
        self.local_version = local.local_version;
        self.download_time = local.download_time;
        self.fallback_used = local.fallback_used;
        self.fallback_time = local.fallback_time;
    }

    /// True when the cache is missing or holds a different version.
    pub fn needs_update(&self) -> bool {
        !self.locally_available || self.local_version.as_deref() != Some(self.version.as_str())
    }
}

/// The persisted catalogue of known components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Registry {
    #[serde(default)]
    pub components: BTreeMap<String, ComponentRecord>,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default, alias = "github_org")]
    pub source_org: String,
}

impl Registry {
    pub fn new(source_org: &str) -> Self {
        Self {
            components: BTreeMap::new(),
            last_sync: None,
            source_org: source_org.to_string(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ComponentRecord> {
        self.components.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.components.contains_key(id)
    }

    pub fn is_locally_available(&self, id: &str) -> bool {
        self.components.get(id).map(|c| c.locally_available).unwrap_or(false)
    }

    /// Inserts a discovered record, keeping any local state already tracked for it.
    pub fn upsert_remote(&mut self, record: ComponentRecord) {
        match self.components.get_mut(&record.id) {
            Some(existing) => existing.merge_remote(record),
            None => {
                self.components.insert(record.id.clone(), record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repo_name() {
        assert_eq!(
            ComponentKind::parse_repo_name("alfred-agent-weather"),
            Some((ComponentKind::Agent, "weather".to_string()))
        );
        assert_eq!(
            ComponentKind::parse_repo_name("alfred-module-home-assistant"),
            Some((ComponentKind::Module, "home-assistant".to_string()))
        );
        assert_eq!(
            ComponentKind::parse_repo_name("alfred-provider-geo"),
            Some((ComponentKind::Provider, "geo".to_string()))
        );
        assert_eq!(ComponentKind::parse_repo_name("alfred-agent-"), None);
        assert_eq!(ComponentKind::parse_repo_name("alfred-core"), None);
        assert_eq!(ComponentKind::parse_repo_name("other-repo"), None);
    }

    #[test]
    fn test_record_defaults_from_metadata() {
        let meta: ComponentMetadata = serde_json::from_str(r#"{"description": "Weather"}"#).unwrap();
        let record = ComponentRecord::from_metadata("weather", ComponentKind::Agent, "alfred-agent-weather", meta);
        assert_eq!(record.name, "alfred-agent-weather");
        assert_eq!(record.version, "0.1.0");
        assert_eq!(record.category, "general");
        assert_eq!(record.kind, ComponentKind::Agent);
        assert!(!record.locally_available);
    }

    #[test]
    fn test_upsert_keeps_local_state() {
        let mut registry = Registry::new("alfred-project");
        let mut record = ComponentRecord::new("geo", ComponentKind::Provider);
        record.locally_available = true;
        record.local_version = Some("0.1.0".to_string());
        registry.upsert_remote(record);

        let mut remote = ComponentRecord::new("geo", ComponentKind::Provider);
        remote.version = "0.2.0".to_string();
        remote.description = "Geocoding".to_string();
        registry.upsert_remote(remote);

        let geo = registry.get("geo").unwrap();
        assert!(geo.locally_available);
        assert_eq!(geo.version, "0.2.0");
        assert_eq!(geo.description, "Geocoding");
        assert!(geo.needs_update());
    }

    #[test]
    fn test_kind_serde_and_parse() {
        assert_eq!(serde_json::to_string(&ComponentKind::Agent).unwrap(), "\"agent\"");
        assert_eq!("Module".parse::<ComponentKind>().unwrap(), ComponentKind::Module);
        assert!("widget".parse::<ComponentKind>().is_err());
    }

    #[test]
    fn test_legacy_registry_fields() {
        let raw = r#"{
  "components": {
    "geo": { "id": "geo", "name": "Geo", "component_type": "provider" }
  },
  "last_sync": null,
  "github_org": "alfred-project"
}"#;
        let registry: Registry = serde_json::from_str(raw).unwrap();
        assert_eq!(registry.source_org, "alfred-project");
        assert_eq!(registry.get("geo").unwrap().kind, ComponentKind::Provider);
    }
}
