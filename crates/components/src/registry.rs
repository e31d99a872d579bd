use alfred_core::{Registry, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Reads and writes `components.json`.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the registry. A missing file yields an empty registry; an
    /// unreadable one is moved aside as `components.json.corrupted.<unixtime>`
    /// and replaced by an empty registry.
    pub fn load(&self, source_org: &str) -> Registry {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No registry file yet");
            return Registry::new(source_org);
        }

        let parsed = std::fs::read_to_string(&self.path)
            .map_err(alfred_core::Error::from)
            .and_then(|content| serde_json::from_str::<Registry>(&content).map_err(Into::into));

        match parsed {
            Ok(mut registry) => {
                if registry.source_org.is_empty() {
                    registry.source_org = source_org.to_string();
                }
                debug!(count = registry.components.len(), "Loaded component registry");
                registry
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Component registry is corrupted");
                self.quarantine();
                Registry::new(source_org)
            }
        }
    }

    fn quarantine(&self) {
        let stamp = chrono::Utc::now().timestamp();
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".corrupted.{}", stamp));
        let target = PathBuf::from(name);
        match std::fs::rename(&self.path, &target) {
            Ok(()) => info!(backup = %target.display(), "Corrupted registry moved aside"),
            Err(e) => warn!(error = %e, "Failed to move corrupted registry aside"),
        }
    }

    /// Writes through a temp file and rename so readers never see a torn file.
    pub fn save(&self, registry: &Registry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(registry)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)?;
        if let Err(e) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }
}
