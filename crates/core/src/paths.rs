use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".alfred"))
            .unwrap_or_else(|| PathBuf::from(".alfred"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// Persisted component registry.
    pub fn registry_file(&self) -> PathBuf {
        self.base.join("components.json")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base.join("cache")
    }

    pub fn component_cache_dir(&self, id: &str) -> PathBuf {
        self.cache_dir().join(id)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.base.join("backups")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.cache_dir())?;
        std::fs::create_dir_all(self.backups_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_dirs_creates_layout() {
        let temp_dir = TempDir::new().unwrap();
        let paths = Paths::with_base(temp_dir.path().join("alfred"));
        paths.ensure_dirs().unwrap();

        assert!(paths.cache_dir().is_dir());
        assert!(paths.backups_dir().is_dir());
        assert_eq!(
            paths.component_cache_dir("weather"),
            temp_dir.path().join("alfred").join("cache").join("weather")
        );
        assert!(paths.registry_file().ends_with("components.json"));
    }
}
