//! Component entry contract and the build-time plugin catalog.
//!
//! A downloaded component directory carries an entry file (`main.json`, or
//! the first other `*.json` at its root besides `metadata.json`) naming the
//! exported constructor symbol: `{"symbol": "weather"}`. The symbol is looked
//! up in the [`PluginCatalog`] compiled into the host; a missing `symbol`
//! field means the component id.

use alfred_core::{Config, Error, Result};
use alfred_runtime::{MessageBus, StateManager};
use serde::Deserialize;
use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

pub const ENTRY_FILE: &str = "main.json";
const METADATA_FILE: &str = "metadata.json";

/// A live component instance created by start/initialize.
pub trait ComponentInstance: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Free-form status for diagnostics.
    fn status(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

pub type Instance = Arc<dyn ComponentInstance>;

/// Entry points of an agent.
pub trait AgentEntry: Send + Sync {
    fn start(&self, bus: &MessageBus, state: &StateManager, config: &serde_json::Value) -> Result<Instance>;
    fn stop(&self, instance: &Instance) -> Result<()>;
}

/// Entry points of a module.
pub trait ModuleEntry: Send + Sync {
    fn initialize(&self, id: &str, config: &serde_json::Value) -> Result<Instance>;

    fn cleanup(&self, _instance: &Instance) -> Result<()> {
        Ok(())
    }
}

/// Code handle produced by a catalog constructor. Agents must return an
/// [`AgentEntry`], modules a [`ModuleEntry`]; providers need neither.
pub trait ComponentCode: Send + Sync {
    fn agent(&self) -> Option<&dyn AgentEntry> {
        None
    }

    fn module(&self) -> Option<&dyn ModuleEntry> {
        None
    }
}

/// Code-only component, used for providers.
pub struct CodeOnly;

impl ComponentCode for CodeOnly {}

pub type Constructor = Arc<dyn Fn() -> Arc<dyn ComponentCode> + Send + Sync>;

/// Symbol table of constructors linked into this build.
#[derive(Clone, Default)]
pub struct PluginCatalog {
    constructors: HashMap<String, Constructor>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `ctor` under `symbol`. Re-registering replaces the previous
    /// constructor.
    pub fn register<F>(&mut self, symbol: &str, ctor: F)
    where
        F: Fn() -> Arc<dyn ComponentCode> + Send + Sync + 'static,
    {
        if self.constructors.insert(symbol.to_string(), Arc::new(ctor)).is_some() {
            warn!(symbol = %symbol, "Plugin symbol registered twice, keeping the latest");
        }
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.constructors.contains_key(symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.constructors.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn instantiate(&self, symbol: &str) -> Option<Arc<dyn ComponentCode>> {
        self.constructors.get(symbol).map(|ctor| ctor())
    }
}

/// Everything a component receives when it is brought up.
#[derive(Clone)]
pub struct LoadContext {
    pub bus: MessageBus,
    pub state: StateManager,
    pub config: Arc<Config>,
}

#[derive(Debug, Deserialize)]
struct EntryFile {
    #[serde(default)]
    symbol: Option<String>,
}

/// Finds the entry file of the component in `dir`.
pub fn locate_entry(dir: &Path) -> Option<PathBuf> {
    let main = dir.join(ENTRY_FILE);
    if main.is_file() {
        return Some(main);
    }
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
        .filter(|p| p.file_name().map(|n| n != METADATA_FILE).unwrap_or(false))
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Constructor symbol exported by the component in `dir`.
pub fn entry_symbol(dir: &Path, id: &str) -> Result<String> {
    let entry = locate_entry(dir)
        .ok_or_else(|| Error::Contract(format!("No entry file found for {}", id)))?;
    let content = std::fs::read_to_string(&entry)?;
    let parsed: EntryFile = serde_json::from_str(&content)
        .map_err(|e| Error::Contract(format!("Invalid entry file {}: {}", entry.display(), e)))?;
    Ok(parsed
        .symbol
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| id.to_string()))
}
