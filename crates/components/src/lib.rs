pub mod archive;
pub mod backup;
pub mod fsops;
pub mod manager;
pub mod plugin;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod source;

pub use backup::BackupStore;
pub use manager::{ComponentManager, LoadedHandle, ManagerOptions};
pub use plugin::{
    AgentEntry, CodeOnly, ComponentCode, ComponentInstance, Instance, LoadContext, ModuleEntry,
    PluginCatalog,
};
pub use registry::RegistryStore;
pub use report::{DependencyReport, DependencyStatus, LoadedInfo, SyncReport};
pub use source::{ComponentSource, GithubSource, LocalSource, RemoteRepository};
