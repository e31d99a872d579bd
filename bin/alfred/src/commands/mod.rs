pub mod components;
pub mod new;
pub mod run;
pub mod status;

use alfred_components::{source, ComponentManager, ManagerOptions};
use alfred_core::{Config, Paths};

/// Component manager for one-shot commands, using the built-in catalog.
pub(crate) fn manager(config: &Config, paths: Paths) -> anyhow::Result<ComponentManager> {
    paths.ensure_dirs()?;
    let source = source::from_config(&config.source)?;
    Ok(ComponentManager::new(
        paths,
        source,
        alfred_host::builtins::catalog(),
        ManagerOptions::from_config(config),
    ))
}
