use alfred_components::{BackupStore, RegistryStore};
use alfred_core::{ComponentKind, Config, Paths};

pub async fn run(config: &Config, paths: &Paths) -> anyhow::Result<()> {
    println!("alfred status");
    println!("=============");
    println!();

    let config_path = paths.config_file();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_path.exists() { "✓" } else { "✗ (defaults)" }
    );
    match &config.source.local_dir {
        Some(dir) => println!("Source:    {} (local)", dir.display()),
        None => println!("Source:    {}/{}", config.source.web_base, config.source.org),
    }
    if config.sync.enabled {
        println!("Sync:      daily at {}, keeping {} backups", config.sync.time, config.sync.max_backups);
    } else {
        println!("Sync:      disabled");
    }
    println!();

    let registry = RegistryStore::new(paths.registry_file()).load(&config.source.org);
    println!("Registry:  {}", paths.registry_file().display());
    println!(
        "Last sync: {}",
        registry
            .last_sync
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    for kind in ComponentKind::ALL {
        let records: Vec<_> = registry.components.values().filter(|r| r.kind == kind).collect();
        let cached = records.iter().filter(|r| r.locally_available).count();
        println!("  {:<9} {} registered, {} cached", kind, records.len(), cached);
    }
    let restored: Vec<&str> = registry
        .components
        .values()
        .filter(|r| r.fallback_used)
        .map(|r| r.id.as_str())
        .collect();
    if !restored.is_empty() {
        println!("  restored from backup: {}", restored.join(", "));
    }
    println!();

    let backups = BackupStore::new(paths.backups_dir()).list()?;
    println!("Backups:   {} in {}", backups.len(), paths.backups_dir().display());
    if let Some(latest) = backups.first() {
        println!("  latest:  {}", latest.display());
    }

    if !config.startup_modules.is_empty() || !config.startup_agents.is_empty() {
        println!();
        println!("Startup modules: {}", config.startup_modules.join(", "));
        println!("Startup agents:  {}", config.startup_agents.join(", "));
    }
    Ok(())
}
