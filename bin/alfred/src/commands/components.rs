use alfred_core::{ComponentKind, Config, Paths};

pub async fn list(
    config: Config,
    paths: Paths,
    kind: Option<ComponentKind>,
    category: Option<String>,
    refresh: bool,
) -> anyhow::Result<()> {
    let manager = super::manager(&config, paths)?;
    if refresh {
        manager.discover(true).await;
    }
    let records = manager.list(kind, category.as_deref()).await;

    if records.is_empty() {
        println!("No components registered. Run `alfred discover` first.");
        return Ok(());
    }

    println!("{:<24} {:<9} {:<10} {:<10} {:<12} DESCRIPTION", "ID", "KIND", "VERSION", "CACHED", "CATEGORY");
    for record in records {
        let cached = match (&record.local_version, record.locally_available) {
            (Some(v), true) if record.fallback_used => format!("{} (bak)", v),
            (Some(v), true) => v.clone(),
            (None, true) => "yes".to_string(),
            _ => "-".to_string(),
        };
        println!(
            "{:<24} {:<9} {:<10} {:<10} {:<12} {}",
            record.id, record.kind, record.version, cached, record.category, record.description
        );
    }
    Ok(())
}

pub async fn discover(config: Config, paths: Paths, force: bool) -> anyhow::Result<()> {
    let manager = super::manager(&config, paths)?;
    let components = manager.discover(force).await;
    println!("{} component(s) registered", components.len());
    for kind in ComponentKind::ALL {
        let count = components.values().filter(|r| r.kind == kind).count();
        println!("  {:<9} {}", kind, count);
    }
    if let Some(last) = manager.last_sync().await {
        println!("Last discovery: {}", last.to_rfc3339());
    }
    Ok(())
}

pub async fn download(config: Config, paths: Paths, id: &str, version: Option<String>) -> anyhow::Result<()> {
    let manager = super::manager(&config, paths)?;
    if !manager.download(id, version.as_deref()).await {
        anyhow::bail!("Failed to download {}", id);
    }
    let record = manager.record(id).await;
    if let Some(path) = record.and_then(|r| r.local_path) {
        println!("✓ {} installed at {}", id, path.display());
    }
    Ok(())
}

pub async fn sync(config: Config, paths: Paths) -> anyhow::Result<()> {
    let manager = super::manager(&config, paths)?;
    let report = manager.sync_all().await;

    println!("Updated:   {}", join_or_dash(&report.updated));
    println!("Failed:    {}", join_or_dash(&report.failed));
    println!("Backed up: {}", report.backed_up.len());
    if let Some(path) = &report.backup_path {
        println!("Backup:    {}", path.display());
    }
    if !report.removed_backups.is_empty() {
        println!("Rotated:   {} old backup(s)", report.removed_backups.len());
    }
    if let Some(error) = &report.error {
        anyhow::bail!("Sync failed: {}", error);
    }
    Ok(())
}

pub async fn deps(config: Config, paths: Paths, id: &str) -> anyhow::Result<()> {
    let manager = super::manager(&config, paths)?;
    if manager.record(id).await.is_none() {
        manager.discover(false).await;
    }
    let Some(report) = manager.dependency_report(id).await else {
        anyhow::bail!("Unknown component: {}", id);
    };

    println!("{} ({} direct dependencies)", report.component_id, report.total_dependencies);
    for dep in &report.dependencies {
        let mark = if dep.available && dep.resolved { "✓" } else { "✗" };
        println!(
            "  {} {:<20} registered={} cached={} loaded={} sub=[{}]",
            mark,
            dep.id,
            dep.available,
            dep.locally_available,
            dep.loaded,
            dep.sub_dependencies.join(", ")
        );
    }

    match manager.resolve_dependencies(id).await {
        Some(order) => println!("Load order: {}", order.into_iter().chain([id.to_string()]).collect::<Vec<_>>().join(" → ")),
        None => println!("Load order: unresolved (dependency cycle)"),
    }
    Ok(())
}

pub async fn fallback(config: Config, paths: Paths, id: &str) -> anyhow::Result<()> {
    let manager = super::manager(&config, paths)?;
    if !manager.use_fallback(id).await {
        anyhow::bail!("No backup contains {}", id);
    }
    println!("✓ {} is available locally", id);
    Ok(())
}

fn join_or_dash(ids: &[String]) -> String {
    if ids.is_empty() {
        "-".to_string()
    } else {
        ids.join(", ")
    }
}
