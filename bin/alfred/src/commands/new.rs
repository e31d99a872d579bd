use alfred_core::{ComponentKind, ComponentMetadata};
use std::path::Path;

/// Writes `alfred-{kind}-{id}/` with metadata, entry file and README.
pub fn run(kind: ComponentKind, id: &str, name: Option<String>, description: &str, dir: &Path) -> anyhow::Result<()> {
    if id.is_empty() || id.contains(['/', '\\']) {
        anyhow::bail!("Invalid component id: {:?}", id);
    }
    let repo = dir.join(format!("{}{}", kind.repo_prefix(), id));
    if repo.exists() {
        anyhow::bail!("{} already exists", repo.display());
    }
    std::fs::create_dir_all(&repo)?;

    let name = name.unwrap_or_else(|| id.to_string());
    let metadata = ComponentMetadata::scaffold(id, kind, &name, description);
    std::fs::write(repo.join("metadata.json"), serde_json::to_string_pretty(&metadata)?)?;
    std::fs::write(
        repo.join("main.json"),
        serde_json::to_string_pretty(&serde_json::json!({ "symbol": id }))?,
    )?;

    let contract = match kind {
        ComponentKind::Agent => "Implements `AgentEntry` (start/stop).",
        ComponentKind::Module => "Implements `ModuleEntry` (initialize/cleanup).",
        ComponentKind::Provider => "Provides code and capabilities only.",
    };
    std::fs::write(
        repo.join("README.md"),
        format!("# {}\n\n{}\n\n{} Register it in the host catalog under `{}`.\n", name, description, contract, id),
    )?;

    println!("✓ Created {}", repo.display());
    Ok(())
}
