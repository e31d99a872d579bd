use alfred_core::{Config, Paths};
use alfred_host::AlfredCore;
use tracing::info;

pub async fn run(config: Config, paths: Paths) -> anyhow::Result<()> {
    paths.ensure_dirs()?;
    let core = AlfredCore::from_config(config, paths)?;
    if !core.start().await {
        anyhow::bail!("Alfred failed to start");
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received");
        }
        _ = core.stop_requested() => {
            info!("Stop command received");
        }
    }

    core.stop().await;
    Ok(())
}
