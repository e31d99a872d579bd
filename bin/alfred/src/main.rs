mod commands;

use alfred_core::{ComponentKind, Config, Paths};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "alfred")]
#[command(about = "Alfred component runtime", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the runtime and load the configured startup components
    Run,

    /// Show paths, registry and backup status
    Status,

    /// List registered components
    List {
        /// Only this kind (module, agent, provider)
        #[arg(short, long)]
        kind: Option<ComponentKind>,

        /// Only this category
        #[arg(short, long)]
        category: Option<String>,

        /// Refresh the registry from the source first
        #[arg(long)]
        refresh: bool,
    },

    /// Refresh the registry from the component source
    Discover {
        /// Ignore the discovery cache
        #[arg(short, long)]
        force: bool,
    },

    /// Download a component and its missing dependencies
    Download {
        /// Component id
        id: String,

        /// Pin to a tagged version
        #[arg(long)]
        version: Option<String>,
    },

    /// Download stale components and take a backup snapshot
    Sync,

    /// Show a component's dependencies and load order
    Deps {
        /// Component id
        id: String,
    },

    /// Restore a component from the newest backup that has it
    Fallback {
        /// Component id
        id: String,
    },

    /// Create a new component repository skeleton
    New {
        /// Component kind (module, agent, provider)
        kind: ComponentKind,

        /// Component id
        id: String,

        /// Display name
        #[arg(long)]
        name: Option<String>,

        /// Short description
        #[arg(short, long, default_value = "")]
        description: String,

        /// Parent directory of the new repository
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = Paths::new();
    let (config, config_error) = match Config::load_or_default(&paths) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };

    // Setup tracing: --verbose, then RUST_LOG, then the configured level.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };
    let json = config.logging.json;

    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .with(filter)
        .init();

    if let Some(e) = config_error {
        tracing::warn!(error = %e, path = %paths.config_file().display(), "Invalid config, using defaults");
    }

    match cli.command {
        Commands::Run => {
            commands::run::run(config, paths).await?;
        }
        Commands::Status => {
            commands::status::run(&config, &paths).await?;
        }
        Commands::List { kind, category, refresh } => {
            commands::components::list(config, paths, kind, category, refresh).await?;
        }
        Commands::Discover { force } => {
            commands::components::discover(config, paths, force).await?;
        }
        Commands::Download { id, version } => {
            commands::components::download(config, paths, &id, version).await?;
        }
        Commands::Sync => {
            commands::components::sync(config, paths).await?;
        }
        Commands::Deps { id } => {
            commands::components::deps(config, paths, &id).await?;
        }
        Commands::Fallback { id } => {
            commands::components::fallback(config, paths, &id).await?;
        }
        Commands::New { kind, id, name, description, dir } => {
            commands::new::run(kind, &id, name, &description, &dir)?;
        }
    }

    Ok(())
}
