use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cf_domain::config::Config;
use cf_gateway::app::build_router;
use cf_gateway::runtime::agent::UnconfiguredAgentFactory;
use cf_gateway::state::AppState;
use cf_pipeline::registry::NodeRegistry;
use cf_pipeline::templates::TemplateStore;
use cf_pipeline::ReadNodeHistoryTool;

#[derive(Parser)]
#[command(name = "clipforge", about = "Session-oriented media-editing gateway")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway server (default).
    Serve,
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Config::load(&cli.config)
                .with_context(|| format!("loading config from {}", cli.config.display()))?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Version) => {
            println!("clipforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cf_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("ClipForge starting");

    // Node registry. The pipeline topology and auxiliary tools ship
    // with the binary; the node backends themselves are wired per
    // deployment.
    let mut registry = NodeRegistry::with_default_specs();
    registry.register_tool("read_node_history", Arc::new(ReadNodeHistoryTool));
    let registry = Arc::new(registry);
    tracing::info!("node registry ready (pipeline node backends wired per deployment)");

    let templates = Arc::new(
        TemplateStore::new(&config.project.templates_dir)
            .context("initializing template store")?,
    );
    tracing::info!(
        templates = templates.list_all().len(),
        dir = %config.project.templates_dir.display(),
        "template store ready"
    );

    let state = AppState::new(
        config.clone(),
        registry,
        templates,
        Arc::new(UnconfiguredAgentFactory),
    );
    let router = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server.host/server.port")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;
    Ok(())
}
