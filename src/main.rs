use anyhow::Context;
use clap::Parser;
use mcpgate::{
    backend::{spawn_health_supervisor, HEALTH_CHECK_INTERVAL},
    build_router,
    config::{self, GatewayConfig, Mode},
    discovery, AppState, Gateway,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mcpgate")]
#[command(about = "HTTP gateway in front of stdio and HTTP MCP servers", long_about = None)]
struct Cli {
    /// Configuration file (JSON). Read from stdin when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on; overrides the configured port
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Expose each server at /mcp/{server}
    #[arg(long, conflicts_with = "unified")]
    routed: bool,

    /// Expose one aggregated endpoint at /mcp (default)
    #[arg(long)]
    unified: bool,

    /// Environment file loaded before the configuration is expanded
    #[arg(long)]
    env_file: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> anyhow::Result<GatewayConfig> {
    let mut config = match &cli.config {
        Some(path) => config::load_from_path(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => config::load_from_reader(std::io::stdin().lock())
            .context("loading configuration from stdin")?,
    };

    if let Some(listen) = cli.listen {
        config.listen = listen;
        config.port = listen.port();
    }
    if cli.routed {
        config.mode = Mode::Routed;
    } else if cli.unified {
        config.mode = Mode::Unified;
    }
    Ok(config)
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received SIGTERM"),
        _ = token.cancelled() => tracing::info!("shutdown requested"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load environment variables
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("loading env file {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    // Logs go to stderr; stdout carries the discovery document.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcpgate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli)?;
    tracing::info!(
        mode = ?config.mode,
        backends = config.backends.len(),
        auth = config.api_key.is_some(),
        "configuration loaded"
    );

    let gateway = Arc::new(Gateway::new(config.clone()));

    if config.eager_start {
        gateway.start_all().await;
    }

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    let bound = listener.local_addr()?;
    tracing::info!("Gateway listening on http://{}", bound);

    let document = discovery::discovery_document(&config, bound.port());
    discovery::write_discovery(&mut std::io::stdout().lock(), &document)
        .context("writing discovery document")?;

    let supervisor = spawn_health_supervisor(gateway.clone(), HEALTH_CHECK_INTERVAL);

    let app = build_router(AppState::new(gateway.clone()));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(gateway.shutdown_token()))
        .await?;

    gateway.shutdown().await;
    supervisor.abort();
    tracing::info!("Gateway exited");

    Ok(())
}
