use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use wagate::{
    config::{self, GatewayConfig},
    events::EventHub,
    protocol::BridgeProtocol,
    session::{CredentialStore, SessionRegistry, validate_session_id},
    state::AppState,
};

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "wagate", about = "Multi-tenant WhatsApp session gateway", version)]
struct Cli {
    /// Path to TOML config file
    #[arg(short, long, default_value = "wagate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve,
    /// List sessions with stored credentials
    Sessions,
    /// Erase the stored credentials of one session
    Purge {
        /// Session id whose credential directory is removed
        session_id: String,
    },
}

// ── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging from RUST_LOG (default: info)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wagate=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;

    match cli.command {
        Commands::Serve => serve(cfg).await,
        Commands::Sessions => list_sessions(&cfg).await,
        Commands::Purge { session_id } => purge(&cfg, &session_id).await,
    }
}

async fn serve(cfg: GatewayConfig) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&cfg.sessions_dir)
        .await
        .with_context(|| format!("failed to create {}", cfg.sessions_dir.display()))?;
    tokio::fs::create_dir_all(&cfg.uploads_dir)
        .await
        .with_context(|| format!("failed to create {}", cfg.uploads_dir.display()))?;

    let store = CredentialStore::new(&cfg.sessions_dir);
    let stored = store.list().await?;
    info!(
        "Credential store at {} ({} stored session(s), restored on first use)",
        cfg.sessions_dir.display(),
        stored.len()
    );

    let protocol = Arc::new(BridgeProtocol::new(
        cfg.bridge_url.clone(),
        cfg.session.ack_timeout(),
    ));
    info!("Protocol bridge: {}", cfg.bridge_url);

    let events = EventHub::new();
    let registry = SessionRegistry::new(store, protocol, cfg.session.clone(), events.clone());
    let state = AppState::new(cfg.clone(), Arc::clone(&registry), events);

    let app = wagate::routes::app(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid bind address")?;

    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind TCP listener")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    registry.shutdown().await;
    info!("Server stopped.");
    Ok(())
}

async fn list_sessions(cfg: &GatewayConfig) -> anyhow::Result<()> {
    let ids = CredentialStore::new(&cfg.sessions_dir).list().await?;
    if ids.is_empty() {
        println!("No stored sessions in {}", cfg.sessions_dir.display());
    }
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

async fn purge(cfg: &GatewayConfig, session_id: &str) -> anyhow::Result<()> {
    validate_session_id(session_id)?;
    let store = CredentialStore::new(&cfg.sessions_dir);
    if !store.exists(session_id).await {
        println!("No stored credentials for {session_id}");
        return Ok(());
    }
    store.erase(session_id).await?;
    println!("Erased stored credentials for {session_id}");
    Ok(())
}

// ── Graceful shutdown ──────────────────────────────────────────────────────

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install CTRL+C handler: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, stopping server...");
}
