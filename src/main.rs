use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use wa_relay::cli::{self, Cli, Command};
use wa_relay::commands::{AckCommand, AiCommand, OpenAiCompletionService, UploadCommand};
use wa_relay::config::{self, RelayConfig};
use wa_relay::credentials::{CredentialStore, FileCredentialBackend};
use wa_relay::logging::{self, targets, LogConfig};
use wa_relay::media::{FetchConfig, HttpFileFetcher};
use wa_relay::router::{CommandRegistry, MessageRouter};
use wa_relay::server::{self, AppState, ServerConfig};
use wa_relay::session::{
    HandleSlot, PairingArtifact, ReconnectPolicy, SessionError, SessionExit, SessionManager,
};
use wa_relay::transport::bridge::BridgeTransport;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Start) => run_relay().await,
        Some(Command::Logout { profile }) => cli::handle_logout(profile).await,
        Some(Command::Status { port, host }) => cli::handle_status(&host, port).await,
        Some(Command::ConfigPath) => {
            cli::handle_config_path();
            Ok(())
        }
        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

/// Run the relay until a shutdown signal or a fatal session error.
async fn run_relay() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging(LogConfig::from_env())?;
    let cfg = config::load_config()?;

    std::fs::create_dir_all(&cfg.state_dir)?;
    if let Some(parent) = cfg.pairing_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let store = CredentialStore::new(Arc::new(FileCredentialBackend::new(
        cfg.credentials_dir(),
    )?));
    let transport = Arc::new(BridgeTransport::new(cfg.transport_url.clone()));
    let fetcher = Arc::new(HttpFileFetcher::new(FetchConfig::from(&cfg.upload))?);
    let registry = build_registry(&cfg, fetcher.clone())?;

    let slot = HandleSlot::new();
    let pairing = PairingArtifact::new(&cfg.pairing_path);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let manager = SessionManager::new(
        transport,
        store,
        pairing.clone(),
        slot.clone(),
        inbound_tx,
    )
    .with_profile(cfg.profile.clone())
    .with_policy(ReconnectPolicy::from(&cfg.reconnect));
    let status = manager.subscribe();

    let state = AppState::new(slot.clone(), pairing, fetcher, status);
    let bind_address: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
    let server_handle = server::run_server_with_config(ServerConfig::new(state, bind_address)).await?;

    log_startup_banner(&cfg, &server_handle.base_url());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut session_task = tokio::spawn(manager.run(shutdown_rx.clone()));
    let router_task = tokio::spawn(MessageRouter::new(registry, slot).run(inbound_rx, shutdown_rx));

    let mut outcome: Result<(), Box<dyn std::error::Error>> = Ok(());
    let mut session_done = false;
    tokio::select! {
        signal = server::await_shutdown_trigger() => {
            info!("Received {}, shutting down", signal);
        }
        joined = &mut session_task => {
            session_done = true;
            match session_exit(joined) {
                Ok(SessionExit::Shutdown) => {}
                Ok(exit) => {
                    warn!(
                        target: targets::SESSION,
                        "Session supervisor stopped ({:?}); the bridge stays up until shutdown. \
                         Run `wa-relay logout` and restart to pair again.",
                        exit
                    );
                    let signal = server::await_shutdown_trigger().await;
                    info!("Received {}, shutting down", signal);
                }
                Err(e) => {
                    error!(target: targets::SESSION, "Session supervisor failed: {}", e);
                    outcome = Err(e.into());
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if !session_done {
        if let Err(e) = session_task.await {
            error!(target: targets::SESSION, "Session task panicked: {}", e);
        }
    }
    if let Err(e) = router_task.await {
        error!(target: targets::ROUTER, "Router task panicked: {}", e);
    }
    server_handle.shutdown().await;
    info!("wa-relay stopped");
    outcome
}

fn session_exit(
    joined: Result<Result<SessionExit, SessionError>, tokio::task::JoinError>,
) -> Result<SessionExit, String> {
    match joined {
        Ok(Ok(exit)) => Ok(exit),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("session task panicked: {e}")),
    }
}

/// Wire the command handlers. A missing AI key is not fatal.
fn build_registry(
    cfg: &RelayConfig,
    fetcher: Arc<HttpFileFetcher>,
) -> Result<CommandRegistry, Box<dyn std::error::Error>> {
    let ai = match OpenAiCompletionService::from_config(&cfg.ai)? {
        Some(service) => {
            info!(model = service.model(), "AI replies enabled");
            AiCommand::new(Arc::new(service))
        }
        None => {
            warn!("No AI API key configured (ai.apiKey, OPENAI_API_KEY or key); /ai will reply with a notice");
            AiCommand::unconfigured()
        }
    };
    Ok(CommandRegistry {
        ai: Arc::new(ai),
        upload: Arc::new(UploadCommand::new(fetcher)),
        fallback: Arc::new(AckCommand),
    })
}

fn log_startup_banner(cfg: &RelayConfig, base_url: &str) {
    info!("wa-relay {} starting", env!("CARGO_PKG_VERSION"));
    info!("  Profile:    {}", cfg.profile);
    info!("  State dir:  {}", cfg.state_dir.display());
    info!("  Transport:  {}", cfg.transport_url);
    info!("  Bridge:     {}", base_url);
    info!("  Pairing:    {}", cfg.pairing_path.display());
}
