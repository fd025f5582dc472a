//! # local-transcribe - Main Application Entry Point
//!
//! Wires the pieces together and runs until SIGINT/SIGTERM:
//! 1. **Load configuration** from `config.toml`, `APP__*` variables and flags
//! 2. **Set up logging** with `tracing`
//! 3. **Build the model lifecycle controller** around the Whisper engine
//! 4. **Prepare the model** (download + load) unless disabled
//! 5. **Start the server supervisor** on 127.0.0.1
//! 6. **Stop gracefully** when a shutdown signal arrives

use anyhow::{Context, Result};
use clap::Parser;
use local_transcribe::audio::WavDecoder;
use local_transcribe::state::RequestLimits;
use local_transcribe::transcription::{SpeechEngine, WhisperEngine};
use local_transcribe::{
    AppConfig, AppState, EventBus, ModelLifecycleController, ServerState, ServerSupervisor, StatusEvent,
    SupervisorSettings,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Local speech-to-text server.
#[derive(Parser)]
#[command(name = "local-transcribe", about = "Local speech-to-text HTTP server", version)]
struct Cli {
    /// Port to listen on, overriding the configuration.
    #[arg(short, long)]
    port: Option<u16>,

    /// Write the chosen port back into the configuration file.
    #[arg(long, requires = "port")]
    save_port: bool,

    /// Configuration file, without the `.toml` extension.
    #[arg(long, default_value = "config")]
    config: String,

    /// Serve immediately and load the model on the first request.
    #[arg(long)]
    no_prepare: bool,
}

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.validate()?;

    if cli.save_port {
        let path = PathBuf::from(format!("{}.toml", cli.config));
        config.save_to(&path)?;
        info!("Saved port {} to {}", config.server.port, path.display());
    }

    info!("Starting local-transcribe v{}", env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.model.repo,
        revision = %config.model.revision,
        install_dir = %config.model.install_dir.display(),
        "Configuration loaded"
    );

    let events = EventBus::default();
    spawn_event_logger(events.subscribe());

    let engine: Arc<dyn SpeechEngine> = Arc::new(WhisperEngine::new());
    let lifecycle = ModelLifecycleController::from_config(&config, engine, events.clone());
    let app_state = AppState::new(
        lifecycle.clone(),
        Arc::new(WavDecoder::new()),
        events.clone(),
        RequestLimits::from_config(&config),
    );
    let supervisor = ServerSupervisor::new(app_state, SupervisorSettings::from(&config.server));

    if config.model.prepare_on_start && !cli.no_prepare {
        info!("Preparing model before serving");
        if let Err(e) = lifecycle.ensure_ready().await {
            // Not fatal: the first transcription request retries.
            error!("Model preparation failed: {}", e);
        }
    }

    supervisor
        .start(supervisor.port())
        .await
        .context("failed to start the transcription server")?;

    wait_for_shutdown().await;
    info!("Shutdown signal received, stopping server...");
    supervisor.stop().await;

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins; otherwise `local_transcribe=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "local_transcribe=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to initialize logging")?;

    Ok(())
}

/// Mirror every status transition into the log.
fn spawn_event_logger(mut events: broadcast::Receiver<StatusEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StatusEvent::Server(state)) => match &state {
                    ServerState::Failed(reason) => warn!(state = state.label(), %reason, "Server state changed"),
                    _ => info!(state = state.label(), "Server state changed"),
                },
                Ok(StatusEvent::Model(status)) => info!(status = %status.description(), "Model status changed"),
                Ok(StatusEvent::Download(progress)) => debug!(fraction = progress.fraction, "{}", progress.message),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event logger fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
