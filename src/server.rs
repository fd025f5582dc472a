//! # Server Supervisor
//!
//! Starts and stops the loopback HTTP listener at runtime.
//!
//! ## State Transitions:
//! ```text
//! Idle ──start──► Starting ──bound──► Running ──stop──► Stopping ──drained──► Idle
//!                    │
//!                    └──bind error──► Failed(reason) ──start──► Starting
//! ```
//!
//! ## Rules:
//! - `start` is a no-op while Starting or Running, and while the model is
//!   downloading (the caller retries once the download has finished)
//! - `stop` is a no-op unless Running
//! - the port can only change while not Running
//! - `Running` is published only after the socket is bound and the accept
//!   loop has been spawned, so observers never see Running for a server that
//!   cannot accept connections
//!
//! Start and stop are serialized by an async mutex; state is published on a
//! `watch` channel (current value) and on the shared event bus (transitions).

use crate::config::ServerConfig;
use crate::error::SupervisorError;
use crate::events::{ServerState, StatusEvent};
use crate::handlers;
use crate::middleware::MetricsMiddleware;
use crate::state::{AppState, ServerStateView};
use actix_cors::Cors;
use actix_web::dev::ServerHandle;
use actix_web::http::header::HeaderValue;
use actix_web::{web, App, HttpServer};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;

/// Listener settings taken from the `server` config section.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub port: u16,
    pub shutdown_timeout: Duration,
    pub workers: usize,
}

impl From<&ServerConfig> for SupervisorSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            port: config.port,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            workers: config.workers,
        }
    }
}

struct RunningServer {
    handle: ServerHandle,
    task: JoinHandle<io::Result<()>>,
    local_addr: SocketAddr,
}

pub struct ServerSupervisor {
    app_state: web::Data<AppState>,
    settings: SupervisorSettings,
    port: AtomicU16,
    state: watch::Sender<ServerState>,
    running: Mutex<Option<RunningServer>>,
}

impl ServerSupervisor {
    pub fn new(app_state: AppState, settings: SupervisorSettings) -> Self {
        let (state, _) = watch::channel(ServerState::Idle);
        Self {
            app_state: web::Data::new(app_state),
            port: AtomicU16::new(settings.port),
            settings,
            state,
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Port used by the next `start`.
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    /// Change the port. Rejected while the server is running.
    pub fn set_port(&self, port: u16) -> Result<(), SupervisorError> {
        let state = self.state.borrow();
        if matches!(*state, ServerState::Running | ServerState::Starting | ServerState::Stopping) {
            return Err(SupervisorError::PortLocked { port: self.port() });
        }
        self.port.store(port, Ordering::SeqCst);
        Ok(())
    }

    /// Address the running listener is bound to.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|server| server.local_addr)
    }

    /// Start serving on `127.0.0.1:port`.
    pub async fn start(&self, port: u16) -> Result<(), SupervisorError> {
        let mut running = self.running.lock().await;

        if running.is_some() || matches!(self.state(), ServerState::Starting | ServerState::Running) {
            return Ok(());
        }
        if self.app_state.lifecycle.is_downloading() {
            info!(port, "Model download in progress, not starting the server yet");
            return Ok(());
        }

        self.port.store(port, Ordering::SeqCst);
        self.publish(ServerState::Starting);

        match self.spawn_server(port) {
            Ok(server) => {
                info!(address = %server.local_addr, "Transcription server listening");
                *running = Some(server);
                self.publish(ServerState::Running);
                Ok(())
            }
            Err(e) => {
                let err = SupervisorError::Bind { port, reason: e.to_string() };
                error!("{}", err);
                self.publish(ServerState::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    /// Stop the listener and let in-flight requests finish within the grace period.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let server = match running.take() {
            Some(server) => server,
            None => return,
        };

        self.publish(ServerState::Stopping);
        info!(address = %server.local_addr, "Stopping transcription server");

        server.handle.stop(true).await;
        match server.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Server exited with error: {}", e),
            Err(e) => warn!("Server task failed: {}", e),
        }

        self.publish(ServerState::Idle);
        info!("Transcription server stopped");
    }

    fn publish(&self, state: ServerState) {
        self.state.send_replace(state.clone());
        self.app_state.events.publish(StatusEvent::Server(state));
    }

    fn spawn_server(&self, port: u16) -> io::Result<RunningServer> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
        let local_addr = listener.local_addr()?;

        let app_state = self.app_state.clone();
        let view = web::Data::new(ServerStateView::new(self.state.subscribe(), local_addr.port()));

        let server = HttpServer::new(move || {
            // Browser pages served from localhost may call the endpoint too
            let cors = Cors::default()
                .allowed_origin_fn(|origin: &HeaderValue, _req| is_loopback_origin(origin))
                .allow_any_method()
                .allow_any_header()
                .max_age(3600);

            App::new()
                .app_data(app_state.clone())
                .app_data(view.clone())
                .wrap(cors)
                .wrap(MetricsMiddleware)
                .wrap(TracingLogger::default())
                .configure(handlers::configure_routes)
        })
        .workers(self.settings.workers)
        .shutdown_timeout(self.settings.shutdown_timeout.as_secs())
        .disable_signals()
        .listen(listener)?
        .run();

        let handle = server.handle();
        let task = tokio::spawn(server);

        Ok(RunningServer { handle, task, local_addr })
    }
}

fn is_loopback_origin(origin: &HeaderValue) -> bool {
    let origin = match origin.to_str() {
        Ok(origin) => origin,
        Err(_) => return false,
    };
    let authority = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };
    matches!(host, "localhost" | "127.0.0.1" | "[::1]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_origins() {
        assert!(is_loopback_origin(&HeaderValue::from_static("http://localhost:5173")));
        assert!(is_loopback_origin(&HeaderValue::from_static("http://127.0.0.1")));
        assert!(is_loopback_origin(&HeaderValue::from_static("http://[::1]:8080")));
        assert!(!is_loopback_origin(&HeaderValue::from_static("https://example.com")));
        assert!(!is_loopback_origin(&HeaderValue::from_static("http://localhost.evil.com")));
    }
}
