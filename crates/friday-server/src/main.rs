//! Friday server binary.
//!
//! Boots the voice bridge: reads configuration, installs the tracing
//! subscriber, resolves the WebRTC engine, and serves the HTTP/SSE surface
//! until a stop signal arrives.

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use friday_server::{app, config, AppState};

#[tokio::main]
async fn main() {
    let (config_path, source) = config::resolve_startup_path();
    let config = match config::load_config(Some(&config_path)) {
        Ok(config) => config,
        Err(e) => panic!("cannot start with unusable configuration ({config_path}): {e}"),
    };

    init_tracing(&config.logging);
    tracing::info!(path = %config_path, source, "configuration loaded");

    let state = AppState::from_config(&config);
    let addr = SocketAddr::new(config.server.host, config.server.port);
    let listener = TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("cannot listen on {addr}: {e}"));

    tracing::info!(%addr, "friday server listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(stop_signal())
        .await
        .expect("server terminated abnormally");

    tracing::info!("friday server stopped");
}

fn init_tracing(logging: &config::LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolves once the process is asked to stop.
async fn stop_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received, stopping"),
            _ = term.recv() => tracing::info!("terminate received, stopping"),
        }
    }

    #[cfg(not(unix))]
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("interrupt received, stopping");
    }
}
