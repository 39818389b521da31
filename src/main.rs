//! # Voice Session Backend - Main Application Entry Point
//!
//! Real-time voice session server: callers connect over WebSocket, stream PCM audio,
//! and get transcribed utterances answered by a response backend whose audio replies
//! are paced back out frame by frame.
//!
//! ## Key Rust Concepts Used:
//! - **Trait objects**: enhancement, transcription and the response backend are
//!   `Arc<dyn Trait>` collaborators, swapped for fakes in tests
//! - **Dedicated threads**: each session's segmenter runs on its own OS thread and
//!   makes blocking HTTP calls there
//! - **Actors**: every WebSocket connection is an actix actor
//!
//! ## Application Architecture:
//! - **config**: configuration (TOML file + environment variables)
//! - **audio**: frame queue, energy detection, conversion, enhancement,
//!   utterance segmentation and playback pacing
//! - **transcription**: speech-to-text collaborator and per-session dispatch
//! - **session**: per-session state, control channel, backend and the session manager
//! - **websocket**: the transport binding
//! - **state / health / middleware / handlers**: the HTTP side

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod session;
mod state;
mod transcription;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use audio::enhance::{DspEnhancer, Enhancer, Passthrough, SerializedEnhancer};
use config::AppConfig;
use session::{Collaborators, HttpBackend};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::HttpTranscriber;

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Builds the collaborators** shared by every session
/// 4. **Runs the HTTP server** until a shutdown signal arrives
///
/// `main` itself is synchronous: the transcription and backend clients are blocking
/// `reqwest` clients, which must be constructed outside of an async runtime.
fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-session-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let collaborators = build_collaborators(&config)?;

    actix_web::rt::System::new().block_on(run(config, collaborators))
}

/// Wire the configured collaborators.
fn build_collaborators(config: &AppConfig) -> Result<Collaborators> {
    let enhancer: Arc<dyn Enhancer> = if config.enhancement.enabled {
        info!(
            noise_gate_ratio = config.enhancement.noise_gate_ratio,
            peak_ceiling = config.enhancement.peak_ceiling,
            smoothing = config.enhancement.smoothing,
            "Audio enhancement enabled"
        );
        Arc::new(SerializedEnhancer::new(DspEnhancer::from_settings(&config.enhancement)))
    } else {
        Arc::new(Passthrough)
    };

    info!(
        endpoint = %config.transcription.endpoint,
        model = %config.transcription.model,
        "Transcription service configured"
    );
    let transcriber = Arc::new(HttpTranscriber::new(&config.transcription)?);

    info!(endpoint = %config.backend.endpoint, "Response backend configured");
    let backend = Arc::new(HttpBackend::new(&config.backend)?);

    Ok(Collaborators {
        enhancer,
        transcriber,
        backend,
    })
}

async fn run(config: AppConfig, collaborators: Collaborators) -> Result<()> {
    let app_state = AppState::new(config.clone(), collaborators);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();
    spawn_reaper(app_state.clone(), config.sessions.reaper_interval_secs);

    info!("Starting HTTP server on {}", bind_addr);

    let data = web::Data::new(app_state.clone());
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(data.clone())
            .wrap(cors)
            .wrap(middleware::RequestTelemetry)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session))
                    .route("/sessions/{id}", web::delete().to(handlers::close_session)),
            )
            .route("/ws/session", web::get().to(websocket::session_socket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    let closed = app_state.sessions.shutdown_all();
    info!(closed, "Server stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// `RUST_LOG` controls the filter; defaults to
/// "voice_session_backend=debug,actix_web=info".
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_session_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Periodically drop sessions whose transport died without a close event.
fn spawn_reaper(state: AppState, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
                break;
            }
            state.sessions.reap();
        }
    });
}

/// Listen for SIGTERM and SIGINT and raise the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers, falling back to Ctrl+C: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
