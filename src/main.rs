//! # Speech Relay Backend - Main Application Entry Point
//!
//! This is the main entry point for the speech-relay-backend web server.
//! It sets up an Actix-web HTTP server with the following key features:
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The entire application is asynchronous for better performance
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc & RwLock**: Thread-safe shared state management
//! - **trait objects**: The recognition engine is injected as `Arc<dyn RecognitionEngine>`
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (TOML files + environment variables)
//! - **state**: Manages shared application state and metrics
//! - **audio**: Converts client float PCM frames into engine PCM
//! - **engine**: The cloud speech-recognition streaming client
//! - **relay**: WebSocket sessions that bridge clients and the engine
//! - **health**: Provides system health monitoring endpoints
//! - **middleware**: Custom request processing logic (logging, metrics)
//! - **handlers**: HTTP request handlers for API endpoints
//! - **error**: Custom error types and HTTP error responses

// Module declarations - These tell Rust about our other source files
mod audio;       // Audio frame conversion (audio/ directory)
mod config;      // Configuration management (config.rs)
mod engine;      // Recognition engine client (engine/ directory)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod relay;       // WebSocket relay sessions (relay/ directory)
mod state;       // Application state management (state.rs)

// External crate imports - These are dependencies from Cargo.toml
use actix_cors::Cors;  // Cross-Origin Resource Sharing support
use actix_web::{middleware::Logger, web, App, HttpServer};  // Web framework
use anyhow::Result;    // Better error handling with context
use config::AppConfig; // Our custom configuration struct
use engine::cloud::CloudSpeechEngine;
use engine::RecognitionEngine;
use state::AppState;   // Our custom application state
use std::sync::atomic::{AtomicBool, Ordering};  // Thread-safe boolean for shutdown
use std::sync::Arc;
use tracing::{error, info};  // Structured logging
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};  // Logging setup

/// Global shutdown signal that can be accessed from anywhere in the program.
/// AtomicBool is thread-safe, meaning multiple threads can safely read/write to it.
/// This is used to signal when the server should gracefully shut down.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Constructs the recognition engine** (reads credential material;
///    failure here is fatal, the relay is useless without it)
/// 4. **Creates shared application state** that all requests can access
/// 5. **Configures the HTTP server** with middleware and routes
/// 6. **Handles graceful shutdown** when receiving system signals
///
/// ## Error Handling:
/// If any step fails (config loading, credentials, server binding, etc.), the
/// function returns an error and the program exits with an error message.
#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    // .ok() means "ignore errors" - it's fine if there's no .env file
    dotenv::dotenv().ok();

    // Set up structured logging (tracing) for debugging and monitoring
    init_tracing()?;

    // Load application configuration from config.toml and environment variables
    let config = AppConfig::load()?;
    // Validate that the configuration makes sense (e.g., port isn't 0)
    config.validate()?;

    info!("Starting speech-relay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    // Construct the recognition engine once for the whole process. This reads
    // the API key from disk; a missing or empty key aborts startup.
    let engine: Arc<dyn RecognitionEngine> = Arc::new(CloudSpeechEngine::from_config(&config.engine)?);
    info!(
        "Recognition engine ready: {} ({})",
        config.engine.endpoint, config.engine.model
    );

    // Create the shared application state that all HTTP requests can access
    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // Set up signal handlers for graceful shutdown (Ctrl+C, SIGTERM, etc.)
    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    // Create the HTTP server with all its configuration
    let server = HttpServer::new(move || {
        // Configure CORS so browser clients on other origins can connect
        let cors = Cors::default()
            .allow_any_origin()    // Allow requests from any domain
            .allow_any_method()    // Allow GET, POST, PUT, DELETE, etc.
            .allow_any_header()    // Allow any HTTP headers
            .max_age(3600);        // Cache CORS settings for 1 hour

        // Create the main application with all its configuration
        App::new()
            // Share our application state with all request handlers
            .app_data(web::Data::new(app_state.clone()))
            // Share the engine as a trait object so sessions (and tests)
            // only ever see the RecognitionEngine interface
            .app_data(web::Data::from(engine.clone()))
            // Add middleware in order (they execute in reverse order for responses)
            .wrap(cors)                                    // Handle CORS
            .wrap(Logger::default())                       // Log HTTP requests
            .wrap(middleware::MetricsMiddleware)           // Collect performance metrics
            .wrap(middleware::RequestLogging)              // Custom request logging
            // Define API routes under /api/v1 prefix
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::config::get_config))
            )
            // Also provide health check at root level for convenience
            .route("/health", web::get().to(health::health_check))
            // The relay itself: client audio in, transcripts out
            .route("/ws/audio", web::get().to(relay::audio_websocket))
    })
    .bind(&bind_addr)?  // Bind to the configured host and port
    .run();             // Start the server (but don't block here)

    // Get a handle to control the server and spawn it in a separate task
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Wait for either the server to finish OR a shutdown signal
    tokio::select! {
        // If the server task finishes (which usually means an error)
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        // If we receive a shutdown signal (Ctrl+C, SIGTERM, etc.)
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;  // Gracefully stop the server
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "info", "speech_relay_backend=debug")
/// - If not set, defaults to "speech_relay_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            // Try to read RUST_LOG environment variable, or use defaults
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())  // Format logs nicely for console output
        .init();  // Actually start the logging system

    Ok(())
}

/// Set up signal handlers for graceful shutdown.
///
/// ## What this does:
/// - Listens for SIGTERM (termination signal from system)
/// - Listens for SIGINT (interrupt signal, usually Ctrl+C)
/// - When either signal is received, sets the global shutdown flag
///
/// ## Why this matters:
/// Graceful shutdown lets in-flight requests finish and gives WebSocket
/// sessions a chance to tear their recognition streams down cleanly.
fn setup_signal_handlers() {
    tokio::spawn(async {
        // Set up handlers for different types of shutdown signals
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        // Wait for either signal to arrive
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        // Set the global shutdown flag so other parts of the program know to stop
        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set.
///
/// Simple polling approach: checks the flag every 100ms so the select! in
/// main wakes up shortly after a signal arrives.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
