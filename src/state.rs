//! # Application State Management
//!
//! This module manages shared state that needs to be accessed by multiple HTTP request
//! handlers and WebSocket session actors simultaneously.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: Multiple ownership (many handlers can hold a reference)
//! - **RwLock**: Multiple readers OR one writer at a time (thread-safe)
//! - **T**: The actual data type being protected
//!
//! The relay itself keeps no cross-session state: each WebSocket connection owns
//! its session exclusively. What lives here is configuration (read-only after
//! startup) and aggregate observability counters.

use crate::config::AppConfig;        // Our configuration types
use std::collections::HashMap;       // For storing per-endpoint metrics
use std::sync::{Arc, RwLock};        // Thread-safe shared ownership and locking
use std::time::Instant;              // For tracking server uptime

/// The main application state that's shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (fixed at startup, shared read-only)
    pub config: Arc<RwLock<AppConfig>>,

    /// Relay metrics (constantly being updated by requests and sessions)
    pub metrics: Arc<RwLock<RelayMetrics>>,

    /// When the server started (never changes, so no Arc<RwLock> needed)
    pub start_time: Instant,
}

/// Aggregate counters for the relay and its HTTP surface.
///
/// ## Why these metrics matter:
/// - **request_count / error_count**: HTTP load and reliability monitoring
/// - **active_sessions**: Current concurrent WebSocket connections
/// - **frames_forwarded / frames_dropped**: Audio pipeline health. A rising
///   drop count usually means malformed client frames or a slow upstream.
/// - **transcripts_relayed / upstream_errors**: Recognition stream health
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of HTTP errors encountered since server start
    pub error_count: u64,

    /// Current number of active relay sessions (open WebSocket connections)
    pub active_sessions: u32,

    /// Audio frames successfully forwarded to the recognition engine
    pub frames_forwarded: u64,

    /// Audio frames dropped (malformed, stream not writable, or session closing)
    pub frames_dropped: u64,

    /// Total converted PCM bytes written upstream
    pub bytes_forwarded: u64,

    /// Transcript events relayed back to clients
    pub transcripts_relayed: u64,

    /// Upstream recognition stream errors
    pub upstream_errors: u64,

    /// Detailed metrics for each API endpoint (URL path)
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

impl AppState {
    /// Create a new AppState with the given configuration.
    pub fn new(config: AppConfig) -> Self {
        Self {
            // Wrap config for thread-safe sharing
            config: Arc::new(RwLock::new(config)),
            // Start with empty metrics
            metrics: Arc::new(RwLock::new(RelayMetrics::default())),
            // Record when the server started
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    /// AppConfig is designed to be cheap to clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    /// Increment the total error counter (called when any HTTP request fails).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        // Get or create metrics for this specific endpoint
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        // Update the metrics for this endpoint
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Increment the active sessions counter (called when a WebSocket connects).
    pub fn increment_active_sessions(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_sessions += 1;
    }

    /// Decrement the active sessions counter (called when a WebSocket disconnects).
    ///
    /// ## Safety check:
    /// Includes a check to prevent underflow (going below zero). u32 would
    /// panic on underflow in debug builds, so we check first.
    pub fn decrement_active_sessions(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    /// Record an audio frame successfully written to the recognition stream.
    pub fn record_frame_forwarded(&self, bytes: usize) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.frames_forwarded += 1;
        metrics.bytes_forwarded += bytes as u64;
    }

    /// Record an audio frame that was dropped instead of forwarded.
    pub fn record_frame_dropped(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.frames_dropped += 1;
    }

    /// Record a transcript event relayed back to a client.
    pub fn record_transcript_relayed(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.transcripts_relayed += 1;
    }

    /// Record a fatal error reported by the recognition stream.
    pub fn record_upstream_error(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.upstream_errors += 1;
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// ## Why a snapshot:
    /// Clones the data so we don't hold the lock while generating the HTTP
    /// response, and metrics don't change while we're serializing them.
    pub fn get_metrics_snapshot(&self) -> RelayMetrics {
        let metrics = self.metrics.read().unwrap();
        RelayMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_sessions: metrics.active_sessions,
            frames_forwarded: metrics.frames_forwarded,
            frames_dropped: metrics.frames_dropped,
            bytes_forwarded: metrics.bytes_forwarded,
            transcripts_relayed: metrics.transcripts_relayed,
            upstream_errors: metrics.upstream_errors,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Implementation of utility methods for EndpointMetric.
impl EndpointMetric {
    /// Calculate the average response time for this endpoint.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0  // No requests yet, so no average to calculate
        }
    }

    /// Calculate the error rate for this endpoint (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0  // No requests yet, so no errors possible
        }
    }
}
