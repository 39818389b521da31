//! # Application State Management
//!
//! State shared by every HTTP handler and WebSocket actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers hold a reference to the same data
//! - **RwLock**: many readers or one writer at a time
//! - Used for the runtime-updatable configuration and the request metrics
//!
//! ### Cheap clones
//! `AppState` derives `Clone`; cloning copies a handful of `Arc` pointers, which is
//! what `web::Data` and the background tasks rely on.
//!
//! ## What lives here:
//! - **config**: current configuration, also pushed to the session manager on update
//! - **metrics**: per-endpoint request counters, fed by the telemetry middleware
//! - **sessions**: the voice session manager

use crate::config::AppConfig;
use crate::session::{Collaborators, SessionManager};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics, updated by middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Live voice sessions
    pub sessions: SessionManager,

    /// When the server started
    pub start_time: Instant,
}

/// Request metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of 4xx/5xx responses since server start
    pub error_count: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    /// Create the shared state and the session manager.
    ///
    /// ## Parameters:
    /// - **config**: validated configuration
    /// - **collaborators**: enhancement, transcription and backend services
    ///   shared by every session
    pub fn new(config: AppConfig, collaborators: Collaborators) -> Self {
        let sessions = SessionManager::new(config.clone(), collaborators);
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            sessions,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Validate and install a new configuration.
    ///
    /// The session manager picks it up for sessions created afterwards; running
    /// sessions keep the settings they were created with.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config.clone();
        self.sessions.update_settings(new_config);
        Ok(())
    }

    /// Record one finished request (called by the telemetry middleware).
    ///
    /// ## Parameters:
    /// - **endpoint**: e.g. "GET /api/v1/sessions"
    /// - **duration_ms**: how long the request took
    /// - **is_error**: whether the response status was 4xx or 5xx
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Cloned so the lock is not held while the response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
