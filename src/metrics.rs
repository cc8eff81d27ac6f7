//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{Counter, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("photoboard_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint"]
    ).expect("metric can be created");

    // Authentication Metrics
    pub static ref LOGIN_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("photoboard_login_attempts_total", "Total number of sign-in attempts"),
        &["method", "outcome"]
    ).expect("metric can be created");
    pub static ref TOKEN_EXCHANGES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("photoboard_token_exchanges_total", "Total number of authorization code exchanges"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref SESSIONS_PURGED_TOTAL: IntCounter = IntCounter::new(
        "photoboard_sessions_purged_total",
        "Total number of expired sessions removed"
    ).expect("metric can be created");

    // Storage Metrics
    pub static ref IMAGE_UPLOADS_TOTAL: IntCounter = IntCounter::new(
        "photoboard_image_uploads_total",
        "Total number of image uploads"
    ).expect("metric can be created");
    pub static ref IMAGE_BYTES_UPLOADED: Counter = Counter::new(
        "photoboard_image_bytes_uploaded_total",
        "Total bytes of images uploaded"
    ).expect("metric can be created");

    // Application Metrics
    pub static ref POSTS_TOTAL: IntGauge = IntGauge::new(
        "photoboard_posts_total",
        "Total number of posts"
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("photoboard_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .expect("HTTP_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(LOGIN_ATTEMPTS_TOTAL.clone()))
        .expect("LOGIN_ATTEMPTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(TOKEN_EXCHANGES_TOTAL.clone()))
        .expect("TOKEN_EXCHANGES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(SESSIONS_PURGED_TOTAL.clone()))
        .expect("SESSIONS_PURGED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(IMAGE_UPLOADS_TOTAL.clone()))
        .expect("IMAGE_UPLOADS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(IMAGE_BYTES_UPLOADED.clone()))
        .expect("IMAGE_BYTES_UPLOADED can be registered");
    REGISTRY
        .register(Box::new(POSTS_TOTAL.clone()))
        .expect("POSTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
