//! # Configuration Endpoint
//!
//! Exposes the effective process configuration for debugging deployments.
//! Read-only: the relay never renegotiates its configuration at runtime.
//!
//! The credentials *path* is included; the key material itself is never
//! loaded into the configuration and cannot appear here.

use crate::error::AppResult;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// GET /api/v1/config - return the effective configuration.
pub async fn get_config(app_state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = app_state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port,
        },
        "engine": {
            "endpoint": config.engine.endpoint,
            "credentials_path": config.engine.credentials_path,
            "model": config.engine.model,
            "language": config.engine.language,
            "punctuation": config.engine.punctuation,
            "enhanced": config.engine.enhanced,
            "interim_results": config.engine.interim_results,
            "connect_timeout_ms": config.engine.connect_timeout_ms,
        },
        "audio": {
            "sample_rate": config.audio.sample_rate,
            "ready_grace_ms": config.audio.ready_grace_ms,
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}
