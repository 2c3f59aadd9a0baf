//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_SERVER_PORT, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! Everything here is fixed for the lifetime of the process. Individual relay
//! sessions never renegotiate the audio format or the recognition settings.

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                    // For reading environment variables

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, engine, audio)
/// makes it easier to understand and maintain as the application grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub audio: AudioConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
/// - `port = 8081`: Default relay port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Cloud recognition engine configuration.
///
/// ## Fields:
/// - `endpoint`: Streaming WebSocket URL of the recognition provider
/// - `credentials_path`: File containing the provider API key. Read once at
///   startup; an unreadable or empty file is a fatal startup error.
/// - `model`: Provider model identifier
/// - `language`: BCP-47 language code the stream is opened with
/// - `punctuation`: Ask the provider for automatic punctuation
/// - `enhanced`: Prefer the provider's enhanced model variant
/// - `interim_results`: Receive interim (non-final) transcript fragments
/// - `connect_timeout_ms`: Bound on establishing the upstream connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub endpoint: String,
    pub credentials_path: String,
    pub model: String,
    pub language: String,
    pub punctuation: bool,
    pub enhanced: bool,
    pub interim_results: bool,
    pub connect_timeout_ms: u64,
}

/// Audio pipeline configuration.
///
/// ## Fields:
/// - `sample_rate`: Sample rate (Hz) the client is expected to capture at.
///   This is the single source of truth: the same value is declared to the
///   recognition engine when a stream is opened.
/// - `ready_grace_ms`: How long the first audio frame of a connection waits
///   for the upstream stream to become writable before it is dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub ready_grace_ms: u64,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the application can start even if no configuration file exists.
/// They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8081,                     // Default relay port
            },
            engine: EngineConfig {
                endpoint: "wss://stt.example-speech.dev/v1/stream".to_string(),
                credentials_path: "credentials/speech_api_key".to_string(),
                model: "enhanced-streaming-v2".to_string(),
                language: "en-US".to_string(),
                punctuation: true,
                enhanced: true,
                interim_results: true,
                connect_timeout_ms: 10_000,
            },
            audio: AudioConfig {
                sample_rate: 48_000,   // Browser capture default
                ready_grace_ms: 150,   // Empirically precedes upstream readiness
            },
        }
    }
}

/// Implementation block for AppConfig - adds methods to the struct.
impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_HOST=0.0.0.0`: Override server host
    /// - `APP_ENGINE_LANGUAGE=de-DE`: Override recognition language
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists) - required(false) means "don't error if missing"
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            // Example: APP_SERVER_HOST becomes server.host in the config
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Handle special environment variables used by deployment platforms
        // These don't follow the APP_ prefix convention but are commonly used
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // Build the final configuration and convert it back to our AppConfig struct
        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0 (port 0 is reserved and can't be used)
    /// - Engine endpoint, credentials path and language are present
    /// - Sample rate is a plausible capture rate
    /// - The readiness grace period is non-zero and bounded
    ///
    /// ## Why validate:
    /// Catching configuration errors early prevents runtime failures and
    /// provides clear error messages about what's wrong.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.engine.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Engine endpoint must be configured"));
        }

        if self.engine.credentials_path.trim().is_empty() {
            return Err(anyhow::anyhow!("Engine credentials path must be configured"));
        }

        if self.engine.language.trim().is_empty() {
            return Err(anyhow::anyhow!("Engine language must be configured"));
        }

        if !(8_000..=192_000).contains(&self.audio.sample_rate) {
            return Err(anyhow::anyhow!(
                "Sample rate {} Hz is outside the supported range (8000-192000)",
                self.audio.sample_rate
            ));
        }

        if self.audio.ready_grace_ms == 0 || self.audio.ready_grace_ms > 5_000 {
            return Err(anyhow::anyhow!(
                "Readiness grace period must be between 1 and 5000 ms"
            ));
        }

        Ok(())  // All validation passed
    }
}

#[cfg(test)]
mod tests {
    use super::*;  // Import everything from the parent module

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.audio.sample_rate, 48_000);
        assert!(config.engine.punctuation);
        assert!(config.engine.interim_results);
        // Ensure the default config passes validation
        assert!(config.validate().is_ok());
    }

    /// Test that validation catches invalid configurations.
    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;  // Invalid port
        // Validation should fail for port 0
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.engine.credentials_path = String::new();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.ready_grace_ms = 0;
        assert!(config.validate().is_err());
    }

    /// The readiness grace default sits inside the band that empirically
    /// precedes upstream readiness.
    #[test]
    fn test_ready_grace_default_band() {
        let config = AppConfig::default();
        assert!((100..=250).contains(&config.audio.ready_grace_ms));
    }
}
