//! Configuration management for IntelForge services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use crate::db::models::QueryType;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Messaging session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Correlation cycle timing
    #[serde(default)]
    pub lookup: LookupConfig,

    /// Content store for materialized artifacts
    #[serde(default)]
    pub artifacts: ArtifactConfig,

    /// Bot profiles the engine can target
    #[serde(default = "default_bots")]
    pub bots: Vec<BotProfileConfig>,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds, also the wait budget for synchronous lookups
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes); `memory://` selects the in-memory ledger
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl DatabaseConfig {
    /// Whether the in-memory ledger was requested
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }
}

/// Messaging-network session, held by the relay sidecar.
///
/// Credentials are opaque to the engine; first-time interactive
/// verification happens outside this service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Base URL of the messaging relay
    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    /// Application identity registered with the messaging network
    pub api_id: Option<String>,

    /// Application secret
    pub api_hash: Option<String>,

    /// Account phone / identifier owning the session
    pub phone: Option<String>,

    /// Session name persisted by the relay
    #[serde(default = "default_session_name")]
    pub session_name: String,

    /// Connect timeout in seconds
    #[serde(default = "default_session_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-request timeout for relay calls (send, button press, file download)
    #[serde(default = "default_relay_request_timeout")]
    pub request_timeout_secs: u64,

    /// Long-poll timeout for inbound updates in seconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Give up reconnecting after this many seconds of transient failures
    #[serde(default = "default_reconnect_max_elapsed")]
    pub reconnect_max_elapsed_secs: u64,

    /// Per-subscription event channel capacity
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LookupConfig {
    /// Inactivity timeout; reset only by substantive events
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Hard ceiling on a single correlation cycle
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,

    /// Grace period after a terminal reply to pick up trailing attachments
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Maximum characters kept in `result_preview`
    #[serde(default = "default_preview_limit")]
    pub preview_limit: usize,

    /// Reuse a completed lookup of the same value within this window (0 disables)
    #[serde(default)]
    pub reuse_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactConfig {
    /// Root directory of the filesystem content store
    #[serde(default = "default_artifact_root")]
    pub root: PathBuf,
}

/// One target bot: identity, command templates and reply detection rules
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BotProfileConfig {
    pub id: String,

    pub name: String,

    /// Contact handle on the messaging network
    pub contact: String,

    /// Used when a request does not name a bot
    #[serde(default)]
    pub default: bool,

    /// Command template per query type; `{value}` is replaced by the normalized value
    #[serde(default)]
    pub commands: HashMap<QueryType, String>,

    #[serde(default)]
    pub detection: DetectionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectionConfig {
    /// Case-insensitive markers of an empty result
    #[serde(default = "default_not_found_markers")]
    pub not_found_markers: Vec<String>,

    /// Case-insensitive markers of interim progress messages
    #[serde(default = "default_progress_markers")]
    pub progress_markers: Vec<String>,

    /// Regex matching a text block shaped like a result
    #[serde(default = "default_result_pattern")]
    pub result_pattern: Option<String>,

    /// Regex counting result entries in text or HTML
    #[serde(default = "default_entry_pattern")]
    pub entry_pattern: Option<String>,

    /// Inline-button labels pressed automatically when offered
    #[serde(default)]
    pub follow_buttons: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Lookup submissions per second
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_relay_url() -> String { "http://127.0.0.1:8787".to_string() }
fn default_session_name() -> String { "intelforge".to_string() }
fn default_session_connect_timeout() -> u64 { 15 }
fn default_relay_request_timeout() -> u64 { 30 }
fn default_poll_timeout() -> u64 { 25 }
fn default_reconnect_max_elapsed() -> u64 { 60 }
fn default_event_capacity() -> usize { 64 }
fn default_idle_timeout_secs() -> u64 { 30 }
fn default_max_wait_secs() -> u64 { 120 }
fn default_settle_ms() -> u64 { 1500 }
fn default_preview_limit() -> usize { 500 }
fn default_artifact_root() -> PathBuf { PathBuf::from("data/artifacts") }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "intelforge-lookup".to_string() }
fn default_rate_limit() -> u32 { 2 }
fn default_burst() -> u32 { 10 }
fn default_enabled() -> bool { true }

fn default_not_found_markers() -> Vec<String> {
    ["no results found", "nothing found", "not found", "no data", "0 results"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_progress_markers() -> Vec<String> {
    ["searching", "please wait", "processing", "in progress", "⏳"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_result_pattern() -> Option<String> {
    Some(r"(?im)^\s*(results?|found|records?)\b.*:".to_string())
}

fn default_entry_pattern() -> Option<String> {
    Some(r"(?m)^\s*(?:\d+[.)]|[-•*])\s+\S".to_string())
}

fn default_bots() -> Vec<BotProfileConfig> {
    let commands = [
        (QueryType::Email, "/email {value}"),
        (QueryType::DocumentId, "/doc {value}"),
        (QueryType::Phone, "/phone {value}"),
        (QueryType::Domain, "/domain {value}"),
        (QueryType::Username, "/user {value}"),
        (QueryType::Ip, "/ip {value}"),
    ]
    .into_iter()
    .map(|(t, cmd)| (t, cmd.to_string()))
    .collect();

    vec![BotProfileConfig {
        id: "lookup".to_string(),
        name: "Lookup Bot".to_string(),
        contact: "@lookup_bot".to_string(),
        default: true,
        commands,
        detection: DetectionConfig::default(),
    }]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            api_id: None,
            api_hash: None,
            phone: None,
            session_name: default_session_name(),
            connect_timeout_secs: default_session_connect_timeout(),
            request_timeout_secs: default_relay_request_timeout(),
            poll_timeout_secs: default_poll_timeout(),
            reconnect_max_elapsed_secs: default_reconnect_max_elapsed(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            max_wait_secs: default_max_wait_secs(),
            settle_ms: default_settle_ms(),
            preview_limit: default_preview_limit(),
            reuse_window_secs: 0,
        }
    }
}

impl LookupConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            root: default_artifact_root(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            not_found_markers: default_not_found_markers(),
            progress_markers: default_progress_markers(),
            result_pattern: default_result_pattern(),
            entry_pattern: default_entry_pattern(),
            follow_buttons: Vec::new(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("database.url", "memory://")?
            .set_default("session.relay_url", default_relay_url())?

            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__LOOKUP__IDLE_TIMEOUT_SECS=20
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bots.is_empty() {
            return Err(ConfigError::Message("at least one bot profile is required".into()));
        }
        if self.bots.iter().filter(|b| b.default).count() > 1 {
            return Err(ConfigError::Message("only one bot profile may be marked default".into()));
        }
        if self.lookup.idle_timeout_secs == 0 || self.lookup.max_wait_secs == 0 {
            return Err(ConfigError::Message("lookup timeouts must be non-zero".into()));
        }
        if self.lookup.idle_timeout_secs > self.lookup.max_wait_secs {
            return Err(ConfigError::Message(
                "lookup.idle_timeout_secs must not exceed lookup.max_wait_secs".into(),
            ));
        }
        Ok(())
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database.read_url.as_deref().unwrap_or(&self.database.url)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig {
                url: "postgres://localhost/intelforge".to_string(),
                read_url: None,
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
            },
            session: SessionConfig::default(),
            lookup: LookupConfig::default(),
            artifacts: ArtifactConfig::default(),
            bots: default_bots(),
            observability: ObservabilityConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.lookup.max_wait_secs, 120);
        tokio_test::assert_ok!(config.validate());
    }

    #[test]
    fn test_read_database_fallback() {
        let config = AppConfig::default();
        assert_eq!(config.read_database_url(), "postgres://localhost/intelforge");
        assert!(!config.database.is_memory());
    }

    #[test]
    fn test_default_bot_has_templates() {
        let config = AppConfig::default();
        let bot = &config.bots[0];
        assert!(bot.default);
        assert_eq!(bot.commands.get(&QueryType::Email).map(String::as_str), Some("/email {value}"));
        assert!(!bot.commands.contains_key(&QueryType::Unknown));
    }

    #[test]
    fn test_idle_longer_than_ceiling_rejected() {
        let mut config = AppConfig::default();
        config.lookup.idle_timeout_secs = 300;
        config.lookup.max_wait_secs = 60;
        tokio_test::assert_err!(config.validate());
    }

    #[test]
    fn test_two_default_bots_rejected() {
        let mut config = AppConfig::default();
        let mut second = config.bots[0].clone();
        second.id = "other".into();
        config.bots.push(second);
        tokio_test::assert_err!(config.validate());
    }
}
