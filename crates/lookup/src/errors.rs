//! Lookup engine error types

use intelforge_common::db::models::QueryType;
use intelforge_common::errors::AppError;
use thiserror::Error;

/// Transport-level failures reported by the session gateway
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Session authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Session not ready (state: {0})")]
    NotReady(String),

    #[error("Relay protocol error: {0}")]
    Protocol(String),

    #[error("Event stream closed")]
    Closed,
}

impl GatewayError {
    /// Whether the session itself must be re-established
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, GatewayError::Auth(_) | GatewayError::Closed)
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            GatewayError::Protocol(e.to_string())
        } else {
            GatewayError::Network(e.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Ambiguous input classified as {chosen}, also matches {alternatives:?}")]
    ClassificationAmbiguous {
        chosen: QueryType,
        alternatives: Vec<QueryType>,
    },

    #[error("Messaging session not ready: {0}")]
    GatewayNotReady(String),

    #[error("Lookup still queued or running after {waited_ms}ms")]
    GatewayBusyTimeout { waited_ms: u64 },

    #[error("Bot gave no terminal reply within {waited_ms}ms")]
    BotTimeout { waited_ms: u64 },

    #[error("Bot transport error: {0}")]
    BotTransportError(String),

    #[error("Materialization failed: {0}")]
    MaterializationError(String),

    #[error("Unknown bot profile: {0}")]
    UnknownBot(String),

    #[error("Invalid bot configuration: {0}")]
    Configuration(String),

    #[error("Illegal status transition for query {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error(transparent)]
    Ledger(AppError),
}

impl From<GatewayError> for LookupError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Auth(_) | GatewayError::NotReady(_) => {
                LookupError::GatewayNotReady(e.to_string())
            }
            other => LookupError::BotTransportError(other.to_string()),
        }
    }
}

impl From<AppError> for LookupError {
    fn from(e: AppError) -> Self {
        match e {
            AppError::InvalidTransition { id, from, to } => {
                LookupError::InvalidTransition { id, from, to }
            }
            other => LookupError::Ledger(other),
        }
    }
}

impl From<std::io::Error> for LookupError {
    fn from(e: std::io::Error) -> Self {
        LookupError::MaterializationError(e.to_string())
    }
}

impl From<LookupError> for AppError {
    fn from(e: LookupError) -> Self {
        match e {
            LookupError::ClassificationAmbiguous { .. } => AppError::Validation {
                message: e.to_string(),
                field: Some("value".to_string()),
            },
            LookupError::GatewayNotReady(message) => AppError::GatewayUnavailable { message },
            LookupError::GatewayBusyTimeout { .. } | LookupError::BotTimeout { .. } => {
                AppError::GatewayTimeout {
                    message: e.to_string(),
                }
            }
            LookupError::BotTransportError(message) => AppError::GatewayUnavailable { message },
            LookupError::MaterializationError(message) => AppError::Storage { message },
            LookupError::UnknownBot(id) => AppError::BotNotFound { id },
            LookupError::Configuration(message) => AppError::Configuration { message },
            LookupError::InvalidTransition { id, from, to } => {
                AppError::InvalidTransition { id, from, to }
            }
            LookupError::Ledger(inner) => inner,
        }
    }
}

pub type Result<T> = std::result::Result<T, LookupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_mapping() {
        let e: LookupError = GatewayError::Auth("expired".into()).into();
        assert!(matches!(e, LookupError::GatewayNotReady(_)));

        let e: LookupError = GatewayError::Network("reset".into()).into();
        assert!(matches!(e, LookupError::BotTransportError(_)));
    }

    #[test]
    fn test_ledger_transition_is_preserved() {
        let e: LookupError = AppError::InvalidTransition {
            id: "q".into(),
            from: "completed".into(),
            to: "processing".into(),
        }
        .into();
        assert!(matches!(e, LookupError::InvalidTransition { .. }));

        let app: AppError = e.into();
        assert_eq!(app.status_code().as_u16(), 409);
    }

    #[test]
    fn test_not_ready_is_service_unavailable() {
        let app: AppError = LookupError::GatewayNotReady("down".into()).into();
        assert_eq!(app.status_code().as_u16(), 503);
    }
}
