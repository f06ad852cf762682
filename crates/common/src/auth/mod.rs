//! Actor context extraction
//!
//! Authentication and role checks happen in the upstream auth layer;
//! this service only needs to know who asked, for the audit trail.

use crate::errors::{AppError, Result};
use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

/// Header carrying the authenticated actor identity
pub const ACTOR_HEADER: &str = "x-actor-id";

/// Header carrying the request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_ACTOR_LEN: usize = 128;

/// Extracted caller identity available to handlers
#[derive(Debug, Clone)]
pub struct ActorContext {
    /// Actor identity recorded as `requested_by`
    pub actor: String,

    /// Request ID for tracing
    pub request_id: String,
}

/// Validate an actor identity taken from a header
pub fn parse_actor(raw: &str) -> Result<String> {
    let actor = raw.trim();
    if actor.is_empty() {
        return Err(AppError::Unauthorized {
            message: "Empty X-Actor-Id header".to_string(),
        });
    }
    if actor.len() > MAX_ACTOR_LEN || actor.chars().any(char::is_control) {
        return Err(AppError::Unauthorized {
            message: "Malformed X-Actor-Id header".to_string(),
        });
    }
    Ok(actor.to_string())
}

/// Axum extractor for ActorContext
impl<S> FromRequestParts<S> for ActorContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        // Extract request ID
        let request_id = parts
            .headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let raw = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized {
                message: "Missing X-Actor-Id header".to_string(),
            })?;

        Ok(ActorContext {
            actor: parse_actor(raw)?,
            request_id,
        })
    }
}
