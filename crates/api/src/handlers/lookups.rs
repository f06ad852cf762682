//! Lookup submission, history and artifact handlers

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use intelforge_common::{
    auth::ActorContext,
    db::models::{HistoryFilter, LedgerStats, Pagination, QueryRecord},
    errors::{AppError, Result},
    MAX_QUERY_VALUE_LEN,
};
use intelforge_lookup::{ArtifactKind, Classification, LookupRequest, Submission};

/// Submit lookup request
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitLookupRequest {
    #[validate(length(min = 1, max = 256))]
    pub value: String,
    pub bot_id: Option<String>,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitParams {
    /// Hold the request open until the lookup finishes or the request
    /// budget runs out
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ClassifyRequest {
    #[validate(length(min = 1, max = 256))]
    pub value: String,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub items: Vec<QueryRecord>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

fn validate_value<T: Validate>(body: &T, value: &str) -> Result<()> {
    body.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("value".to_string()),
    })?;
    if value.trim().is_empty() || value.chars().count() > MAX_QUERY_VALUE_LEN {
        return Err(AppError::Validation {
            message: "value must contain a non-blank lookup value".to_string(),
            field: Some("value".to_string()),
        });
    }
    Ok(())
}

/// Submit a lookup. `202` while running, `200` once terminal.
pub async fn submit_lookup(
    State(state): State<AppState>,
    actor: ActorContext,
    Query(params): Query<SubmitParams>,
    Json(body): Json<SubmitLookupRequest>,
) -> Result<(StatusCode, Json<QueryRecord>)> {
    validate_value(&body, &body.value)?;

    let request = LookupRequest {
        value: body.value,
        bot_id: body.bot_id,
        requested_by: actor.actor,
        force_refresh: body.force_refresh,
    };

    if !params.wait {
        let record = state.engine.submit(request).await?;
        tracing::info!(
            query_id = %record.id,
            request_id = %actor.request_id,
            "Lookup submitted"
        );
        return Ok((StatusCode::ACCEPTED, Json(record)));
    }

    match state
        .engine
        .submit_and_wait(request, state.config.request_timeout())
        .await?
    {
        Submission::Finished(record) => Ok((StatusCode::OK, Json(record))),
        Submission::Running(record) => Ok((StatusCode::ACCEPTED, Json(record))),
    }
}

pub async fn get_lookup(
    State(state): State<AppState>,
    _actor: ActorContext,
    Path(id): Path<Uuid>,
) -> Result<Json<QueryRecord>> {
    Ok(Json(state.engine.get_query(id).await?))
}

pub async fn list_lookups(
    State(state): State<AppState>,
    _actor: ActorContext,
    Query(filter): Query<HistoryFilter>,
    Query(page): Query<Pagination>,
) -> Result<Json<HistoryResponse>> {
    let (items, total) = state.engine.list_history(&filter, page).await?;
    Ok(Json(HistoryResponse {
        items,
        total,
        offset: page.offset,
        limit: page.effective_limit(),
    }))
}

pub async fn lookup_stats(
    State(state): State<AppState>,
    _actor: ActorContext,
) -> Result<Json<LedgerStats>> {
    Ok(Json(state.engine.get_stats().await?))
}

/// Stream a stored artifact with its content type
pub async fn get_artifact(
    State(state): State<AppState>,
    _actor: ActorContext,
    Path((id, kind)): Path<(Uuid, String)>,
) -> Result<Response> {
    let kind = ArtifactKind::parse(&kind).ok_or_else(|| AppError::Validation {
        message: format!("unknown artifact kind '{}', expected html or file", kind),
        field: Some("kind".to_string()),
    })?;

    let artifact = state.engine.get_artifact(id, kind).await?;
    let disposition = format!("inline; filename=\"{}\"", artifact.file_name);

    Ok((
        [
            (header::CONTENT_TYPE, artifact.content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        artifact.bytes,
    )
        .into_response())
}

/// Classification preview; records nothing
pub async fn classify(
    State(state): State<AppState>,
    Json(body): Json<ClassifyRequest>,
) -> Result<Json<Classification>> {
    validate_value(&body, &body.value)?;
    Ok(Json(state.engine.classify(&body.value)))
}
