//! Bot profile listing

use axum::{extract::State, Json};
use intelforge_lookup::BotSummary;

use crate::AppState;

pub async fn list_bots(State(state): State<AppState>) -> Json<Vec<BotSummary>> {
    Json(state.engine.bots())
}
