use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use super::blocking;
use crate::api::{ApiError, AppState};
use crate::auth::User;
use crate::models::*;

pub async fn list_favorites(
    State(state): State<AppState>,
    user: User,
) -> Result<Json<Vec<LearningPath>>, ApiError> {
    blocking(&state.db, move |db| db.get_favorites(&user.id))
        .await
        .map(Json)
}

pub async fn add_favorite(
    State(state): State<AppState>,
    user: User,
    Path(id): Path<Uuid>,
) -> Result<Json<Favorite>, ApiError> {
    blocking(&state.db, move |db| db.add_favorite(&user.id, id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Learning path"))
}

pub async fn remove_favorite(
    State(state): State<AppState>,
    user: User,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    blocking(&state.db, move |db| db.remove_favorite(&user.id, id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
