use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use super::blocking;
use crate::api::{ApiError, ApiJson, AppState};
use crate::auth::User;
use crate::models::*;

fn check_community(user: &User, community: Option<&str>) -> Result<(), ApiError> {
    match community {
        Some(c) if !user.can_access_community(c) => {
            tracing::warn!(user_id = %user.id, community = %c, "Community access denied");
            Err(ApiError::Forbidden(format!(
                "Not a member of community '{}'",
                c
            )))
        }
        _ => Ok(()),
    }
}

pub async fn list_learning_paths(
    State(state): State<AppState>,
    Query(query): Query<ListLearningPathsQuery>,
) -> Result<Json<Vec<LearningPath>>, ApiError> {
    blocking(&state.db, move |db| {
        db.get_learning_paths(query.community.as_deref())
    })
    .await
    .map(Json)
}

pub async fn get_learning_path(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<LearningPath>, ApiError> {
    blocking(&state.db, move |db| db.get_learning_path(id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Learning path"))
}

/// Creates a learning path and its template diagram. If the diagram step
/// fails the learning path is deleted again.
pub async fn create_learning_path(
    State(state): State<AppState>,
    user: User,
    ApiJson(input): ApiJson<CreateLearningPathInput>,
) -> Result<(StatusCode, Json<LearningPath>), ApiError> {
    check_community(&user, input.community.as_deref())?;

    let path = blocking(&state.db, move |db| {
        let path = db.create_learning_path(input)?;
        match db.create_diagram_for_learning_path(&path.id.to_string(), Some(&path.title)) {
            Ok(outcome) => Ok(LearningPath {
                diagram_id: Some(outcome.diagram().id),
                ..path
            }),
            Err(e) => {
                if let Err(cleanup) = db.delete_learning_path(path.id) {
                    tracing::error!(
                        learning_path_id = %path.id,
                        error = %cleanup,
                        "Failed to roll back learning path"
                    );
                }
                Err(e)
            }
        }
    })
    .await?;

    tracing::info!(learning_path_id = %path.id, user_id = %user.id, "Learning path created");
    Ok((StatusCode::CREATED, Json(path)))
}

pub async fn update_learning_path(
    State(state): State<AppState>,
    user: User,
    Path(id): Path<Uuid>,
    ApiJson(input): ApiJson<UpdateLearningPathInput>,
) -> Result<Json<LearningPath>, ApiError> {
    let existing = blocking(&state.db, move |db| db.get_learning_path(id))
        .await?
        .ok_or_else(|| ApiError::not_found("Learning path"))?;
    check_community(&user, existing.community.as_deref())?;

    blocking(&state.db, move |db| db.update_learning_path(id, input))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Learning path"))
}

/// Deletes a learning path with its diagram and favorites. Idempotent.
pub async fn delete_learning_path(
    State(state): State<AppState>,
    user: User,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if let Some(existing) = blocking(&state.db, move |db| db.get_learning_path(id)).await? {
        check_community(&user, existing.community.as_deref())?;
        let (_, deleted) = state
            .sessions
            .evict_while(
                &id.to_string(),
                blocking(&state.db, move |db| db.delete_learning_path(id)),
            )
            .await;
        deleted?;
        tracing::info!(learning_path_id = %id, user_id = %user.id, "Learning path deleted");
    }
    Ok(StatusCode::NO_CONTENT)
}
