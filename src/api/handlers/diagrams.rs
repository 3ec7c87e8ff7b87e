use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use super::blocking;
use crate::api::{ApiError, ApiJson, AppState};
use crate::models::*;

pub async fn list_diagrams(
    State(state): State<AppState>,
) -> Result<Json<Vec<DiagramSummary>>, ApiError> {
    blocking(&state.db, |db| db.get_all_diagrams()).await.map(Json)
}

pub async fn get_diagram(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Diagram>, ApiError> {
    blocking(&state.db, move |db| db.get_diagram_by_name(&name))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Diagram"))
}

pub async fn create_diagram(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<CreateDiagramInput>,
) -> Result<(StatusCode, Json<Diagram>), ApiError> {
    let diagram = blocking(&state.db, move |db| db.create_diagram(input)).await?;
    tracing::info!(diagram_id = %diagram.id, name = %diagram.name, "Diagram created");
    Ok((StatusCode::CREATED, Json(diagram)))
}

pub async fn replace_diagram(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ApiJson(content): ApiJson<DiagramContent>,
) -> Result<Json<Diagram>, ApiError> {
    let diagram = blocking(&state.db, move |db| db.replace_diagram_content(&name, content))
        .await?
        .ok_or_else(|| ApiError::not_found("Diagram"))?;

    state
        .sessions
        .reconcile(&diagram.learning_path_id, &diagram.content())
        .await;
    Ok(Json(diagram))
}

/// Creates the template diagram for a learning path, or returns the one it
/// already has with `200`.
pub async fn create_diagram_for_learning_path(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<CreateDiagramByLpInput>,
) -> Result<(StatusCode, Json<Diagram>), ApiError> {
    let learning_path_id = input
        .learning_path_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("learningPathId is required".to_string()))?;

    let outcome = blocking(&state.db, move |db| {
        db.create_diagram_for_learning_path(&learning_path_id, input.name.as_deref())
    })
    .await?;

    match outcome {
        CreateOutcome::Created(diagram) => {
            tracing::info!(
                learning_path_id = %diagram.learning_path_id,
                name = %diagram.name,
                "Diagram created from template"
            );
            Ok((StatusCode::CREATED, Json(diagram)))
        }
        CreateOutcome::Existing(diagram) => Ok((StatusCode::OK, Json(diagram))),
    }
}

pub async fn get_diagram_for_learning_path(
    State(state): State<AppState>,
    Path(lp_id): Path<String>,
) -> Result<Json<Diagram>, ApiError> {
    blocking(&state.db, move |db| db.get_diagram_by_learning_path(&lp_id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Diagram"))
}

pub async fn update_diagram_for_learning_path(
    State(state): State<AppState>,
    Path(lp_id): Path<String>,
    ApiJson(input): ApiJson<UpdateDiagramInput>,
) -> Result<Json<Diagram>, ApiError> {
    let touches_graph = input.nodes.is_some() || input.edges.is_some();
    let key = lp_id.clone();

    let diagram = blocking(&state.db, move |db| {
        db.update_diagram_for_learning_path(&lp_id, input)
    })
    .await?
    .ok_or_else(|| ApiError::not_found("Diagram"))?;

    if touches_graph {
        state.sessions.reconcile(&key, &diagram.content()).await;
    }
    Ok(Json(diagram))
}

/// Deletes the diagram of a learning path. Succeeds whether or not a
/// diagram existed.
pub async fn delete_diagram_for_learning_path(
    State(state): State<AppState>,
    Path(lp_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key = lp_id.clone();
    // Closes and drains the session before the row goes away.
    let (_, deleted) = state
        .sessions
        .evict_while(
            &key,
            blocking(&state.db, move |db| db.delete_diagram_for_learning_path(&lp_id)),
        )
        .await;
    let deleted = deleted?;

    tracing::info!(learning_path_id = %key, deleted, "Diagram delete requested");
    Ok(StatusCode::NO_CONTENT)
}
