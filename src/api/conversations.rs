//! Conversation inspection and removal.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};

use crate::session::SessionKey;
use crate::store::{ConversationState, ConversationSummary, StoreError};

use super::routes::{resolve_user, AppState};
use super::types::{DeleteResponse, UserQuery};

fn store_error(err: StoreError) -> (StatusCode, String) {
    tracing::error!("Conversation store error: {}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

/// List a user's conversations in one application, newest first.
pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
    Query(query): Query<UserQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationSummary>>, (StatusCode, String)> {
    let user = resolve_user(query.user_id.as_deref(), &headers);
    let conversations = state.store.list(&app, &user).await.map_err(store_error)?;
    Ok(Json(conversations))
}

pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path((app, id)): Path<(String, String)>,
    Query(query): Query<UserQuery>,
    headers: HeaderMap,
) -> Result<Json<ConversationState>, (StatusCode, String)> {
    let key = SessionKey::new(app, resolve_user(query.user_id.as_deref(), &headers), id);
    match state.store.get(&key).await.map_err(store_error)? {
        Some(conversation) => Ok(Json(conversation)),
        None => Err((
            StatusCode::NOT_FOUND,
            format!("Conversation {} not found", key),
        )),
    }
}

/// Delete a conversation. Refused while a run holds its session.
pub async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path((app, id)): Path<(String, String)>,
    Query(query): Query<UserQuery>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, (StatusCode, String)> {
    let key = SessionKey::new(app, resolve_user(query.user_id.as_deref(), &headers), id);
    if state.guard.is_held(&key) {
        return Err((
            StatusCode::CONFLICT,
            format!("Conversation {} has a run in progress", key),
        ));
    }
    let deleted = state.store.delete(&key).await.map_err(store_error)?;
    tracing::info!(session = %key, deleted, "Conversation delete requested");
    Ok(Json(DeleteResponse { deleted }))
}
