//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the chat REST endpoints and the master
//! definition for the OpenAPI specification. These are thin controllers over
//! the conversation store; all interesting behavior lives behind the ports.

use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use lm_chat_core::domain::{Chat, ChatKind, Message};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        create_chat_handler,
        list_chats_handler,
        get_messages_handler,
        rename_chat_handler,
        delete_chat_handler,
    ),
    components(
        schemas(CreateChatRequest, RenameChatRequest, ChatResponse, MessageResponse)
    ),
    tags(
        (name = "LM Chat API", description = "API endpoints for the chat application.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Deserialize, ToSchema, Default)]
pub struct CreateChatRequest {
    /// "music" for catalog-backed chats; anything else is a general chat.
    #[serde(default, rename = "type")]
    pub chat_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct RenameChatRequest {
    pub title: String,
}

#[derive(Serialize, ToSchema)]
pub struct ChatResponse {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub chat_type: String,
}

impl ChatResponse {
    fn from_domain(chat: Chat) -> Self {
        Self {
            id: chat.id,
            title: chat.title,
            created_at: chat.created_at,
            chat_type: chat.kind.as_str().to_string(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct MessageResponse {
    pub id: Uuid,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_user: bool,
}

impl MessageResponse {
    fn from_domain(message: Message) -> Self {
        Self {
            id: message.id,
            content: message.content,
            timestamp: message.created_at,
            is_user: message.is_user,
        }
    }
}

fn internal_error<E: std::fmt::Debug>(context: &'static str, e: E) -> (StatusCode, String) {
    error!("{}: {:?}", context, e);
    (StatusCode::INTERNAL_SERVER_ERROR, context.to_string())
}

fn not_found() -> (StatusCode, String) {
    // Ownership mismatches answer exactly like missing chats.
    (StatusCode::NOT_FOUND, "Chat not found".to_string())
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Create a new chat for the current user.
#[utoipa::path(
    post,
    path = "/api/chats",
    request_body = CreateChatRequest,
    responses(
        (status = 201, description = "Chat created successfully", body = ChatResponse),
        (status = 401, description = "Not authenticated"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn create_chat_handler(
    State(app_state): State<Arc<AppState>>,
    axum::Extension(user_id): axum::Extension<Uuid>,
    Json(req): Json<CreateChatRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let kind = req
        .chat_type
        .as_deref()
        .map(ChatKind::from_name)
        .unwrap_or_default();

    let chat = app_state
        .db
        .create_chat(user_id, req.title.as_deref(), kind)
        .await
        .map_err(|e| internal_error("Failed to create chat", e))?;

    Ok((StatusCode::CREATED, Json(ChatResponse::from_domain(chat))))
}

/// List the current user's chats, newest first.
#[utoipa::path(
    get,
    path = "/api/chats",
    responses(
        (status = 200, description = "The user's chats", body = [ChatResponse]),
        (status = 401, description = "Not authenticated")
    )
)]
pub async fn list_chats_handler(
    State(app_state): State<Arc<AppState>>,
    axum::Extension(user_id): axum::Extension<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let chats = app_state
        .db
        .list_chats(user_id)
        .await
        .map_err(|e| internal_error("Failed to list chats", e))?;

    let response: Vec<ChatResponse> = chats.into_iter().map(ChatResponse::from_domain).collect();
    Ok(Json(response))
}

/// Get the messages of one chat, chronological.
#[utoipa::path(
    get,
    path = "/api/chats/{chat_id}/messages",
    params(("chat_id" = Uuid, Path, description = "The chat to read")),
    responses(
        (status = 200, description = "The chat's messages", body = [MessageResponse]),
        (status = 404, description = "Chat not found"),
        (status = 401, description = "Not authenticated")
    )
)]
pub async fn get_messages_handler(
    State(app_state): State<Arc<AppState>>,
    axum::Extension(user_id): axum::Extension<Uuid>,
    Path(chat_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let chat = app_state
        .db
        .get_chat(chat_id, user_id)
        .await
        .map_err(|e| internal_error("Failed to load chat", e))?
        .ok_or_else(not_found)?;

    let messages = app_state
        .db
        .list_messages(chat.id)
        .await
        .map_err(|e| internal_error("Failed to load messages", e))?;

    let response: Vec<MessageResponse> = messages
        .into_iter()
        .map(MessageResponse::from_domain)
        .collect();
    Ok(Json(response))
}

/// Rename a chat.
#[utoipa::path(
    post,
    path = "/api/chats/{chat_id}/rename",
    params(("chat_id" = Uuid, Path, description = "The chat to rename")),
    request_body = RenameChatRequest,
    responses(
        (status = 200, description = "Chat renamed successfully"),
        (status = 404, description = "Chat not found"),
        (status = 401, description = "Not authenticated")
    )
)]
pub async fn rename_chat_handler(
    State(app_state): State<Arc<AppState>>,
    axum::Extension(user_id): axum::Extension<Uuid>,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<RenameChatRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let renamed = app_state
        .db
        .rename_chat(chat_id, user_id, &req.title)
        .await
        .map_err(|e| internal_error("Failed to rename chat", e))?;

    if renamed {
        Ok(Json(serde_json::json!({ "message": "Chat renamed successfully" })))
    } else {
        Err(not_found())
    }
}

/// Delete a chat and all of its messages.
#[utoipa::path(
    delete,
    path = "/api/chats/{chat_id}",
    params(("chat_id" = Uuid, Path, description = "The chat to delete")),
    responses(
        (status = 200, description = "Chat deleted successfully"),
        (status = 404, description = "Chat not found"),
        (status = 401, description = "Not authenticated")
    )
)]
pub async fn delete_chat_handler(
    State(app_state): State<Arc<AppState>>,
    axum::Extension(user_id): axum::Extension<Uuid>,
    Path(chat_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let deleted = app_state
        .db
        .delete_chat(chat_id, user_id)
        .await
        .map_err(|e| internal_error("Failed to delete chat", e))?;

    if deleted {
        Ok(Json(serde_json::json!({ "message": "Chat deleted successfully" })))
    } else {
        Err(not_found())
    }
}
