use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{error, warn};
use uuid::Uuid;

use writedown_gateway::access;
use writedown_sync::DocumentStore;
use writedown_types::api::{Claims, EditMessageRequest, MessagePageResponse, SendMessageRequest};
use writedown_types::paths::{channel_messages, messages_query};
use writedown_types::{Cursor, Document, Message, SortKey};

use crate::error::store_status;
use crate::state::AppState;

pub const MAX_PAGE_LIMIT: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub limit: Option<u32>,
    /// `created_at` of the last message of the previous page.
    pub after_key: Option<String>,
    /// Id of the last message of the previous page.
    pub after_id: Option<String>,
}

impl MessageQuery {
    fn limit(&self, default: u32) -> u32 {
        self.limit.unwrap_or(default).clamp(1, MAX_PAGE_LIMIT)
    }

    /// Both halves of the cursor, or neither.
    fn cursor(&self) -> Result<Option<Cursor>, StatusCode> {
        match (&self.after_key, &self.after_id) {
            (None, None) => Ok(None),
            (Some(key), Some(id)) => Ok(Some(Cursor {
                key: SortKey::Text(key.clone()),
                id: id.clone(),
            })),
            _ => Err(StatusCode::BAD_REQUEST),
        }
    }
}

/// Only channel members may touch a channel's messages.
async fn authorize(state: &AppState, user_id: &str, channel_id: Uuid) -> Result<(), StatusCode> {
    let db = state.store.db().clone();
    let user_id = user_id.to_string();
    let collection = channel_messages(channel_id);

    let allowed = tokio::task::spawn_blocking(move || access::can_read(&db, &user_id, &collection))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("access check failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if allowed {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

fn decode_message(doc: &Document) -> Result<Message, StatusCode> {
    doc.decode().map_err(|e| {
        error!("Corrupt message '{}': {}", doc.id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Load a message for a write by its author.
async fn authored_message(
    state: &AppState,
    channel_id: Uuid,
    message_id: Uuid,
    user_id: &str,
) -> Result<Message, StatusCode> {
    let doc = state
        .store
        .get_document(&channel_messages(channel_id), &message_id.to_string())
        .await
        .map_err(|e| store_status(&e))?
        .ok_or(StatusCode::NOT_FOUND)?;
    let message = decode_message(&doc)?;
    if message.user_id != user_id {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(message)
}

/// One page of messages in creation order, starting after the given cursor.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &claims.sub, channel_id).await?;

    let limit = query.limit(state.page_size);
    let after = query.cursor()?;
    let page_query = messages_query(channel_id, limit);

    let docs = state
        .store
        .fetch_page(&page_query, after.as_ref())
        .await
        .map_err(|e| store_status(&e))?;

    let next = if docs.len() == limit as usize {
        docs.last().and_then(|doc| page_query.position(doc))
    } else {
        None
    };
    let (next_after_key, next_after_id) = match next {
        Some(Cursor { key: SortKey::Text(key), id }) => (Some(key), Some(id)),
        _ => (None, None),
    };

    let messages = docs
        .iter()
        .filter_map(|doc| match doc.decode::<Message>() {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Corrupt message '{}' in channel {}: {}", doc.id, channel_id, e);
                None
            }
        })
        .collect();

    Ok(Json(MessagePageResponse {
        messages,
        next_after_key,
        next_after_id,
    }))
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.text.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    authorize(&state, &claims.sub, channel_id).await?;

    let message = Message::compose(channel_id, claims.sub, req.text);
    let doc = Document::from_model(message.id.to_string(), &message).map_err(|e| {
        error!("encoding message failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    // The stored copy carries the resolved timestamp.
    let stored = state
        .store
        .create_document(&channel_messages(channel_id), &doc.id, doc.fields)
        .await
        .map_err(|e| store_status(&e))?;

    Ok((StatusCode::CREATED, Json(decode_message(&stored)?)))
}

pub async fn edit_message(
    State(state): State<AppState>,
    Path((channel_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EditMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.text.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    authorize(&state, &claims.sub, channel_id).await?;
    authored_message(&state, channel_id, message_id, &claims.sub).await?;

    let mut patch = Map::new();
    patch.insert("text".into(), Value::String(req.text));
    patch.insert("updated".into(), Value::Bool(true));

    let doc = state
        .store
        .update_document(&channel_messages(channel_id), &message_id.to_string(), patch)
        .await
        .map_err(|e| store_status(&e))?;

    Ok(Json(decode_message(&doc)?))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path((channel_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &claims.sub, channel_id).await?;
    authored_message(&state, channel_id, message_id, &claims.sub).await?;

    state
        .store
        .delete_document(&channel_messages(channel_id), &message_id.to_string())
        .await
        .map_err(|e| store_status(&e))?;

    Ok(StatusCode::NO_CONTENT)
}
