use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::warn;

use writedown_sync::{DocumentStore, NewChannel};
use writedown_types::Channel;
use writedown_types::api::{ChannelListResponse, Claims, CreateChannelRequest};
use writedown_types::paths::channels_query;

use crate::error::{channel_status, store_status};
use crate::state::AppState;

/// The caller's channels, ordered by name.
pub async fn list_channels(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let query = channels_query(&claims.sub, state.page_size);
    let docs = state
        .store
        .fetch_all(&query)
        .await
        .map_err(|e| store_status(&e))?;

    let channels = docs
        .into_iter()
        .filter_map(|doc| match doc.decode::<Channel>() {
            Ok(channel) => Some(channel),
            Err(e) => {
                warn!("Corrupt channel '{}' in {}: {}", doc.id, query.collection_path, e);
                None
            }
        })
        .collect();

    Ok(Json(ChannelListResponse { channels }))
}

pub async fn create_channel(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateChannelRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let new = NewChannel {
        name: req.name,
        emoji: req.emoji,
        background: req.emoji_background,
        public: req.public,
    };
    let channel = writedown_sync::create_channel(&state.store, &claims.sub, new)
        .await
        .map_err(|e| channel_status(&e))?;

    Ok((StatusCode::CREATED, Json(channel)))
}

pub async fn join_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let channel = writedown_sync::join_channel(&state.store, &claims.sub, &channel_id)
        .await
        .map_err(|e| channel_status(&e))?;

    Ok(Json(channel))
}
