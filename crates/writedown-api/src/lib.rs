//! REST surface of the WriteDown store.

pub mod channels;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod state;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, patch, post},
};

pub use state::{AppState, AppStateInner};

/// All authenticated routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/channels", get(channels::list_channels).post(channels::create_channel))
        .route("/channels/{channel_id}/join", post(channels::join_channel))
        .route(
            "/channels/{channel_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route(
            "/channels/{channel_id}/messages/{message_id}",
            patch(messages::edit_message).delete(messages::delete_message),
        )
        .layer(axum_middleware::from_fn_with_state(state.clone(), middleware::require_auth))
        .with_state(state)
}
