use axum::http::StatusCode;
use tracing::error;

use writedown_sync::{ChannelError, StoreError, SyncError};

pub fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::AlreadyExists(_) => StatusCode::CONFLICT,
        StoreError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
        StoreError::Lagged(_) | StoreError::Closed | StoreError::Backend(_) => {
            error!("store error: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub fn sync_status(err: &SyncError) -> StatusCode {
    match err {
        SyncError::FetchFailed(e)
        | SyncError::SubscriptionFailed(e)
        | SyncError::WriteFailed(e) => store_status(e),
    }
}

pub fn channel_status(err: &ChannelError) -> StatusCode {
    match err {
        ChannelError::EmptyChannelName | ChannelError::EmptyChannelId => StatusCode::BAD_REQUEST,
        ChannelError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
        ChannelError::ChannelPrivate(_) => StatusCode::FORBIDDEN,
        ChannelError::Sync(e) => sync_status(e),
    }
}
