use writedown_db::DbError;
use writedown_gateway::SubscriptionError;
use writedown_types::QueryError;

/// Failures reported by a `DocumentStore`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("document {0} not found")]
    NotFound(String),
    #[error("document {0} already exists")]
    AlreadyExists(String),
    #[error("invalid query: {0}")]
    InvalidQuery(#[from] QueryError),
    #[error("realtime stream lagged by {0} changes")]
    Lagged(u64),
    #[error("realtime stream closed")]
    Closed,
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { collection, id } => {
                Self::NotFound(format!("{}/{}", collection, id))
            }
            DbError::AlreadyExists { collection, id } => {
                Self::AlreadyExists(format!("{}/{}", collection, id))
            }
            DbError::InvalidQuery(e) => Self::InvalidQuery(e),
            other => Self::Backend(other.to_string()),
        }
    }
}

impl From<SubscriptionError> for StoreError {
    fn from(err: SubscriptionError) -> Self {
        match err {
            SubscriptionError::Lagged(n) => Self::Lagged(n),
            SubscriptionError::Closed => Self::Closed,
        }
    }
}

/// Failures surfaced by the client core. Each keeps its underlying cause.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("page fetch failed: {0}")]
    FetchFailed(#[source] StoreError),
    #[error("realtime subscription failed: {0}")]
    SubscriptionFailed(#[source] StoreError),
    #[error("write failed: {0}")]
    WriteFailed(#[source] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("please enter a channel name")]
    EmptyChannelName,
    #[error("please enter a channel ID")]
    EmptyChannelId,
    #[error("channel {0} does not exist")]
    ChannelNotFound(String),
    #[error("channel {0} is private")]
    ChannelPrivate(String),
    #[error(transparent)]
    Sync(#[from] SyncError),
}
