use std::sync::Arc;

use writedown_sync::LocalStore;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub store: LocalStore,
    pub jwt_secret: String,
    /// Page size used when a request gives no limit.
    pub page_size: u32,
}
