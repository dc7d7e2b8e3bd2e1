use tracing::warn;
use uuid::Uuid;

use writedown_db::{Database, Result};
use writedown_types::Channel;
use writedown_types::paths::CHANNEL_DIRECTORY;

/// Load a channel from the directory, if it exists and decodes.
pub fn find_channel(db: &Database, channel_id: Uuid) -> Result<Option<Channel>> {
    let Some(doc) = db.get_document(CHANNEL_DIRECTORY, &channel_id.to_string())? else {
        return Ok(None);
    };
    match doc.decode::<Channel>() {
        Ok(channel) => Ok(Some(channel)),
        Err(e) => {
            warn!("Corrupt channel document '{}': {}", doc.id, e);
            Ok(None)
        }
    }
}

/// Whether `user_id` may read (and subscribe to) `collection`.
///
/// - `users/{uid}/channels`: only `uid` itself
/// - `channels/{cid}/messages`: members of the channel
/// - anything else, including the channel directory: nobody
pub fn can_read(db: &Database, user_id: &str, collection: &str) -> Result<bool> {
    let segments: Vec<&str> = collection.split('/').collect();
    match segments.as_slice() {
        ["users", uid, "channels"] => Ok(*uid == user_id),
        ["channels", cid, "messages"] => {
            let Ok(channel_id) = cid.parse::<Uuid>() else {
                return Ok(false);
            };
            Ok(find_channel(db, channel_id)?.is_some_and(|c| c.is_member(user_id)))
        }
        _ => Ok(false),
    }
}
