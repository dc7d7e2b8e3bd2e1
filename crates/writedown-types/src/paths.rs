//! Collection layout of the chat data.
//!
//! - `channels`: directory of every channel, used to resolve joins
//! - `users/{uid}/channels`: channels a user belongs to
//! - `channels/{cid}/messages`: messages of one channel, shared by its members

use uuid::Uuid;

use crate::models::{CHANNEL_ORDER_FIELD, MESSAGE_ORDER_FIELD};
use crate::query::QueryDescriptor;

pub const CHANNEL_DIRECTORY: &str = "channels";

pub fn user_channels(user_id: &str) -> String {
    format!("users/{}/channels", user_id)
}

pub fn channel_messages(channel_id: Uuid) -> String {
    format!("channels/{}/messages", channel_id)
}

/// Paged, creation-ordered view of a channel's messages.
pub fn messages_query(channel_id: Uuid, page_size: u32) -> QueryDescriptor {
    QueryDescriptor::new(channel_messages(channel_id), MESSAGE_ORDER_FIELD, page_size)
}

/// Name-ordered view of a user's channels.
pub fn channels_query(user_id: &str, page_size: u32) -> QueryDescriptor {
    QueryDescriptor::new(user_channels(user_id), CHANNEL_ORDER_FIELD, page_size)
}
