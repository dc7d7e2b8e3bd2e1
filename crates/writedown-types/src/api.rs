use serde::{Deserialize, Serialize};

use crate::models::{Channel, Message};

// -- JWT Claims --

/// Claims of the identity provider's tokens. Shared by the REST middleware
/// and the gateway's Identify handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id assigned by the identity provider.
    pub sub: String,
    pub exp: usize,
}

// -- Channels --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateChannelRequest {
    pub name: String,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub emoji_background: usize,
    #[serde(default)]
    pub public: bool,
}

#[derive(Debug, Serialize)]
pub struct ChannelListResponse {
    pub channels: Vec<Channel>,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditMessageRequest {
    pub text: String,
}

/// One page of a channel's messages, oldest first. `next_after_*` is the
/// cursor to pass back for the following page; absent when this page was
/// short (no more messages).
#[derive(Debug, Serialize)]
pub struct MessagePageResponse {
    pub messages: Vec<Message>,
    pub next_after_key: Option<String>,
    pub next_after_id: Option<String>,
}
