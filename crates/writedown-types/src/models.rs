use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::timestamp::ServerTimestamp;

/// Order field of a channel's message collection.
pub const MESSAGE_ORDER_FIELD: &str = "created_at";
/// Order field of a user's channel list.
pub const CHANNEL_ORDER_FIELD: &str = "name";

pub const DEFAULT_CHANNEL_EMOJI: &str = "🙂";

/// Background colours offered for a channel's emoji badge.
pub const CHANNEL_BACKGROUND_COLORS: &[&str] = &[
    "#fde68a", "#fecaca", "#bbf7d0", "#bfdbfe", "#ddd6fe", "#fbcfe8", "#e5e7eb", "#fed7aa",
];

const SLUG_ALPHABET: &[u8] = b"_-0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const SLUG_LEN: usize = 21;

/// Short URL-safe token used for shareable links.
pub fn new_slug() -> String {
    let mut rng = rand::rng();
    (0..SLUG_LEN)
        .map(|_| SLUG_ALPHABET[rng.random_range(0..SLUG_ALPHABET.len())] as char)
        .collect()
}

/// A schemaless record in a collection. Identity is `id` within the
/// collection; everything else is in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Encode a typed model as document fields.
    pub fn from_model<T: Serialize>(id: impl Into<String>, model: &T) -> serde_json::Result<Self> {
        match serde_json::to_value(model)? {
            Value::Object(fields) => Ok(Self::new(id, fields)),
            _ => Err(serde::ser::Error::custom("model must serialize to an object")),
        }
    }

    /// Decode the fields back into a typed model.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub emoji: String,
    pub emoji_background: String,
    /// Owner.
    pub user_id: String,
    #[serde(rename = "type")]
    pub visibility: Visibility,
    pub slug: String,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub members: Vec<String>,
}

impl Channel {
    pub fn is_member(&self, user_id: &str) -> bool {
        self.user_id == user_id || self.members.iter().any(|m| m == user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Message,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub channel_id: Uuid,
    /// Author.
    pub user_id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub updated: bool,
    pub created_at: ServerTimestamp,
    pub slug: String,
}

impl Message {
    /// A fresh message with a client id and slug, stamped by the store on write.
    pub fn compose(channel_id: Uuid, user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_id,
            user_id: user_id.into(),
            text: text.into(),
            kind: MessageKind::Message,
            updated: false,
            created_at: ServerTimestamp::Pending,
            slug: new_slug(),
        }
    }
}
