use serde::{Deserialize, Serialize};

use crate::models::Document;

/// One committed write, as seen by subscribers of its collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "document", rename_all = "snake_case")]
pub enum DocumentChange {
    Added(Document),
    Modified(Document),
    Removed { id: String },
}

impl DocumentChange {
    pub fn id(&self) -> &str {
        match self {
            Self::Added(doc) | Self::Modified(doc) => &doc.id,
            Self::Removed { id } => id,
        }
    }
}

/// What a realtime subscription delivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LiveEvent {
    /// Ordered prefix of the query's collection. Authoritative up to its
    /// last item, or for the whole collection when `exhaustive`.
    Snapshot {
        items: Vec<Document>,
        from_cache: bool,
        exhaustive: bool,
    },

    /// A single incremental change.
    Delta(DocumentChange),
}

/// A change tagged with the collection it happened in; the unit the
/// dispatcher broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionChange {
    pub collection: String,
    pub change: DocumentChange,
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: String },

    /// A document changed in a subscribed collection
    Change(CollectionChange),

    /// A subscription was refused or broke; the client should resubscribe
    Error { collection: String, reason: String },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Start receiving changes for a collection
    Subscribe { collection: String },

    /// Stop receiving changes for a collection
    Unsubscribe { collection: String },
}
