use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use writedown_types::paths::channel_messages;
use writedown_types::{Document, Message};

use crate::error::{StoreError, SyncError};
use crate::store::DocumentStore;

/// Input buffer plus the channel and user it posts as.
///
/// Without a bound channel or user, every action silently does nothing;
/// that is a UI boundary, not an error. Sent messages are not inserted
/// into any window: they show up when the realtime feed delivers them.
pub struct MessageComposer<S: DocumentStore> {
    store: Arc<S>,
    channel_id: Option<Uuid>,
    user_id: Option<String>,
    input: String,
}

impl<S: DocumentStore> MessageComposer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            channel_id: None,
            user_id: None,
            input: String::new(),
        }
    }

    pub fn bind_channel(&mut self, channel_id: Option<Uuid>) {
        self.channel_id = channel_id;
    }

    pub fn bind_user(&mut self, user_id: Option<String>) {
        self.user_id = user_id;
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn set_input(&mut self, input: impl Into<String>) {
        self.input = input.into();
    }

    fn binding(&self) -> Option<(Uuid, &str)> {
        Some((self.channel_id?, self.user_id.as_deref()?))
    }

    /// Send the input buffer. Returns the message as submitted (its
    /// timestamp still pending), or `None` if nothing was sent.
    pub async fn submit(&mut self) -> Result<Option<Message>, SyncError> {
        let Some((channel_id, user_id)) = self.binding().map(|(c, u)| (c, u.to_string())) else {
            debug!("submit ignored: no channel or user bound");
            return Ok(None);
        };
        if self.input.trim().is_empty() {
            return Ok(None);
        }

        let message = Message::compose(channel_id, user_id, std::mem::take(&mut self.input));
        let doc = Document::from_model(message.id.to_string(), &message)
            .map_err(|e| SyncError::WriteFailed(StoreError::Backend(e.to_string())))?;

        self.store
            .create_document(&channel_messages(channel_id), &doc.id, doc.fields)
            .await
            .map_err(|e| {
                warn!("sending message to {} failed: {}", channel_id, e);
                SyncError::WriteFailed(e)
            })?;

        Ok(Some(message))
    }

    /// Replace a message's text and flag it as edited.
    pub async fn edit(&self, message_id: Uuid, text: &str) -> Result<bool, SyncError> {
        let Some((channel_id, _)) = self.binding() else {
            return Ok(false);
        };

        let mut patch = Map::new();
        patch.insert("text".into(), Value::String(text.to_string()));
        patch.insert("updated".into(), Value::Bool(true));

        self.store
            .update_document(&channel_messages(channel_id), &message_id.to_string(), patch)
            .await
            .map_err(SyncError::WriteFailed)?;
        Ok(true)
    }

    pub async fn delete(&self, message_id: Uuid) -> Result<bool, SyncError> {
        let Some((channel_id, _)) = self.binding() else {
            return Ok(false);
        };

        self.store
            .delete_document(&channel_messages(channel_id), &message_id.to_string())
            .await
            .map_err(SyncError::WriteFailed)?;
        Ok(true)
    }
}
