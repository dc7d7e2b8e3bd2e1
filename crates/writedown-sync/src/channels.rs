use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use writedown_types::models::{CHANNEL_BACKGROUND_COLORS, DEFAULT_CHANNEL_EMOJI, new_slug};
use writedown_types::paths::{CHANNEL_DIRECTORY, channels_query, messages_query, user_channels};
use writedown_types::{Channel, Document, QueryDescriptor, Visibility};

use crate::error::{ChannelError, StoreError, SyncError};
use crate::paginated::apply_event;
use crate::store::{DocumentStore, LiveStream};
use crate::window::Window;

/// Page size recorded on the channel list query. The list is loaded whole.
const CHANNEL_LIST_PAGE_SIZE: u32 = 50;

/// Input of the "new channel" form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChannel {
    pub name: String,
    /// Falls back to the default emoji when unset or blank.
    pub emoji: Option<String>,
    /// Index into the background palette; wraps around.
    pub background: usize,
    pub public: bool,
}

fn encode(channel: &Channel) -> Result<Document, ChannelError> {
    Document::from_model(channel.id.to_string(), channel)
        .map_err(|e| SyncError::WriteFailed(StoreError::Backend(e.to_string())).into())
}

fn decode(doc: &Document) -> Result<Channel, ChannelError> {
    doc.decode().map_err(|e| {
        warn!("channel {} is corrupt: {}", doc.id, e);
        SyncError::FetchFailed(StoreError::Backend(e.to_string())).into()
    })
}

/// Create a channel owned by `user_id` and add it to the owner's list.
pub async fn create_channel<S: DocumentStore>(
    store: &S,
    user_id: &str,
    new: NewChannel,
) -> Result<Channel, ChannelError> {
    let name = new.name.trim();
    if name.is_empty() {
        return Err(ChannelError::EmptyChannelName);
    }

    let emoji = new
        .emoji
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CHANNEL_EMOJI.to_string());
    let background = CHANNEL_BACKGROUND_COLORS[new.background % CHANNEL_BACKGROUND_COLORS.len()];

    let channel = Channel {
        id: Uuid::new_v4(),
        name: name.to_string(),
        emoji,
        emoji_background: background.to_string(),
        user_id: user_id.to_string(),
        visibility: if new.public {
            Visibility::Public
        } else {
            Visibility::Private
        },
        slug: new_slug(),
        messages: Vec::new(),
        members: vec![user_id.to_string()],
    };
    let doc = encode(&channel)?;

    // The owner's copy exists before the channel can be joined.
    store
        .set_document(&user_channels(user_id), &doc.id, doc.fields.clone())
        .await
        .map_err(SyncError::WriteFailed)?;
    store
        .create_document(CHANNEL_DIRECTORY, &doc.id, doc.fields)
        .await
        .map_err(SyncError::WriteFailed)?;

    info!("user {} created channel {} ({})", user_id, channel.name, channel.id);
    Ok(channel)
}

/// Join an existing channel by id. Joining twice is harmless.
///
/// Member lists only ever grow through atomic unions and a user's copy is
/// created once and never replaced, so concurrent joins all end up in the
/// directory and in every member's copy.
pub async fn join_channel<S: DocumentStore>(
    store: &S,
    user_id: &str,
    channel_id: &str,
) -> Result<Channel, ChannelError> {
    let channel_id = channel_id.trim();
    if channel_id.is_empty() {
        return Err(ChannelError::EmptyChannelId);
    }
    let not_found = || ChannelError::ChannelNotFound(channel_id.to_string());
    let id = Uuid::parse_str(channel_id).map_err(|_| not_found())?.to_string();

    let doc = store
        .get_document(CHANNEL_DIRECTORY, &id)
        .await
        .map_err(SyncError::FetchFailed)?
        .ok_or_else(not_found)?;
    let channel = decode(&doc)?;

    if channel.visibility == Visibility::Private && !channel.is_member(user_id) {
        return Err(ChannelError::ChannelPrivate(channel_id.to_string()));
    }
    let me = Value::String(user_id.to_string());

    let listed = store
        .array_union(CHANNEL_DIRECTORY, &id, "members", vec![me.clone()])
        .await
        .map_err(SyncError::WriteFailed)?;

    let own_path = user_channels(user_id);
    match store.create_document(&own_path, &id, listed.fields).await {
        Ok(_) | Err(StoreError::AlreadyExists(_)) => {}
        Err(e) => return Err(SyncError::WriteFailed(e).into()),
    }

    // Read again now that the copy exists: a user who joined meanwhile has
    // either added themselves to it or shows up here.
    let current = store
        .get_document(CHANNEL_DIRECTORY, &id)
        .await
        .map_err(SyncError::FetchFailed)?
        .ok_or_else(not_found)?;
    let current = decode(&current)?;
    let members = current.members.iter().cloned().map(Value::String).collect();
    let own = store
        .array_union(&own_path, &id, "members", members)
        .await
        .map_err(SyncError::WriteFailed)?;

    for member in current.members.iter().filter(|m| *m != user_id) {
        match store
            .array_union(&user_channels(member), &id, "members", vec![me.clone()])
            .await
        {
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => debug!("{} has no copy of {}", member, id),
            Err(e) => return Err(SyncError::WriteFailed(e).into()),
        }
    }

    if channel.members.iter().any(|m| m == user_id) {
        debug!("user {} already in channel {}", user_id, id);
    } else {
        info!("user {} joined channel {}", user_id, id);
    }
    decode(&own)
}

/// Live list of a user's channels, ordered by name, with the selection
/// held explicitly.
///
/// Whenever nothing is selected, or the selected channel leaves the list,
/// the first channel becomes selected.
pub struct ChannelList<S: DocumentStore> {
    store: Arc<S>,
    user_id: String,
    window: Window,
    live: LiveStream,
    selected: Option<Uuid>,
}

impl<S: DocumentStore> ChannelList<S> {
    pub async fn open(store: Arc<S>, user_id: impl Into<String>) -> Result<Self, SyncError> {
        let user_id = user_id.into();
        let query = channels_query(&user_id, CHANNEL_LIST_PAGE_SIZE);
        let (live, docs) = connect(store.as_ref(), &query).await?;

        let mut window = Window::new(query);
        let len = window.load_all(docs);
        debug!("loaded {} channels for {}", len, user_id);

        let mut list = Self {
            store,
            user_id,
            window,
            live,
            selected: None,
        };
        list.reconcile();
        Ok(list)
    }

    /// Resubscribe and reload after `next_change` failed. The failed feed
    /// is finished, so `next_change` keeps returning `Closed` until this
    /// succeeds. The selection survives if the channel is still listed.
    pub async fn reopen(&mut self) -> Result<(), SyncError> {
        let query = self.window.query().clone();
        let (live, docs) = connect(self.store.as_ref(), &query).await?;
        self.live = live;
        let len = self.window.load_all(docs);
        info!("reloaded {} channels for {}", len, self.user_id);
        self.reconcile();
        Ok(())
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Wait for the next realtime event and apply it. Returns whether the
    /// list changed. After an error, call `reopen` to resume.
    pub async fn next_change(&mut self) -> Result<bool, SyncError> {
        let event = match self.live.next().await {
            Some(Ok(event)) => event,
            Some(Err(e)) => return Err(SyncError::SubscriptionFailed(e)),
            None => return Err(SyncError::SubscriptionFailed(StoreError::Closed)),
        };
        let changed = apply_event(&mut self.window, event);
        self.reconcile();
        Ok(changed)
    }

    /// The channels in display order. Documents that fail to decode are skipped.
    pub fn channels(&self) -> Vec<Channel> {
        self.window
            .documents()
            .filter_map(|doc| match doc.decode() {
                Ok(channel) => Some(channel),
                Err(e) => {
                    warn!("skipping corrupt channel {}: {}", doc.id, e);
                    None
                }
            })
            .collect()
    }

    pub fn selected(&self) -> Option<Uuid> {
        self.selected
    }

    /// Select a channel in the list. Unknown ids leave the selection as is.
    pub fn select(&mut self, channel_id: Uuid) -> bool {
        if !self.window.contains(&channel_id.to_string()) {
            return false;
        }
        self.selected = Some(channel_id);
        true
    }

    /// Message query of the selected channel, for `PaginatedSubscription::set_target`.
    pub fn message_target(&self, page_size: u32) -> Option<QueryDescriptor> {
        self.selected.map(|id| messages_query(id, page_size))
    }

    fn reconcile(&mut self) {
        if let Some(id) = self.selected {
            if self.window.contains(&id.to_string()) {
                return;
            }
            debug!("selected channel {} left the list", id);
        }
        self.selected = self
            .window
            .documents()
            .find_map(|doc| Uuid::parse_str(&doc.id).ok());
    }
}

/// Subscribe first, then load, so no change between the two is missed.
async fn connect<S: DocumentStore>(
    store: &S,
    query: &QueryDescriptor,
) -> Result<(LiveStream, Vec<Document>), SyncError> {
    let live = store.subscribe(query).map_err(SyncError::SubscriptionFailed)?;
    let docs = store.fetch_all(query).await.map_err(SyncError::FetchFailed)?;
    Ok((live, docs))
}
