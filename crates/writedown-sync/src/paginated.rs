use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use writedown_types::{Cursor, Document, LiveEvent, QueryDescriptor};

use crate::error::{StoreError, SyncError};
use crate::store::{DocumentStore, LiveStream};
use crate::window::Window;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    /// No valid target.
    Idle,
    /// First page in flight.
    Loading,
    /// Subscribed; live changes are applied as they arrive.
    Active,
    /// Next page in flight; the subscription stays live.
    LoadingMore,
    /// The window is kept as last known until the caller retries or
    /// changes target.
    Error(SyncError),
}

/// What `next_update` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// First page arrived.
    Loaded { len: usize, exhausted: bool },
    /// A further page arrived.
    Extended { added: usize, exhausted: bool },
    /// A live event was processed.
    Live { changed: bool },
    /// A fetch or the subscription failed.
    Failed(SyncError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    Initial,
    More,
}

/// What `retry` has to redo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    Fetch(FetchKind),
    Resubscribe,
}

struct InFlight {
    generation: u64,
    kind: FetchKind,
    fut: BoxFuture<'static, Result<Vec<Document>, StoreError>>,
}

struct LiveHandle {
    generation: u64,
    stream: LiveStream,
}

impl LiveHandle {
    fn cancel(self) {
        debug!("cancelling live subscription (generation {})", self.generation);
        drop(self.stream);
    }
}

enum Step {
    Fetched(u64, FetchKind, Result<Vec<Document>, StoreError>),
    Live(u64, Option<Result<LiveEvent, StoreError>>),
}

/// A live, growable window over an ordered collection.
///
/// All state changes happen in `&mut self` methods. `set_target` and
/// `load_more` only issue work; `next_update` waits for the next fetch
/// result or live event and applies it to completion before returning.
/// Live events that arrive while a fetch is in flight are applied at once
/// and replayed after the page lands, so the merge does not depend on
/// which of the two arrived first.
pub struct PaginatedSubscription<S: DocumentStore> {
    store: Arc<S>,
    target: Option<QueryDescriptor>,
    state: SubscriptionState,
    window: Option<Window>,
    generation: u64,
    live: Option<LiveHandle>,
    in_flight: Option<InFlight>,
    replay: Vec<LiveEvent>,
    recovery: Option<Recovery>,
}

impl<S: DocumentStore> PaginatedSubscription<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            target: None,
            state: SubscriptionState::Idle,
            window: None,
            generation: 0,
            live: None,
            in_flight: None,
            replay: Vec::new(),
            recovery: None,
        }
    }

    pub fn state(&self) -> &SubscriptionState {
        &self.state
    }

    pub fn target(&self) -> Option<&QueryDescriptor> {
        self.target.as_ref()
    }

    /// Read-only copy of the window for rendering.
    pub fn snapshot(&self) -> Vec<Document> {
        self.window.as_ref().map(Window::snapshot).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.window.as_ref().map_or(0, Window::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once a short page showed there is nothing more to fetch.
    pub fn is_exhausted(&self) -> bool {
        self.window.as_ref().is_some_and(Window::is_exhausted)
    }

    /// Point the subscription at a new query, or at nothing.
    ///
    /// An invalid descriptor counts as no target. Re-setting the current
    /// target is a no-op unless the subscription is in `Error`.
    pub fn set_target(&mut self, target: Option<QueryDescriptor>) {
        let target = target.filter(|q| match q.validate() {
            Ok(()) => true,
            Err(e) => {
                debug!("ignoring invalid target: {}", e);
                false
            }
        });

        if target == self.target && !matches!(self.state, SubscriptionState::Error(_)) {
            return;
        }

        self.teardown();
        self.target = target;

        match self.target.clone() {
            Some(query) => {
                info!("subscribing to {}", query.collection_path);
                self.start(query);
            }
            None => self.state = SubscriptionState::Idle,
        }
    }

    /// Request the next page. Returns whether a fetch was issued: nothing
    /// happens unless `Active` (or failed on a previous `load_more`) and
    /// not exhausted.
    pub fn load_more(&mut self) -> bool {
        let retrying = matches!(self.state, SubscriptionState::Error(_))
            && self.recovery == Some(Recovery::Fetch(FetchKind::More));
        if self.state != SubscriptionState::Active && !retrying {
            return false;
        }
        let Some(window) = self.window.as_ref() else {
            return false;
        };
        if window.is_exhausted() {
            debug!("{} exhausted; not fetching", window.query().collection_path);
            return false;
        }
        let Some(cursor) = window.edge().cloned() else {
            return false;
        };

        self.recovery = None;
        self.issue(FetchKind::More, Some(cursor));
        self.state = SubscriptionState::LoadingMore;
        true
    }

    /// Redo whatever put the subscription in `Error`. The retained window
    /// is kept for a failed page fetch and rebuilt for a broken
    /// subscription. Returns whether anything was issued.
    pub fn retry(&mut self) -> bool {
        if !matches!(self.state, SubscriptionState::Error(_)) {
            return false;
        }
        match self.recovery {
            Some(Recovery::Fetch(FetchKind::Initial)) => {
                self.recovery = None;
                self.issue(FetchKind::Initial, None);
                self.state = SubscriptionState::Loading;
                true
            }
            Some(Recovery::Fetch(FetchKind::More)) => self.load_more(),
            Some(Recovery::Resubscribe) | None => {
                let target = self.target.clone();
                self.set_target(target);
                self.target.is_some()
            }
        }
    }

    /// Wait for the next fetch result or live event and apply it.
    /// Returns `None` when there is nothing to wait for.
    pub async fn next_update(&mut self) -> Option<Update> {
        if self.in_flight.is_none() && self.live.is_none() {
            return None;
        }

        let step = {
            let Self { in_flight, live, .. } = self;
            let fetch = async {
                match in_flight {
                    Some(f) => Step::Fetched(f.generation, f.kind, (&mut f.fut).await),
                    None => std::future::pending().await,
                }
            };
            let event = async {
                match live {
                    Some(h) => Step::Live(h.generation, h.stream.next().await),
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                step = fetch => step,
                step = event => step,
            }
        };

        Some(match step {
            Step::Fetched(generation, kind, result) => {
                self.in_flight = None;
                if generation != self.generation {
                    warn!("discarding page from stale generation {}", generation);
                    return Some(Update::Live { changed: false });
                }
                self.on_fetched(kind, result)
            }
            Step::Live(generation, event) => {
                if generation != self.generation {
                    warn!("discarding event from stale generation {}", generation);
                    return Some(Update::Live { changed: false });
                }
                match event {
                    Some(Ok(event)) => Update::Live {
                        changed: self.on_live(event),
                    },
                    Some(Err(e)) => self.fail_subscription(e),
                    None => self.fail_subscription(StoreError::Closed),
                }
            }
        })
    }

    fn start(&mut self, query: QueryDescriptor) {
        self.window = Some(Window::new(query.clone()));

        // Subscribe before fetching so no write between the two is missed.
        match self.store.subscribe(&query) {
            Ok(stream) => {
                self.live = Some(LiveHandle {
                    generation: self.generation,
                    stream,
                });
                self.issue(FetchKind::Initial, None);
                self.state = SubscriptionState::Loading;
            }
            Err(e) => {
                warn!("subscribe to {} failed: {}", query.collection_path, e);
                self.recovery = Some(Recovery::Resubscribe);
                self.state = SubscriptionState::Error(SyncError::SubscriptionFailed(e));
            }
        }
    }

    /// Cancel the live subscription and any fetch before anything new is
    /// created, and move to a new generation.
    fn teardown(&mut self) {
        if let Some(handle) = self.live.take() {
            handle.cancel();
        }
        self.in_flight = None;
        self.replay.clear();
        self.recovery = None;
        self.window = None;
        self.generation += 1;
    }

    fn issue(&mut self, kind: FetchKind, after: Option<Cursor>) {
        let Some(query) = self.target.clone() else {
            return;
        };
        debug!(
            "fetching {:?} page of {} after {:?}",
            kind, query.collection_path, after
        );
        let store = self.store.clone();
        self.in_flight = Some(InFlight {
            generation: self.generation,
            kind,
            fut: Box::pin(async move { store.fetch_page(&query, after.as_ref()).await }),
        });
    }

    fn on_fetched(&mut self, kind: FetchKind, result: Result<Vec<Document>, StoreError>) -> Update {
        let replay = std::mem::take(&mut self.replay);

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                warn!("{:?} fetch failed: {}", kind, e);
                // A retried fetch reads past every event seen so far.
                let error = SyncError::FetchFailed(e);
                self.recovery = Some(Recovery::Fetch(kind));
                self.state = SubscriptionState::Error(error.clone());
                return Update::Failed(error);
            }
        };

        let Some(window) = self.window.as_mut() else {
            return Update::Live { changed: false };
        };
        let added = window.extend(page);
        for event in replay {
            apply_event(window, event);
        }
        let exhausted = window.is_exhausted();
        let len = window.len();

        self.state = SubscriptionState::Active;
        match kind {
            FetchKind::Initial => {
                debug!("first page: {} items, exhausted={}", len, exhausted);
                Update::Loaded { len, exhausted }
            }
            FetchKind::More => {
                debug!("next page: {} new items, exhausted={}", added, exhausted);
                Update::Extended { added, exhausted }
            }
        }
    }

    fn on_live(&mut self, event: LiveEvent) -> bool {
        let Some(window) = self.window.as_mut() else {
            return false;
        };
        if self.in_flight.is_some() {
            self.replay.push(event.clone());
        }
        apply_event(window, event)
    }

    fn fail_subscription(&mut self, cause: StoreError) -> Update {
        warn!("live subscription failed: {}", cause);
        if let Some(handle) = self.live.take() {
            handle.cancel();
        }
        self.in_flight = None;
        self.replay.clear();
        self.recovery = Some(Recovery::Resubscribe);
        let error = SyncError::SubscriptionFailed(cause);
        self.state = SubscriptionState::Error(error.clone());
        Update::Failed(error)
    }
}

pub(crate) fn apply_event(window: &mut Window, event: LiveEvent) -> bool {
    match event {
        LiveEvent::Delta(change) => window.apply(change).changed(),
        LiveEvent::Snapshot {
            items,
            from_cache,
            exhaustive,
        } => {
            debug!(
                "snapshot of {} items (from_cache={}, exhaustive={})",
                items.len(),
                from_cache,
                exhaustive
            );
            window.apply_snapshot(items, exhaustive)
        }
    }
}
