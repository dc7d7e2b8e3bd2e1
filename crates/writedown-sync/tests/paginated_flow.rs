use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use writedown_sync::{
    DocumentStore, LiveStream, LocalStore, MessageComposer, PaginatedSubscription, StoreError,
    SubscriptionState, SyncError, Update,
};
use writedown_types::paths::messages_query;
use writedown_types::{
    Cursor, Document, DocumentChange, LiveEvent, Message, QueryDescriptor, ServerTimestamp,
};

fn item(n: u32) -> Document {
    Document::new(format!("{n:02}"), json!({ "n": n }).as_object().cloned().unwrap())
}

fn numbers(docs: &[Document]) -> Vec<u32> {
    docs.iter().map(|d| d.fields["n"].as_u64().unwrap() as u32).collect()
}

fn items_query(page_size: u32) -> QueryDescriptor {
    QueryDescriptor::new("items", "n", page_size)
}

type Sender = mpsc::UnboundedSender<Result<LiveEvent, StoreError>>;
type Fields = Map<String, Value>;

fn read_only() -> StoreError {
    StoreError::Backend("read-only fake".into())
}

/// Scripted store: pages come from an in-memory list, live events are
/// pushed by the test, and fetches can be held or failed on demand.
#[derive(Default)]
struct FakeStore {
    docs: Mutex<Vec<(String, Document)>>,
    subscribers: Mutex<Vec<(String, Sender)>>,
    fetches: AtomicUsize,
    fail_next_fetch: AtomicBool,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FakeStore {
    fn with_items(collection: &str, range: impl IntoIterator<Item = u32>) -> Self {
        let store = Self::default();
        for n in range {
            store.insert(collection, item(n));
        }
        store
    }

    fn insert(&self, collection: &str, doc: Document) {
        self.docs.lock().unwrap().push((collection.to_string(), doc));
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn fail_next_fetch(&self) {
        self.fail_next_fetch.store(true, Ordering::SeqCst);
    }

    /// Hold the next fetch until the returned sender fires.
    fn hold_next_fetch(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    fn push(&self, collection: &str, event: Result<LiveEvent, StoreError>) {
        for (c, tx) in self.subscribers.lock().unwrap().iter() {
            if c == collection {
                let _ = tx.send(event.clone());
            }
        }
    }

    fn close(&self, collection: &str) {
        self.subscribers.lock().unwrap().retain(|(c, _)| c != collection);
    }

    fn live_subscribers(&self, collection: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, tx)| c == collection && !tx.is_closed())
            .count()
    }
}

impl DocumentStore for FakeStore {
    async fn fetch_page(
        &self,
        query: &QueryDescriptor,
        after: Option<&Cursor>,
    ) -> Result<Vec<Document>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        if let Some(rx) = gate {
            let _ = rx.await;
        }
        if self.fail_next_fetch.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("connection reset".into()));
        }

        let mut page: Vec<(Cursor, Document)> = self
            .docs
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == query.collection_path)
            .filter_map(|(_, d)| query.position(d).map(|p| (p, d.clone())))
            .filter(|(p, _)| after.is_none_or(|a| p > a))
            .collect();
        page.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(page
            .into_iter()
            .take(query.page_size as usize)
            .map(|(_, d)| d)
            .collect())
    }

    async fn fetch_all(&self, query: &QueryDescriptor) -> Result<Vec<Document>, StoreError> {
        let all = QueryDescriptor::new(
            query.collection_path.clone(),
            query.order_field.clone(),
            u32::MAX,
        );
        self.fetch_page(&all, None).await
    }

    fn subscribe(&self, query: &QueryDescriptor) -> Result<LiveStream, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .push((query.collection_path.clone(), tx));
        let events = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|e| (e, rx))
        });
        Ok(events.boxed())
    }

    async fn get_document(&self, _: &str, _: &str) -> Result<Option<Document>, StoreError> {
        Err(read_only())
    }

    async fn create_document(&self, _: &str, _: &str, _: Fields) -> Result<Document, StoreError> {
        Err(read_only())
    }

    async fn set_document(&self, _: &str, _: &str, _: Fields) -> Result<Document, StoreError> {
        Err(read_only())
    }

    async fn update_document(&self, _: &str, _: &str, _: Fields) -> Result<Document, StoreError> {
        Err(read_only())
    }

    async fn array_union(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: Vec<Value>,
    ) -> Result<Document, StoreError> {
        Err(read_only())
    }

    async fn delete_document(&self, _: &str, _: &str) -> Result<(), StoreError> {
        Err(read_only())
    }
}

async fn seeded_local(range: impl IntoIterator<Item = u32>) -> Arc<LocalStore> {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    for n in range {
        let doc = item(n);
        store.create_document("items", &doc.id, doc.fields).await.unwrap();
    }
    store
}

#[tokio::test]
async fn twelve_items_in_pages_of_five() {
    let store = seeded_local(1..=12).await;
    let mut sub = PaginatedSubscription::new(store);

    sub.set_target(Some(items_query(5)));
    assert_eq!(sub.state(), &SubscriptionState::Loading);
    assert_eq!(sub.next_update().await, Some(Update::Loaded { len: 5, exhausted: false }));
    assert_eq!(numbers(&sub.snapshot()), [1, 2, 3, 4, 5]);

    assert!(sub.load_more());
    assert_eq!(sub.state(), &SubscriptionState::LoadingMore);
    // Already loading: a second request is ignored.
    assert!(!sub.load_more());
    assert_eq!(sub.next_update().await, Some(Update::Extended { added: 5, exhausted: false }));
    assert_eq!(numbers(&sub.snapshot()), (1..=10).collect::<Vec<_>>());

    assert!(sub.load_more());
    assert_eq!(sub.next_update().await, Some(Update::Extended { added: 2, exhausted: true }));
    assert_eq!(numbers(&sub.snapshot()), (1..=12).collect::<Vec<_>>());
    assert_eq!(sub.state(), &SubscriptionState::Active);

    assert!(!sub.load_more());
    assert_eq!(sub.len(), 12);
}

#[tokio::test]
async fn live_removal_keeps_order() {
    let store = seeded_local(1..=5).await;
    let mut sub = PaginatedSubscription::new(store.clone());
    sub.set_target(Some(items_query(5)));
    sub.next_update().await;

    store.delete_document("items", "03").await.unwrap();
    assert_eq!(sub.next_update().await, Some(Update::Live { changed: true }));
    assert_eq!(numbers(&sub.snapshot()), [1, 2, 4, 5]);
}

#[tokio::test]
async fn created_message_appears_only_through_the_feed() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let channel_id = Uuid::new_v4();
    let mut sub = PaginatedSubscription::new(store.clone());
    sub.set_target(Some(messages_query(channel_id, 20)));
    assert_eq!(sub.next_update().await, Some(Update::Loaded { len: 0, exhausted: true }));

    let mut composer = MessageComposer::new(store.clone());
    composer.bind_channel(Some(channel_id));
    composer.bind_user(Some("u1".into()));
    composer.set_input("hello");
    let sent = composer.submit().await.unwrap().unwrap();

    // No optimistic insert.
    assert!(sub.snapshot().is_empty());

    assert_eq!(sub.next_update().await, Some(Update::Live { changed: true }));
    let shown: Message = sub.snapshot()[0].decode().unwrap();
    assert_eq!(shown.id, sent.id);
    assert!(matches!(shown.created_at, ServerTimestamp::Resolved(_)));
}

#[tokio::test]
async fn live_insert_racing_a_page_is_kept_once() {
    let store = Arc::new(FakeStore::with_items("items", [1, 2, 3, 4, 5, 7]));
    let mut sub = PaginatedSubscription::new(store.clone());
    sub.set_target(Some(items_query(5)));
    sub.next_update().await;

    let release = store.hold_next_fetch();
    assert!(sub.load_more());

    // Item 6 is written while the page is in flight.
    store.insert("items", item(6));
    store.push("items", Ok(LiveEvent::Delta(DocumentChange::Added(item(6)))));
    // Past the edge and more pages remain: not shown yet.
    assert_eq!(sub.next_update().await, Some(Update::Live { changed: false }));
    assert_eq!(sub.len(), 5);

    release.send(()).unwrap();
    assert_eq!(sub.next_update().await, Some(Update::Extended { added: 2, exhausted: true }));
    assert_eq!(numbers(&sub.snapshot()), [1, 2, 3, 4, 5, 6, 7]);
}

#[tokio::test]
async fn removal_racing_a_stale_page_is_replayed() {
    let store = Arc::new(FakeStore::with_items("items", 1..=8));
    let mut sub = PaginatedSubscription::new(store.clone());
    sub.set_target(Some(items_query(5)));
    sub.next_update().await;

    let release = store.hold_next_fetch();
    assert!(sub.load_more());

    // Item 7 is deleted while the page is in flight, but the page was read
    // before the delete and still carries it.
    let removed = DocumentChange::Removed { id: "07".into() };
    store.push("items", Ok(LiveEvent::Delta(removed)));
    assert_eq!(sub.next_update().await, Some(Update::Live { changed: false }));

    release.send(()).unwrap();
    assert_eq!(
        sub.next_update().await,
        Some(Update::Extended { added: 3, exhausted: true })
    );
    assert_eq!(numbers(&sub.snapshot()), [1, 2, 3, 4, 5, 6, 8]);
}

#[tokio::test]
async fn exhausted_window_issues_no_fetch() {
    let store = Arc::new(FakeStore::with_items("items", 1..=3));
    let mut sub = PaginatedSubscription::new(store.clone());
    sub.set_target(Some(items_query(5)));
    assert_eq!(sub.next_update().await, Some(Update::Loaded { len: 3, exhausted: true }));
    assert_eq!(store.fetches(), 1);

    assert!(!sub.load_more());
    assert_eq!(store.fetches(), 1);
    assert_eq!(sub.state(), &SubscriptionState::Active);

    // Same target again is a no-op.
    sub.set_target(Some(items_query(5)));
    assert_eq!(store.fetches(), 1);
    assert_eq!(sub.len(), 3);

    // New items past the end of an exhausted window are appended.
    store.push("items", Ok(LiveEvent::Delta(DocumentChange::Added(item(9)))));
    assert_eq!(sub.next_update().await, Some(Update::Live { changed: true }));
    assert_eq!(numbers(&sub.snapshot()), [1, 2, 3, 9]);
}

#[tokio::test]
async fn switching_target_isolates_the_old_feed() {
    let store = FakeStore::with_items("a", 1..=2);
    store.insert("b", item(10));
    let store = Arc::new(store);

    let mut sub = PaginatedSubscription::new(store.clone());
    sub.set_target(Some(QueryDescriptor::new("a", "n", 5)));
    sub.next_update().await;
    assert_eq!(store.live_subscribers("a"), 1);

    sub.set_target(Some(QueryDescriptor::new("b", "n", 5)));
    assert_eq!(sub.state(), &SubscriptionState::Loading);
    assert!(sub.is_empty());
    // The old stream was cancelled before the new one was opened.
    assert_eq!(store.live_subscribers("a"), 0);
    assert_eq!(store.live_subscribers("b"), 1);

    store.push("a", Ok(LiveEvent::Delta(DocumentChange::Added(item(3)))));
    assert_eq!(sub.next_update().await, Some(Update::Loaded { len: 1, exhausted: true }));
    assert_eq!(numbers(&sub.snapshot()), [10]);

    let idle = tokio::time::timeout(Duration::from_millis(50), sub.next_update()).await;
    assert!(idle.is_err(), "no event should reach the new window");
    assert_eq!(numbers(&sub.snapshot()), [10]);
}

#[tokio::test]
async fn failed_fetches_keep_the_window_and_recover() {
    let store = Arc::new(FakeStore::with_items("items", 1..=7));

    store.fail_next_fetch();
    let mut sub = PaginatedSubscription::new(store.clone());
    sub.set_target(Some(items_query(5)));
    assert!(matches!(
        sub.next_update().await,
        Some(Update::Failed(SyncError::FetchFailed(StoreError::Backend(_))))
    ));
    assert!(matches!(sub.state(), SubscriptionState::Error(SyncError::FetchFailed(_))));

    assert!(sub.retry());
    assert_eq!(sub.state(), &SubscriptionState::Loading);
    assert_eq!(sub.next_update().await, Some(Update::Loaded { len: 5, exhausted: false }));

    store.fail_next_fetch();
    assert!(sub.load_more());
    assert!(matches!(sub.next_update().await, Some(Update::Failed(_))));
    assert_eq!(numbers(&sub.snapshot()), [1, 2, 3, 4, 5]);

    // Asking for the page again recovers.
    assert!(sub.load_more());
    assert_eq!(sub.next_update().await, Some(Update::Extended { added: 2, exhausted: true }));
    assert_eq!(sub.len(), 7);
}

#[tokio::test]
async fn broken_feed_reports_subscription_failure() {
    let store = Arc::new(FakeStore::with_items("items", 1..=3));
    let mut sub = PaginatedSubscription::new(store.clone());
    sub.set_target(Some(items_query(5)));
    sub.next_update().await;

    store.push("items", Err(StoreError::Lagged(4)));
    assert_eq!(
        sub.next_update().await,
        Some(Update::Failed(SyncError::SubscriptionFailed(StoreError::Lagged(4))))
    );
    assert_eq!(sub.len(), 3);
    assert!(!sub.load_more());

    // Retry starts over with a fresh subscription.
    assert!(sub.retry());
    assert_eq!(sub.next_update().await, Some(Update::Loaded { len: 3, exhausted: true }));

    store.close("items");
    assert_eq!(
        sub.next_update().await,
        Some(Update::Failed(SyncError::SubscriptionFailed(StoreError::Closed)))
    );
    assert_eq!(sub.next_update().await, None);
}

#[tokio::test]
async fn invalid_target_goes_idle() {
    let store = Arc::new(FakeStore::with_items("items", 1..=3));
    let mut sub = PaginatedSubscription::new(store.clone());

    sub.set_target(Some(QueryDescriptor::new("", "n", 5)));
    assert_eq!(sub.state(), &SubscriptionState::Idle);
    sub.set_target(Some(QueryDescriptor::new("items", "n", 0)));
    assert_eq!(sub.state(), &SubscriptionState::Idle);
    assert_eq!(sub.next_update().await, None);
    assert_eq!(store.fetches(), 0);

    sub.set_target(Some(items_query(5)));
    sub.next_update().await;
    sub.set_target(None);
    assert_eq!(sub.state(), &SubscriptionState::Idle);
    assert!(sub.is_empty());
    assert_eq!(store.live_subscribers("items"), 0);
}
