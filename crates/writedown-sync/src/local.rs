use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::error;

use writedown_db::Database;
use writedown_gateway::Dispatcher;
use writedown_types::{Cursor, Document, DocumentChange, LiveEvent, QueryDescriptor};

use crate::error::StoreError;
use crate::store::{DocumentStore, LiveStream};

/// In-process realtime store: SQLite for documents, the gateway
/// `Dispatcher` for change notifications.
///
/// Writes are serialized and published while still holding the write lock,
/// so subscribers observe changes in commit order.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    write_lock: Arc<Mutex<()>>,
}

impl LocalStore {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self {
            db,
            dispatcher,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Fresh in-memory database with its own dispatcher.
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Database::open_in_memory()?;
        Ok(Self::new(Arc::new(db), Dispatcher::new()))
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run a blocking read off the async runtime.
    async fn read<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> writedown_db::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StoreError::Backend(e.to_string())
            })?
            .map_err(StoreError::from)
    }

    /// Run a blocking write and publish the change it produced, in order.
    async fn write<F, T>(&self, collection: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> writedown_db::Result<(T, Option<DocumentChange>)> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let dispatcher = self.dispatcher.clone();
        let write_lock = self.write_lock.clone();
        let collection = collection.to_string();

        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let _guard = write_lock
                .lock()
                .map_err(|e| StoreError::Backend(format!("write lock poisoned: {}", e)))?;
            let (out, change) = f(&db)?;
            if let Some(change) = change {
                dispatcher.publish(&collection, change);
            }
            Ok(out)
        })
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StoreError::Backend(e.to_string())
        })?
    }
}

impl DocumentStore for LocalStore {
    async fn fetch_page(
        &self,
        query: &QueryDescriptor,
        after: Option<&Cursor>,
    ) -> Result<Vec<Document>, StoreError> {
        let query = query.clone();
        let after = after.cloned();
        self.read(move |db| db.fetch_page(&query, after.as_ref())).await
    }

    async fn fetch_all(&self, query: &QueryDescriptor) -> Result<Vec<Document>, StoreError> {
        let query = query.clone();
        self.read(move |db| db.fetch_all(&query)).await
    }

    fn subscribe(&self, query: &QueryDescriptor) -> Result<LiveStream, StoreError> {
        query.validate()?;
        let mut sub = self.dispatcher.subscribe(&query.collection_path);

        Ok(Box::pin(async_stream::stream! {
            loop {
                match sub.recv().await {
                    Ok(change) => yield Ok(LiveEvent::Delta(change)),
                    Err(e) => {
                        yield Err(StoreError::from(e));
                        break;
                    }
                }
            }
        }))
    }

    async fn get_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.read(move |db| db.get_document(&collection, &id)).await
    }

    async fn create_document(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<Document, StoreError> {
        let (path, id) = (collection.to_string(), id.to_string());
        self.write(collection, move |db| {
            let doc = db.create_document(&path, &id, fields)?;
            Ok((doc.clone(), Some(DocumentChange::Added(doc))))
        })
        .await
    }

    async fn set_document(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<Document, StoreError> {
        let (path, id) = (collection.to_string(), id.to_string());
        self.write(collection, move |db| {
            let (doc, created) = db.set_document(&path, &id, fields)?;
            let change = if created {
                DocumentChange::Added(doc.clone())
            } else {
                DocumentChange::Modified(doc.clone())
            };
            Ok((doc, Some(change)))
        })
        .await
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> Result<Document, StoreError> {
        let (path, id) = (collection.to_string(), id.to_string());
        self.write(collection, move |db| {
            let doc = db.update_document(&path, &id, patch)?;
            Ok((doc.clone(), Some(DocumentChange::Modified(doc))))
        })
        .await
    }

    async fn array_union(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        values: Vec<Value>,
    ) -> Result<Document, StoreError> {
        let (path, id, field) = (collection.to_string(), id.to_string(), field.to_string());
        self.write(collection, move |db| {
            let doc = db.array_union(&path, &id, &field, values)?;
            Ok((doc.clone(), Some(DocumentChange::Modified(doc))))
        })
        .await
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let (path, id) = (collection.to_string(), id.to_string());
        self.write(collection, move |db| {
            let removed = db.delete_document(&path, &id)?;
            Ok(((), removed.then(|| DocumentChange::Removed { id })))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn writes_reach_subscribers_in_commit_order() {
        let store = LocalStore::in_memory().unwrap();
        let q = QueryDescriptor::new("items", "rank", 5);
        let mut live = store.subscribe(&q).unwrap();

        store.create_document("items", "a", fields(json!({ "rank": 1 }))).await.unwrap();
        store.create_document("other", "x", fields(json!({ "rank": 1 }))).await.unwrap();
        store.update_document("items", "a", fields(json!({ "rank": 2 }))).await.unwrap();
        store.delete_document("items", "a").await.unwrap();
        // Already gone: no event
        store.delete_document("items", "a").await.unwrap();
        store.set_document("items", "b", fields(json!({ "rank": 3 }))).await.unwrap();

        let mut kinds = Vec::new();
        for _ in 0..4 {
            let kind = match live.next().await.unwrap().unwrap() {
                LiveEvent::Delta(DocumentChange::Added(d)) => format!("added {}", d.id),
                LiveEvent::Delta(DocumentChange::Modified(d)) => format!("modified {}", d.id),
                LiveEvent::Delta(DocumentChange::Removed { id }) => format!("removed {}", id),
                other => panic!("unexpected event {:?}", other),
            };
            kinds.push(kind);
        }
        assert_eq!(kinds, ["added a", "modified a", "removed a", "added b"]);
    }

    #[tokio::test]
    async fn duplicate_create_is_reported() {
        let store = LocalStore::in_memory().unwrap();
        store.create_document("items", "a", Map::new()).await.unwrap();
        let err = store.create_document("items", "a", Map::new()).await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists("items/a".into()));
    }

    #[tokio::test]
    async fn subscribe_rejects_invalid_query() {
        let store = LocalStore::in_memory().unwrap();
        let q = QueryDescriptor::new("", "rank", 5);
        assert!(matches!(store.subscribe(&q), Err(StoreError::InvalidQuery(_))));
    }
}
