use std::future::Future;

use futures_util::stream::BoxStream;
use serde_json::{Map, Value};

use writedown_types::{Cursor, Document, LiveEvent, QueryDescriptor};

use crate::error::StoreError;

/// Realtime feed of one query. Dropping it cancels the subscription.
pub type LiveStream = BoxStream<'static, Result<LiveEvent, StoreError>>;

/// What the client core needs from a realtime document store.
///
/// Implementations must deliver a subscription's events in the order the
/// store committed them, and must start delivering from the moment
/// `subscribe` returns, so that a fetch issued afterwards plus the events
/// received meanwhile never miss a write.
pub trait DocumentStore: Send + Sync + 'static {
    /// Up to `query.page_size` documents strictly after `after`, in query order.
    fn fetch_page(
        &self,
        query: &QueryDescriptor,
        after: Option<&Cursor>,
    ) -> impl Future<Output = Result<Vec<Document>, StoreError>> + Send;

    /// The whole ordered collection, ignoring `page_size`.
    fn fetch_all(
        &self,
        query: &QueryDescriptor,
    ) -> impl Future<Output = Result<Vec<Document>, StoreError>> + Send;

    /// Start a realtime subscription to the query's collection.
    fn subscribe(&self, query: &QueryDescriptor) -> Result<LiveStream, StoreError>;

    fn get_document(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<Option<Document>, StoreError>> + Send;

    /// Fails with `AlreadyExists` if the id is taken. Fields equal to the
    /// server timestamp sentinel are stamped with the commit time.
    fn create_document(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> impl Future<Output = Result<Document, StoreError>> + Send;

    /// Create or replace.
    fn set_document(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> impl Future<Output = Result<Document, StoreError>> + Send;

    /// Merge top-level fields into an existing document.
    fn update_document(
        &self,
        collection: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> impl Future<Output = Result<Document, StoreError>> + Send;

    /// Add `values` to the array `field` of an existing document, skipping
    /// ones already present, as a single atomic step. Concurrent unions on
    /// the same field all take effect.
    fn array_union(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        values: Vec<Value>,
    ) -> impl Future<Output = Result<Document, StoreError>> + Send;

    /// Deleting a missing document is not an error.
    fn delete_document(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
