//! Shared types for the WriteDown workspace.
//!
//! Everything that crosses a crate boundary lives here: documents and the
//! typed chat models stored in them, ordered query descriptors and cursors,
//! realtime change events and the HTTP/WebSocket payloads.

pub mod api;
pub mod events;
pub mod models;
pub mod paths;
pub mod query;
pub mod timestamp;

pub use events::{CollectionChange, DocumentChange, LiveEvent};
pub use models::{Channel, Document, Message, MessageKind, Visibility};
pub use query::{Cursor, QueryDescriptor, QueryError, SortKey};
pub use timestamp::ServerTimestamp;
