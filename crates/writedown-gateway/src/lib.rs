//! Realtime change fan-out: the in-process `Dispatcher` every committed
//! write is published to, read-access rules for collections, and the
//! WebSocket connection loop that relays changes to remote subscribers.

pub mod access;
pub mod connection;
pub mod dispatcher;

pub use dispatcher::{CollectionSubscription, Dispatcher, SubscriptionError};
