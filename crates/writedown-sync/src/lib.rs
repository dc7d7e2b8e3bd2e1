//! Client core of WriteDown.
//!
//! `PaginatedSubscription` keeps a live, growable window over an ordered
//! collection of any `DocumentStore`. `ChannelList`, `MessageComposer` and
//! the channel operations build the chat flows on top of it. `LocalStore`
//! is the in-process store backed by `writedown-db` and the gateway's
//! `Dispatcher`.

pub mod channels;
pub mod composer;
pub mod error;
pub mod local;
pub mod paginated;
pub mod store;
pub mod window;

pub use channels::{ChannelList, NewChannel, create_channel, join_channel};
pub use composer::MessageComposer;
pub use error::{ChannelError, StoreError, SyncError};
pub use local::LocalStore;
pub use paginated::{PaginatedSubscription, SubscriptionState, Update};
pub use store::{DocumentStore, LiveStream};
pub use window::{Applied, Window};
