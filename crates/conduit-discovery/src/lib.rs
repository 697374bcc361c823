//! Coordination-store backed service discovery: a membership watcher that turns a watched
//! child set into coalesced `on_join`/`on_leave` callbacks and a cached, snapshot-able map of
//! [`MemberRecord`]s.

mod record;
mod store;
mod watcher;

pub use record::{Endpoint, MemberRecord};
pub use store::{CoordinationStore, InMemoryCoordinationStore, WatcherError};
pub use watcher::{CallbackBlocker, MembersSnapshot, MembershipWatcher};
