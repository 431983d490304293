//! Append-only, time-slotted feed: publish, discover, fetch, and garbage
//! collection (spec.md §4.4).

pub mod cache;
pub mod engine;
pub mod head;

pub use cache::FeedCache;
pub use engine::{local_scopes, FeedEngine, IdentityLookup};
pub use head::{EntryState, FeedHead, LocalEntry};

