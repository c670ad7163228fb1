// Query cache module.
// Keyed, in-memory store of query results shared by every caller in the process.

pub mod entry;
pub mod key;
pub mod keys;
pub mod store;

pub use entry::{CacheEntry, EntryPolicy, FetchStatus};
pub use key::{KeyPart, QueryKey, Scope};
pub use store::{Loader, Query, QueryCache, Subscription, loader};
