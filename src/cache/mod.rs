//! Client-side cache of server-owned resources.
//!
//! This module provides the read side of the sync layer:
//! - Caches fetched collections by structural [`QueryKey`]
//! - Serves stale data while revalidating in the background
//! - Coalesces concurrent fetches of the same key into one request
//! - Invalidates by [`ResourceType`] (optionally narrowed by parameters)

mod directory;
mod entry;
mod key;

pub use directory::{CacheDirectory, CachePolicy};
pub use entry::{CacheEntry, EntryState};
pub use key::{InvalidationPattern, QueryKey, ResourceType};
