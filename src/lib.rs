//! Client-side data synchronization for the Flowto accounting dashboard.
//!
//! A [`SyncContext`] owns the pieces:
//! - [`session::SessionStore`]: the bearer token and its lifecycle
//! - [`transport::Transport`]: the only component that talks to the network
//! - [`cache::CacheDirectory`]: stale-while-revalidate cache of server data
//! - [`mutation::MutationCoordinator`]: ordered writes plus invalidation
//! - [`bulk::BulkJobTracker`]: server-side batch operations
//! - [`api::DashboardClient`]: typed access on top of all of the above

pub mod api;
pub mod bulk;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod mutation;
pub mod query;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use context::SyncContext;
pub use error::ApiError;
