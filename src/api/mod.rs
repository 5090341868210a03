//! Typed client for the dashboard API.

mod client;
pub mod types;

pub use client::{DashboardClient, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};

#[cfg(test)]
pub(crate) use client::invoice_json;
