//! Sync queue producer, API client and drain.

mod client;
mod drain;
mod error;
mod producer;

pub use client::{StaticTokenProvider, SyncApiClient, SyncTransport, TokenProvider};
pub use drain::{DrainReport, RetryPolicy, SyncDrain};
pub(crate) use error::error_from_response;
pub use error::{SyncError, SyncResult};
pub use producer::SyncProducer;
