//! certsync-core - Core library for certsync
//!
//! This crate contains the offline-first synchronisation engine shared by the
//! CLI and any editing surface: the durable local store, the attachment
//! offline queue, connectivity tracking, the upload wrapper, the sync queue
//! producer and the drain that reconciles with the certsync API.

pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod media;
pub mod models;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{CertificateId, CertificateSnapshot, SyncOperation, SyncQueueItem};
