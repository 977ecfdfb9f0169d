//! Durable local store for certsync

mod attachment_queue;
mod connection;
mod local_store;
mod migrations;

pub use attachment_queue::AttachmentQueue;
pub use connection::Database;
pub use local_store::LocalStore;
