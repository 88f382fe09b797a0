//! Typed payload structures, one module per endpoint.

pub mod app_run_state;
pub mod blobdb;
pub mod ping;
pub mod timeline;

pub use app_run_state::AppRunStateMessage;
pub use blobdb::{BlobCommand, BlobDatabase, BlobOperation, BlobResponse, BlobStatus};
pub use ping::PingMessage;
pub use timeline::{ActionResponseCode, TimelineActionMessage, TimelineAttribute};
