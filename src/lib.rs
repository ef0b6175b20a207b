//! mark-node: personal data node
//!
//! Each node owns a signed, append-only feed of entity mutations and
//! replicates other users' feeds by gossiping with known peers ("pubs").
//!
//! - `feed` - operations, feeds, signing and the operation codec
//! - `storage` - ordered key-value store capability and backends
//! - `entities` - datom indexes and typed records derived from feeds
//! - `sync` - pull rounds, announcements and the sync coordinator
//! - `api` - HTTP surface peers talk to
//! - `app` - bookmarks

pub mod api;
pub mod app;
pub mod config;
pub mod entities;
pub mod error;
pub mod feed;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use entities::EntityDb;
pub use error::{CodecError, EntityError, StoreError, SyncError};
