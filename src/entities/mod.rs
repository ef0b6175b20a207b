//! Multi-index entity store
//!
//! - `datom` - facts, values and system attributes
//! - `schema` - per-kind field descriptors for typed records
//! - `index` - EAV/AEV/AVE/VAE key layout and staging
//! - `db` - [`EntityDb`]: feed persistence, ingest, rebuild, typed reads/writes
//! - `registry` - peer registry kept in the same store

pub mod datom;
pub mod db;
pub mod index;
pub mod registry;
pub mod schema;

pub use datom::{Datom, Value, FEED_ID_ATTR, ID_ATTR, KIND_ATTR};
pub use db::{EntityDb, IngestOutcome};
pub use schema::{Entity, Field, FieldKind, Record};
