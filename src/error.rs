//! Error types for mark-node

use thiserror::Error;

/// Failures of the operation codec and key layer.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Signature invalid")]
    SignatureInvalid,

    #[error("Malformed operation: {0}")]
    MalformedOperation(String),

    #[error("Unknown operation kind: {0}")]
    UnknownOperationKind(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of the ordered key-value store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store is closed")]
    Closed,

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Failures of the entity store.
#[derive(Error, Debug)]
pub enum EntityError {
    #[error("Entity {id} is not in feed {feed}")]
    NotOwner { id: String, feed: String },

    #[error("Malformed entity id: {0}")]
    MalformedId(String),

    #[error("Type mismatch for field {field}: {value:?}")]
    TypeMismatch { field: String, value: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No user feed in store")]
    NoUserFeed,

    #[error("Fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures talking to a peer.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Peer {url} unreachable: {reason}")]
    PeerUnreachable { url: String, reason: String },

    #[error("Peer request timed out: {0}")]
    Timeout(String),

    #[error("Peer {url} answered HTTP {status}")]
    BadStatus { url: String, status: u16 },

    #[error("Invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    #[error("Fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl SyncError {
    pub fn unreachable(url: &str, reason: impl ToString) -> Self {
        SyncError::PeerUnreachable {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}
