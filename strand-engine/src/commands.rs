//! Command surface outputs and the stable error taxonomy.
//!
//! The admin layer (HTTP, CLI) dispatches to [`crate::engine::Engine`]
//! methods and serializes these types; errors carry a stable `kind` string
//! alongside the human-readable message.

use serde::Serialize;
use strand_blobs::{IngestError, StoreError};
use strand_protocol::manifest::FileEntry;

use crate::dht::DhtError;
use crate::keys::KeyError;
use crate::subscriptions::SubscriptionError;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub dht: String,
    pub network: NetworkStatus,
    pub blob_store: BlobStoreStatus,
    pub subscriptions: usize,
}

#[derive(Debug, Serialize)]
pub struct NetworkStatus {
    pub listen_addr: String,
}

#[derive(Debug, Serialize)]
pub struct BlobStoreStatus {
    pub blobs: u64,
    pub size: u64,
    pub max: u64,
}

#[derive(Debug, Serialize)]
pub struct KeyOutput {
    pub public_key: String,
    pub secret_key: String,
}

#[derive(Debug, Serialize)]
pub struct IngestReport {
    pub file_entry: FileEntry,
    pub blob_count: usize,
}

#[derive(Debug, Serialize)]
pub struct PublishReport {
    pub status: &'static str,
    pub sequence: i64,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionReport {
    pub public_key: String,
    pub last_sequence: i64,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct BlobReport {
    pub blob_id: String,
    pub size: u64,
    pub added_at: i64,
}

/// Command failure with a stable kind for API callers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid key: {0}")]
    BadKey(String),
    #[error("invalid manifest: {0}")]
    BadManifest(String),
    #[error("dht operation failed: {0}")]
    Dht(#[from] DhtError),
    #[error("blob store is full")]
    StoreFull,
    #[error("io error: {0}")]
    Io(String),
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    Exists,
}

impl EngineError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::BadKey(_) => "BadKey",
            EngineError::BadManifest(_) => "BadManifest",
            EngineError::Dht(_) => "DHTFail",
            EngineError::StoreFull => "StoreFull",
            EngineError::Io(_) => "IOError",
            EngineError::NotFound => "NotFound",
            EngineError::Exists => "Exists",
        }
    }
}

impl From<KeyError> for EngineError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::Io(e) => EngineError::Io(e.to_string()),
            other => EngineError::BadKey(other.to_string()),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::StoreFull => EngineError::StoreFull,
            other => EngineError::Io(other.to_string()),
        }
    }
}

impl From<IngestError> for EngineError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Store(StoreError::StoreFull) => EngineError::StoreFull,
            other => EngineError::Io(other.to_string()),
        }
    }
}

impl From<SubscriptionError> for EngineError {
    fn from(e: SubscriptionError) -> Self {
        match e {
            SubscriptionError::Exists => EngineError::Exists,
            SubscriptionError::NotFound => EngineError::NotFound,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(EngineError::BadKey("x".into()).kind(), "BadKey");
        assert_eq!(EngineError::BadManifest("x".into()).kind(), "BadManifest");
        assert_eq!(
            EngineError::Dht(DhtError::Unavailable("down".into())).kind(),
            "DHTFail"
        );
        assert_eq!(EngineError::StoreFull.kind(), "StoreFull");
        assert_eq!(EngineError::Io("x".into()).kind(), "IOError");
        assert_eq!(EngineError::NotFound.kind(), "NotFound");
        assert_eq!(EngineError::Exists.kind(), "Exists");
    }

    #[test]
    fn store_full_maps_through() {
        let e: EngineError = StoreError::StoreFull.into();
        assert_eq!(e.kind(), "StoreFull");
        let e: EngineError = IngestError::Store(StoreError::StoreFull).into();
        assert_eq!(e.kind(), "StoreFull");
    }

    #[test]
    fn subscription_errors_map() {
        let e: EngineError = SubscriptionError::Exists.into();
        assert_eq!(e.kind(), "Exists");
        let e: EngineError = SubscriptionError::NotFound.into();
        assert_eq!(e.kind(), "NotFound");
    }
}
