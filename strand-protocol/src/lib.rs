//! Shared types, wire formats, and manifest signing for strand.

pub mod manifest;
pub mod types;
pub mod wire;

pub use manifest::{BlobRef, FileEntry, Manifest, ManifestError, SignedManifest};
pub use types::{BlobId, InfoHash, PeerAddr};
pub use wire::{Message, WireError};
