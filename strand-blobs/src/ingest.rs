//! File ingest and reassembly.
//!
//! Ingest splits a file into 1 MiB chunks, encrypts each with a fresh random
//! key and IV (ChaCha20-Poly1305), stores the ciphertext as a
//! content-addressed blob, and emits the file entry that a manifest carries.
//! Reassembly reverses the pipeline: fetch, decrypt, concatenate.

use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use strand_protocol::manifest::{BlobRef, FileEntry};
use strand_protocol::types::BlobId;

use crate::store::{BlobStore, StoreError};

/// Plaintext chunk size.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Result of ingesting one file.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub entry: FileEntry,
    pub blob_count: usize,
}

/// Chunk and encrypt `data`, returning the file entry and the blob bytes to
/// store. Each chunk gets its own random key and IV.
pub fn chunk_and_encrypt(
    data: &[u8],
    name: &str,
    mime: &str,
) -> Result<(FileEntry, Vec<(BlobId, Vec<u8>)>), IngestError> {
    let mut chunks = Vec::new();
    let mut blobs = Vec::new();

    for plain in data.chunks(CHUNK_SIZE).chain(empty_file_chunk(data)) {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut key);
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let blob = cipher
            .encrypt(Nonce::from_slice(&iv), plain)
            .map_err(|_| IngestError::Encrypt)?;
        let id = BlobId::of(&blob);

        chunks.push(BlobRef {
            id,
            size: blob.len() as u64,
            key,
            iv,
        });
        blobs.push((id, blob));
    }

    let entry = FileEntry {
        name: name.to_string(),
        size: data.len() as u64,
        mime: mime.to_string(),
        chunks,
    };
    Ok((entry, blobs))
}

// An empty file still produces one (empty-plaintext) chunk so the entry has a
// blob to anchor it.
fn empty_file_chunk(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    if data.is_empty() { Some(data) } else { None }.into_iter()
}

/// Ingest a file from disk into the store.
pub async fn ingest_file(store: &BlobStore, path: &Path) -> Result<IngestOutcome, IngestError> {
    let data = tokio::fs::read(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let mime = mime_for_name(&name);

    let (entry, blobs) = chunk_and_encrypt(&data, &name, mime)?;
    let blob_count = blobs.len();
    for (_, bytes) in &blobs {
        store.insert(bytes)?;
    }

    tracing::info!(
        name = %entry.name,
        size = entry.size,
        blobs = blob_count,
        "file ingested"
    );
    Ok(IngestOutcome { entry, blob_count })
}

/// Decrypt one retrieved chunk, checking its content address first.
pub fn decrypt_chunk(chunk: &BlobRef, blob: &[u8]) -> Result<Vec<u8>, IngestError> {
    if BlobId::of(blob) != chunk.id {
        return Err(IngestError::ChunkMismatch(chunk.id));
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&chunk.key));
    cipher
        .decrypt(Nonce::from_slice(&chunk.iv), blob)
        .map_err(|_| IngestError::Decrypt(chunk.id))
}

/// Reassemble a file from its chunks. `fetch` supplies the stored blob bytes
/// for an id, or `None` if unavailable.
pub fn reassemble<F>(entry: &FileEntry, mut fetch: F) -> Result<Vec<u8>, IngestError>
where
    F: FnMut(&BlobId) -> Option<Vec<u8>>,
{
    let mut plain = Vec::with_capacity(entry.size as usize);
    for chunk in &entry.chunks {
        let blob = fetch(&chunk.id).ok_or(IngestError::MissingBlob(chunk.id))?;
        plain.extend_from_slice(&decrypt_chunk(chunk, &blob)?);
    }
    if plain.len() as u64 != entry.size {
        return Err(IngestError::SizeMismatch {
            expected: entry.size,
            actual: plain.len() as u64,
        });
    }
    Ok(plain)
}

/// Guess a MIME type from the file extension; opaque by default.
pub fn mime_for_name(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Ingest or reassembly failure.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("chunk encryption failed")]
    Encrypt,
    #[error("chunk {0} failed to decrypt")]
    Decrypt(BlobId),
    #[error("blob bytes do not match chunk id {0}")]
    ChunkMismatch(BlobId),
    #[error("blob {0} unavailable")]
    MissingBlob(BlobId),
    #[error("reassembled size {actual} does not match entry size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}
