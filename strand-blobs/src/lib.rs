//! Blob storage, ingest, download orchestration, and serving.

pub mod download;
pub mod ingest;
pub mod server;
pub mod store;

pub use download::{DownloadEvent, DownloadSnapshot, Downloader};
pub use ingest::{ingest_file, reassemble, IngestError, IngestOutcome};
pub use server::{BlobServer, PublishReceived, RunningServer};
pub use store::{BlobInfo, BlobStore, StoreError};
