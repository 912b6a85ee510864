//! Content-addressed blob storage: encrypted blob files plus a SQLite index.
//!
//! Blobs are stored at `<dir>/<hex_id>` and indexed in `<dir>/index.db` with
//! their size and insertion time. Inserts are atomic (temp file, fsync,
//! rename) and idempotent. A bounded capacity evicts oldest-first.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use strand_protocol::types::BlobId;

/// Metadata for one stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub id: BlobId,
    pub size: u64,
    /// Unix seconds at insertion.
    pub added_at: i64,
}

/// Content-addressed store of opaque (encrypted) blob bytes.
pub struct BlobStore {
    dir: PathBuf,
    conn: Mutex<Connection>,
    capacity: u64,
}

impl BlobStore {
    /// Open (or create) a store rooted at `dir` with a byte capacity.
    ///
    /// Reconciles the index with the directory: rows whose file vanished are
    /// dropped, untracked files with valid hex names are adopted.
    pub fn open(dir: PathBuf, capacity: u64) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&dir)?;
        let conn = Connection::open(dir.join("index.db"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blobs (
                id TEXT PRIMARY KEY,
                size INTEGER NOT NULL,
                added_at INTEGER NOT NULL
            );",
        )?;

        let store = Self {
            dir,
            conn: Mutex::new(conn),
            capacity,
        };
        store.reconcile()?;
        tracing::info!(
            dir = %store.dir.display(),
            blobs = store.count()?,
            capacity,
            "blob store opened"
        );
        Ok(store)
    }

    /// Insert blob bytes, returning their id. Idempotent: re-inserting an
    /// existing blob is a no-op.
    pub fn insert(&self, bytes: &[u8]) -> Result<BlobId, StoreError> {
        let id = BlobId::of(bytes);
        if self.contains(&id)? {
            return Ok(id);
        }
        self.make_room(bytes.len() as u64)?;

        let final_path = self.blob_path(&id);
        let tmp_path = self.dir.join(format!(".{}.tmp", id.to_hex()));
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;

        self.index_insert(&id, bytes.len() as u64)?;
        tracing::debug!(blob_id = %id, size = bytes.len(), "blob inserted");
        Ok(id)
    }

    /// Adopt an already-written file as blob `id` by renaming it into the
    /// store. The contents are re-hashed; a mismatch removes the file and
    /// fails.
    pub fn insert_from_file(&self, id: BlobId, path: &Path) -> Result<(), StoreError> {
        let bytes = std::fs::read(path)?;
        if BlobId::of(&bytes) != id {
            let _ = std::fs::remove_file(path);
            return Err(StoreError::Corrupt(id));
        }
        if self.contains(&id)? {
            let _ = std::fs::remove_file(path);
            return Ok(());
        }
        self.make_room(bytes.len() as u64)?;
        std::fs::rename(path, self.blob_path(&id))?;
        self.index_insert(&id, bytes.len() as u64)?;
        tracing::debug!(blob_id = %id, size = bytes.len(), "blob adopted");
        Ok(())
    }

    /// Read blob bytes, or `None` if absent.
    pub fn get(&self, id: &BlobId) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(self.blob_path(id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, id: &BlobId) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT 1 FROM blobs WHERE id = ?1")?;
        Ok(stmt.exists([id.to_hex()])?)
    }

    /// Remove a blob. Returns whether it was present.
    pub fn remove(&self, id: &BlobId) -> Result<bool, StoreError> {
        let removed = {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM blobs WHERE id = ?1", [id.to_hex()])? > 0
        };
        match std::fs::remove_file(self.blob_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(removed)
    }

    /// Enumerate stored blobs, oldest first.
    pub fn list(&self) -> Result<Vec<BlobInfo>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, size, added_at FROM blobs ORDER BY added_at, rowid")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut infos = Vec::new();
        for row in rows {
            let (hex, size, added_at) = row?;
            let id = BlobId::from_hex(&hex).map_err(|_| StoreError::BadIndexEntry(hex))?;
            infos.push(BlobInfo {
                id,
                size: size as u64,
                added_at,
            });
        }
        Ok(infos)
    }

    /// Total bytes currently stored.
    pub fn total_size(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let total: i64 =
            conn.query_row("SELECT COALESCE(SUM(size), 0) FROM blobs", [], |r| r.get(0))?;
        Ok(total as u64)
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM blobs", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Re-hash every indexed blob; files whose contents no longer match their
    /// id are renamed to `<hex>.quarantine` and dropped from the index.
    /// Returns how many were quarantined.
    pub fn verify_all(&self) -> Result<usize, StoreError> {
        let mut quarantined = 0;
        for info in self.list()? {
            let path = self.blob_path(&info.id);
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.index_remove(&info.id)?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if BlobId::of(&bytes) != info.id {
                tracing::warn!(blob_id = %info.id, "quarantining corrupted blob");
                std::fs::rename(&path, self.dir.join(format!("{}.quarantine", info.id.to_hex())))?;
                self.index_remove(&info.id)?;
                quarantined += 1;
            }
        }
        Ok(quarantined)
    }

    fn blob_path(&self, id: &BlobId) -> PathBuf {
        self.dir.join(id.to_hex())
    }

    /// Evict oldest blobs until `incoming` fits. A blob that can never fit
    /// fails with `StoreFull` without evicting anything.
    fn make_room(&self, incoming: u64) -> Result<(), StoreError> {
        if incoming > self.capacity {
            return Err(StoreError::StoreFull);
        }
        while self.total_size()? + incoming > self.capacity {
            let oldest = {
                let conn = self.conn.lock().unwrap();
                conn.query_row(
                    "SELECT id FROM blobs ORDER BY added_at, rowid LIMIT 1",
                    [],
                    |r| r.get::<_, String>(0),
                )?
            };
            let id = BlobId::from_hex(&oldest).map_err(|_| StoreError::BadIndexEntry(oldest))?;
            tracing::info!(blob_id = %id, "evicting blob to make room");
            self.remove(&id)?;
        }
        Ok(())
    }

    fn index_insert(&self, id: &BlobId, size: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO blobs (id, size, added_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![id.to_hex(), size as i64, unix_now()],
        )?;
        Ok(())
    }

    fn index_remove(&self, id: &BlobId) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM blobs WHERE id = ?1", [id.to_hex()])?;
        Ok(())
    }

    /// Drop index rows without files; adopt hex-named files without rows.
    fn reconcile(&self) -> Result<(), StoreError> {
        for info in self.list()? {
            if !self.blob_path(&info.id).exists() {
                tracing::warn!(blob_id = %info.id, "indexed blob missing on disk, dropping");
                self.index_remove(&info.id)?;
            }
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(id) = BlobId::from_hex(name) else { continue };
            if !self.contains(&id)? {
                let size = entry.metadata()?.len();
                tracing::info!(blob_id = %id, size, "adopting untracked blob file");
                self.index_insert(&id, size)?;
            }
        }
        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Blob store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("blob store is full")]
    StoreFull,
    #[error("blob {0} contents do not match its id")]
    Corrupt(BlobId),
    #[error("corrupted index entry: {0}")]
    BadIndexEntry(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index error: {0}")]
    Index(#[from] rusqlite::Error),
}
