//! DHT boundary.
//!
//! The routing table and UDP transport are an external collaborator; the
//! engine depends on the [`Dht`] trait and translates lookup completions into
//! events on its reactor channel. [`MemoryDht`] is the in-process
//! implementation used by tests and single-node deployments.
//!
//! Items in this engine's namespace are signed manifests keyed by their
//! author's Ed25519 public key; the mutable item's signature is the
//! manifest's own signature over its canonical bytes. A backend that cannot
//! inject pre-signed items returns [`DhtError::Unsupported`] from
//! [`Dht::put_mutable_signed`], which makes the gateway role unsupported on
//! that backend.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use strand_protocol::manifest::SignedManifest;
use strand_protocol::types::{InfoHash, PeerAddr};
use tokio::sync::mpsc;

/// A BEP-44-style mutable item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableItem {
    /// Ed25519 public key the item is stored under.
    pub key: [u8; 32],
    pub seq: i64,
    pub value: Vec<u8>,
    pub sig: [u8; 64],
}

/// The assumed external DHT library surface.
#[async_trait]
pub trait Dht: Send + Sync {
    /// Sign and store a mutable item under the author's public key.
    async fn put_mutable(
        &self,
        author: &SigningKey,
        value: Vec<u8>,
        seq: i64,
    ) -> Result<(), DhtError>;

    /// Relay an already-signed mutable item without holding the private key.
    async fn put_mutable_signed(&self, item: MutableItem) -> Result<(), DhtError>;

    /// Fetch the current mutable item for a key, if any.
    async fn get_mutable(&self, key: [u8; 32]) -> Result<Option<MutableItem>, DhtError>;

    /// Announce that this node serves content with `info_hash` on `port`.
    async fn announce(&self, info_hash: InfoHash, port: u16) -> Result<(), DhtError>;

    /// Look up peers announcing `info_hash`.
    async fn get_peers(&self, info_hash: InfoHash) -> Result<Vec<PeerAddr>, DhtError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    #[error("dht rejected the item: {0}")]
    Rejected(String),
    #[error("signed-item relay unsupported by this dht")]
    Unsupported,
    #[error("dht unavailable: {0}")]
    Unavailable(String),
}

/// Lookup completions fanned out to the engine loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtEvent {
    ManifestFound {
        item: MutableItem,
    },
    PeersFound {
        info_hash: InfoHash,
        endpoints: Vec<PeerAddr>,
    },
}

/// Wraps a [`Dht`]: lookups become fire-and-forget requests whose results
/// arrive as [`DhtEvent`]s; writes are awaited by the caller.
#[derive(Clone)]
pub struct DhtAdapter {
    dht: Arc<dyn Dht>,
    event_tx: mpsc::UnboundedSender<DhtEvent>,
}

impl DhtAdapter {
    pub fn new(dht: Arc<dyn Dht>) -> (Self, mpsc::UnboundedReceiver<DhtEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self { dht, event_tx }, event_rx)
    }

    /// Request the mutable item for a key; a hit arrives as `ManifestFound`.
    pub fn request_manifest(&self, key: [u8; 32]) {
        let dht = self.dht.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            match dht.get_mutable(key).await {
                Ok(Some(item)) => {
                    let _ = event_tx.send(DhtEvent::ManifestFound { item });
                }
                Ok(None) => {
                    tracing::debug!(
                        key = data_encoding::HEXLOWER.encode(&key),
                        "no mutable item yet"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        key = data_encoding::HEXLOWER.encode(&key),
                        error = %e,
                        "mutable get failed"
                    );
                }
            }
        });
    }

    /// Request peers for an infohash; a non-empty result arrives as
    /// `PeersFound`.
    pub fn request_peers(&self, info_hash: InfoHash) {
        let dht = self.dht.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            match dht.get_peers(info_hash).await {
                Ok(endpoints) if !endpoints.is_empty() => {
                    let _ = event_tx.send(DhtEvent::PeersFound {
                        info_hash,
                        endpoints,
                    });
                }
                Ok(_) => {
                    tracing::debug!(info_hash = %info_hash, "no peers found");
                }
                Err(e) => {
                    tracing::warn!(info_hash = %info_hash, error = %e, "peer lookup failed");
                }
            }
        });
    }

    /// Fire-and-forget announce.
    pub fn announce(&self, info_hash: InfoHash, port: u16) {
        let dht = self.dht.clone();
        tokio::spawn(async move {
            if let Err(e) = dht.announce(info_hash, port).await {
                tracing::warn!(info_hash = %info_hash, error = %e, "announce failed");
            }
        });
    }

    /// Publish a signed manifest under the author's key.
    pub async fn publish(
        &self,
        author: &SigningKey,
        manifest: &SignedManifest,
    ) -> Result<(), DhtError> {
        self.dht
            .put_mutable(author, manifest.as_bytes().to_vec(), manifest.seq())
            .await
    }

    /// Relay a pre-signed manifest (gateway mode).
    pub async fn relay(&self, manifest: &SignedManifest) -> Result<(), DhtError> {
        self.dht
            .put_mutable_signed(MutableItem {
                key: manifest.public_key(),
                seq: manifest.seq(),
                value: manifest.as_bytes().to_vec(),
                sig: manifest.sig(),
            })
            .await
    }
}

/// In-memory DHT for tests and single-process deployments.
///
/// Mutable puts follow BEP-44 update semantics: an item replaces the stored
/// one only when its sequence number is greater; equal-or-lower puts are
/// accepted and discarded. Announces assume loopback peers.
#[derive(Default)]
pub struct MemoryDht {
    items: Mutex<HashMap<[u8; 32], MutableItem>>,
    peers: Mutex<HashMap<InfoHash, Vec<PeerAddr>>>,
}

impl MemoryDht {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify a value as a signed manifest consistent with the item fields.
    fn check_item(item: &MutableItem) -> Result<(), DhtError> {
        let manifest = SignedManifest::parse(&item.value)
            .map_err(|e| DhtError::Rejected(format!("bad manifest value: {e}")))?;
        if manifest.public_key() != item.key {
            return Err(DhtError::Rejected("key does not match manifest".into()));
        }
        if manifest.seq() != item.seq {
            return Err(DhtError::Rejected("seq does not match manifest".into()));
        }
        if manifest.sig() != item.sig {
            return Err(DhtError::Rejected("sig does not match manifest".into()));
        }
        Ok(())
    }

    fn store(&self, item: MutableItem) {
        let mut items = self.items.lock().unwrap();
        match items.get(&item.key) {
            Some(existing) if existing.seq >= item.seq => {
                tracing::debug!(
                    key = data_encoding::HEXLOWER.encode(&item.key),
                    stored = existing.seq,
                    offered = item.seq,
                    "keeping higher-sequence item"
                );
            }
            _ => {
                items.insert(item.key, item);
            }
        }
    }
}

#[async_trait]
impl Dht for MemoryDht {
    async fn put_mutable(
        &self,
        author: &SigningKey,
        value: Vec<u8>,
        seq: i64,
    ) -> Result<(), DhtError> {
        let manifest = SignedManifest::parse(&value)
            .map_err(|e| DhtError::Rejected(format!("bad manifest value: {e}")))?;
        if manifest.public_key() != author.verifying_key().to_bytes() {
            return Err(DhtError::Rejected("author key does not match value".into()));
        }
        let item = MutableItem {
            key: manifest.public_key(),
            seq,
            value,
            sig: manifest.sig(),
        };
        Self::check_item(&item)?;
        self.store(item);
        Ok(())
    }

    async fn put_mutable_signed(&self, item: MutableItem) -> Result<(), DhtError> {
        Self::check_item(&item)?;
        self.store(item);
        Ok(())
    }

    async fn get_mutable(&self, key: [u8; 32]) -> Result<Option<MutableItem>, DhtError> {
        Ok(self.items.lock().unwrap().get(&key).cloned())
    }

    async fn announce(&self, info_hash: InfoHash, port: u16) -> Result<(), DhtError> {
        let peer = PeerAddr(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
        let mut peers = self.peers.lock().unwrap();
        let entries = peers.entry(info_hash).or_default();
        if !entries.contains(&peer) {
            entries.push(peer);
        }
        Ok(())
    }

    async fn get_peers(&self, info_hash: InfoHash) -> Result<Vec<PeerAddr>, DhtError> {
        Ok(self
            .peers
            .lock()
            .unwrap()
            .get(&info_hash)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_protocol::manifest::Manifest;
    use strand_protocol::types::BlobId;

    fn signed(key: &SigningKey, seq: i64) -> SignedManifest {
        SignedManifest::sign(
            key,
            Manifest {
                public_key: [0; 32],
                seq,
                files: vec![],
            },
        )
    }

    #[tokio::test]
    async fn put_then_get() {
        let dht = MemoryDht::new();
        let key = crate::keys::generate();
        let manifest = signed(&key, 5);

        dht.put_mutable(&key, manifest.as_bytes().to_vec(), 5)
            .await
            .unwrap();
        let item = dht
            .get_mutable(key.verifying_key().to_bytes())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.seq, 5);
        assert_eq!(item.value, manifest.as_bytes());
    }

    #[tokio::test]
    async fn lower_sequence_put_succeeds_but_is_discarded() {
        let dht = MemoryDht::new();
        let key = crate::keys::generate();

        let m10 = signed(&key, 10);
        let m9 = signed(&key, 9);
        dht.put_mutable(&key, m10.as_bytes().to_vec(), 10)
            .await
            .unwrap();
        // Sequence-monotonicity enforcement is the subscriber's job; the put
        // itself does not fail.
        dht.put_mutable(&key, m9.as_bytes().to_vec(), 9)
            .await
            .unwrap();

        let item = dht
            .get_mutable(key.verifying_key().to_bytes())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.seq, 10);
    }

    #[tokio::test]
    async fn signed_relay_verifies_manifest() {
        let dht = MemoryDht::new();
        let key = crate::keys::generate();
        let manifest = signed(&key, 3);

        // Relay path: no private key, just the parsed item.
        dht.put_mutable_signed(MutableItem {
            key: manifest.public_key(),
            seq: 3,
            value: manifest.as_bytes().to_vec(),
            sig: manifest.sig(),
        })
        .await
        .unwrap();

        // Tampered value is rejected.
        let mut bad = manifest.as_bytes().to_vec();
        let pos = bad.len() - 10;
        bad[pos] ^= 1;
        let result = dht
            .put_mutable_signed(MutableItem {
                key: manifest.public_key(),
                seq: 3,
                value: bad,
                sig: manifest.sig(),
            })
            .await;
        assert!(matches!(result, Err(DhtError::Rejected(_))));
    }

    #[tokio::test]
    async fn wrong_author_rejected() {
        let dht = MemoryDht::new();
        let author = crate::keys::generate();
        let impostor = crate::keys::generate();
        let manifest = signed(&author, 1);

        let result = dht
            .put_mutable(&impostor, manifest.as_bytes().to_vec(), 1)
            .await;
        assert!(matches!(result, Err(DhtError::Rejected(_))));
    }

    #[tokio::test]
    async fn announce_then_get_peers() {
        let dht = MemoryDht::new();
        let info_hash = BlobId::of(b"blob").info_hash();

        dht.announce(info_hash, 7000).await.unwrap();
        dht.announce(info_hash, 7000).await.unwrap();
        dht.announce(info_hash, 7001).await.unwrap();

        let peers = dht.get_peers(info_hash).await.unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].0.port(), 7000);
        assert_eq!(peers[1].0.port(), 7001);
    }

    #[tokio::test]
    async fn adapter_fans_out_events() {
        let dht = Arc::new(MemoryDht::new());
        let key = crate::keys::generate();
        let manifest = signed(&key, 2);
        dht.put_mutable(&key, manifest.as_bytes().to_vec(), 2)
            .await
            .unwrap();
        let info_hash = BlobId::of(b"b").info_hash();
        dht.announce(info_hash, 9000).await.unwrap();

        let (adapter, mut events) = DhtAdapter::new(dht);
        adapter.request_manifest(key.verifying_key().to_bytes());
        adapter.request_peers(info_hash);

        let mut found_manifest = false;
        let mut found_peers = false;
        for _ in 0..2 {
            match tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap()
            {
                DhtEvent::ManifestFound { item } => {
                    assert_eq!(item.seq, 2);
                    found_manifest = true;
                }
                DhtEvent::PeersFound { endpoints, .. } => {
                    assert_eq!(endpoints.len(), 1);
                    found_peers = true;
                }
            }
        }
        assert!(found_manifest && found_peers);
    }
}
