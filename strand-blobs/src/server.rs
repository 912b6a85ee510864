//! Serves stored blobs to peers over the secure transport.
//!
//! Each accepted connection gets its own task: acceptor handshake, then a
//! sequential request loop (one transfer in flight per connection). ANNOUNCE
//! messages feed a recency-bounded peer cache that FIND_PEERS answers from.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use strand_net::secure::{handshake, SecureStream, HANDSHAKE_TIMEOUT};
use strand_net::Role;
use strand_protocol::manifest::SignedManifest;
use strand_protocol::types::{BlobId, PeerAddr};
use strand_protocol::wire::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::store::BlobStore;

/// Default cap on simultaneously served connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Most recent announces kept per blob.
const ANNOUNCES_PER_BLOB: usize = 32;
/// Announces older than this are not served.
const ANNOUNCE_TTL: Duration = Duration::from_secs(30 * 60);

/// A pre-signed manifest relayed by a peer for gateway publication.
#[derive(Debug)]
pub struct PublishReceived {
    pub from: SocketAddr,
    pub manifest: SignedManifest,
}

/// Blob server configuration; call [`BlobServer::bind`] to start serving.
pub struct BlobServer {
    store: Arc<BlobStore>,
    max_connections: usize,
    gossip_tx: Option<mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>>,
    publish_tx: Option<mpsc::UnboundedSender<PublishReceived>>,
}

impl BlobServer {
    pub fn new(store: Arc<BlobStore>) -> Self {
        Self {
            store,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            gossip_tx: None,
            publish_tx: None,
        }
    }

    pub fn max_connections(mut self, cap: usize) -> Self {
        self.max_connections = cap;
        self
    }

    /// Receive HELLO gossip payloads with the sender's address.
    pub fn gossip_channel(&mut self) -> mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.gossip_tx = Some(tx);
        rx
    }

    /// Accept PUBLISH relays. Without this channel the server refuses them.
    pub fn publish_channel(&mut self) -> mpsc::UnboundedReceiver<PublishReceived> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.publish_tx = Some(tx);
        rx
    }

    /// Bind and start the accept loop.
    pub async fn bind(self, addr: SocketAddr) -> std::io::Result<RunningServer> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let announces = Arc::new(AnnounceCache::default());
        let announces_handle = announces.clone();
        let connections = Arc::new(AtomicUsize::new(0));

        tracing::info!(addr = %local_addr, "blob server listening");
        let task = tokio::spawn(async move {
            loop {
                let (socket, remote) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                if connections.load(Ordering::SeqCst) >= self.max_connections {
                    tracing::warn!(remote = %remote, "connection limit reached, dropping");
                    drop(socket);
                    continue;
                }
                connections.fetch_add(1, Ordering::SeqCst);

                let store = self.store.clone();
                let announces = announces.clone();
                let gossip_tx = self.gossip_tx.clone();
                let publish_tx = self.publish_tx.clone();
                let connections = connections.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        serve_connection(socket, remote, store, announces, gossip_tx, publish_tx)
                            .await
                    {
                        tracing::debug!(remote = %remote, error = %e, "connection ended");
                    }
                    connections.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Ok(RunningServer {
            local_addr,
            announces: announces_handle,
            task,
        })
    }
}

/// A bound blob server. Aborts its accept loop on drop.
pub struct RunningServer {
    local_addr: SocketAddr,
    announces: Arc<AnnounceCache>,
    task: JoinHandle<()>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Record a peer for a blob, as if it had announced over a connection.
    pub fn record_peer(&self, blob_id: BlobId, peer: PeerAddr) {
        self.announces.record(blob_id, peer);
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(
    socket: TcpStream,
    remote: SocketAddr,
    store: Arc<BlobStore>,
    announces: Arc<AnnounceCache>,
    gossip_tx: Option<mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>>,
    publish_tx: Option<mpsc::UnboundedSender<PublishReceived>>,
) -> Result<(), strand_net::TransportError> {
    let mut stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(socket, Role::Acceptor))
        .await
        .map_err(|_| strand_net::TransportError::Timeout)??;
    tracing::debug!(remote = %remote, "peer connected");

    loop {
        let msg = match stream.recv().await {
            Ok(msg) => msg,
            Err(e) => {
                stream.close().await;
                return Err(e);
            }
        };
        match msg {
            Message::Request { blob_id } => {
                serve_blob(&mut stream, &store, remote, blob_id).await?;
            }
            Message::FindPeers { blob_id } => {
                let endpoints = announces.lookup(&blob_id);
                tracing::debug!(
                    remote = %remote,
                    blob_id = %blob_id,
                    peers = endpoints.len(),
                    "serving peer lookup"
                );
                stream.send(&Message::Peers { endpoints }).await?;
            }
            Message::Announce { blob_id, port } => {
                let peer = PeerAddr(SocketAddr::new(remote.ip(), port));
                tracing::debug!(remote = %remote, blob_id = %blob_id, peer = %peer, "peer announced blob");
                announces.record(blob_id, peer);
            }
            Message::Hello { gossip } => {
                if let Some(tx) = &gossip_tx {
                    let _ = tx.send((remote, gossip));
                } else {
                    tracing::debug!(remote = %remote, bytes = gossip.len(), "gossip received");
                }
            }
            Message::Publish { manifest } => {
                relay_publish(&mut stream, remote, &manifest, publish_tx.as_ref()).await?;
            }
            other => {
                tracing::debug!(remote = %remote, opcode = other.opcode(), "ignoring message");
            }
        }
    }
}

async fn serve_blob(
    stream: &mut SecureStream<TcpStream>,
    store: &BlobStore,
    remote: SocketAddr,
    blob_id: BlobId,
) -> Result<(), strand_net::TransportError> {
    match store.get(&blob_id) {
        Ok(Some(bytes)) => {
            tracing::info!(remote = %remote, blob_id = %blob_id, size = bytes.len(), "serving blob");
            stream.send(&Message::Data { bytes }).await
        }
        Ok(None) => {
            tracing::debug!(remote = %remote, blob_id = %blob_id, "blob not found");
            stream
                .send(&Message::Error {
                    reason: "not found".into(),
                })
                .await
        }
        Err(e) => {
            tracing::error!(blob_id = %blob_id, error = %e, "store read failed");
            stream
                .send(&Message::Error {
                    reason: "store error".into(),
                })
                .await
        }
    }
}

async fn relay_publish(
    stream: &mut SecureStream<TcpStream>,
    remote: SocketAddr,
    manifest_bytes: &[u8],
    publish_tx: Option<&mpsc::UnboundedSender<PublishReceived>>,
) -> Result<(), strand_net::TransportError> {
    let Some(tx) = publish_tx else {
        return stream
            .send(&Message::Error {
                reason: "not a gateway".into(),
            })
            .await;
    };
    match SignedManifest::parse(manifest_bytes) {
        Ok(manifest) => {
            tracing::info!(
                remote = %remote,
                author = data_encoding::HEXLOWER.encode(&manifest.public_key()),
                seq = manifest.seq(),
                "relaying signed manifest"
            );
            let _ = tx.send(PublishReceived {
                from: remote,
                manifest,
            });
            stream.send(&Message::Ok { context: vec![] }).await
        }
        Err(e) => {
            tracing::warn!(remote = %remote, error = %e, "rejecting bad publish");
            stream
                .send(&Message::Error {
                    reason: "bad manifest".into(),
                })
                .await
        }
    }
}

/// Recent blob announcements, newest first per blob.
#[derive(Default)]
struct AnnounceCache {
    inner: Mutex<HashMap<BlobId, Vec<(PeerAddr, Instant)>>>,
}

impl AnnounceCache {
    fn record(&self, blob_id: BlobId, peer: PeerAddr) {
        let mut inner = self.inner.lock().unwrap();
        let entries = inner.entry(blob_id).or_default();
        entries.retain(|(addr, _)| *addr != peer);
        entries.insert(0, (peer, Instant::now()));
        entries.truncate(ANNOUNCES_PER_BLOB);
    }

    fn lookup(&self, blob_id: &BlobId) -> Vec<PeerAddr> {
        let inner = self.inner.lock().unwrap();
        inner
            .get(blob_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, at)| at.elapsed() < ANNOUNCE_TTL)
                    .map(|(addr, _)| *addr)
                    .collect()
            })
            .unwrap_or_default()
    }
}
