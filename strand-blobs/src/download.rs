//! Blob download orchestration.
//!
//! A single actor task owns every piece of download state: the FIFO queue of
//! blob ids, per-blob peer queues, and the active-slot count. Attempt I/O
//! (connect, request, receive, verify) runs in spawned tasks that report one
//! outcome event back to the actor, so state transitions all happen in one
//! place. Peers are tried in arrival order, each at most once per download.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use strand_net::secure::connect_with_timeout;
use strand_net::TransportError;
use strand_protocol::types::{BlobId, PeerAddr};
use strand_protocol::wire::Message;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

/// Default global cap on simultaneously active downloads.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// TCP connect plus handshake deadline per attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for the first response frame after sending REQUEST.
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(15);
/// Idle deadline for any later frame.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Payloads at or above this size are hashed off the async runtime.
const HASH_OFFLOAD_THRESHOLD: usize = 256 * 1024;

/// Notifications from the downloader to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    /// A tracked blob has run out of untried peers; ask the DHT for more.
    PeersNeeded(BlobId),
    /// Blob verified and written to its save path.
    Finished { blob_id: BlobId, path: PathBuf },
}

/// Introspection snapshot of one tracked download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSnapshot {
    pub pending_peers: usize,
    pub tried_peers: usize,
    pub active: bool,
    pub attempts: u64,
}

enum Command {
    Queue {
        blob_id: BlobId,
        expected_size: u64,
        save_path: PathBuf,
    },
    AddPeers {
        blob_id: BlobId,
        endpoints: Vec<PeerAddr>,
    },
    Snapshot {
        blob_id: BlobId,
        reply: oneshot::Sender<Option<DownloadSnapshot>>,
    },
    ActiveCount {
        reply: oneshot::Sender<usize>,
    },
    SetGossip(Vec<u8>),
}

struct AttemptOutcome {
    blob_id: BlobId,
    peer: PeerAddr,
    result: Result<Vec<u8>, AttemptError>,
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("peer refused: {0}")]
    Refused(String),
    #[error("timed out waiting for data")]
    Timeout,
    #[error("blob bytes do not hash to the requested id")]
    HashMismatch,
    #[error("hash task failed")]
    HashTask,
}

struct DownloadState {
    expected_size: u64,
    save_path: PathBuf,
    peers: VecDeque<PeerAddr>,
    tried: HashSet<PeerAddr>,
    active: bool,
    attempts: u64,
}

/// Handle to the downloader actor. Cheap to clone.
#[derive(Clone)]
pub struct Downloader {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Downloader {
    /// Spawn the actor. Returns the handle and the event stream.
    pub fn spawn(max_concurrent: usize) -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(cmd_rx, event_tx, max_concurrent));
        (Self { cmd_tx }, event_rx)
    }

    /// Track a blob for download. Queuing an already-tracked id is a no-op.
    pub fn queue(&self, blob_id: BlobId, expected_size: u64, save_path: PathBuf) {
        let _ = self.cmd_tx.send(Command::Queue {
            blob_id,
            expected_size,
            save_path,
        });
    }

    /// Offer candidate peers for a tracked blob. Endpoints already tried or
    /// already pending are dropped, so repeated calls are idempotent.
    pub fn add_peers(&self, blob_id: BlobId, endpoints: Vec<PeerAddr>) {
        let _ = self.cmd_tx.send(Command::AddPeers { blob_id, endpoints });
    }

    /// Inspect a tracked download; `None` once it finished or was never queued.
    pub async fn snapshot(&self, blob_id: BlobId) -> Option<DownloadSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Snapshot { blob_id, reply }).ok()?;
        rx.await.ok().flatten()
    }

    /// Set the HELLO gossip payload sent to each peer before REQUEST
    /// (by convention a JSON map of followed keys to last known sequences).
    pub fn set_gossip(&self, payload: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::SetGossip(payload));
    }

    /// Number of downloads currently holding an active slot.
    pub async fn active_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ActiveCount { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn run(
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<DownloadEvent>,
    max_concurrent: usize,
) {
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<AttemptOutcome>();
    let mut downloads: HashMap<BlobId, DownloadState> = HashMap::new();
    let mut queue: VecDeque<BlobId> = VecDeque::new();
    let mut active = 0usize;
    let mut gossip: Option<Arc<Vec<u8>>> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Queue { blob_id, expected_size, save_path } => {
                        if downloads.contains_key(&blob_id) {
                            tracing::debug!(blob_id = %blob_id, "already tracked, ignoring queue");
                            continue;
                        }
                        downloads.insert(blob_id, DownloadState {
                            expected_size,
                            save_path,
                            peers: VecDeque::new(),
                            tried: HashSet::new(),
                            active: false,
                            attempts: 0,
                        });
                        queue.push_back(blob_id);
                        tracing::info!(blob_id = %blob_id, expected_size, "blob queued");
                        let _ = event_tx.send(DownloadEvent::PeersNeeded(blob_id));
                    }
                    Command::AddPeers { blob_id, endpoints } => {
                        let Some(dl) = downloads.get_mut(&blob_id) else {
                            tracing::debug!(blob_id = %blob_id, "peers for untracked blob dropped");
                            continue;
                        };
                        let mut added = 0;
                        for ep in endpoints {
                            if !dl.tried.contains(&ep) && !dl.peers.contains(&ep) {
                                dl.peers.push_back(ep);
                                added += 1;
                            }
                        }
                        if added > 0 {
                            tracing::debug!(blob_id = %blob_id, added, "peers added");
                            pump(&mut downloads, &queue, &mut active, max_concurrent, &outcome_tx, &gossip);
                        }
                    }
                    Command::Snapshot { blob_id, reply } => {
                        let snapshot = downloads.get(&blob_id).map(|dl| DownloadSnapshot {
                            pending_peers: dl.peers.len(),
                            tried_peers: dl.tried.len(),
                            active: dl.active,
                            attempts: dl.attempts,
                        });
                        let _ = reply.send(snapshot);
                    }
                    Command::ActiveCount { reply } => {
                        let _ = reply.send(active);
                    }
                    Command::SetGossip(payload) => {
                        gossip = Some(Arc::new(payload));
                    }
                }
            }
            Some(outcome) = outcome_rx.recv() => {
                active -= 1;
                handle_outcome(outcome, &mut downloads, &mut queue, &event_tx).await;
                pump(&mut downloads, &queue, &mut active, max_concurrent, &outcome_tx, &gossip);
            }
        }
    }
}

/// Scan the queue in order and start any startable blob until the cap is hit.
fn pump(
    downloads: &mut HashMap<BlobId, DownloadState>,
    queue: &VecDeque<BlobId>,
    active: &mut usize,
    max_concurrent: usize,
    outcome_tx: &mpsc::UnboundedSender<AttemptOutcome>,
    gossip: &Option<Arc<Vec<u8>>>,
) {
    for &blob_id in queue {
        if *active >= max_concurrent {
            break;
        }
        let Some(dl) = downloads.get_mut(&blob_id) else {
            continue;
        };
        if dl.active {
            continue;
        }
        let Some(peer) = dl.peers.pop_front() else {
            continue;
        };
        dl.tried.insert(peer);
        dl.active = true;
        dl.attempts += 1;
        *active += 1;

        tracing::info!(blob_id = %blob_id, peer = %peer, attempt = dl.attempts, "dialing peer");
        let expected_size = dl.expected_size;
        let outcome_tx = outcome_tx.clone();
        let gossip = gossip.clone();
        tokio::spawn(async move {
            let result = fetch_blob(peer, blob_id, expected_size, gossip).await;
            let _ = outcome_tx.send(AttemptOutcome {
                blob_id,
                peer,
                result,
            });
        });
    }
}

async fn handle_outcome(
    outcome: AttemptOutcome,
    downloads: &mut HashMap<BlobId, DownloadState>,
    queue: &mut VecDeque<BlobId>,
    event_tx: &mpsc::UnboundedSender<DownloadEvent>,
) {
    let AttemptOutcome {
        blob_id,
        peer,
        result,
    } = outcome;
    let (save_path, peers_left) = {
        let Some(dl) = downloads.get_mut(&blob_id) else {
            return;
        };
        dl.active = false;
        (dl.save_path.clone(), !dl.peers.is_empty())
    };

    match result {
        Ok(bytes) => match write_atomic(&save_path, &bytes).await {
            Ok(()) => {
                downloads.remove(&blob_id);
                queue.retain(|id| *id != blob_id);
                tracing::info!(blob_id = %blob_id, peer = %peer, size = bytes.len(), "blob finished");
                let _ = event_tx.send(DownloadEvent::Finished {
                    blob_id,
                    path: save_path,
                });
            }
            Err(e) => {
                // Keep the blob tracked; another peer (or a later retry) may
                // land it once the disk condition clears.
                tracing::error!(blob_id = %blob_id, error = %e, "failed to write blob");
                if !peers_left {
                    let _ = event_tx.send(DownloadEvent::PeersNeeded(blob_id));
                }
            }
        },
        Err(e) => {
            tracing::warn!(blob_id = %blob_id, peer = %peer, error = %e, "attempt failed");
            if !peers_left {
                let _ = event_tx.send(DownloadEvent::PeersNeeded(blob_id));
            }
        }
    }
}

/// One download attempt: connect, greet, request, receive, verify.
async fn fetch_blob(
    peer: PeerAddr,
    blob_id: BlobId,
    expected_size: u64,
    gossip: Option<Arc<Vec<u8>>>,
) -> Result<Vec<u8>, AttemptError> {
    let mut stream = connect_with_timeout(peer.0, CONNECT_TIMEOUT).await?;
    if let Some(gossip) = gossip {
        stream
            .send(&Message::Hello {
                gossip: gossip.as_ref().clone(),
            })
            .await?;
    }
    stream.send(&Message::Request { blob_id }).await?;

    let mut deadline = FIRST_FRAME_TIMEOUT;
    let bytes = loop {
        let msg = tokio::time::timeout(deadline, stream.recv())
            .await
            .map_err(|_| AttemptError::Timeout)??;
        deadline = IDLE_TIMEOUT;
        match msg {
            Message::Data { bytes } => break bytes,
            Message::Error { reason } => {
                stream.close().await;
                return Err(AttemptError::Refused(reason));
            }
            // Gossip and other chatter before the data frame is fine.
            other => {
                tracing::debug!(blob_id = %blob_id, opcode = other.opcode(), "skipping pre-data frame");
            }
        }
    };
    stream.close().await;

    if bytes.len() as u64 != expected_size {
        tracing::debug!(
            blob_id = %blob_id,
            expected = expected_size,
            actual = bytes.len(),
            "blob size differs from manifest entry"
        );
    }

    let (computed, bytes) = if bytes.len() >= HASH_OFFLOAD_THRESHOLD {
        tokio::task::spawn_blocking(move || (BlobId::of(&bytes), bytes))
            .await
            .map_err(|_| AttemptError::HashTask)?
    } else {
        (BlobId::of(&bytes), bytes)
    };
    if computed != blob_id {
        return Err(AttemptError::HashMismatch);
    }
    Ok(bytes)
}

/// Write via temp file in the same directory, fsync, rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("part");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
