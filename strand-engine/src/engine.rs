//! Engine wiring: one event loop ties the store, downloader, blob server,
//! DHT adapter, and subscription registry together.
//!
//! All engine state lives behind the `Engine` value; the loop task consumes
//! DHT completions, downloader notifications, relayed publishes, and the
//! subscription poll timer. Command methods are thin entry points the admin
//! layer dispatches to.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use data_encoding::HEXLOWER;
use strand_blobs::download::DownloadEvent;
use strand_blobs::server::PublishReceived;
use strand_blobs::{ingest_file, reassemble, BlobServer, BlobStore, Downloader, RunningServer};
use strand_protocol::manifest::{FileEntry, Manifest, SignedManifest};
use strand_protocol::types::{BlobId, InfoHash};
use tokio::sync::mpsc;

use crate::commands::{
    BlobReport, BlobStoreStatus, EngineError, IngestReport, KeyOutput, NetworkStatus,
    PublishReport, StatusReport, SubscriptionReport,
};
use crate::config::EngineConfig;
use crate::dht::{Dht, DhtAdapter, DhtEvent};
use crate::keys;
use crate::subscriptions::SubscriptionManager;

/// Notifications for engine observers (UI, tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    SubscriptionUpdated { public_key: [u8; 32], seq: i64 },
    BlobFinished(BlobId),
    FileComplete { name: String, path: PathBuf },
}

/// A file entry from an accepted manifest still waiting on blobs.
struct PendingFile {
    entry: FileEntry,
    missing: HashSet<BlobId>,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<BlobStore>,
    downloader: Downloader,
    adapter: DhtAdapter,
    subscriptions: Mutex<SubscriptionManager>,
    listen_addr: SocketAddr,
    /// Maps announced infohashes back to the blob ids awaiting peers.
    pending_blobs: Mutex<HashMap<InfoHash, BlobId>>,
    pending_files: Mutex<Vec<PendingFile>>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    /// Held so the accept loop stays alive for the engine's lifetime.
    _server: RunningServer,
}

impl Engine {
    /// Bring up the engine: store, downloader, blob server, event loop.
    pub async fn start(
        config: EngineConfig,
        dht: Arc<dyn Dht>,
    ) -> anyhow::Result<(Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>)> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data directory: {}", config.data_dir.display())
        })?;

        let store = Arc::new(BlobStore::open(
            config.data_dir.join("blobs"),
            config.store_capacity_bytes,
        )?);
        if config.verify_store_on_open {
            let quarantined = store.verify_all()?;
            if quarantined > 0 {
                tracing::warn!(quarantined, "quarantined corrupted blobs at startup");
            }
        }

        let (downloader, download_rx) = Downloader::spawn(config.max_concurrent_downloads);
        let (adapter, dht_rx) = DhtAdapter::new(dht);

        let mut server = BlobServer::new(store.clone()).max_connections(config.max_connections);
        let gossip_rx = server.gossip_channel();
        let publish_rx = server.publish_channel();
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.listen_port);
        let server = server
            .bind(bind_addr)
            .await
            .context("failed to bind blob server")?;
        let listen_addr = server.local_addr();

        let subscriptions = Mutex::new(SubscriptionManager::load(
            config.data_dir.join("subscriptions.json"),
        ));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let engine = Arc::new(Self {
            config,
            store,
            downloader,
            adapter,
            subscriptions,
            listen_addr,
            pending_blobs: Mutex::new(HashMap::new()),
            pending_files: Mutex::new(Vec::new()),
            event_tx,
            _server: server,
        });
        engine
            .clone()
            .spawn_loop(dht_rx, download_rx, gossip_rx, publish_rx);
        engine.refresh_outbound_gossip();
        engine.poll_subscriptions();
        tracing::info!(listen_addr = %listen_addr, "engine started");
        Ok((engine, event_rx))
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    fn spawn_loop(
        self: Arc<Self>,
        mut dht_rx: mpsc::UnboundedReceiver<DhtEvent>,
        mut download_rx: mpsc::UnboundedReceiver<DownloadEvent>,
        mut gossip_rx: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
        mut publish_rx: mpsc::UnboundedReceiver<PublishReceived>,
    ) {
        let poll_period = Duration::from_secs(self.config.poll_interval_secs.max(1));
        tokio::spawn(async move {
            let mut poll = tokio::time::interval(poll_period);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick; startup already polled.
            poll.tick().await;
            loop {
                tokio::select! {
                    Some(event) = dht_rx.recv() => self.on_dht_event(event),
                    Some(event) = download_rx.recv() => self.on_download_event(event),
                    Some((from, gossip)) = gossip_rx.recv() => self.on_gossip(from, &gossip),
                    Some(publish) = publish_rx.recv() => self.on_publish_relay(publish).await,
                    _ = poll.tick() => self.poll_subscriptions(),
                    else => break,
                }
            }
        });
    }

    fn on_dht_event(&self, event: DhtEvent) {
        match event {
            DhtEvent::ManifestFound { item } => {
                let accepted = self.subscriptions.lock().unwrap().on_manifest_found(&item);
                if let Some(signed) = accepted {
                    let _ = self.event_tx.send(EngineEvent::SubscriptionUpdated {
                        public_key: signed.public_key(),
                        seq: signed.seq(),
                    });
                    self.refresh_outbound_gossip();
                    for entry in &signed.manifest().files {
                        self.fetch_file(entry.clone());
                    }
                }
            }
            DhtEvent::PeersFound {
                info_hash,
                endpoints,
            } => {
                let blob_id = self.pending_blobs.lock().unwrap().get(&info_hash).copied();
                match blob_id {
                    Some(blob_id) => self.downloader.add_peers(blob_id, endpoints),
                    None => {
                        tracing::debug!(info_hash = %info_hash, "peers for unknown infohash");
                    }
                }
            }
        }
    }

    fn on_download_event(&self, event: DownloadEvent) {
        match event {
            DownloadEvent::PeersNeeded(blob_id) => {
                self.pending_blobs
                    .lock()
                    .unwrap()
                    .insert(blob_id.info_hash(), blob_id);
                self.adapter.request_peers(blob_id.info_hash());
            }
            DownloadEvent::Finished { blob_id, path } => {
                if let Err(e) = self.store.insert_from_file(blob_id, &path) {
                    tracing::error!(blob_id = %blob_id, error = %e, "failed to adopt downloaded blob");
                    return;
                }
                self.pending_blobs.lock().unwrap().remove(&blob_id.info_hash());
                self.adapter
                    .announce(blob_id.info_hash(), self.listen_addr.port());
                let _ = self.event_tx.send(EngineEvent::BlobFinished(blob_id));
                self.settle_pending_files(blob_id);
            }
        }
    }

    /// HELLO gossip: a JSON map of pub-key hex to the sender's latest known
    /// sequence. Anything newer than our registry triggers a manifest lookup.
    fn on_gossip(&self, from: SocketAddr, payload: &[u8]) {
        let known: HashMap<String, i64> = match serde_json::from_slice(payload) {
            Ok(known) => known,
            Err(e) => {
                tracing::debug!(from = %from, error = %e, "undecodable gossip dropped");
                return;
            }
        };
        for (hex, their_seq) in known {
            let Ok(public_key) = keys::parse_public(&hex) else {
                continue;
            };
            let newer = {
                let subs = self.subscriptions.lock().unwrap();
                subs.list()
                    .iter()
                    .any(|sub| sub.public_key == public_key && their_seq > sub.last_seq)
            };
            if newer {
                tracing::info!(from = %from, key = %hex, seq = their_seq, "gossip hints at newer revision");
                self.adapter.request_manifest(public_key);
            }
        }
    }

    async fn on_publish_relay(&self, publish: PublishReceived) {
        match self.adapter.relay(&publish.manifest).await {
            Ok(()) => {
                tracing::info!(
                    from = %publish.from,
                    author = HEXLOWER.encode(&publish.manifest.public_key()),
                    seq = publish.manifest.seq(),
                    "relayed manifest to dht"
                );
            }
            Err(e) => {
                tracing::warn!(from = %publish.from, error = %e, "manifest relay failed");
            }
        }
    }

    /// Keep the HELLO payload peers receive from us current: the map of
    /// followed keys to our last accepted sequences.
    fn refresh_outbound_gossip(&self) {
        let known: HashMap<String, i64> = self
            .subscriptions
            .lock()
            .unwrap()
            .list()
            .into_iter()
            .map(|sub| (HEXLOWER.encode(&sub.public_key), sub.last_seq))
            .collect();
        match serde_json::to_vec(&known) {
            Ok(payload) => self.downloader.set_gossip(payload),
            Err(e) => tracing::error!(error = %e, "failed to encode gossip"),
        }
    }

    fn poll_subscriptions(&self) {
        let polled = {
            let mut subs = self.subscriptions.lock().unwrap();
            if subs.is_empty() {
                return;
            }
            subs.mark_all_checked();
            subs.keys()
        };
        tracing::debug!(count = polled.len(), "polling subscriptions");
        for key in polled {
            self.adapter.request_manifest(key);
        }
    }

    /// Queue every missing chunk of a manifest file entry for download.
    fn fetch_file(&self, entry: FileEntry) {
        let mut missing = HashSet::new();
        for chunk in &entry.chunks {
            match self.store.contains(&chunk.id) {
                Ok(true) => {}
                Ok(false) => {
                    missing.insert(chunk.id);
                }
                Err(e) => {
                    tracing::error!(blob_id = %chunk.id, error = %e, "store lookup failed");
                    missing.insert(chunk.id);
                }
            }
        }
        if missing.is_empty() {
            self.complete_file(&entry);
            return;
        }

        tracing::info!(
            name = %entry.name,
            missing = missing.len(),
            total = entry.chunks.len(),
            "fetching file chunks"
        );
        for chunk in entry.chunks.iter().filter(|c| missing.contains(&c.id)) {
            self.pending_blobs
                .lock()
                .unwrap()
                .insert(chunk.id.info_hash(), chunk.id);
            let staging = self
                .config
                .data_dir
                .join("staging")
                .join(chunk.id.to_hex());
            self.downloader.queue(chunk.id, chunk.size, staging);
        }
        self.pending_files
            .lock()
            .unwrap()
            .push(PendingFile { entry, missing });
    }

    fn settle_pending_files(&self, blob_id: BlobId) {
        let completed: Vec<FileEntry> = {
            let mut pending = self.pending_files.lock().unwrap();
            for file in pending.iter_mut() {
                file.missing.remove(&blob_id);
            }
            let mut done = Vec::new();
            pending.retain_mut(|file| {
                if file.missing.is_empty() {
                    done.push(std::mem::replace(
                        &mut file.entry,
                        FileEntry {
                            name: String::new(),
                            size: 0,
                            mime: String::new(),
                            chunks: vec![],
                        },
                    ));
                    false
                } else {
                    true
                }
            });
            done
        };
        for entry in completed {
            self.complete_file(&entry);
        }
    }

    /// Decrypt and reassemble a file whose chunks are all in the store.
    fn complete_file(&self, entry: &FileEntry) {
        let plain = match reassemble(entry, |id| self.store.get(id).ok().flatten()) {
            Ok(plain) => plain,
            Err(e) => {
                tracing::error!(name = %entry.name, error = %e, "reassembly failed");
                return;
            }
        };

        let file_name = Path::new(&entry.name)
            .file_name()
            .map(|n| n.to_owned())
            .unwrap_or_else(|| "file".into());
        let downloads = self.config.data_dir.join("downloads");
        let out_path = downloads.join(&file_name);
        let result = std::fs::create_dir_all(&downloads)
            .and_then(|()| std::fs::write(&out_path, &plain));
        match result {
            Ok(()) => {
                tracing::info!(name = %entry.name, path = %out_path.display(), "file complete");
                let _ = self.event_tx.send(EngineEvent::FileComplete {
                    name: entry.name.clone(),
                    path: out_path,
                });
            }
            Err(e) => {
                tracing::error!(name = %entry.name, error = %e, "failed to write reassembled file");
            }
        }
    }

    // --- command surface -------------------------------------------------

    pub fn status(&self) -> Result<StatusReport, EngineError> {
        Ok(StatusReport {
            dht: "ready".into(),
            network: NetworkStatus {
                listen_addr: self.listen_addr.to_string(),
            },
            blob_store: BlobStoreStatus {
                blobs: self.store.count()?,
                size: self.store.total_size()?,
                max: self.store.capacity(),
            },
            subscriptions: self.subscriptions.lock().unwrap().len(),
        })
    }

    /// Generate and persist a fresh author identity.
    pub fn generate_key(&self) -> Result<KeyOutput, EngineError> {
        let key = keys::generate();
        keys::save_key(&self.config.data_dir.join("keys"), &key)?;
        Ok(KeyOutput {
            public_key: keys::public_hex(&key),
            secret_key: keys::secret_hex(&key),
        })
    }

    /// Chunk, encrypt, and store a local file, announcing each blob.
    pub async fn ingest(&self, path: &Path) -> Result<IngestReport, EngineError> {
        let outcome = ingest_file(&self.store, path).await?;
        for chunk in &outcome.entry.chunks {
            self.adapter
                .announce(chunk.id.info_hash(), self.listen_addr.port());
        }
        Ok(IngestReport {
            file_entry: outcome.entry,
            blob_count: outcome.blob_count,
        })
    }

    /// Sign a manifest over `files` and publish it to the DHT.
    pub async fn publish(
        &self,
        files: Vec<FileEntry>,
        secret_key_hex: &str,
        seq: Option<i64>,
    ) -> Result<PublishReport, EngineError> {
        let key = keys::parse_secret(secret_key_hex)?;
        if files.is_empty() {
            return Err(EngineError::BadManifest("no file entries".into()));
        }
        let seq = seq.unwrap_or_else(|| time::OffsetDateTime::now_utc().unix_timestamp());
        if seq < 0 {
            return Err(EngineError::BadManifest("negative sequence".into()));
        }

        let signed = SignedManifest::sign(
            &key,
            Manifest {
                public_key: [0; 32],
                seq,
                files,
            },
        );
        self.adapter.publish(&key, &signed).await?;
        self.adapter
            .announce(signed.info_hash(), self.listen_addr.port());
        tracing::info!(
            author = HEXLOWER.encode(&signed.public_key()),
            seq,
            "manifest published"
        );
        Ok(PublishReport {
            status: "published",
            sequence: seq,
        })
    }

    /// Follow an author. Issues an immediate manifest lookup.
    pub fn subscribe(
        &self,
        public_key_hex: &str,
        label: Option<String>,
    ) -> Result<(), EngineError> {
        let public_key = keys::parse_public(public_key_hex)?;
        let label = label.unwrap_or_else(|| public_key_hex.chars().take(8).collect());
        self.subscriptions
            .lock()
            .unwrap()
            .add(label, public_key)?;
        self.refresh_outbound_gossip();
        self.adapter.request_manifest(public_key);
        Ok(())
    }

    pub fn unsubscribe(&self, public_key_hex: &str) -> Result<(), EngineError> {
        let public_key = keys::parse_public(public_key_hex)?;
        self.subscriptions.lock().unwrap().remove(&public_key)?;
        self.refresh_outbound_gossip();
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionReport> {
        self.subscriptions
            .lock()
            .unwrap()
            .list()
            .into_iter()
            .map(|sub| SubscriptionReport {
                public_key: HEXLOWER.encode(&sub.public_key),
                last_sequence: sub.last_seq,
                status: if sub.last_seq > 0 {
                    "active".into()
                } else {
                    "pending".into()
                },
            })
            .collect()
    }

    pub fn blobs(&self) -> Result<Vec<BlobReport>, EngineError> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .map(|info| BlobReport {
                blob_id: info.id.to_hex(),
                size: info.size,
                added_at: info.added_at,
            })
            .collect())
    }
}
