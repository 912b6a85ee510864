//! Subscription registry: who we follow, what revision we last accepted.
//!
//! Manifests arriving from the DHT pass three gates: the key must be
//! subscribed, the signature must verify, and the sequence must be strictly
//! greater than the last accepted one. The registry is rewritten atomically
//! (temp file + rename) on every accepted change.

use std::collections::HashMap;
use std::path::PathBuf;

use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use strand_protocol::manifest::SignedManifest;
use time::OffsetDateTime;

use crate::dht::MutableItem;
use crate::keys;

/// A long-lived interest in one author's manifest revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub label: String,
    pub public_key: [u8; 32],
    pub last_seq: i64,
    pub last_updated: OffsetDateTime,
    pub last_checked: OffsetDateTime,
}

/// On-disk record: `{label, pub, seq, updated, checked}` with RFC-3339 times.
#[derive(Serialize, Deserialize)]
struct SubscriptionRecord {
    label: String,
    #[serde(rename = "pub")]
    public_key: String,
    seq: i64,
    #[serde(with = "time::serde::rfc3339")]
    updated: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    checked: OffsetDateTime,
}

pub struct SubscriptionManager {
    path: PathBuf,
    subs: HashMap<[u8; 32], Subscription>,
    verify_failures: u64,
}

impl SubscriptionManager {
    /// Load the registry from `path`; a missing or corrupt file starts empty.
    pub fn load(path: PathBuf) -> Self {
        let subs = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<SubscriptionRecord>>(&bytes) {
                Ok(records) => {
                    let mut subs = HashMap::new();
                    for record in records {
                        match keys::parse_public(&record.public_key) {
                            Ok(public_key) => {
                                subs.insert(
                                    public_key,
                                    Subscription {
                                        label: record.label,
                                        public_key,
                                        last_seq: record.seq,
                                        last_updated: record.updated,
                                        last_checked: record.checked,
                                    },
                                );
                            }
                            Err(e) => {
                                tracing::warn!(
                                    key = %record.public_key,
                                    error = %e,
                                    "skipping subscription with bad key"
                                );
                            }
                        }
                    }
                    tracing::info!(path = %path.display(), count = subs.len(), "subscriptions loaded");
                    subs
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "corrupt subscriptions file");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read subscriptions");
                HashMap::new()
            }
        };
        Self {
            path,
            subs,
            verify_failures: 0,
        }
    }

    /// Register interest in a public key. Fails if already subscribed.
    pub fn add(&mut self, label: String, public_key: [u8; 32]) -> Result<(), SubscriptionError> {
        if self.subs.contains_key(&public_key) {
            return Err(SubscriptionError::Exists);
        }
        let now = OffsetDateTime::now_utc();
        self.subs.insert(
            public_key,
            Subscription {
                label,
                public_key,
                last_seq: 0,
                last_updated: now,
                last_checked: now,
            },
        );
        self.persist();
        tracing::info!(key = HEXLOWER.encode(&public_key), "subscription added");
        Ok(())
    }

    /// Drop a subscription. Fails if not present.
    pub fn remove(&mut self, public_key: &[u8; 32]) -> Result<(), SubscriptionError> {
        if self.subs.remove(public_key).is_none() {
            return Err(SubscriptionError::NotFound);
        }
        self.persist();
        tracing::info!(key = HEXLOWER.encode(public_key), "subscription removed");
        Ok(())
    }

    pub fn contains(&self, public_key: &[u8; 32]) -> bool {
        self.subs.contains_key(public_key)
    }

    pub fn list(&self) -> Vec<Subscription> {
        self.subs.values().cloned().collect()
    }

    /// The keys to poll.
    pub fn keys(&self) -> Vec<[u8; 32]> {
        self.subs.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Manifests dropped because verification failed.
    pub fn verify_failures(&self) -> u64 {
        self.verify_failures
    }

    /// Stamp every subscription as just checked and persist once.
    pub fn mark_all_checked(&mut self) {
        let now = OffsetDateTime::now_utc();
        for sub in self.subs.values_mut() {
            sub.last_checked = now;
        }
        self.persist();
    }

    /// Gate a manifest that arrived for `item.key`.
    ///
    /// Returns the verified manifest when it advances the subscription;
    /// unknown keys, bad signatures, and replays return `None`.
    pub fn on_manifest_found(&mut self, item: &MutableItem) -> Option<SignedManifest> {
        let sub = match self.subs.get_mut(&item.key) {
            Some(sub) => sub,
            None => {
                tracing::debug!(
                    key = HEXLOWER.encode(&item.key),
                    "manifest for unsubscribed key dropped"
                );
                return None;
            }
        };

        let manifest = match SignedManifest::parse(&item.value) {
            Ok(manifest) if manifest.public_key() == item.key => manifest,
            Ok(_) => {
                self.verify_failures += 1;
                tracing::warn!(
                    key = HEXLOWER.encode(&item.key),
                    "manifest signed by a different key, dropped"
                );
                return None;
            }
            Err(e) => {
                self.verify_failures += 1;
                tracing::warn!(
                    key = HEXLOWER.encode(&item.key),
                    error = %e,
                    "manifest failed verification, dropped"
                );
                return None;
            }
        };

        if manifest.seq() <= sub.last_seq {
            tracing::debug!(
                key = HEXLOWER.encode(&item.key),
                seq = manifest.seq(),
                last_seq = sub.last_seq,
                "replayed or stale manifest dropped"
            );
            return None;
        }

        sub.last_seq = manifest.seq();
        sub.last_updated = OffsetDateTime::now_utc();
        let label = sub.label.clone();
        self.persist();
        tracing::info!(
            key = HEXLOWER.encode(&item.key),
            label = %label,
            seq = manifest.seq(),
            "subscription updated"
        );
        Some(manifest)
    }

    /// Atomically rewrite the registry file. Persistence failures are logged,
    /// never surfaced into the subscription path.
    fn persist(&self) {
        let records: Vec<SubscriptionRecord> = self
            .subs
            .values()
            .map(|sub| SubscriptionRecord {
                label: sub.label.clone(),
                public_key: HEXLOWER.encode(&sub.public_key),
                seq: sub.last_seq,
                updated: sub.last_updated,
                checked: sub.last_checked,
            })
            .collect();

        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_vec_pretty(&records)?;
            let tmp = self.path.with_extension("json.tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, &self.path)?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::error!(path = %self.path.display(), error = %e, "failed to persist subscriptions");
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("already subscribed")]
    Exists,
    #[error("no such subscription")]
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use strand_protocol::manifest::Manifest;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir) -> SubscriptionManager {
        SubscriptionManager::load(tmp.path().join("subscriptions.json"))
    }

    fn item_for(key: &SigningKey, seq: i64) -> MutableItem {
        let signed = SignedManifest::sign(
            key,
            Manifest {
                public_key: [0; 32],
                seq,
                files: vec![],
            },
        );
        MutableItem {
            key: signed.public_key(),
            seq,
            value: signed.as_bytes().to_vec(),
            sig: signed.sig(),
        }
    }

    #[test]
    fn add_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp);
        let key = crate::keys::generate().verifying_key().to_bytes();

        mgr.add("alice".into(), key).unwrap();
        assert_eq!(mgr.add("alice again".into(), key), Err(SubscriptionError::Exists));
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn remove_requires_presence() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp);
        let key = crate::keys::generate().verifying_key().to_bytes();

        assert_eq!(mgr.remove(&key), Err(SubscriptionError::NotFound));
        mgr.add("alice".into(), key).unwrap();
        mgr.remove(&key).unwrap();
        assert!(mgr.is_empty());
    }

    #[test]
    fn replay_rejection_is_order_independent() {
        // Deliver seq 5, then 5 again, then 4, then 6: only 5 and 6 accepted.
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp);
        let key = crate::keys::generate();
        mgr.add("feed".into(), key.verifying_key().to_bytes())
            .unwrap();

        assert!(mgr.on_manifest_found(&item_for(&key, 5)).is_some());
        assert!(mgr.on_manifest_found(&item_for(&key, 5)).is_none());
        assert!(mgr.on_manifest_found(&item_for(&key, 4)).is_none());
        assert!(mgr.on_manifest_found(&item_for(&key, 6)).is_some());

        let sub = &mgr.list()[0];
        assert_eq!(sub.last_seq, 6);
    }

    #[test]
    fn unsubscribed_key_dropped() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp);
        let key = crate::keys::generate();
        assert!(mgr.on_manifest_found(&item_for(&key, 1)).is_none());
        assert_eq!(mgr.verify_failures(), 0);
    }

    #[test]
    fn tampered_manifest_counted_and_dropped() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp);
        let key = crate::keys::generate();
        mgr.add("feed".into(), key.verifying_key().to_bytes())
            .unwrap();

        let mut item = item_for(&key, 3);
        let pos = item.value.len() - 10;
        item.value[pos] ^= 1;
        assert!(mgr.on_manifest_found(&item).is_none());
        assert_eq!(mgr.verify_failures(), 1);

        // The subscription itself is untouched.
        assert_eq!(mgr.list()[0].last_seq, 0);
    }

    #[test]
    fn wrong_key_manifest_dropped() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp);
        let followed = crate::keys::generate();
        let other = crate::keys::generate();
        mgr.add("feed".into(), followed.verifying_key().to_bytes())
            .unwrap();

        // Valid manifest by `other`, delivered under the followed key.
        let mut item = item_for(&other, 2);
        item.key = followed.verifying_key().to_bytes();
        assert!(mgr.on_manifest_found(&item).is_none());
        assert_eq!(mgr.verify_failures(), 1);
    }

    #[test]
    fn registry_persists_across_loads() {
        let tmp = TempDir::new().unwrap();
        let key = crate::keys::generate();
        {
            let mut mgr = manager(&tmp);
            mgr.add("feed".into(), key.verifying_key().to_bytes())
                .unwrap();
            assert!(mgr.on_manifest_found(&item_for(&key, 7)).is_some());
        }

        let mgr = manager(&tmp);
        assert_eq!(mgr.len(), 1);
        let sub = &mgr.list()[0];
        assert_eq!(sub.label, "feed");
        assert_eq!(sub.last_seq, 7);
        // A reload must still reject replays at or below the persisted seq.
        let mut mgr = mgr;
        assert!(mgr.on_manifest_found(&item_for(&key, 7)).is_none());
    }

    #[test]
    fn corrupt_registry_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("subscriptions.json");
        std::fs::write(&path, b"not json at all").unwrap();
        let mgr = SubscriptionManager::load(path);
        assert!(mgr.is_empty());
    }

    #[test]
    fn persisted_file_uses_documented_shape() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp);
        let key = crate::keys::generate();
        mgr.add("feed".into(), key.verifying_key().to_bytes())
            .unwrap();

        let raw = std::fs::read_to_string(tmp.path().join("subscriptions.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let record = &parsed.as_array().unwrap()[0];
        assert_eq!(record["label"], "feed");
        assert_eq!(
            record["pub"],
            HEXLOWER.encode(&key.verifying_key().to_bytes())
        );
        assert!(record["updated"].as_str().unwrap().contains('T'));
        assert!(record["checked"].as_str().unwrap().contains('T'));
    }
}
