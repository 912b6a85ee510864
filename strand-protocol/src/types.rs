//! Core identifier types shared across all strand crates.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use data_encoding::HEXLOWER;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Content address of a stored blob: the SHA-256 of its encrypted bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId(pub [u8; 32]);

impl BlobId {
    /// Hash `bytes` into a blob id.
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        Self(id)
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }

    /// Parse a 64-char lowercase hex string.
    pub fn from_hex(s: &str) -> Result<Self, IdParseError> {
        let bytes = HEXLOWER
            .decode(s.as_bytes())
            .map_err(|_| IdParseError::InvalidHex)?;
        let id: [u8; 32] = bytes.try_into().map_err(|_| IdParseError::BadLength)?;
        Ok(Self(id))
    }

    /// The 20-byte infohash used when announcing this blob on the DHT.
    pub fn info_hash(&self) -> InfoHash {
        let mut ih = [0u8; 20];
        ih.copy_from_slice(&self.0[..20]);
        InfoHash(ih)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.to_hex())
    }
}

impl FromStr for BlobId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for BlobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Truncated SHA-256 used as a BitTorrent-style infohash for DHT announces.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

/// A peer's TCP endpoint; string form is `"ip:port"`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr(pub SocketAddr);

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddr({})", self.0)
    }
}

impl FromStr for PeerAddr {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Self)
            .map_err(|_| IdParseError::InvalidEndpoint)
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

/// Error parsing an identifier from its text form.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid lowercase hex")]
    InvalidHex,
    #[error("wrong identifier length")]
    BadLength,
    #[error("invalid ip:port endpoint")]
    InvalidEndpoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_id_hex_roundtrip() {
        let id = BlobId([0xAB; 32]);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(BlobId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn blob_id_rejects_uppercase() {
        let hex = "AB".repeat(32);
        assert_eq!(BlobId::from_hex(&hex), Err(IdParseError::InvalidHex));
    }

    #[test]
    fn blob_id_rejects_short_input() {
        assert!(BlobId::from_hex("abcd").is_err());
    }

    #[test]
    fn blob_id_hashes_content() {
        let id = BlobId::of(b"hello");
        let again = BlobId::of(b"hello");
        assert_eq!(id, again);
        assert_ne!(id, BlobId::of(b"world"));
    }

    #[test]
    fn info_hash_is_truncated_id() {
        let id = BlobId::of(b"some blob");
        let ih = id.info_hash();
        assert_eq!(&ih.0[..], &id.0[..20]);
    }

    #[test]
    fn peer_addr_parses_ip_port() {
        let addr: PeerAddr = "127.0.0.1:6881".parse().unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:6881");
        assert!("not-an-endpoint".parse::<PeerAddr>().is_err());
    }

    #[test]
    fn blob_id_serde_as_hex_string() {
        let id = BlobId::of(b"x");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: BlobId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
