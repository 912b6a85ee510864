//! Signed manifests: canonical JSON form, Ed25519 signing and verification.
//!
//! The signature covers an exact byte sequence (the canonical form), so the
//! emitter is hand-rolled rather than driven by a generic serializer: keys in
//! fixed order, compact separators, lowercase hex for byte fields. Verification
//! re-emits the canonical form from the parsed fields and rejects any manifest
//! whose signature does not match that re-emission.

use data_encoding::HEXLOWER;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{BlobId, InfoHash};

/// Largest integer a JSON number can carry exactly (2^53 - 1). Any manifest
/// containing a size above this switches every size to the decimal-string form.
const MAX_SAFE_JSON_INT: u64 = (1 << 53) - 1;

/// One encrypted chunk of a file: content address plus the symmetric material
/// consumers need to decrypt it after retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub id: BlobId,
    /// Size of the stored (encrypted) blob in bytes.
    #[serde(with = "flex_u64")]
    pub size: u64,
    #[serde(with = "hex_array")]
    pub key: [u8; 32],
    #[serde(with = "hex_array")]
    pub iv: [u8; 12],
}

/// A published file: ordered chunks reassemble to the plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    /// Plaintext size in bytes.
    #[serde(with = "flex_u64")]
    pub size: u64,
    #[serde(rename = "type")]
    pub mime: String,
    pub chunks: Vec<BlobRef>,
}

/// Unsigned manifest body: the fields covered by the signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "pub", with = "hex_array")]
    pub public_key: [u8; 32],
    pub seq: i64,
    pub files: Vec<FileEntry>,
}

impl Manifest {
    /// Serialize to the exact byte sequence the signature covers.
    ///
    /// Key order is fixed (`pub, seq, files`; `name, size, type, chunks`;
    /// `id, size, key, iv`), output is compact, byte fields are lowercase hex.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let string_sizes = self.files.iter().any(|f| {
            f.size > MAX_SAFE_JSON_INT || f.chunks.iter().any(|c| c.size > MAX_SAFE_JSON_INT)
        });

        let mut out = String::with_capacity(128 + self.files.len() * 256);
        out.push_str("{\"pub\":\"");
        out.push_str(&HEXLOWER.encode(&self.public_key));
        out.push_str("\",\"seq\":");
        out.push_str(&self.seq.to_string());
        out.push_str(",\"files\":[");
        for (i, file) in self.files.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str("{\"name\":");
            push_json_string(&mut out, &file.name);
            out.push_str(",\"size\":");
            push_size(&mut out, file.size, string_sizes);
            out.push_str(",\"type\":");
            push_json_string(&mut out, &file.mime);
            out.push_str(",\"chunks\":[");
            for (j, chunk) in file.chunks.iter().enumerate() {
                if j > 0 {
                    out.push(',');
                }
                out.push_str("{\"id\":\"");
                out.push_str(&chunk.id.to_hex());
                out.push_str("\",\"size\":");
                push_size(&mut out, chunk.size, string_sizes);
                out.push_str(",\"key\":\"");
                out.push_str(&HEXLOWER.encode(&chunk.key));
                out.push_str("\",\"iv\":\"");
                out.push_str(&HEXLOWER.encode(&chunk.iv));
                out.push_str("\"}");
            }
            out.push_str("]}");
        }
        out.push_str("]}");
        out.into_bytes()
    }
}

fn push_size(out: &mut String, size: u64, as_string: bool) {
    if as_string {
        out.push('"');
        out.push_str(&size.to_string());
        out.push('"');
    } else {
        out.push_str(&size.to_string());
    }
}

fn push_json_string(out: &mut String, s: &str) {
    let quoted = serde_json::to_string(s).expect("string serialization is infallible");
    out.push_str(&quoted);
}

/// A manifest together with its signature and canonical signed encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedManifest {
    manifest: Manifest,
    sig: [u8; 64],
    bytes: Vec<u8>,
}

/// On-wire shape, used only for parsing; field order on input is free.
#[derive(Deserialize)]
struct SignedDoc {
    #[serde(rename = "pub", with = "hex_array")]
    public_key: [u8; 32],
    seq: i64,
    files: Vec<FileEntry>,
    #[serde(with = "hex_array")]
    sig: [u8; 64],
}

impl SignedManifest {
    /// Sign `manifest` with `key`. The manifest's `pub` field is overwritten
    /// with the key's public half before canonicalization.
    pub fn sign(key: &SigningKey, mut manifest: Manifest) -> Self {
        manifest.public_key = key.verifying_key().to_bytes();
        let canonical = manifest.canonical_bytes();
        let sig = key.sign(&canonical).to_bytes();
        let bytes = signed_json(&canonical, &sig);
        Self {
            manifest,
            sig,
            bytes,
        }
    }

    /// Parse and verify a signed manifest.
    ///
    /// The canonical bytes are rebuilt from the parsed fields; a manifest that
    /// was not canonically encoded by its signer fails verification here.
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        let doc: SignedDoc = serde_json::from_slice(bytes)?;
        if doc.seq < 0 {
            return Err(ManifestError::NegativeSequence);
        }
        let manifest = Manifest {
            public_key: doc.public_key,
            seq: doc.seq,
            files: doc.files,
        };
        let canonical = manifest.canonical_bytes();
        let key =
            VerifyingKey::from_bytes(&manifest.public_key).map_err(|_| ManifestError::BadKey)?;
        let sig = Signature::from_bytes(&doc.sig);
        key.verify(&canonical, &sig)
            .map_err(|_| ManifestError::VerifyFailed)?;
        let bytes = signed_json(&canonical, &doc.sig);
        Ok(Self {
            manifest,
            sig: doc.sig,
            bytes,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.manifest.public_key
    }

    pub fn seq(&self) -> i64 {
        self.manifest.seq
    }

    pub fn sig(&self) -> [u8; 64] {
        self.sig
    }

    /// The canonical signed JSON encoding.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Infohash for announcing the manifest itself: first 20 bytes of the
    /// SHA-256 over the signed encoding.
    pub fn info_hash(&self) -> InfoHash {
        let digest = Sha256::digest(&self.bytes);
        let mut ih = [0u8; 20];
        ih.copy_from_slice(&digest[..20]);
        InfoHash(ih)
    }
}

/// Canonical bytes with `"sig"` appended as the final key.
fn signed_json(canonical: &[u8], sig: &[u8; 64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(canonical.len() + 140);
    out.extend_from_slice(&canonical[..canonical.len() - 1]);
    out.extend_from_slice(b",\"sig\":\"");
    out.extend_from_slice(HEXLOWER.encode(sig).as_bytes());
    out.extend_from_slice(b"\"}");
    out
}

/// Error parsing or verifying a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("malformed manifest json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid ed25519 public key")]
    BadKey,
    #[error("manifest signature verification failed")]
    VerifyFailed,
    #[error("negative sequence number")]
    NegativeSequence,
}

mod hex_array {
    use data_encoding::HEXLOWER;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&HEXLOWER.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = HEXLOWER
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("wrong byte length"))
    }
}

mod flex_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*v)
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(n) => Ok(n),
            NumberOrString::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn test_manifest(seq: i64) -> Manifest {
        Manifest {
            public_key: [0u8; 32],
            seq,
            files: vec![FileEntry {
                name: "photo.jpg".into(),
                size: 2_000_000,
                mime: "image/jpeg".into(),
                chunks: vec![
                    BlobRef {
                        id: BlobId::of(b"chunk-0"),
                        size: 1_048_592,
                        key: [0x11; 32],
                        iv: [0x22; 12],
                    },
                    BlobRef {
                        id: BlobId::of(b"chunk-1"),
                        size: 951_424,
                        key: [0x33; 32],
                        iv: [0x44; 12],
                    },
                ],
            }],
        }
    }

    #[test]
    fn canonical_bytes_fixed_key_order() {
        let manifest = Manifest {
            public_key: [0xAA; 32],
            seq: 7,
            files: vec![FileEntry {
                name: "a".into(),
                size: 3,
                mime: "text/plain".into(),
                chunks: vec![BlobRef {
                    id: BlobId([0xBB; 32]),
                    size: 19,
                    key: [0xCC; 32],
                    iv: [0xDD; 12],
                }],
            }],
        };
        let expected = format!(
            "{{\"pub\":\"{}\",\"seq\":7,\"files\":[{{\"name\":\"a\",\"size\":3,\
             \"type\":\"text/plain\",\"chunks\":[{{\"id\":\"{}\",\"size\":19,\
             \"key\":\"{}\",\"iv\":\"{}\"}}]}}]}}",
            "aa".repeat(32),
            "bb".repeat(32),
            "cc".repeat(32),
            "dd".repeat(12),
        );
        assert_eq!(manifest.canonical_bytes(), expected.into_bytes());
    }

    #[test]
    fn canonical_bytes_stable_across_parse() {
        let key = SigningKey::generate(&mut OsRng);
        let signed = SignedManifest::sign(&key, test_manifest(1));
        let parsed = SignedManifest::parse(signed.as_bytes()).unwrap();
        assert_eq!(parsed.as_bytes(), signed.as_bytes());
        assert_eq!(parsed.manifest(), signed.manifest());
    }

    #[test]
    fn sign_then_verify() {
        let key = SigningKey::generate(&mut OsRng);
        let signed = SignedManifest::sign(&key, test_manifest(42));
        assert_eq!(signed.public_key(), key.verifying_key().to_bytes());
        assert!(SignedManifest::parse(signed.as_bytes()).is_ok());
    }

    #[test]
    fn tampered_signature_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let signed = SignedManifest::sign(&key, test_manifest(1));
        let mut bytes = signed.as_bytes().to_vec();
        // Flip a nibble inside the sig hex at the end of the document.
        let pos = bytes.len() - 10;
        bytes[pos] = if bytes[pos] == b'a' { b'b' } else { b'a' };
        assert!(matches!(
            SignedManifest::parse(&bytes),
            Err(ManifestError::VerifyFailed)
        ));
    }

    #[test]
    fn tampered_content_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let signed = SignedManifest::sign(&key, test_manifest(1));
        let text = String::from_utf8(signed.as_bytes().to_vec()).unwrap();
        let tampered = text.replace("\"seq\":1", "\"seq\":2");
        assert!(matches!(
            SignedManifest::parse(tampered.as_bytes()),
            Err(ManifestError::VerifyFailed)
        ));
    }

    #[test]
    fn non_canonical_encoding_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let signed = SignedManifest::sign(&key, test_manifest(1));
        // Same data, different formatting: signature no longer matches the
        // canonical re-emission.
        let value: serde_json::Value = serde_json::from_slice(signed.as_bytes()).unwrap();
        let pretty = serde_json::to_vec_pretty(&value).unwrap();
        assert!(SignedManifest::parse(&pretty).is_err());
    }

    #[test]
    fn oversize_sizes_become_strings() {
        let mut manifest = test_manifest(1);
        manifest.files[0].size = MAX_SAFE_JSON_INT + 1;
        let canonical = String::from_utf8(manifest.canonical_bytes()).unwrap();
        assert!(canonical.contains(&format!("\"size\":\"{}\"", MAX_SAFE_JSON_INT + 1)));
        // The switch applies to every size in the manifest.
        assert!(canonical.contains("\"size\":\"1048592\""));

        let key = SigningKey::generate(&mut OsRng);
        let signed = SignedManifest::sign(&key, manifest.clone());
        let parsed = SignedManifest::parse(signed.as_bytes()).unwrap();
        assert_eq!(parsed.manifest().files[0].size, MAX_SAFE_JSON_INT + 1);
    }

    #[test]
    fn negative_sequence_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let mut manifest = test_manifest(0);
        manifest.seq = -3;
        let signed = SignedManifest::sign(&key, manifest);
        assert!(matches!(
            SignedManifest::parse(signed.as_bytes()),
            Err(ManifestError::NegativeSequence)
        ));
    }

    #[test]
    fn info_hash_is_truncated_sha256_of_signed_bytes() {
        let key = SigningKey::generate(&mut OsRng);
        let signed = SignedManifest::sign(&key, test_manifest(9));
        let digest = Sha256::digest(signed.as_bytes());
        assert_eq!(&signed.info_hash().0[..], &digest[..20]);
    }

    #[test]
    fn wrong_key_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let signed = SignedManifest::sign(&key, test_manifest(1));
        // Substitute the other key's public half; signature can no longer match.
        let text = String::from_utf8(signed.as_bytes().to_vec()).unwrap();
        let swapped = text.replace(
            &HEXLOWER.encode(&key.verifying_key().to_bytes()),
            &HEXLOWER.encode(&other.verifying_key().to_bytes()),
        );
        assert!(SignedManifest::parse(swapped.as_bytes()).is_err());
    }
}
