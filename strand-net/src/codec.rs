//! Frame encryption: ChaCha20-Poly1305 (IETF) with per-direction counter
//! nonces and BLAKE2b session-key derivation.
//!
//! Each direction keeps an independent 96-bit little-endian counter, advanced
//! by exactly one *before* every seal or open, so the first frame in each
//! direction uses nonce 1. Both sides advance their receive counter even when
//! authentication fails; a tampered frame therefore poisons the connection
//! permanently.

use blake2::{Blake2b512, Digest};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Largest accepted frame (ciphertext plus tag). DATA frames carry whole
/// blobs, so the cap sits well above the ingest chunk size.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Which side of the handshake this endpoint played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the TCP connection.
    Initiator,
    /// Accepted the TCP connection.
    Acceptor,
}

impl Role {
    fn tx_tag(self) -> u8 {
        match self {
            Role::Initiator => b'C',
            Role::Acceptor => b'S',
        }
    }

    fn rx_tag(self) -> u8 {
        match self {
            Role::Initiator => b'S',
            Role::Acceptor => b'C',
        }
    }
}

/// Directional session keys derived from an X25519 shared secret.
pub struct SessionKeys {
    pub tx: [u8; KEY_LEN],
    pub rx: [u8; KEY_LEN],
}

/// Derive directional keys: `BLAKE2b-512(secret ‖ role_tag)[0..32]`, where the
/// initiator tags tx with `'C'` and rx with `'S'` and the acceptor swaps.
pub fn derive_session_keys(shared_secret: &[u8; 32], role: Role) -> SessionKeys {
    SessionKeys {
        tx: kdf(shared_secret, role.tx_tag()),
        rx: kdf(shared_secret, role.rx_tag()),
    }
}

fn kdf(shared_secret: &[u8; 32], tag: u8) -> [u8; KEY_LEN] {
    let mut hasher = Blake2b512::new();
    hasher.update(shared_secret);
    hasher.update([tag]);
    let digest = hasher.finalize();
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    key
}

/// 96-bit little-endian counter nonce.
struct NonceCounter([u8; NONCE_LEN]);

impl NonceCounter {
    fn new() -> Self {
        Self([0u8; NONCE_LEN])
    }

    /// Advance by one and return the nonce for the next frame. A wrap back to
    /// all-zero means the counter space is spent and the connection must close.
    fn advance(&mut self) -> Result<[u8; NONCE_LEN], CodecError> {
        for byte in self.0.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                return Ok(self.0);
            }
        }
        Err(CodecError::NonceExhausted)
    }
}

/// Per-connection frame crypto: seals outbound plaintext, opens inbound frames.
pub struct FrameCrypto {
    tx_cipher: ChaCha20Poly1305,
    rx_cipher: ChaCha20Poly1305,
    nonce_tx: NonceCounter,
    nonce_rx: NonceCounter,
    frames_sealed: u64,
    frames_opened: u64,
}

impl FrameCrypto {
    pub fn new(keys: &SessionKeys) -> Self {
        Self {
            tx_cipher: ChaCha20Poly1305::new(Key::from_slice(&keys.tx)),
            rx_cipher: ChaCha20Poly1305::new(Key::from_slice(&keys.rx)),
            nonce_tx: NonceCounter::new(),
            nonce_rx: NonceCounter::new(),
            frames_sealed: 0,
            frames_opened: 0,
        }
    }

    /// Encrypt plaintext into `ciphertext ‖ tag` under the next tx nonce.
    pub fn seal(&mut self, plain: &[u8]) -> Result<Vec<u8>, CodecError> {
        let nonce = self.nonce_tx.advance()?;
        let frame = self
            .tx_cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| CodecError::AuthFailed)?;
        self.frames_sealed += 1;
        Ok(frame)
    }

    /// Decrypt `ciphertext ‖ tag` under the next rx nonce.
    pub fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>, CodecError> {
        if frame.len() < TAG_LEN {
            return Err(CodecError::AuthFailed);
        }
        let nonce = self.nonce_rx.advance()?;
        let plain = self
            .rx_cipher
            .decrypt(Nonce::from_slice(&nonce), frame)
            .map_err(|_| CodecError::AuthFailed)?;
        self.frames_opened += 1;
        Ok(plain)
    }

    /// Frames successfully sealed on this connection.
    pub fn frames_sealed(&self) -> u64 {
        self.frames_sealed
    }

    /// Frames successfully opened on this connection.
    pub fn frames_opened(&self) -> u64 {
        self.frames_opened
    }

    #[cfg(test)]
    fn with_counters(keys: &SessionKeys, tx: [u8; NONCE_LEN], rx: [u8; NONCE_LEN]) -> Self {
        let mut crypto = Self::new(keys);
        crypto.nonce_tx = NonceCounter(tx);
        crypto.nonce_rx = NonceCounter(rx);
        crypto
    }
}

/// Frame encryption failure. Both variants are fatal for the connection.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame authentication failed")]
    AuthFailed,
    #[error("nonce counter exhausted")]
    NonceExhausted,
}
