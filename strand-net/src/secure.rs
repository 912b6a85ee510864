//! Encrypted peer connections over TCP (or any async byte stream).
//!
//! On connect, each side writes its raw 32-byte ephemeral X25519 public key
//! and reads the peer's; directional AEAD keys are derived from the shared
//! secret. After the exchange, all traffic is `u32 BE length ‖ ciphertext ‖
//! tag` frames carrying wire-protocol messages.

use std::net::SocketAddr;
use std::time::Duration;

use rand::rngs::OsRng;
use strand_protocol::wire::{Message, WireError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::codec::{derive_session_keys, CodecError, FrameCrypto, Role, MAX_FRAME_LEN, TAG_LEN};

/// Deadline covering TCP connect plus the key exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// An authenticated, encrypted message stream.
///
/// Generic over the underlying stream so tests can run over
/// `tokio::io::duplex` pairs instead of real sockets.
pub struct SecureStream<S> {
    stream: S,
    crypto: FrameCrypto,
}

/// Perform the two-message key exchange over an established stream.
pub async fn handshake<S>(mut stream: S, role: Role) -> Result<SecureStream<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    stream.write_all(public.as_bytes()).await?;
    stream.flush().await?;

    let mut remote = [0u8; 32];
    stream.read_exact(&mut remote).await?;

    let shared = secret.diffie_hellman(&PublicKey::from(remote));
    if !shared.was_contributory() {
        return Err(TransportError::Handshake);
    }

    let keys = derive_session_keys(shared.as_bytes(), role);
    Ok(SecureStream {
        stream,
        crypto: FrameCrypto::new(&keys),
    })
}

/// Connect and handshake under [`HANDSHAKE_TIMEOUT`].
pub async fn connect(addr: SocketAddr) -> Result<SecureStream<TcpStream>, TransportError> {
    connect_with_timeout(addr, HANDSHAKE_TIMEOUT).await
}

/// Connect and handshake under an explicit deadline.
pub async fn connect_with_timeout(
    addr: SocketAddr,
    deadline: Duration,
) -> Result<SecureStream<TcpStream>, TransportError> {
    tokio::time::timeout(deadline, async {
        let stream = TcpStream::connect(addr).await?;
        handshake(stream, Role::Initiator).await
    })
    .await
    .map_err(|_| TransportError::Timeout)?
}

impl<S> SecureStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Encrypt and send one message. Delivery order matches send order.
    pub async fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        let frame = self.crypto.seal(&msg.encode())?;
        if frame.len() > MAX_FRAME_LEN as usize {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        self.stream.write_u32(frame.len() as u32).await?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive the next message.
    ///
    /// Unknown opcodes are logged and skipped without closing the connection;
    /// authentication failures are fatal.
    pub async fn recv(&mut self) -> Result<Message, TransportError> {
        loop {
            let len = self.stream.read_u32().await? as usize;
            if len > MAX_FRAME_LEN as usize {
                return Err(TransportError::FrameTooLarge(len));
            }
            if len < TAG_LEN {
                return Err(TransportError::Auth);
            }
            let mut frame = vec![0u8; len];
            self.stream.read_exact(&mut frame).await?;
            let plain = self.crypto.open(&frame)?;
            match Message::decode(&plain) {
                Ok(msg) => return Ok(msg),
                Err(WireError::UnknownOpcode(opcode)) => {
                    tracing::debug!(opcode, "ignoring unknown opcode");
                }
                Err(e) => return Err(TransportError::Wire(e)),
            }
        }
    }

    /// Frames sent since the handshake.
    pub fn frames_sent(&self) -> u64 {
        self.crypto.frames_sealed()
    }

    /// Frames received since the handshake.
    pub fn frames_received(&self) -> u64 {
        self.crypto.frames_opened()
    }

    /// Shut down the underlying stream. Idempotent; errors are ignored
    /// because the peer may already be gone.
    pub async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    pub(crate) fn from_parts(stream: S, crypto: FrameCrypto) -> Self {
        Self { stream, crypto }
    }
}

/// Transport failure. All variants are fatal for the connection they occur
/// on; callers recover by trying another peer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame authentication failed")]
    Auth,
    #[error("nonce counter exhausted")]
    NonceExhausted,
    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(usize),
    #[error("key exchange was not contributory")]
    Handshake,
    #[error("timed out")]
    Timeout,
    #[error("protocol error: {0}")]
    Wire(#[from] WireError),
}

impl From<CodecError> for TransportError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::AuthFailed => TransportError::Auth,
            CodecError::NonceExhausted => TransportError::NonceExhausted,
        }
    }
}
