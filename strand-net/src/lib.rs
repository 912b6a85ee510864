//! Encrypted peer transport: ephemeral X25519 handshake, ChaCha20-Poly1305
//! framing with counter nonces, and typed message streams.

pub mod codec;
pub mod secure;

pub use codec::{CodecError, FrameCrypto, Role, SessionKeys};
pub use secure::{connect, connect_with_timeout, handshake, SecureStream, TransportError};
