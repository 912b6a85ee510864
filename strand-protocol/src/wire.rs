//! Peer wire protocol: single-byte opcodes with fixed payload layouts.
//!
//! A decrypted frame is `u8 message_type ‖ payload`. Blob ids travel as
//! 64-byte ASCII hex, peer lists as `"ip:port\n"`-delimited text.

use std::str::FromStr;

use crate::types::{BlobId, PeerAddr};

pub const MSG_HELLO: u8 = 0x01;
pub const MSG_REQUEST: u8 = 0x02;
pub const MSG_DATA: u8 = 0x03;
pub const MSG_FIND_PEERS: u8 = 0x04;
pub const MSG_PEERS: u8 = 0x05;
pub const MSG_PUBLISH: u8 = 0x06;
pub const MSG_ANNOUNCE: u8 = 0x07;
pub const MSG_OK: u8 = 0x08;
pub const MSG_ERROR: u8 = 0xFF;

const HEX_ID_LEN: usize = 64;

/// A decoded peer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Opaque gossip blob; by convention a JSON map of pub-key hex to last
    /// known sequence.
    Hello { gossip: Vec<u8> },
    /// Ask the peer to serve a blob.
    Request { blob_id: BlobId },
    /// Encrypted blob bytes, exactly as stored.
    Data { bytes: Vec<u8> },
    /// Ask the peer for other peers that have a blob.
    FindPeers { blob_id: BlobId },
    /// Reply to `FindPeers`.
    Peers { endpoints: Vec<PeerAddr> },
    /// Signed manifest JSON, relayed to a gateway.
    Publish { manifest: Vec<u8> },
    /// The sender serves `blob_id` on `port` at its connecting address.
    Announce { blob_id: BlobId, port: u16 },
    /// Generic acknowledgement with optional context.
    Ok { context: Vec<u8> },
    /// Failure reply with a human-readable reason.
    Error { reason: String },
}

impl Message {
    pub fn opcode(&self) -> u8 {
        match self {
            Message::Hello { .. } => MSG_HELLO,
            Message::Request { .. } => MSG_REQUEST,
            Message::Data { .. } => MSG_DATA,
            Message::FindPeers { .. } => MSG_FIND_PEERS,
            Message::Peers { .. } => MSG_PEERS,
            Message::Publish { .. } => MSG_PUBLISH,
            Message::Announce { .. } => MSG_ANNOUNCE,
            Message::Ok { .. } => MSG_OK,
            Message::Error { .. } => MSG_ERROR,
        }
    }

    /// Encode as frame plaintext: opcode byte followed by the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload_len());
        out.push(self.opcode());
        match self {
            Message::Hello { gossip } => out.extend_from_slice(gossip),
            Message::Request { blob_id } | Message::FindPeers { blob_id } => {
                out.extend_from_slice(blob_id.to_hex().as_bytes());
            }
            Message::Data { bytes } => out.extend_from_slice(bytes),
            Message::Peers { endpoints } => {
                for ep in endpoints {
                    out.extend_from_slice(ep.to_string().as_bytes());
                    out.push(b'\n');
                }
            }
            Message::Publish { manifest } => out.extend_from_slice(manifest),
            Message::Announce { blob_id, port } => {
                out.extend_from_slice(blob_id.to_hex().as_bytes());
                out.extend_from_slice(&port.to_be_bytes());
            }
            Message::Ok { context } => out.extend_from_slice(context),
            Message::Error { reason } => out.extend_from_slice(reason.as_bytes()),
        }
        out
    }

    /// Decode frame plaintext.
    ///
    /// Unknown opcodes yield [`WireError::UnknownOpcode`] so the dispatcher
    /// can log and ignore them without tearing down the connection.
    pub fn decode(plain: &[u8]) -> Result<Self, WireError> {
        let (&opcode, payload) = plain.split_first().ok_or(WireError::Empty)?;
        match opcode {
            MSG_HELLO => Ok(Message::Hello {
                gossip: payload.to_vec(),
            }),
            MSG_REQUEST => Ok(Message::Request {
                blob_id: decode_hex_id(payload)?,
            }),
            MSG_DATA => Ok(Message::Data {
                bytes: payload.to_vec(),
            }),
            MSG_FIND_PEERS => Ok(Message::FindPeers {
                blob_id: decode_hex_id(payload)?,
            }),
            MSG_PEERS => {
                let text = std::str::from_utf8(payload).map_err(|_| WireError::BadEndpoint)?;
                let mut endpoints = Vec::new();
                for line in text.split('\n').filter(|l| !l.is_empty()) {
                    endpoints.push(PeerAddr::from_str(line).map_err(|_| WireError::BadEndpoint)?);
                }
                Ok(Message::Peers { endpoints })
            }
            MSG_PUBLISH => Ok(Message::Publish {
                manifest: payload.to_vec(),
            }),
            MSG_ANNOUNCE => {
                if payload.len() != HEX_ID_LEN + 2 {
                    return Err(WireError::BadAnnounce);
                }
                let blob_id = decode_hex_id(&payload[..HEX_ID_LEN])?;
                let port = u16::from_be_bytes([payload[HEX_ID_LEN], payload[HEX_ID_LEN + 1]]);
                Ok(Message::Announce { blob_id, port })
            }
            MSG_OK => Ok(Message::Ok {
                context: payload.to_vec(),
            }),
            MSG_ERROR => Ok(Message::Error {
                reason: String::from_utf8_lossy(payload).into_owned(),
            }),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::Hello { gossip } => gossip.len(),
            Message::Request { .. } | Message::FindPeers { .. } => HEX_ID_LEN,
            Message::Data { bytes } => bytes.len(),
            Message::Peers { endpoints } => endpoints.len() * 22,
            Message::Publish { manifest } => manifest.len(),
            Message::Announce { .. } => HEX_ID_LEN + 2,
            Message::Ok { context } => context.len(),
            Message::Error { reason } => reason.len(),
        }
    }
}

fn decode_hex_id(payload: &[u8]) -> Result<BlobId, WireError> {
    let text = std::str::from_utf8(payload).map_err(|_| WireError::BadBlobId)?;
    BlobId::from_hex(text).map_err(|_| WireError::BadBlobId)
}

/// Error decoding frame plaintext into a [`Message`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("empty frame")]
    Empty,
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("malformed blob id payload")]
    BadBlobId,
    #[error("malformed peer endpoint")]
    BadEndpoint,
    #[error("malformed announce payload")]
    BadAnnounce,
}
