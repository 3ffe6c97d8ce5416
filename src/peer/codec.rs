//! The codecs for the two framing units of the peer wire protocol: the 68
//! byte handshake, and the length prefixed messages exchanged after it.
//!
//! All integers on the wire are 4 byte big endian values unless noted
//! otherwise.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// The protocol string of the BitTorrent handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The length of the handshake frame: `<pstrlen><pstr><reserved><info_hash>
/// <peer_id>`.
const HANDSHAKE_LEN: usize = 68;

/// Frames declaring a length above this are rejected as corrupt. We only ever
/// request 16 KiB blocks, so the longest legitimate frame is a block message
/// slightly above that.
pub(crate) const MAX_MESSAGE_LEN: u32 = 30 * 1024;

/// The handshake sent by both sides at the start of a connection.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, always "BitTorrent protocol".
    pub prot: [u8; 19],
    /// Reserved extension bits, all zero on output and ignored on input.
    pub reserved: [u8; 8],
    /// The torrent's SHA-1 info hash.
    pub info_hash: Sha1Hash,
    /// The sender's arbitrary 20 byte peer id.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates a new protocol version 1 handshake with the given info hash
    /// and peer id.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;

        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(prot.len() as u8);
        buf.put_slice(&prot);
        buf.put_slice(&reserved);
        buf.put_slice(&info_hash);
        buf.put_slice(&peer_id);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the protocol string length is checked before the rest of the frame
        // arrives so that garbage is rejected early
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(Error::InvalidHandshake);
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let mut frame = buf.split_to(HANDSHAKE_LEN);
        frame.advance(1);

        let mut prot = [0; 19];
        frame.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidHandshake);
        }

        let mut reserved = [0; 8];
        frame.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        frame.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        frame.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The messages exchanged after the handshake, framed as
/// `<length prefix><message id><payload>`. A zero length prefix carries no id
/// or payload and is a keep-alive.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    /// The raw availability bytes; interpreting them needs the torrent's
    /// piece count, which the codec doesn't have.
    Bitfield(Vec<u8>),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    Port {
        port: u16,
    },
}

impl Message {
    /// Returns the id of the message, or `None` for keep-alives, which have
    /// none.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Block { .. } => Some(MessageId::Block),
            Message::Cancel(_) => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
        }
    }
}

/// The message ids defined by the protocol.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bytes) => {
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Port { port } => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        // unknown but well formed messages are skipped, so decoding loops
        // until it produces a message or runs out of whole frames
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }

            // peek at the length prefix without consuming it, the frame may
            // not have fully arrived yet
            let msg_len =
                u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if msg_len > MAX_MESSAGE_LEN {
                return Err(Error::InvalidMessageLength(msg_len));
            }
            if buf.len() < 4 + msg_len as usize {
                buf.reserve(4 + msg_len as usize - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            if msg_len == 0 {
                return Ok(Some(Message::KeepAlive));
            }

            let id = buf.get_u8();
            let payload_len = msg_len as usize - 1;

            let msg = match id {
                id if id == MessageId::Choke as u8 => {
                    Self::expect_payload_len(payload_len, 0)?;
                    Message::Choke
                }
                id if id == MessageId::Unchoke as u8 => {
                    Self::expect_payload_len(payload_len, 0)?;
                    Message::Unchoke
                }
                id if id == MessageId::Interested as u8 => {
                    Self::expect_payload_len(payload_len, 0)?;
                    Message::Interested
                }
                id if id == MessageId::NotInterested as u8 => {
                    Self::expect_payload_len(payload_len, 0)?;
                    Message::NotInterested
                }
                id if id == MessageId::Have as u8 => {
                    Self::expect_payload_len(payload_len, 4)?;
                    Message::Have {
                        piece_index: buf.get_u32() as PieceIndex,
                    }
                }
                id if id == MessageId::Bitfield as u8 => {
                    Message::Bitfield(buf.split_to(payload_len).to_vec())
                }
                id if id == MessageId::Request as u8 => {
                    Self::expect_payload_len(payload_len, 12)?;
                    Message::Request(BlockInfo {
                        piece_index: buf.get_u32() as PieceIndex,
                        offset: buf.get_u32(),
                        len: buf.get_u32(),
                    })
                }
                id if id == MessageId::Block as u8 => {
                    if payload_len < 8 {
                        return Err(Error::InvalidMessage);
                    }
                    Message::Block {
                        piece_index: buf.get_u32() as PieceIndex,
                        offset: buf.get_u32(),
                        data: buf.split_to(payload_len - 8).to_vec(),
                    }
                }
                id if id == MessageId::Cancel as u8 => {
                    Self::expect_payload_len(payload_len, 12)?;
                    Message::Cancel(BlockInfo {
                        piece_index: buf.get_u32() as PieceIndex,
                        offset: buf.get_u32(),
                        len: buf.get_u32(),
                    })
                }
                id if id == MessageId::Port as u8 => {
                    Self::expect_payload_len(payload_len, 2)?;
                    Message::Port {
                        port: buf.get_u16(),
                    }
                }
                id => {
                    // an id outside the defined set with a sane length: skip
                    // it for forward compatibility
                    log::debug!("Skipping unknown message id {}", id);
                    buf.advance(payload_len);
                    continue;
                }
            };

            return Ok(Some(msg));
        }
    }
}

impl PeerCodec {
    fn expect_payload_len(actual: usize, expected: usize) -> Result<()> {
        if actual == expected {
            Ok(())
        } else {
            Err(Error::InvalidMessage)
        }
    }
}
