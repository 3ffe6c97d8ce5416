//! The crate-wide error taxonomy.
//!
//! Transport and protocol errors are scoped to a single peer: the coordinator
//! reacts to them by evicting the offending session. Metainfo, tracker, and
//! channel errors are fatal to the whole torrent. Piece hash mismatches are
//! deliberately _not_ represented here: a failed piece is reset and
//! re-requested, which is normal operation rather than an error.

use std::{fmt, io};

/// An alias for the results returned by the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned by all parts of the engine.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The peer's TCP connection could not be established within the allowed
    /// time.
    ConnectTimeout,
    /// The socket was closed by the remote, or the session's writer half is
    /// gone.
    ConnectionClosed,
    /// The peer produced no traffic, not even keep-alives, for longer than the
    /// allowed idle time.
    IdleTimeout,
    /// The handshake was not 68 bytes starting with the BitTorrent protocol
    /// string.
    InvalidHandshake,
    /// The handshake advertised a different torrent than ours.
    InvalidPeerInfoHash,
    /// A message frame declared a length above the sanity ceiling, which
    /// virtually always means a corrupt or malicious stream.
    InvalidMessageLength(u32),
    /// A message payload didn't have the size mandated by its message id.
    InvalidMessage,
    /// The peer sent a bitfield message after its first-message window.
    BitfieldNotAfterHandshake,
    /// The bitfield was too short for the torrent or had spare bits set.
    InvalidBitfield,
    /// A message referred to a piece index the torrent doesn't have.
    InvalidPieceIndex,
    /// A block's offset or length doesn't fit the piece it claims to be in.
    InvalidBlockInfo,
    /// Two bit sets of unequal lengths were combined.
    BitSetLenMismatch {
        len: usize,
        other_len: usize,
    },
    /// The metainfo is missing required fields or is internally inconsistent
    /// (e.g. the piece hash count doesn't cover the download length).
    InvalidMetainfo,
    /// The tracker rejected the announce with the given failure reason.
    TrackerFailure(String),
    /// The tracker could not be reached or returned a non-success status.
    Http(reqwest::Error),
    /// Bencode (de)serialization failure.
    Bencode(serde_bencode::Error),
    /// One of the engine's internal channels was closed while still in use.
    /// This is fatal as the parts of the engine can no longer communicate.
    ChannelClosed,
    /// An IO error ocurred.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            ConnectTimeout => write!(f, "peer connect timeout"),
            ConnectionClosed => write!(f, "connection closed"),
            IdleTimeout => write!(f, "peer idle timeout"),
            InvalidHandshake => write!(f, "invalid handshake"),
            InvalidPeerInfoHash => {
                write!(f, "peer handshake has invalid info hash")
            }
            InvalidMessageLength(len) => {
                write!(f, "invalid message length {}", len)
            }
            InvalidMessage => write!(f, "invalid message payload"),
            BitfieldNotAfterHandshake => {
                write!(f, "bitfield sent not directly after handshake")
            }
            InvalidBitfield => write!(f, "invalid bitfield"),
            InvalidPieceIndex => write!(f, "invalid piece index"),
            InvalidBlockInfo => write!(f, "invalid block offset or length"),
            BitSetLenMismatch { len, other_len } => write!(
                f,
                "bit sets of unequal lengths combined: {} and {}",
                len, other_len
            ),
            InvalidMetainfo => write!(f, "invalid metainfo"),
            TrackerFailure(reason) => {
                write!(f, "tracker failure: {}", reason)
            }
            Http(e) => e.fmt(f),
            Bencode(e) => e.fmt(f),
            ChannelClosed => write!(f, "engine channel closed"),
            Io(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Http(e) => Some(e),
            Error::Bencode(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}
