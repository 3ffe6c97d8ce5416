//! Peer session state and the transport that feeds it.
//!
//! A session is split in two along the ownership rule that only the
//! coordinator task mutates shared torrent state: the [`connection`] module
//! owns the socket and runs as its own task, turning the byte stream into
//! parsed messages, while [`Peer`] here is the coordinator's view of the
//! session: the peer's advertised availability, its choke state, our declared
//! interest, and the block requests in flight to it. The connection reports
//! events upstream and carries no reference to the torrent.

pub(crate) mod codec;
pub(crate) mod connection;

use std::net::SocketAddr;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{
    bitset::BitSet,
    error::{Error, Result},
    BlockInfo, PieceIndex,
};
use codec::Message;

/// The channel on which the coordinator sends commands to a session task.
pub(crate) type CommandSender = UnboundedSender<Command>;
pub(crate) type CommandReceiver = UnboundedReceiver<Command>;

/// The commands a peer session task can receive.
#[derive(Debug)]
pub(crate) enum Command {
    /// Send the message to the peer.
    Send(Message),
    /// Eventually shut down the peer session.
    Shutdown,
}

/// At any given time, a connection with a peer is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// This is the normal state of a peer session, in which any of the
    /// messages, apart from the 'handshake', may be exchanged.
    Connected,
}

/// The default (and initial) state of a peer session is `Disconnected`.
impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// The coordinator side of a peer session.
///
/// By default the remote starts off choking us and we start off not
/// interested, so no requests flow until a bitfield or have announcement
/// makes us interested and the remote unchokes us.
pub(crate) struct Peer {
    /// The remote address of the peer.
    addr: SocketAddr,
    /// The channel on which the session task receives commands.
    cmd_chan: CommandSender,
    /// Which pieces the peer claims to have, updated by its bitfield and have
    /// messages.
    availability: BitSet,
    /// If the peer is choking us it won't serve our requests.
    peer_choking: bool,
    /// Whether we have told the peer we want pieces from it.
    am_interested: bool,
    /// The block requests we sent to the peer for which no block has been
    /// received. If the peer goes away, the blocks in here are returned to
    /// their pieces for other peers to pick up.
    outgoing_requests: Vec<BlockInfo>,
    /// A peer may only send its bitfield as the very first message after the
    /// handshake; this window closes on the first message of any kind.
    in_availability_exchange: bool,
}

impl Peer {
    pub fn new(
        addr: SocketAddr,
        cmd_chan: CommandSender,
        piece_count: usize,
    ) -> Self {
        Self {
            addr,
            cmd_chan,
            availability: BitSet::new(piece_count),
            peer_choking: true,
            am_interested: false,
            outgoing_requests: Vec::new(),
            in_availability_exchange: true,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    pub fn request_queue_len(&self) -> usize {
        self.outgoing_requests.len()
    }

    /// Closes the bitfield window; called for every message that is not a
    /// bitfield.
    pub fn close_availability_exchange(&mut self) {
        self.in_availability_exchange = false;
    }

    /// The peer choked us: requests we have in flight won't be served, so
    /// they are drained and handed back to the coordinator for unassignment.
    pub fn handle_choke(&mut self) -> Vec<BlockInfo> {
        log::info!("Peer {} choked us", self.addr);
        self.peer_choking = true;
        std::mem::take(&mut self.outgoing_requests)
    }

    pub fn handle_unchoke(&mut self) {
        log::info!("Peer {} unchoked us", self.addr);
        self.peer_choking = false;
    }

    /// Registers a piece the peer announced. An index past the torrent's
    /// piece count is a protocol violation.
    pub fn handle_have(&mut self, piece_index: PieceIndex) -> Result<()> {
        if piece_index >= self.availability.len() {
            log::warn!(
                "Peer {} sent have with invalid piece index {}",
                self.addr,
                piece_index
            );
            return Err(Error::InvalidPieceIndex);
        }
        log::debug!("Peer {} has piece {}", self.addr, piece_index);
        self.availability.set(piece_index);
        Ok(())
    }

    /// Initializes the peer's availability from its bitfield message.
    ///
    /// The raw bitfield that is sent over the wire may be longer than the
    /// logical pieces it represents, if the number of pieces in torrent is
    /// not a multiple of 8; the spare bits must be zero. The message is only
    /// valid directly after the handshake.
    pub fn handle_bitfield(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.in_availability_exchange {
            log::warn!(
                "Peer {} sent bitfield message not after handshake",
                self.addr
            );
            return Err(Error::BitfieldNotAfterHandshake);
        }
        self.in_availability_exchange = false;

        let piece_count = self.availability.len();
        if bytes.len() * 8 < piece_count {
            log::warn!(
                "Peer {} sent bitfield for {} bits, torrent has {} pieces",
                self.addr,
                bytes.len() * 8,
                piece_count
            );
            return Err(Error::InvalidBitfield);
        }
        for i in piece_count..bytes.len() * 8 {
            if bytes[i / 8] & (0x80 >> (i % 8)) != 0 {
                log::warn!("Peer {} sent bitfield with spare bits", self.addr);
                return Err(Error::InvalidBitfield);
            }
        }

        self.availability = BitSet::from_bytes(bytes, piece_count);
        log::debug!(
            "Peer {} new availability: {}",
            self.addr,
            self.availability
        );
        Ok(())
    }

    /// Recomputes whether we want anything from this peer and announces a
    /// change of heart to it.
    ///
    /// The wanted set is the peer's availability minus the pieces that are
    /// completed or have requests outstanding. Interest follows from the
    /// wanted set being non-empty; the corresponding message is only sent on
    /// an actual change. The wanted piece indices are returned as the
    /// candidates for dispatch.
    pub fn update_interest(
        &mut self,
        active: &BitSet,
        completed: &BitSet,
    ) -> Result<Vec<PieceIndex>> {
        // wanted = availability ^ (availability & (active | completed))
        let covered = self.availability.and(&active.or(completed)?)?;
        let wanted = self.availability.xor(&covered)?.set_indices();

        let interested = !wanted.is_empty();
        if interested != self.am_interested {
            if interested {
                log::info!("Interested in peer {}", self.addr);
                self.send(Message::Interested)?;
            } else {
                log::info!("No longer interested in peer {}", self.addr);
                self.send(Message::NotInterested)?;
            }
            self.am_interested = interested;
        }

        Ok(wanted)
    }

    /// Whether requests may be issued to this peer at all: the peer must not
    /// be choking us and we must have declared interest.
    pub fn can_request(&self) -> bool {
        !self.peer_choking && self.am_interested
    }

    /// Sends a block request to the peer and registers it as outstanding.
    pub fn send_request(&mut self, block: BlockInfo) -> Result<()> {
        log::debug!("Requesting block {:?} from peer {}", block, self.addr);
        self.outgoing_requests.push(block);
        self.send(Message::Request(block))
    }

    /// Takes the matching outstanding request off the queue when its block
    /// arrives. Returns the request, or `None` if the block was never asked
    /// for.
    pub fn complete_request(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Option<BlockInfo> {
        let pos = self.outgoing_requests.iter().position(|b| {
            b.piece_index == piece_index && b.offset == offset && b.len == len
        })?;
        Some(self.outgoing_requests.remove(pos))
    }

    /// Drains all outstanding requests, used when the peer is evicted.
    pub fn drain_requests(&mut self) -> Vec<BlockInfo> {
        std::mem::take(&mut self.outgoing_requests)
    }

    pub fn send_have(&self, piece_index: PieceIndex) -> Result<()> {
        self.send(Message::Have { piece_index })
    }

    /// Asks the session task to shut down. Failure means the task is already
    /// gone, which is fine for a peer on its way out.
    pub fn shutdown(&self) {
        let _ = self.cmd_chan.send(Command::Shutdown);
    }

    fn send(&self, msg: Message) -> Result<()> {
        // if the session task is gone the peer is as good as disconnected
        self.cmd_chan
            .send(Command::Send(msg))
            .map_err(|_| Error::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::bitset::tests::bitset;

    fn test_peer(piece_count: usize) -> (Peer, CommandReceiver) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let peer = Peer::new(
            "127.0.0.1:51413".parse().unwrap(),
            cmd_chan,
            piece_count,
        );
        (peer, cmd_port)
    }

    fn sent_messages(cmd_port: &mut CommandReceiver) -> Vec<Message> {
        let mut msgs = Vec::new();
        while let Ok(cmd) = cmd_port.try_recv() {
            if let Command::Send(msg) = cmd {
                msgs.push(msg);
            }
        }
        msgs
    }

    #[test]
    fn test_wanted_set_and_interest() {
        let (mut peer, mut cmd_port) = test_peer(4);
        peer.handle_bitfield(&[0b1010_0000]).unwrap();

        let active = bitset("0000");
        let completed = bitset("0010");
        let wanted = peer.update_interest(&active, &completed).unwrap();

        // of pieces 0 and 2, piece 2 is already completed
        assert_eq!(wanted, vec![0]);
        assert!(peer.am_interested);
        assert_eq!(sent_messages(&mut cmd_port), vec![Message::Interested]);
    }

    #[test]
    fn test_interest_is_edge_triggered() {
        let (mut peer, mut cmd_port) = test_peer(4);
        peer.handle_bitfield(&[0b1000_0000]).unwrap();

        let mut completed = bitset("0000");
        let active = bitset("0000");
        peer.update_interest(&active, &completed).unwrap();
        peer.update_interest(&active, &completed).unwrap();
        // interest announced once, not per recomputation
        assert_eq!(sent_messages(&mut cmd_port), vec![Message::Interested]);

        // once the only piece it has is done, interest is withdrawn
        completed.set(0);
        let wanted = peer.update_interest(&active, &completed).unwrap();
        assert!(wanted.is_empty());
        assert!(!peer.am_interested);
        assert_eq!(
            sent_messages(&mut cmd_port),
            vec![Message::NotInterested]
        );
    }

    #[test]
    fn test_have_updates_availability() {
        let (mut peer, _cmd_port) = test_peer(4);
        peer.handle_have(2).unwrap();
        assert!(peer.availability.get(2));

        assert!(matches!(
            peer.handle_have(4),
            Err(Error::InvalidPieceIndex)
        ));
    }

    #[test]
    fn test_bitfield_validation() {
        // too short for the torrent
        let (mut peer, _port) = test_peer(9);
        assert!(matches!(
            peer.handle_bitfield(&[0xff]),
            Err(Error::InvalidBitfield)
        ));

        // spare bits beyond the piece count must be zero
        let (mut peer, _port) = test_peer(4);
        assert!(matches!(
            peer.handle_bitfield(&[0b1010_1000]),
            Err(Error::InvalidBitfield)
        ));

        // valid: spare bits zero
        let (mut peer, _port) = test_peer(4);
        peer.handle_bitfield(&[0b1010_0000]).unwrap();
        assert_eq!(peer.availability.set_indices(), vec![0, 2]);
    }

    #[test]
    fn test_bitfield_only_valid_as_first_message() {
        let (mut peer, _port) = test_peer(4);
        // any earlier message closes the window
        peer.close_availability_exchange();
        assert!(matches!(
            peer.handle_bitfield(&[0b1010_0000]),
            Err(Error::BitfieldNotAfterHandshake)
        ));
    }

    #[test]
    fn test_choke_drains_outstanding_requests() {
        let (mut peer, _port) = test_peer(4);
        peer.handle_unchoke();
        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: crate::BLOCK_LEN,
        };
        peer.send_request(block).unwrap();
        assert_eq!(peer.request_queue_len(), 1);

        let drained = peer.handle_choke();
        assert_eq!(drained, vec![block]);
        assert_eq!(peer.request_queue_len(), 0);
        assert!(peer.peer_choking());
    }

    #[test]
    fn test_complete_request() {
        let (mut peer, _port) = test_peer(4);
        let block = BlockInfo {
            piece_index: 1,
            offset: crate::BLOCK_LEN,
            len: crate::BLOCK_LEN,
        };
        peer.send_request(block).unwrap();

        // a block we never asked for doesn't match
        assert!(peer.complete_request(1, 0, crate::BLOCK_LEN).is_none());
        assert_eq!(
            peer.complete_request(1, crate::BLOCK_LEN, crate::BLOCK_LEN),
            Some(block)
        );
        assert_eq!(peer.request_queue_len(), 0);
    }
}
