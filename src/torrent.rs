//! The swarm coordinator.
//!
//! A [`Torrent`] owns the piece array, the `active` and `completed` sets, and
//! every peer session, and it is the only task that mutates any of them. All
//! input arrives on a single bounded event stream: peers to add, parsed
//! messages, session errors, and the shutdown request. Events are processed
//! strictly in arrival order, so there are no locks anywhere; when the queue
//! fills up, the session tasks block on sending, which throttles their socket
//! reads end to end.
//!
//! Verified pieces leave the coordinator on the completed piece channel in
//! completion order, which is where the file writing collaborator picks them
//! up.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use rand::Rng;
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedSender};

use crate::{
    bitset::BitSet,
    conf::TorrentConf,
    error::{Error, Result},
    metainfo::Metainfo,
    peer::{codec::Message, connection::PeerConnection, Peer},
    piece::Piece,
    storage_info::StorageInfo,
    PeerId, PieceIndex, Sha1Hash, PEER_MAX_REQUESTS,
};

/// The channel on which the coordinator receives events from peer sessions
/// and the outside world.
pub(crate) type EventSender = Sender<Event>;
type EventReceiver = Receiver<Event>;

/// The events the coordinator consumes, all on the same serialized stream.
#[derive(Debug)]
pub(crate) enum Event {
    /// Connect to a new peer, if we don't know it already.
    AddPeer { addr: SocketAddr },
    /// A session received and parsed a protocol message.
    Message { addr: SocketAddr, message: Message },
    /// A session died; the peer is evicted.
    Error { addr: SocketAddr, error: Error },
    /// Stop the torrent: close all sessions and return.
    Shutdown,
}

/// Shared information of the torrent, immutable over the torrent's lifetime.
/// Each session gets a reference for the handshake; nothing in here lets a
/// session reach back into torrent state.
pub(crate) struct TorrentContext {
    /// The torrent's SHA-1 info hash, the torrent's identity on the wire.
    pub info_hash: Sha1Hash,
    /// Our own id, sent in handshakes.
    pub client_id: PeerId,
    /// The torrent's piece geometry.
    pub storage: StorageInfo,
}

/// A hash-verified piece, handed to the file writing collaborator.
#[derive(Debug)]
pub struct CompletedPiece {
    pub index: PieceIndex,
    pub data: Vec<u8>,
}

/// The channel on which verified pieces leave the engine.
pub type PieceSender = UnboundedSender<CompletedPiece>;

/// A cheap handle for feeding a running torrent from other tasks.
#[derive(Clone)]
pub struct TorrentHandle {
    chan: EventSender,
}

impl TorrentHandle {
    /// Offers a peer address to the torrent.
    pub async fn add_peer(&mut self, addr: SocketAddr) -> Result<()> {
        self.chan
            .send(Event::AddPeer { addr })
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Asks the torrent to stop.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.chan
            .send(Event::Shutdown)
            .await
            .map_err(|_| Error::ChannelClosed)
    }
}

pub struct Torrent {
    /// Shared information of the torrent.
    ctx: Arc<TorrentContext>,
    conf: TorrentConf,
    /// The write buffers and block accounting of every piece, present for the
    /// whole session whether the piece is started or not.
    pieces: Vec<Piece>,
    /// One bit per piece: set while the piece has block requests outstanding.
    active: BitSet,
    /// One bit per piece: set once the piece has passed hash verification.
    completed: BitSet,
    /// All connected peer sessions, keyed by remote address.
    peers: HashMap<SocketAddr, Peer>,
    /// Our own sending half of the event stream, cloned into each session.
    event_chan: EventSender,
    /// The receiving half of the event stream.
    event_port: EventReceiver,
    /// Where verified pieces are delivered.
    piece_chan: PieceSender,
}

impl Torrent {
    /// Creates the torrent state for the given metainfo.
    ///
    /// Fails if the metainfo is inconsistent, such as a hash count that
    /// doesn't cover the download length.
    pub fn new(
        conf: TorrentConf,
        client_id: PeerId,
        metainfo: &Metainfo,
        piece_chan: PieceSender,
    ) -> Result<Self> {
        let storage = StorageInfo::new(metainfo)?;
        let info_hash = metainfo.create_info_hash()?;
        log::info!(
            "Torrent {} has {} pieces of {} bytes",
            hex::encode(&info_hash),
            storage.piece_count,
            storage.piece_len
        );

        let mut pieces = Vec::with_capacity(storage.piece_count);
        for index in 0..storage.piece_count {
            let len = storage.piece_len(index)?;
            pieces.push(Piece::new(index, len, metainfo.piece_hash(index)));
        }

        let (event_chan, event_port) = mpsc::channel(conf.event_queue_len);
        let piece_count = storage.piece_count;

        Ok(Self {
            ctx: Arc::new(TorrentContext {
                info_hash,
                client_id,
                storage,
            }),
            conf,
            pieces,
            active: BitSet::new(piece_count),
            completed: BitSet::new(piece_count),
            peers: HashMap::new(),
            event_chan,
            event_port,
            piece_chan,
        })
    }

    /// Returns a handle for feeding the torrent peer addresses and shutting
    /// it down.
    pub fn handle(&self) -> TorrentHandle {
        TorrentHandle {
            chan: self.event_chan.clone(),
        }
    }

    /// Runs the coordinator event loop until the download completes or
    /// a shutdown is requested.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting torrent");

        while let Some(event) = self.event_port.recv().await {
            match event {
                Event::AddPeer { addr } => self.add_peer(addr),
                Event::Message { addr, message } => {
                    if let Err(e) = self.handle_message(addr, message) {
                        if matches!(e, Error::ChannelClosed) {
                            // the output side is gone, nowhere to deliver to
                            return Err(e);
                        }
                        log::warn!("Peer {} violation: {}", addr, e);
                        self.remove_peer(&addr);
                        self.dispatch_all();
                    }
                }
                Event::Error { addr, error } => {
                    log::warn!("Peer {} error: {}", addr, error);
                    self.remove_peer(&addr);
                    self.dispatch_all();
                }
                Event::Shutdown => {
                    log::info!("Shutting down torrent");
                    self.shutdown_peers();
                    return Ok(());
                }
            }

            if self.completed.is_full() {
                log::info!("Download complete");
                self.shutdown_peers();
                return Ok(());
            }
        }

        Ok(())
    }

    /// Starts a session with the peer if it isn't known already and the peer
    /// cap allows another connection.
    fn add_peer(&mut self, addr: SocketAddr) {
        if self.peers.contains_key(&addr) || self.completed.is_full() {
            return;
        }
        if self.peers.len() >= self.conf.max_connected_peer_count {
            log::debug!("Ignoring peer {}, at connection cap", addr);
            return;
        }

        log::info!("Adding peer {}", addr);
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        self.peers.insert(
            addr,
            Peer::new(addr, cmd_chan, self.ctx.storage.piece_count),
        );

        let session = PeerConnection::outbound(
            Arc::clone(&self.ctx),
            addr,
            cmd_port,
            self.event_chan.clone(),
        );
        tokio::spawn(session.start());
    }

    /// Applies a session's parsed message to the torrent state.
    ///
    /// An error return means this peer broke the protocol and is evicted by
    /// the caller; errors of other peers are handled internally.
    fn handle_message(
        &mut self,
        addr: SocketAddr,
        message: Message,
    ) -> Result<()> {
        if !self.peers.contains_key(&addr) {
            // events of an evicted session may still be queued behind its
            // eviction
            log::debug!("Message from unknown peer {}", addr);
            return Ok(());
        }

        match message {
            Message::Bitfield(bytes) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.handle_bitfield(&bytes)?;
                }
                self.dispatch(addr)?;
            }
            message => {
                // any message other than a bitfield closes the window in
                // which a bitfield is acceptable
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.close_availability_exchange();
                }

                match message {
                    Message::KeepAlive => {
                        log::debug!("Peer {} sent keep alive", addr);
                    }
                    Message::Choke => {
                        if let Some(peer) = self.peers.get_mut(&addr) {
                            // requests in flight to a choking peer won't be
                            // served
                            let abandoned = peer.handle_choke();
                            self.unassign_blocks(&abandoned);
                        }
                    }
                    Message::Unchoke => {
                        if let Some(peer) = self.peers.get_mut(&addr) {
                            peer.handle_unchoke();
                        }
                        self.dispatch(addr)?;
                    }
                    Message::Have { piece_index } => {
                        if let Some(peer) = self.peers.get_mut(&addr) {
                            peer.handle_have(piece_index)?;
                        }
                        self.dispatch(addr)?;
                    }
                    Message::Block {
                        piece_index,
                        offset,
                        data,
                    } => {
                        self.handle_block(addr, piece_index, offset, &data)?;
                    }
                    // this core serves nothing, so the remote's interest and
                    // requests are acknowledged by ignoring them
                    Message::Interested | Message::NotInterested => {
                        log::debug!(
                            "Peer {} updated its interest in us",
                            addr
                        );
                    }
                    Message::Request(_) | Message::Cancel(_) => {
                        log::debug!("Ignoring request from peer {}", addr);
                    }
                    Message::Port { port } => {
                        log::debug!(
                            "Peer {} announced DHT port {}",
                            addr,
                            port
                        );
                    }
                    Message::Bitfield(_) => unreachable!("matched above"),
                }
            }
        }

        Ok(())
    }

    /// Applies a received block to its piece and completes the piece if this
    /// was its last missing block.
    fn handle_block(
        &mut self,
        addr: SocketAddr,
        piece_index: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> Result<()> {
        // the block must correspond to a request we made to this very peer
        let request = self.peers.get_mut(&addr).and_then(|p| {
            p.complete_request(piece_index, offset, data.len() as u32)
        });
        if request.is_none() {
            // silently ignore blocks we didn't ask for
            log::warn!(
                "Peer {} sent block we didn't request: piece {} offset {}",
                addr,
                piece_index,
                offset
            );
            return Ok(());
        }
        debug_assert!(piece_index < self.pieces.len());

        log::debug!(
            "Received block from peer {}: piece {} offset {} len {}",
            addr,
            piece_index,
            offset,
            data.len()
        );

        let piece = &mut self.pieces[piece_index];
        let accepted = piece.set_block(offset, data)?;
        if accepted && piece.is_complete() {
            self.complete_piece(piece_index)?;
        } else if self.pieces[piece_index].pending_request_count() == 0 {
            // the piece is only partially received but nothing is in flight
            // for it anymore (the request budget moved on before covering all
            // of its blocks), so it must re-enter the wanted sets for its
            // remaining blocks to be requested
            self.active.clear(piece_index);
        }

        // a block arrived, so this peer's request queue has room again
        self.dispatch(addr)
    }

    /// Hash-checks a fully assembled piece. A valid piece is delivered to the
    /// output channel and announced to the whole swarm; an invalid one is
    /// reset so its blocks are re-requested.
    fn complete_piece(&mut self, index: PieceIndex) -> Result<()> {
        if self.pieces[index].is_valid() {
            log::info!("Piece {} complete and valid", index);
            self.completed.set(index);
            self.active.clear(index);

            let data = self.pieces[index].take_data();
            self.piece_chan
                .send(CompletedPiece { index, data })
                .map_err(|_| Error::ChannelClosed)?;

            // the whole swarm learns we have the piece now
            let mut dead = Vec::new();
            for peer in self.peers.values() {
                if peer.send_have(index).is_err() {
                    dead.push(peer.addr());
                }
            }
            for addr in dead {
                self.remove_peer(&addr);
            }
        } else {
            log::warn!("Piece {} failed hash check, resetting", index);
            self.pieces[index].reset();
            self.active.clear(index);
        }

        // completion (or reset) changed the wanted set of every peer
        self.dispatch_all();
        Ok(())
    }

    /// Tries to fill the peer's request queue from the pieces it has and we
    /// still want.
    ///
    /// Candidate pieces are drawn uniformly at random from the peer's wanted
    /// set to spread the load across the swarm; within a piece, blocks are
    /// requested in order.
    fn dispatch(&mut self, addr: SocketAddr) -> Result<()> {
        let peer = match self.peers.get_mut(&addr) {
            Some(peer) => peer,
            None => return Ok(()),
        };

        let mut wanted =
            peer.update_interest(&self.active, &self.completed)?;
        if !peer.can_request() {
            return Ok(());
        }

        let mut rng = rand::thread_rng();
        while peer.request_queue_len() < PEER_MAX_REQUESTS
            && !wanted.is_empty()
        {
            let pos = rng.gen_range(0..wanted.len());
            let index = wanted[pos];
            match self.pieces[index].next_block() {
                Some(block) => {
                    self.active.set(index);
                    peer.send_request(block)?;
                }
                None => {
                    // every block of the piece is requested or done; it is no
                    // longer a candidate for this volley
                    wanted.swap_remove(pos);
                }
            }
        }

        Ok(())
    }

    /// Re-runs the dispatch for every connected peer, evicting the ones whose
    /// session is gone.
    fn dispatch_all(&mut self) {
        let addrs: Vec<_> = self.peers.keys().copied().collect();
        for addr in addrs {
            if let Err(e) = self.dispatch(addr) {
                log::warn!("Peer {} dispatch failed: {}", addr, e);
                self.remove_peer(&addr);
            }
        }
    }

    /// Evicts a peer: its session is told to shut down and the blocks it had
    /// in flight are returned to their pieces so other peers can pick them
    /// up.
    fn remove_peer(&mut self, addr: &SocketAddr) {
        if let Some(mut peer) = self.peers.remove(addr) {
            log::info!("Removing peer {}", addr);
            peer.shutdown();
            let abandoned = peer.drain_requests();
            self.unassign_blocks(&abandoned);
        }
    }

    /// Clears the `requested` bits of blocks whose requests were abandoned,
    /// and with them the owning piece's `active` bit when nothing remains in
    /// flight for it.
    fn unassign_blocks(&mut self, blocks: &[crate::BlockInfo]) {
        for block in blocks {
            let index = block.piece_index;
            self.pieces[index].clear_requested(block.offset);
            if !self.completed.get(index)
                && self.pieces[index].pending_request_count() == 0
            {
                self.active.clear(index);
            }
        }
    }

    fn shutdown_peers(&mut self) {
        for peer in self.peers.values() {
            peer.shutdown();
        }
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use sha1::{Digest, Sha1};
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::{
        peer::{Command, CommandReceiver},
        BlockInfo, BLOCK_LEN,
    };

    fn test_torrent(
        pieces_data: &[Vec<u8>],
        piece_len: u32,
    ) -> (Torrent, UnboundedReceiver<CompletedPiece>) {
        let piece_count = pieces_data.len();
        let storage = StorageInfo {
            piece_count,
            piece_len,
            last_piece_len: pieces_data
                .last()
                .map(|d| d.len() as u32)
                .unwrap_or(piece_len),
            total_len: pieces_data.iter().map(|d| d.len() as u64).sum(),
        };

        let pieces = pieces_data
            .iter()
            .enumerate()
            .map(|(index, data)| {
                let mut hash = [0; 20];
                hash.copy_from_slice(&Sha1::digest(data));
                Piece::new(index, data.len() as u32, hash)
            })
            .collect();

        let (event_chan, event_port) = mpsc::channel(64);
        let (piece_chan, piece_port) = mpsc::unbounded_channel();

        let torrent = Torrent {
            ctx: Arc::new(TorrentContext {
                info_hash: [0xab; 20],
                client_id: *b"-GT0001abcdefghijklm",
                storage,
            }),
            conf: TorrentConf::default(),
            pieces,
            active: BitSet::new(piece_count),
            completed: BitSet::new(piece_count),
            peers: HashMap::new(),
            event_chan,
            event_port,
            piece_chan,
        };
        (torrent, piece_port)
    }

    fn add_mock_peer(
        torrent: &mut Torrent,
        addr: SocketAddr,
    ) -> CommandReceiver {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let piece_count = torrent.ctx.storage.piece_count;
        torrent
            .peers
            .insert(addr, Peer::new(addr, cmd_chan, piece_count));
        cmd_port
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

    fn sent_requests(cmd_port: &mut CommandReceiver) -> Vec<BlockInfo> {
        sent_messages(cmd_port)
            .into_iter()
            .filter_map(|msg| match msg {
                Message::Request(block) => Some(block),
                _ => None,
            })
            .collect()
    }

    fn piece_bytes(len: u32) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn block_of(data: &[u8], block: &BlockInfo) -> Message {
        Message::Block {
            piece_index: block.piece_index,
            offset: block.offset,
            data: data[block.offset as usize
                ..(block.offset + block.len) as usize]
                .to_vec(),
        }
    }

    #[test]
    fn test_download_one_piece_from_two_peers() {
        let piece_len = 2 * BLOCK_LEN;
        let data = piece_bytes(piece_len);
        let (mut torrent, mut piece_port) =
            test_torrent(&[data.clone()], piece_len);

        let a: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:50002".parse().unwrap();
        let mut a_port = add_mock_peer(&mut torrent, a);
        let mut b_port = add_mock_peer(&mut torrent, b);

        // both peers hold the piece; we get interested
        torrent
            .handle_message(a, Message::Bitfield(vec![0x80]))
            .unwrap();
        torrent
            .handle_message(b, Message::Bitfield(vec![0x80]))
            .unwrap();
        torrent.handle_message(a, Message::Unchoke).unwrap();
        torrent.handle_message(b, Message::Unchoke).unwrap();

        // the first unchoked peer got both block requests; the piece then
        // counts as active so the second peer has nothing left to offer
        let a_requests = sent_requests(&mut a_port);
        assert_eq!(a_requests.len(), 2);
        assert_eq!(a_requests[0].offset, 0);
        assert_eq!(a_requests[1].offset, BLOCK_LEN);
        assert!(torrent.active.get(0));
        assert!(sent_requests(&mut b_port).is_empty());

        for request in &a_requests {
            torrent
                .handle_message(a, block_of(&data, request))
                .unwrap();
        }

        // the piece verified and completed
        assert!(torrent.completed.get(0));
        assert!(!torrent.active.get(0));
        let completed = piece_port.try_recv().unwrap();
        assert_eq!(completed.index, 0);
        assert_eq!(completed.data, data);

        // every peer is told exactly once that we have the piece
        let have_count = |msgs: &[Message]| {
            msgs.iter()
                .filter(|msg| {
                    matches!(msg, Message::Have { piece_index: 0 })
                })
                .count()
        };
        assert_eq!(have_count(&sent_messages(&mut a_port)), 1);
        assert_eq!(have_count(&sent_messages(&mut b_port)), 1);
    }

    #[test]
    fn test_duplicate_block_is_ignored() {
        let piece_len = 2 * BLOCK_LEN;
        let data = piece_bytes(piece_len);
        let (mut torrent, mut piece_port) =
            test_torrent(&[data.clone()], piece_len);

        let a: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        let mut a_port = add_mock_peer(&mut torrent, a);
        torrent
            .handle_message(a, Message::Bitfield(vec![0x80]))
            .unwrap();
        torrent.handle_message(a, Message::Unchoke).unwrap();
        let requests = sent_requests(&mut a_port);

        let first = block_of(&data, &requests[0]);
        torrent.handle_message(a, first.clone()).unwrap();
        // the repeat matches no outstanding request and changes nothing
        torrent.handle_message(a, first).unwrap();
        assert!(!torrent.completed.get(0));
        assert!(piece_port.try_recv().is_err());

        torrent
            .handle_message(a, block_of(&data, &requests[1]))
            .unwrap();
        assert_eq!(piece_port.try_recv().unwrap().data, data);
    }

    #[test]
    fn test_piece_larger_than_request_budget_completes() {
        // more blocks than a peer may have requests in flight for, so the
        // piece can't be covered by a single volley
        let piece_len = 20 * BLOCK_LEN;
        let data = piece_bytes(piece_len);
        let (mut torrent, mut piece_port) =
            test_torrent(&[data.clone()], piece_len);

        let a: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        let mut a_port = add_mock_peer(&mut torrent, a);
        torrent
            .handle_message(a, Message::Bitfield(vec![0x80]))
            .unwrap();
        torrent.handle_message(a, Message::Unchoke).unwrap();

        // the first volley is capped by the request budget
        let mut pending = sent_requests(&mut a_port);
        assert_eq!(pending.len(), PEER_MAX_REQUESTS);

        // serve every outstanding request, then pick up whatever got
        // requested in response, until the requests dry up
        let mut served = 0;
        while !pending.is_empty() {
            for request in std::mem::take(&mut pending) {
                served += 1;
                torrent
                    .handle_message(a, block_of(&data, &request))
                    .unwrap();
            }
            pending = sent_requests(&mut a_port);
        }

        // the blocks past the first volley were requested and served too
        assert_eq!(served, 20);
        assert!(torrent.completed.get(0));
        assert!(!torrent.active.get(0));
        assert_eq!(piece_port.try_recv().unwrap().data, data);
    }

    #[test]
    fn test_eviction_returns_blocks_to_the_pool() {
        let piece_len = 2 * BLOCK_LEN;
        let data = piece_bytes(piece_len);
        let (mut torrent, _piece_port) = test_torrent(&[data], piece_len);

        let a: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:50002".parse().unwrap();
        let mut a_port = add_mock_peer(&mut torrent, a);
        let mut b_port = add_mock_peer(&mut torrent, b);

        torrent
            .handle_message(a, Message::Bitfield(vec![0x80]))
            .unwrap();
        torrent
            .handle_message(b, Message::Bitfield(vec![0x80]))
            .unwrap();
        torrent.handle_message(a, Message::Unchoke).unwrap();
        torrent.handle_message(b, Message::Unchoke).unwrap();
        assert_eq!(sent_requests(&mut a_port).len(), 2);
        assert!(torrent.active.get(0));

        // peer a dies with both blocks in flight; the blocks go back to the
        // pool and the piece is no longer active
        torrent.remove_peer(&a);
        assert!(!torrent.active.get(0));

        // the surviving peer picks the work up
        torrent.dispatch_all();
        let b_requests = sent_requests(&mut b_port);
        assert_eq!(b_requests.len(), 2);
        assert!(torrent.active.get(0));
    }

    #[test]
    fn test_corrupt_piece_is_rerequested() {
        let piece_len = 2 * BLOCK_LEN;
        let data = piece_bytes(piece_len);
        let (mut torrent, mut piece_port) =
            test_torrent(&[data], piece_len);

        let a: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        let mut a_port = add_mock_peer(&mut torrent, a);
        torrent
            .handle_message(a, Message::Bitfield(vec![0x80]))
            .unwrap();
        torrent.handle_message(a, Message::Unchoke).unwrap();
        let requests = sent_requests(&mut a_port);

        // the peer delivers garbage for every block
        let bogus = vec![0xfe; piece_len as usize];
        for request in &requests {
            torrent
                .handle_message(a, block_of(&bogus, request))
                .unwrap();
        }

        // the piece failed verification: nothing was delivered, the peer is
        // kept, and the blocks were re-requested from it
        assert!(!torrent.completed.get(0));
        assert!(piece_port.try_recv().is_err());
        assert!(torrent.peers.contains_key(&a));
        assert_eq!(sent_requests(&mut a_port).len(), 2);
        assert!(torrent.active.get(0));
    }

    #[test]
    fn test_choke_abandons_requests() {
        let piece_len = 2 * BLOCK_LEN;
        let data = piece_bytes(piece_len);
        let (mut torrent, _piece_port) = test_torrent(&[data], piece_len);

        let a: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        let mut a_port = add_mock_peer(&mut torrent, a);
        torrent
            .handle_message(a, Message::Bitfield(vec![0x80]))
            .unwrap();
        torrent.handle_message(a, Message::Unchoke).unwrap();
        assert_eq!(sent_requests(&mut a_port).len(), 2);

        torrent.handle_message(a, Message::Choke).unwrap();
        assert!(!torrent.active.get(0));

        // after an unchoke the requests are issued anew
        torrent.handle_message(a, Message::Unchoke).unwrap();
        assert_eq!(sent_requests(&mut a_port).len(), 2);
    }

    #[test]
    fn test_protocol_violations_evict_the_peer() {
        let piece_len = 2 * BLOCK_LEN;
        let (mut torrent, _piece_port) =
            test_torrent(&[piece_bytes(piece_len)], piece_len);

        let a: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        let _a_port = add_mock_peer(&mut torrent, a);

        // out of range have
        assert!(torrent
            .handle_message(a, Message::Have { piece_index: 1 })
            .is_err());

        // a bitfield after the first message
        let b: SocketAddr = "127.0.0.1:50002".parse().unwrap();
        let _b_port = add_mock_peer(&mut torrent, b);
        torrent.handle_message(b, Message::KeepAlive).unwrap();
        assert!(torrent
            .handle_message(b, Message::Bitfield(vec![0x80]))
            .is_err());
    }

    #[tokio::test]
    async fn test_add_peer_is_idempotent() {
        let piece_len = 2 * BLOCK_LEN;
        let (mut torrent, _piece_port) =
            test_torrent(&[piece_bytes(piece_len)], piece_len);

        let addr: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        torrent.add_peer(addr);
        torrent.add_peer(addr);
        assert_eq!(torrent.peers.len(), 1);
    }
}
