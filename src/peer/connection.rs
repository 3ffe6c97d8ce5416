//! The transport half of a peer session.
//!
//! Each connection runs as its own task: it dials the peer, exchanges
//! handshakes, and then loops over the framed socket and the coordinator's
//! command channel. Decoded messages and terminal errors are reported to the
//! coordinator as events; the task holds no reference to any torrent state.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{select, stream::Fuse, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    time::{self, Instant},
};
use tokio_util::codec::{Framed, FramedParts};

use super::{codec::*, Command, CommandReceiver, State};
use crate::{
    error::{Error, Result},
    torrent::{Event, EventSender, TorrentContext},
};

/// The time allowed for establishing the TCP connection, and then again for
/// the peer's handshake to arrive.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the session wakes up from reading to check on the peer.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Peers that produce no traffic, not even keep-alives, for this long are
/// disconnected.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

pub(crate) struct PeerConnection {
    /// Shared information of the torrent, needed for the handshake.
    torrent: Arc<TorrentContext>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// The port on which the session receives commands from the coordinator.
    cmd_port: Fuse<CommandReceiver>,
    /// The channel on which parsed messages and errors are sent upstream.
    event_chan: EventSender,
    /// The current state of the session.
    state: State,
}

impl PeerConnection {
    /// Creates a new outbound session with the peer at the given address.
    pub fn outbound(
        torrent: Arc<TorrentContext>,
        addr: SocketAddr,
        cmd_port: CommandReceiver,
        event_chan: EventSender,
    ) -> Self {
        Self {
            torrent,
            addr,
            cmd_port: cmd_port.fuse(),
            event_chan,
            state: State::default(),
        }
    }

    /// Runs the session until the connection is closed. Errors are reported
    /// upstream so that the coordinator can evict the peer; they are not
    /// returned.
    pub async fn start(mut self) {
        if let Err(error) = self.run().await {
            log::info!("Peer {} session stopped: {}", self.addr, error);
            let addr = self.addr;
            // the coordinator itself going away mid-send is fine, the whole
            // torrent is being torn down then
            let _ = self.event_chan.send(Event::Error { addr, error }).await;
        }
        self.state = State::Disconnected;
    }

    async fn run(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.state = State::Connecting;
        let socket =
            time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr))
                .await
                .map_err(|_| Error::ConnectTimeout)??;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.state = State::Handshaking;
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        log::info!("Sending handshake to peer {}", self.addr);
        socket.send(handshake).await?;

        log::info!("Waiting for peer {} handshake", self.addr);
        let peer_handshake =
            match time::timeout(CONNECT_TIMEOUT, socket.next())
                .await
                .map_err(|_| Error::ConnectTimeout)?
            {
                Some(peer_handshake) => peer_handshake?,
                None => return Err(Error::ConnectionClosed),
            };
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
        // the codec only returns a handshake if the protocol string in it is
        // valid
        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != self.torrent.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(Error::InvalidPeerInfoHash);
        }

        // now that we have the handshake, we need to switch to the peer
        // message codec (note that we need to keep the buffer from the
        // original codec as it may contain bytes of any message the peer may
        // have sent after the handshake)
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        // reuse buffers of previous codec
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.state = State::Connected;
        log::info!("Peer {} session state: {:?}", self.addr, self.state);

        self.run_loop(socket).await
    }

    /// The main session loop: socket frames in, coordinator commands out,
    /// with an idle watchdog.
    async fn run_loop(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        // split the sink and stream so that we can write commands while
        // a read is pending
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        // we never choke our peers: this engine only leeches, so there is
        // nothing they could request from us
        sink.send(Message::Unchoke).await?;

        let mut last_activity = Instant::now();
        let mut ticker = time::interval(READ_TIMEOUT).fuse();

        loop {
            select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        None => return Err(Error::ConnectionClosed),
                    };
                    log::debug!(
                        "Received message {:?} from peer {}",
                        msg.id(),
                        self.addr
                    );
                    // any frame counts as activity, keep-alives exist for
                    // exactly this purpose
                    last_activity = Instant::now();
                    let addr = self.addr;
                    self.event_chan
                        .send(Event::Message { addr, message: msg })
                        .await
                        .map_err(|_| Error::ChannelClosed)?;
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Send(msg) => {
                            log::debug!(
                                "Sending message {:?} to peer {}",
                                msg.id(),
                                self.addr
                            );
                            sink.send(msg).await?;
                        }
                        Command::Shutdown => {
                            log::info!(
                                "Shutting down peer {} session",
                                self.addr
                            );
                            return Ok(());
                        }
                    }
                }
                _ = ticker.select_next_some() => {
                    if last_activity.elapsed() >= IDLE_TIMEOUT {
                        return Err(Error::IdleTimeout);
                    }
                }
            }
        }
    }
}
