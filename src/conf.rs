//! This module defines types used to configure the engine and its parts.

use std::time::Duration;

use crate::{new_client_id, PeerId};

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults and a freshly
    /// generated client id.
    pub fn new() -> Self {
        Self {
            engine: EngineConf {
                client_id: new_client_id(),
                listen_port: 6881,
            },
            torrent: TorrentConf::default(),
        }
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The port reported to the tracker. The engine doesn't accept inbound
    /// connections so this is advertisement only.
    pub listen_port: u16,
}

/// Configuration for a torrent.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// The capacity of the coordinator's event queue. When the queue is full,
    /// peer sessions block on sending, which throttles their socket reads and
    /// so provides end-to-end backpressure.
    pub event_queue_len: usize,

    /// If the tracker doesn't provide an announce interval, we default to
    /// announcing every 30 seconds.
    pub announce_interval: Duration,
}

impl Default for TorrentConf {
    fn default() -> Self {
        Self {
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            event_queue_len: 1024,
            announce_interval: Duration::from_secs(30),
        }
    }
}
