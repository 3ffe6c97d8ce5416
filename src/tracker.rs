//! The HTTP tracker client.
//!
//! An announce is a GET request whose query carries the torrent's info hash,
//! our id and progress counters; the tracker answers with a bencoded
//! dictionary holding the refresh interval and, in the compact format, the
//! swarm's peers as packed 6 byte entries.

use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde_bytes::ByteBuf;
use url::Url;

use crate::{
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// The parameters of an announce, assembled by the engine.
#[derive(Clone, Debug)]
pub struct AnnounceParams {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The port we could be reached on. Advertisement only, this engine
    /// doesn't accept inbound connections.
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// What the tracker told us: when to come back and whom to talk to.
#[derive(Debug)]
pub struct Announce {
    /// The tracker's requested announce interval, if it sent one.
    pub interval: Option<Duration>,
    /// The addresses of the swarm's peers.
    pub peers: Vec<SocketAddr>,
}

pub struct Tracker {
    announce_url: Url,
}

impl Tracker {
    pub fn new(announce_url: Url) -> Self {
        Self { announce_url }
    }

    /// Announces to the tracker and returns its peer list.
    pub async fn announce(
        &self,
        params: &AnnounceParams,
    ) -> Result<Announce> {
        // the info hash and peer id are raw bytes, so the query string is
        // built by hand with the byte oriented percent encoder
        let sep = if self.announce_url.query().is_some() {
            '&'
        } else {
            '?'
        };
        let url = format!(
            "{url}{sep}info_hash={info_hash}&peer_id={peer_id}\
             &port={port}&uploaded={uploaded}&downloaded={downloaded}\
             &left={left}&compact=1",
            url = self.announce_url,
            sep = sep,
            info_hash = percent_encode(&params.info_hash, NON_ALPHANUMERIC),
            peer_id = percent_encode(&params.peer_id, NON_ALPHANUMERIC),
            port = params.port,
            uploaded = params.uploaded,
            downloaded = params.downloaded,
            left = params.left,
        );

        log::debug!("Announcing to tracker: {}", url);
        let resp = reqwest::get(&url).await?;
        if !resp.status().is_success() {
            return Err(Error::TrackerFailure(format!(
                "unexpected status code {}",
                resp.status()
            )));
        }
        let body = resp.bytes().await?;

        let resp: TrackerResponse = serde_bencode::from_bytes(&body)?;
        if let Some(reason) = resp.failure_reason {
            return Err(Error::TrackerFailure(reason));
        }

        let peers = match &resp.peers {
            Some(peers) => parse_compact_peers(peers)?,
            None => Vec::new(),
        };
        log::debug!("Tracker returned {} peers", peers.len());

        Ok(Announce {
            interval: resp.interval.map(Duration::from_secs),
            peers,
        })
    }
}

/// The bencoded announce response.
///
/// https://wiki.theory.org/BitTorrentSpecification#Tracker_Response
#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<u64>,
    /// The compact peer list: 6 bytes per peer, 4 for the IPv4 address and
    /// 2 for the port, all big endian.
    peers: Option<ByteBuf>,
}

fn parse_compact_peers(buf: &[u8]) -> Result<Vec<SocketAddr>> {
    if buf.len() % 6 != 0 {
        return Err(Error::TrackerFailure(format!(
            "malformed compact peer list of {} bytes",
            buf.len()
        )));
    }

    Ok(buf
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::from((ip, port))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use mockito::{mock, Matcher};

    use super::*;

    fn test_params() -> AnnounceParams {
        AnnounceParams {
            info_hash: [0xab; 20],
            peer_id: *b"-GT0001abcdefghijklm",
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 49152,
        }
    }

    // each test announces to its own path so that the mocks, which live on
    // a server shared by all tests, can't answer for one another
    fn test_tracker(path: &str) -> Tracker {
        let url =
            Url::parse(&format!("{}{}", mockito::server_url(), path))
                .unwrap();
        Tracker::new(url)
    }

    #[tokio::test]
    async fn test_announce_parses_compact_peers() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers12:");
        // 127.0.0.1:6881 and 10.0.0.2:6889
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.extend_from_slice(&[10, 0, 0, 2, 0x1a, 0xe9]);
        body.extend_from_slice(b"e");

        let _m = mock("GET", "/announce-peers")
            .match_query(Matcher::Any)
            .with_body(&body)
            .create();

        let announce = test_tracker("/announce-peers")
            .announce(&test_params())
            .await
            .unwrap();
        assert_eq!(announce.interval, Some(Duration::from_secs(1800)));
        assert_eq!(
            announce.peers,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "10.0.0.2:6889".parse().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn test_announce_sends_query_params() {
        let _m = mock("GET", "/announce-query")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("port".into(), "6881".into()),
                Matcher::UrlEncoded("compact".into(), "1".into()),
                Matcher::UrlEncoded("left".into(), "49152".into()),
            ]))
            .with_body(&b"d8:intervali1800e5:peers0:e"[..])
            .create();

        let announce = test_tracker("/announce-query")
            .announce(&test_params())
            .await
            .unwrap();
        assert!(announce.peers.is_empty());
    }

    #[tokio::test]
    async fn test_announce_failure_reason() {
        let _m = mock("GET", "/announce-failure")
            .match_query(Matcher::Any)
            .with_body(&b"d14:failure reason12:unregisterede"[..])
            .create();

        let err = test_tracker("/announce-failure")
            .announce(&test_params())
            .await;
        assert!(matches!(
            err,
            Err(Error::TrackerFailure(reason)) if reason == "unregistered"
        ));
    }
}
