//! Ties the collaborators together: the tracker feeds peer addresses to the
//! swarm coordinator, which downloads and verifies pieces and delivers them
//! on the caller's channel.

use std::time::Duration;

use futures::{pin_mut, select, FutureExt};
use tokio::time;
use url::Url;

use crate::{
    conf::Conf,
    error::{Error, Result},
    metainfo::Metainfo,
    torrent::{PieceSender, Torrent, TorrentHandle},
    tracker::{AnnounceParams, Tracker},
};

/// Downloads the torrent described by the metainfo.
///
/// Verified pieces are delivered on `piece_chan` as they complete, in
/// completion order. The future resolves once every piece has been verified,
/// or fails on a fatal error (bad metainfo, the piece channel going away).
/// Peer churn and tracker hiccups are handled internally and are not fatal.
pub async fn download(
    conf: Conf,
    metainfo: Metainfo,
    piece_chan: PieceSender,
) -> Result<()> {
    let announce_url =
        Url::parse(&metainfo.announce).map_err(|_| Error::InvalidMetainfo)?;
    let tracker = Tracker::new(announce_url);

    let mut torrent = Torrent::new(
        conf.torrent.clone(),
        conf.engine.client_id,
        &metainfo,
        piece_chan,
    )?;
    let handle = torrent.handle();

    let params = AnnounceParams {
        info_hash: metainfo.create_info_hash()?,
        peer_id: conf.engine.client_id,
        port: conf.engine.listen_port,
        uploaded: 0,
        downloaded: 0,
        left: metainfo.total_len(),
    };

    // the announce loop never finishes on its own, so this resolves when the
    // download does (or when a fatal error surfaces on either side)
    let download = torrent.start().fuse();
    let announces = announce_loop(
        tracker,
        params,
        handle,
        conf.torrent.announce_interval,
    )
    .fuse();
    pin_mut!(download, announces);

    select! {
        result = download => result,
        result = announces => result,
    }
}

/// Periodically announces to the tracker and offers the returned peers to the
/// torrent. Announce failures are retried on the next tick.
async fn announce_loop(
    tracker: Tracker,
    params: AnnounceParams,
    mut handle: TorrentHandle,
    fallback_interval: Duration,
) -> Result<()> {
    let mut interval = fallback_interval;
    loop {
        match tracker.announce(&params).await {
            Ok(announce) => {
                log::info!(
                    "Tracker returned {} peers",
                    announce.peers.len()
                );
                for addr in announce.peers {
                    handle.add_peer(addr).await?;
                }
                if let Some(tracker_interval) = announce.interval {
                    interval = tracker_interval;
                }
            }
            Err(e) => {
                log::warn!("Announce failed: {}", e);
            }
        }
        time::delay_for(interval).await;
    }
}
