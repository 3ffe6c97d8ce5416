use crate::{
    error::{Error, Result},
    metainfo::Metainfo,
    PieceIndex,
};

/// Information about a torrent's piece geometry, such as the piece count and
/// length, download length, etc.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files in the torrent.
    pub total_len: u64,
}

impl StorageInfo {
    /// Extracts the piece geometry from the torrent metainfo.
    ///
    /// Fails if the metainfo's hash count doesn't cover its download length,
    /// as the two are produced together and a mismatch means the torrent file
    /// is corrupt.
    pub fn new(metainfo: &Metainfo) -> Result<Self> {
        let piece_count = metainfo.piece_count();
        let piece_len = metainfo.info.piece_length as u32;
        let total_len = metainfo.total_len();

        if piece_count == 0
            || piece_len == 0
            || piece_count
                != ((total_len + piece_len as u64 - 1) / piece_len as u64)
                    as usize
        {
            return Err(Error::InvalidMetainfo);
        }

        let last_piece_len =
            total_len - piece_len as u64 * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        Ok(Self {
            piece_count,
            piece_len,
            last_piece_len,
            total_len,
        })
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex)
        }
    }
}
