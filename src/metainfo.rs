//! Decoding of bencoded `.torrent` files.
//!
//! Only the fields the engine needs are kept: the announce URL and the info
//! dictionary with the piece geometry and hashes. The info hash is computed by
//! re-encoding the info dictionary, as the torrent's identity on the wire is
//! the SHA-1 of those exact bytes.

use serde_bencode;
use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    Sha1Hash,
};

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: String,
    pub info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Self = serde_bencode::from_bytes(buf)?;
        // the concatenated piece hashes must be whole 20 byte digests and
        // cover at least one piece
        if metainfo.info.pieces.is_empty()
            || metainfo.info.pieces.len() % 20 != 0
            || metainfo.info.piece_length == 0
        {
            return Err(Error::InvalidMetainfo);
        }
        Ok(metainfo)
    }

    pub fn create_info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// The number of pieces in the torrent, one per 20 byte hash in the info
    /// dictionary.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// The expected hash of the piece at the given index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of range.
    pub fn piece_hash(&self, index: usize) -> Sha1Hash {
        let pos = index * 20;
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.info.pieces[pos..pos + 20]);
        hash
    }

    /// The sum of the length of all files in the torrent.
    pub fn total_len(&self) -> u64 {
        match (self.info.length, &self.info.files) {
            (Some(len), _) => len,
            (None, Some(files)) => {
                files.iter().map(|f| f.length.max(0) as u64).sum()
            }
            (None, None) => 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    // A minimal single file torrent: two pieces of 32 KiB covering 48 KiB.
    fn test_torrent_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce28:http://tracker.test/announce");
        buf.extend_from_slice(b"4:infod6:lengthi49152e4:name4:test");
        buf.extend_from_slice(b"12:piece lengthi32768e6:pieces40:");
        buf.extend_from_slice(&[0xab; 20]);
        buf.extend_from_slice(&[0xcd; 20]);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn test_from_bytes() {
        let metainfo = Metainfo::from_bytes(&test_torrent_bytes()).unwrap();
        assert_eq!(metainfo.announce, "http://tracker.test/announce");
        assert_eq!(metainfo.info.name, "test");
        assert_eq!(metainfo.info.piece_length, 32768);
        assert_eq!(metainfo.total_len(), 49152);
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.piece_hash(0), [0xab; 20]);
        assert_eq!(metainfo.piece_hash(1), [0xcd; 20]);
    }

    #[test]
    fn test_info_hash_is_stable() {
        let metainfo = Metainfo::from_bytes(&test_torrent_bytes()).unwrap();
        let hash = metainfo.create_info_hash().unwrap();
        assert_eq!(hash.len(), 20);
        assert_eq!(hash, metainfo.create_info_hash().unwrap());
    }

    #[test]
    fn test_truncated_piece_hashes_are_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce28:http://tracker.test/announce");
        buf.extend_from_slice(b"4:infod6:lengthi49152e4:name4:test");
        buf.extend_from_slice(b"12:piece lengthi32768e6:pieces19:");
        buf.extend_from_slice(&[0xab; 19]);
        buf.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo)
        ));
    }
}
