//! The piece write buffer and block accounting.
//!
//! A piece refers to a portion of the downloaded data that is described in the
//! metainfo file and can be verified by a SHA-1 hash. A block is the portion
//! of data that is requested from a peer; one or more blocks make up a piece.
//! A piece buffers its blocks in memory until all have arrived, at which point
//! it is hashed and either handed off as verified data or reset for another
//! attempt.

use sha1::{Digest, Sha1};

use crate::{
    bitset::BitSet,
    block_count, block_len,
    error::{Error, Result},
    BlockInfo, PieceIndex, Sha1Hash, BLOCK_LEN,
};

pub(crate) struct Piece {
    /// The position of the piece in the torrent.
    index: PieceIndex,
    /// The length of the piece, in bytes.
    len: u32,
    /// The expected hash of the whole piece.
    hash: Sha1Hash,
    /// The piece's write buffer, sized up front to the piece length.
    data: Vec<u8>,
    /// One bit per block: set once the block's data has been copied into
    /// `data`. A set bit is never written again.
    completed: BitSet,
    /// One bit per block: set once the block has been handed out as a
    /// request. Cleared again if the requesting peer goes away before
    /// delivering.
    requested: BitSet,
}

impl Piece {
    pub fn new(index: PieceIndex, len: u32, hash: Sha1Hash) -> Self {
        let block_count = block_count(len);
        Self {
            index,
            len,
            hash,
            data: vec![0; len as usize],
            completed: BitSet::new(block_count),
            requested: BitSet::new(block_count),
        }
    }

    pub fn block_count(&self) -> usize {
        self.completed.len()
    }

    /// Copies a received block into the piece's buffer.
    ///
    /// Returns whether the block was accepted. A duplicate of an already
    /// completed block is rejected with `Ok(false)`: the existing data is
    /// kept, which makes block application idempotent. A block that is
    /// misaligned, out of range, or overflowing the piece is a protocol
    /// violation and returns an error.
    pub fn set_block(&mut self, offset: u32, block: &[u8]) -> Result<bool> {
        let index = (offset / BLOCK_LEN) as usize;
        let end = offset as usize + block.len();

        if offset % BLOCK_LEN != 0
            || index >= self.block_count()
            || end > self.len as usize
        {
            log::warn!(
                "Invalid block in piece {}: offset {} len {}",
                self.index,
                offset,
                block.len()
            );
            return Err(Error::InvalidBlockInfo);
        }

        if self.completed.get(index) {
            log::warn!(
                "Attempt to overwrite data at piece {} offset {}",
                self.index,
                offset
            );
            return Ok(false);
        }

        self.data[offset as usize..end].copy_from_slice(block);
        self.completed.set(index);
        Ok(true)
    }

    /// Picks the next block to request from this piece, if any.
    ///
    /// Blocks that are already requested or completed are skipped; of the
    /// remainder the lowest index is chosen and marked requested, which gives
    /// deterministic request ordering.
    pub fn next_block(&mut self) -> Option<BlockInfo> {
        if self.completed.is_full() {
            return None;
        }

        let index = *self
            .requested
            .or(&self.completed)
            .expect("piece block bit sets must have equal lengths")
            .unset_indices()
            .first()?;
        self.requested.set(index);

        Some(BlockInfo {
            piece_index: self.index,
            offset: index as u32 * BLOCK_LEN,
            len: block_len(self.len, index),
        })
    }

    /// Returns the block at the given offset to the requestable pool, after
    /// its request was abandoned (peer evicted or choked us).
    pub fn clear_requested(&mut self, offset: u32) {
        let index = (offset / BLOCK_LEN) as usize;
        debug_assert!(index < self.block_count());
        self.requested.clear(index);
    }

    /// The number of blocks that have been requested but not yet received.
    pub fn pending_request_count(&self) -> usize {
        self.requested.cardinality() - self.completed.cardinality()
    }

    /// Returns true if all blocks of the piece have been received.
    pub fn is_complete(&self) -> bool {
        self.completed.is_full()
    }

    /// Calculates the piece's hash and returns whether it matches the
    /// expected hash. Only meaningful once the piece is complete.
    pub fn is_valid(&self) -> bool {
        debug_assert!(self.is_complete());
        let digest = Sha1::digest(&self.data);
        log::debug!("Piece {} hash: {}", self.index, hex::encode(&digest));
        digest.as_slice() == self.hash
    }

    /// Discards all downloaded data so the piece can be re-requested from
    /// scratch, used when the completed piece failed its hash check.
    pub fn reset(&mut self) {
        let block_count = self.block_count();
        self.completed = BitSet::new(block_count);
        self.requested = BitSet::new(block_count);
        self.data = vec![0; self.len as usize];
    }

    /// Moves the verified piece data out of the buffer, leaving the piece
    /// empty. Must only be called after a successful hash check.
    pub fn take_data(&mut self) -> Vec<u8> {
        debug_assert!(self.is_complete());
        std::mem::replace(&mut self.data, Vec::new())
    }
}
