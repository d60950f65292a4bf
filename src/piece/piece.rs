//! Piece assembly and integrity verification (C2, spec §3/§4.2).

use crate::piece::block::{Block, BlockState, BLOCK_SIZE};
use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

#[derive(Debug)]
pub struct Piece {
    pub piece_index: usize,
    pub piece_size: usize,
    pub piece_hash: [u8; 20],
    pub blocks: Vec<Block>,
    pub is_downloaded: bool,
    pub raw_data: Bytes,
}

impl Piece {
    pub fn new(piece_index: usize, piece_size: usize, piece_hash: [u8; 20]) -> Piece {
        let num_blocks = ((piece_size as u32) + BLOCK_SIZE - 1) / BLOCK_SIZE;
        let num_blocks = num_blocks.max(1) as usize;
        let mut blocks = Vec::with_capacity(num_blocks);
        for i in 0..num_blocks {
            // The last block absorbs the remainder; a piece_size that is an
            // exact multiple of BLOCK_SIZE naturally yields a full-size last
            // block here (the original implementation's `piece_size % BLOCK_SIZE`
            // formula produced 0 in that case — spec §9's fix).
            let size = if i == num_blocks - 1 {
                piece_size as u32 - (num_blocks as u32 - 1) * BLOCK_SIZE
            } else {
                BLOCK_SIZE
            };
            blocks.push(Block::new(size));
        }
        Piece {
            piece_index,
            piece_size,
            piece_hash,
            blocks,
            is_downloaded: false,
            raw_data: Bytes::new(),
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Precondition: piece is not `is_downloaded` and `block_index` is in range.
    /// A block already `Downloaded` is left untouched (idempotent).
    pub fn set_block(&mut self, block_index: usize, data: Bytes) {
        if self.is_downloaded {
            return;
        }
        let block = match self.blocks.get_mut(block_index) {
            Some(b) => b,
            None => return,
        };
        if block.state == BlockState::Downloaded {
            return;
        }
        block.set_data(data);
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| b.state == BlockState::Downloaded)
    }

    fn merge_blocks(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.piece_size);
        for block in &self.blocks {
            if let Some(data) = &block.data {
                out.extend_from_slice(data);
            }
        }
        out.freeze()
    }

    /// Concatenates blocks, verifies SHA-1 against `piece_hash`. On match, sets
    /// `is_downloaded` and returns true. On mismatch, resets every block to
    /// EMPTY (so the whole piece is retried) and returns false.
    pub fn try_finalise(&mut self) -> bool {
        let data = self.merge_blocks();
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let hash: [u8; 20] = hasher.finalize().into();

        if hash == self.piece_hash {
            self.is_downloaded = true;
            self.raw_data = data;
            true
        } else {
            for block in &mut self.blocks {
                block.reset();
            }
            false
        }
    }

    /// Seeks to `piece_index * piece_length` and writes `raw_data[:piece_size]`.
    pub fn save(&self, file: &mut File, piece_length: u64) -> std::io::Result<()> {
        let offset = self.piece_index as u64 * piece_length;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&self.raw_data[..self.piece_size])
    }
}
