//! Block state (C2, spec §3/§4.2): the smallest unit of network transfer.

use bytes::Bytes;

/// Fixed maximum block size, 16 KiB.
pub const BLOCK_SIZE: u32 = 1 << 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Empty,
    InFlight,
    Downloaded,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub state: BlockState,
    pub size: u32,
    pub data: Option<Bytes>,
    /// Set when the block transitions to `InFlight`; used by the reaper to
    /// release blocks whose request has gone stale.
    pub requested_at: Option<std::time::Instant>,
}

impl Block {
    pub fn new(size: u32) -> Block {
        Block {
            state: BlockState::Empty,
            size,
            data: None,
            requested_at: None,
        }
    }

    pub fn mark_in_flight(&mut self) {
        self.state = BlockState::InFlight;
        self.requested_at = Some(std::time::Instant::now());
    }

    pub fn reset(&mut self) {
        self.state = BlockState::Empty;
        self.data = None;
        self.requested_at = None;
    }

    pub fn set_data(&mut self, data: Bytes) {
        self.state = BlockState::Downloaded;
        self.data = Some(data);
        self.requested_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_block_starts_empty() {
        let b = Block::new(BLOCK_SIZE);
        assert_eq!(b.state, BlockState::Empty);
        assert!(b.data.is_none());
    }

    #[test]
    fn set_data_marks_downloaded() {
        let mut b = Block::new(4);
        b.set_data(Bytes::from(vec![1, 2, 3, 4]));
        assert_eq!(b.state, BlockState::Downloaded);
        assert_eq!(b.data, Some(Bytes::from(vec![1, 2, 3, 4])));
    }

    #[test]
    fn reset_clears_data_and_timestamp() {
        let mut b = Block::new(4);
        b.mark_in_flight();
        b.reset();
        assert_eq!(b.state, BlockState::Empty);
        assert!(b.data.is_none());
        assert!(b.requested_at.is_none());
    }
}
