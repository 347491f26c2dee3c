//! In-memory card used for host-side simulation.
use crate::{BLOCK_SIZE, Block, BlockDevice, BlockDeviceError};
use hashbrown::HashMap;

const ZERO_BLOCK: Block = [0; BLOCK_SIZE];

/// A sparse, removable RAM-backed card.
///
/// Blocks that were never written read back as zeroes, so large volumes
/// only cost the memory of the blocks actually touched.
pub struct RamCard {
    blocks: HashMap<u32, Block>,
    block_count: u32,
    present: bool,
    init_count: usize,
}

impl RamCard {
    #[must_use]
    #[inline]
    /// Creates an inserted, all-zero card with `block_count` blocks.
    pub fn new(block_count: u32) -> Self {
        Self {
            blocks: HashMap::new(),
            block_count,
            present: true,
            init_count: 0,
        }
    }

    #[must_use]
    #[inline]
    pub const fn block_count(&self) -> u32 {
        self.block_count
    }

    #[inline]
    /// Simulates pulling the card out of its slot.
    pub const fn eject(&mut self) {
        self.present = false;
    }

    #[inline]
    /// Simulates putting the card back.
    pub const fn insert(&mut self) {
        self.present = true;
    }

    #[must_use]
    #[inline]
    /// Returns how many times the card went through its power-up sequence.
    pub const fn init_count(&self) -> usize {
        self.init_count
    }

    #[must_use]
    /// Returns a copy of the block at `index`, regardless of card presence.
    pub fn block(&self, index: u32) -> Block {
        self.blocks.get(&index).copied().unwrap_or(ZERO_BLOCK)
    }

    /// Overwrites the block at `index`, regardless of card presence.
    pub fn set_block(&mut self, index: u32, data: &Block) {
        if data == &ZERO_BLOCK {
            self.blocks.remove(&index);
        } else {
            self.blocks.insert(index, *data);
        }
    }

    #[must_use]
    /// Returns the number of blocks holding non-zero data.
    pub fn used_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl BlockDevice for RamCard {
    fn init(&mut self) -> Result<(), BlockDeviceError> {
        if !self.present {
            return Err(BlockDeviceError::NoCard);
        }
        self.init_count += 1;
        Ok(())
    }

    fn read_block(&mut self, index: u32, dst: &mut Block) -> Result<(), BlockDeviceError> {
        if !self.present {
            return Err(BlockDeviceError::NoCard);
        }
        if index >= self.block_count {
            return Err(BlockDeviceError::Read);
        }
        *dst = self.block(index);
        Ok(())
    }

    fn write_block(&mut self, index: u32, src: &Block) -> Result<(), BlockDeviceError> {
        if !self.present {
            return Err(BlockDeviceError::NoCard);
        }
        if index >= self.block_count {
            return Err(BlockDeviceError::Write);
        }
        self.set_block(index, src);
        Ok(())
    }

    #[inline]
    fn card_present(&mut self) -> bool {
        self.present
    }
}
