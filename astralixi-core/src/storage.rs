use thiserror::Error;

/// Size of a single addressable block, in bytes.
pub const BLOCK_SIZE: usize = 512;

/// One block worth of bytes.
pub type Block = [u8; BLOCK_SIZE];

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
/// An error that can occur when performing block device operations.
pub enum BlockDeviceError {
    #[error("Read failed")]
    Read,
    #[error("Write failed")]
    Write,
    #[error("No card")]
    NoCard,
}

/// A trait for removable block devices.
///
/// These are physical devices (such as SD cards) that transfer data one
/// fixed-size block at a time and may disappear at any moment.
pub trait BlockDevice {
    /// Brings the device into a state where blocks can be transferred.
    ///
    /// This is called once before every mount attempt. Devices that need no
    /// power-up sequence can keep the default implementation.
    fn init(&mut self) -> Result<(), BlockDeviceError> {
        Ok(())
    }

    /// Read the block at absolute index `index` into `dst`.
    ///
    /// ## Errors
    ///
    /// This function returns an error if the transfer failed
    /// or if the card is no longer present.
    fn read_block(&mut self, index: u32, dst: &mut Block) -> Result<(), BlockDeviceError>;

    /// Write `src` to the block at absolute index `index`.
    ///
    /// ## Errors
    ///
    /// This function returns an error if the transfer failed
    /// or if the card is no longer present.
    fn write_block(&mut self, index: u32, src: &Block) -> Result<(), BlockDeviceError>;

    /// Non-blocking presence probe.
    fn card_present(&mut self) -> bool;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    #[inline]
    fn init(&mut self) -> Result<(), BlockDeviceError> {
        (**self).init()
    }

    #[inline]
    fn read_block(&mut self, index: u32, dst: &mut Block) -> Result<(), BlockDeviceError> {
        (**self).read_block(index, dst)
    }

    #[inline]
    fn write_block(&mut self, index: u32, src: &Block) -> Result<(), BlockDeviceError> {
        (**self).write_block(index, src)
    }

    #[inline]
    fn card_present(&mut self) -> bool {
        (**self).card_present()
    }
}
