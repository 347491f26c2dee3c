//! Volume formatter and card doubles shared by the integration tests.
#![allow(dead_code)]

use storage::{
    BLOCK_SIZE, Block, BlockDevice, BlockDeviceError,
    fs::{dev::RamCard, fat::FatFs},
};

pub const RESERVED_SECTORS: u16 = 32;
pub const FS_INFO_SECTOR: u16 = 1;
pub const ROOT_CLUSTER: u32 = 2;
/// Smallest cluster count of a FAT32 volume
pub const MIN_CLUSTERS: u32 = 65_525;

/// Shape of a volume laid out by [`format`].
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    /// Block holding the boot sector, 0 without a partition table
    pub volume_start: u32,
    pub sectors_per_cluster: u8,
    pub fat_count: u8,
    pub fat_size: u32,
    pub total_sectors: u32,
    pub cluster_count: u32,
}

impl Layout {
    /// A volume just big enough for `clusters` clusters.
    pub fn new(sectors_per_cluster: u8, clusters: u32) -> Self {
        let fat_count = 2;
        let fat_size = (clusters + 2).div_ceil(128);
        let total_sectors = u32::from(RESERVED_SECTORS)
            + u32::from(fat_count) * fat_size
            + clusters * u32::from(sectors_per_cluster);
        Self {
            volume_start: 0,
            sectors_per_cluster,
            fat_count,
            fat_size,
            total_sectors,
            cluster_count: clusters,
        }
    }

    /// Smallest valid volume with 512-byte clusters.
    pub fn small() -> Self {
        Self::new(1, MIN_CLUSTERS + 75)
    }

    #[must_use]
    pub const fn behind_mbr(mut self, volume_start: u32) -> Self {
        self.volume_start = volume_start;
        self
    }

    pub const fn bytes_per_cluster(&self) -> u32 {
        self.sectors_per_cluster as u32 * BLOCK_SIZE as u32
    }

    pub const fn fat_start(&self) -> u32 {
        self.volume_start + RESERVED_SECTORS as u32
    }

    pub const fn first_data_sector(&self) -> u32 {
        self.fat_start() + self.fat_count as u32 * self.fat_size
    }

    pub const fn fs_info_sector(&self) -> u32 {
        self.volume_start + FS_INFO_SECTOR as u32
    }

    pub const fn card_blocks(&self) -> u32 {
        self.volume_start + self.total_sectors
    }
}

fn put_u16(block: &mut Block, offset: usize, value: u16) {
    block[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(block: &mut Block, offset: usize, value: u32) {
    block[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(block: &Block, offset: usize) -> u32 {
    u32::from_le_bytes(block[offset..offset + 4].try_into().unwrap())
}

pub fn boot_sector(layout: &Layout) -> Block {
    let mut block = [0; BLOCK_SIZE];
    block[..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
    block[3..11].copy_from_slice(b"MSWIN4.1");
    put_u16(&mut block, 11, 512);
    block[13] = layout.sectors_per_cluster;
    put_u16(&mut block, 14, RESERVED_SECTORS);
    block[16] = layout.fat_count;
    block[21] = 0xF8;
    put_u16(&mut block, 24, 63);
    put_u16(&mut block, 26, 255);
    put_u32(&mut block, 28, layout.volume_start);
    put_u32(&mut block, 32, layout.total_sectors);
    put_u32(&mut block, 36, layout.fat_size);
    put_u32(&mut block, 44, ROOT_CLUSTER);
    put_u16(&mut block, 48, FS_INFO_SECTOR);
    put_u16(&mut block, 50, 6);
    block[64] = 0x80;
    block[66] = 0x29;
    put_u32(&mut block, 67, 0x1234_5678);
    block[71..82].copy_from_slice(b"NO NAME    ");
    block[82..90].copy_from_slice(b"FAT32   ");
    block[510] = 0x55;
    block[511] = 0xAA;
    block
}

pub fn fs_info(free_count: u32, next_free: u32) -> Block {
    let mut block = [0; BLOCK_SIZE];
    put_u32(&mut block, 0, 0x4161_5252);
    put_u32(&mut block, 484, 0x6141_7272);
    put_u32(&mut block, 488, free_count);
    put_u32(&mut block, 492, next_free);
    put_u32(&mut block, 508, 0xAA55_0000);
    block
}

pub fn partition_table(layout: &Layout, partition_type: u8) -> Block {
    let mut block = [0; BLOCK_SIZE];
    let entry = 446;
    block[entry] = 0x80;
    block[entry + 4] = partition_type;
    put_u32(&mut block, entry + 8, layout.volume_start);
    put_u32(&mut block, entry + 12, layout.total_sectors);
    block[510] = 0x55;
    block[511] = 0xAA;
    block
}

/// Lays out an empty FAT32 volume, with its root directory, on `card`.
pub fn format(card: &mut RamCard, layout: &Layout) {
    if layout.volume_start != 0 {
        card.set_block(0, &partition_table(layout, 0x0C));
    }
    card.set_block(layout.volume_start, &boot_sector(layout));
    card.set_block(layout.volume_start + 6, &boot_sector(layout));
    card.set_block(
        layout.fs_info_sector(),
        &fs_info(layout.cluster_count - 1, ROOT_CLUSTER + 1),
    );

    let mut fat = [0; BLOCK_SIZE];
    put_u32(&mut fat, 0, 0x0FFF_FFF8);
    put_u32(&mut fat, 4, 0x0FFF_FFFF);
    put_u32(&mut fat, 8, 0x0FFF_FFFF);
    for copy in 0..u32::from(layout.fat_count) {
        card.set_block(layout.fat_start() + copy * layout.fat_size, &fat);
    }
}

/// Card with a freshly formatted volume.
pub fn formatted_card(layout: &Layout) -> RamCard {
    let mut card = RamCard::new(layout.card_blocks());
    format(&mut card, layout);
    card
}

/// Mounted file system over a freshly formatted volume.
pub fn mounted(layout: &Layout) -> FatFs<RamCard> {
    let mut fs = FatFs::new(formatted_card(layout));
    fs.mount().unwrap();
    fs
}

/// Marks every cluster of the FAT as used, except those in `free`.
pub fn fill_fat(card: &mut RamCard, layout: &Layout, free: &[u32]) {
    for copy in 0..u32::from(layout.fat_count) {
        for index in 0..layout.fat_size {
            let mut block = [0; BLOCK_SIZE];
            for slot in 0..128 {
                let cluster = index * 128 + slot;
                let value: u32 = if free.contains(&cluster) { 0 } else { 0x0FFF_FFFF };
                put_u32(&mut block, slot as usize * 4, value);
            }
            card.set_block(layout.fat_start() + copy * layout.fat_size + index, &block);
        }
    }
}

/// Reads the raw entry of `cluster` from FAT copy `copy`.
pub fn fat_entry(card: &RamCard, layout: &Layout, copy: u32, cluster: u32) -> u32 {
    let sector = layout.fat_start() + copy * layout.fat_size + cluster / 128;
    get_u32(&card.block(sector), (cluster % 128) as usize * 4)
}

/// Returns the free count and next-free hint stored on the card.
pub fn stored_fs_info(card: &RamCard, layout: &Layout) -> (u32, u32) {
    let block = card.block(layout.fs_info_sector());
    (get_u32(&block, 488), get_u32(&block, 492))
}

/// Follows a chain directly on the card.
pub fn chain(card: &RamCard, layout: &Layout, start: u32) -> Vec<u32> {
    let mut clusters = vec![start];
    let mut current = start;
    loop {
        let next = fat_entry(card, layout, 0, current) & 0x0FFF_FFFF;
        if next >= 0x0FFF_FFF8 {
            return clusters;
        }
        clusters.push(next);
        current = next;
    }
}

/// Card whose transfers start failing once a budget is spent.
pub struct FaultyCard<D: BlockDevice> {
    pub inner: D,
    /// Remaining successful writes, unlimited when `None`
    pub writes_left: Option<usize>,
    /// Remaining successful reads, unlimited when `None`
    pub reads_left: Option<usize>,
}

impl<D: BlockDevice> FaultyCard<D> {
    pub const fn new(inner: D) -> Self {
        Self {
            inner,
            writes_left: None,
            reads_left: None,
        }
    }
}

fn spend(budget: &mut Option<usize>) -> bool {
    match budget {
        Some(0) => false,
        Some(left) => {
            *left -= 1;
            true
        }
        None => true,
    }
}

impl<D: BlockDevice> BlockDevice for FaultyCard<D> {
    fn init(&mut self) -> Result<(), BlockDeviceError> {
        self.inner.init()
    }

    fn read_block(&mut self, index: u32, dst: &mut Block) -> Result<(), BlockDeviceError> {
        if !spend(&mut self.reads_left) {
            return Err(BlockDeviceError::Read);
        }
        self.inner.read_block(index, dst)
    }

    fn write_block(&mut self, index: u32, src: &Block) -> Result<(), BlockDeviceError> {
        if !spend(&mut self.writes_left) {
            return Err(BlockDeviceError::Write);
        }
        self.inner.write_block(index, src)
    }

    fn card_present(&mut self) -> bool {
        self.inner.card_present()
    }
}
