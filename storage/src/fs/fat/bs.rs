//! Partition table, boot sector and FSInfo on-disk formats.
use super::{
    Cluster, FatError, FatResult,
    fat::CommitCache,
};
use crate::{BLOCK_SIZE, Block, BlockDevice};
use astralixi_core::static_assert;

/// Offset of the two-byte signature closing the MBR, boot sector and FSInfo sector.
const SIGNATURE_OFFSET: usize = 510;
const SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// Smallest cluster count of a FAT32 volume.
pub const MIN_CLUSTERS: u32 = 65_525;
/// Largest cluster count addressable by 28-bit FAT entries.
pub const MAX_CLUSTERS: u32 = 0x0FFF_FFF5;
/// Number of FAT entries held in one sector.
pub const ENTRIES_PER_SECTOR: u32 = (BLOCK_SIZE / 4) as u32;

static_assert!(BLOCK_SIZE == 512, "FAT32 volumes use 512-byte sectors");

#[must_use]
#[inline]
pub(crate) const fn read_u16(block: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([block[offset], block[offset + 1]])
}

#[must_use]
#[inline]
pub(crate) const fn read_u32(block: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        block[offset],
        block[offset + 1],
        block[offset + 2],
        block[offset + 3],
    ])
}

#[inline]
pub(crate) fn write_u16(block: &mut [u8], offset: usize, value: u16) {
    block[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn write_u32(block: &mut [u8], offset: usize, value: u32) {
    block[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[must_use]
#[inline]
/// Returns true if the sector ends with the 0x55AA signature.
pub fn has_signature(block: &Block) -> bool {
    block[SIGNATURE_OFFSET..] == SIGNATURE
}

/// Entry of the partition table held in an MBR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEntry {
    /// 0x80 for the active partition, 0x00 otherwise.
    boot_indicator: u8,
    /// Partition type identifier.
    partition_type: u8,
    /// First block of the partition.
    start_block: u32,
    /// Size of the partition in blocks.
    block_count: u32,
}

impl PartitionEntry {
    const TABLE_OFFSET: usize = 446;
    const SIZE: usize = 16;
    /// Number of entries in the table.
    pub const COUNT: usize = 4;

    /// FAT32 with CHS addressing.
    pub const TYPE_FAT32_CHS: u8 = 0x0B;
    /// FAT32 with LBA addressing.
    pub const TYPE_FAT32_LBA: u8 = 0x0C;

    #[must_use]
    /// Parses the `index`-th partition entry of an MBR.
    pub const fn parse(block: &Block, index: usize) -> Self {
        let base = Self::TABLE_OFFSET + index * Self::SIZE;
        Self {
            boot_indicator: block[base],
            partition_type: block[base + 4],
            start_block: read_u32(block, base + 8),
            block_count: read_u32(block, base + 12),
        }
    }

    /// Iterates over the four entries of an MBR.
    pub fn all(block: &Block) -> impl Iterator<Item = Self> + '_ {
        (0..Self::COUNT).map(|index| Self::parse(block, index))
    }

    #[must_use]
    #[inline]
    pub const fn boot_indicator(&self) -> u8 {
        self.boot_indicator
    }

    #[must_use]
    #[inline]
    pub const fn partition_type(&self) -> u8 {
        self.partition_type
    }

    #[must_use]
    #[inline]
    pub const fn start_block(&self) -> u32 {
        self.start_block
    }

    #[must_use]
    #[inline]
    pub const fn block_count(&self) -> u32 {
        self.block_count
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry describes a usable FAT32 partition.
    pub const fn is_fat32(&self) -> bool {
        matches!(self.boot_indicator, 0x00 | 0x80)
            && matches!(
                self.partition_type,
                Self::TYPE_FAT32_CHS | Self::TYPE_FAT32_LBA
            )
            && self.start_block != 0
    }
}

#[must_use]
/// Returns true if the sector looks like an MBR.
pub fn is_partition_table(block: &Block) -> bool {
    has_signature(block) && PartitionEntry::all(block).any(|e| e.partition_type() != 0)
}

#[must_use]
/// Returns true if the sector looks like a volume boot sector.
pub fn is_boot_sector(block: &Block) -> bool {
    has_signature(block)
        && matches!(block[0], 0xEB | 0xE9)
        && matches!(read_u16(block, 11), 512 | 1024 | 2048 | 4096)
}

/// Finds the first block of the FAT32 volume, given the card's block 0.
///
/// Block 0 is either an MBR pointing to a FAT32 partition, or the boot sector
/// of an unpartitioned volume.
pub fn locate_volume(block0: &Block) -> FatResult<u32> {
    if is_partition_table(block0) {
        if let Some(entry) = PartitionEntry::all(block0).find(PartitionEntry::is_fat32) {
            return Ok(entry.start_block());
        }
        // Boot code of unpartitioned volumes can spill into the table area
        if is_boot_sector(block0) {
            return Ok(0);
        }
        return Err(FatError::InvalidFormat);
    }

    if is_boot_sector(block0) {
        Ok(0)
    } else {
        Err(FatError::InvalidFormat)
    }
}

/// FAT32 boot sector (BIOS Parameter Block).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSector {
    /// Bytes per sector.
    bytes_per_sector: u16,
    /// Sectors per cluster.
    sectors_per_cluster: u8,
    /// Reserved sectors, boot sector included.
    reserved_sectors: u16,
    /// Number of FATs.
    fat_count: u8,
    /// Sectors per FAT.
    ///
    /// Must be zero on FAT32 volumes.
    sectors_per_fat_16: u16,
    /// Total sectors in the file system.
    total_sectors: u32,
    /// Sectors per FAT.
    sectors_per_fat: u32,
    /// Cluster number of the root directory.
    root_cluster: u32,
    /// Sector number of the FS Information Sector, relative to the volume.
    fs_info_sector: u16,
    /// Whether the sector carries the 0x55AA signature.
    signed: bool,
}

impl BootSector {
    #[must_use]
    pub fn parse(block: &Block) -> Self {
        Self {
            bytes_per_sector: read_u16(block, 11),
            sectors_per_cluster: block[13],
            reserved_sectors: read_u16(block, 14),
            fat_count: block[16],
            sectors_per_fat_16: read_u16(block, 22),
            total_sectors: read_u32(block, 32),
            sectors_per_fat: read_u32(block, 36),
            root_cluster: read_u32(block, 44),
            fs_info_sector: read_u16(block, 48),
            signed: has_signature(block),
        }
    }

    #[must_use]
    #[inline]
    /// Returns the number of bytes per sector.
    pub const fn bytes_per_sector(&self) -> u16 {
        self.bytes_per_sector
    }

    #[must_use]
    #[inline]
    /// Returns the number of sectors per cluster.
    pub const fn sectors_per_cluster(&self) -> u8 {
        self.sectors_per_cluster
    }

    #[must_use]
    #[inline]
    /// Returns the number of reserved sectors.
    pub const fn reserved_sectors(&self) -> u16 {
        self.reserved_sectors
    }

    #[must_use]
    #[inline]
    /// Returns the number of FATs.
    pub const fn fat_count(&self) -> u8 {
        self.fat_count
    }

    #[must_use]
    #[inline]
    /// Returns the number of sectors in the file system.
    pub const fn total_sectors(&self) -> u32 {
        self.total_sectors
    }

    #[must_use]
    #[inline]
    /// Returns the number of sectors per FAT.
    pub const fn sectors_per_fat(&self) -> u32 {
        self.sectors_per_fat
    }

    #[must_use]
    #[inline]
    /// Returns the cluster number of the root directory.
    pub const fn root_cluster(&self) -> u32 {
        self.root_cluster
    }

    #[must_use]
    #[inline]
    /// Returns the sector number of the FS Information Sector.
    pub const fn fs_info_sector(&self) -> u16 {
        self.fs_info_sector
    }

    #[must_use]
    #[inline]
    /// Returns the number of bytes per cluster.
    pub const fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    #[must_use]
    pub const fn validate(&self) -> bool {
        /// Maximum number of supported FAT
        const MAX_FAT_COUNT: u8 = 2;
        /// Maximum sectors per cluster
        const MAX_SECTORS_PER_CLUSTER: u8 = 128;

        if !self.signed {
            return false;
        }

        // Check bytes per sector
        if self.bytes_per_sector as usize != BLOCK_SIZE {
            return false;
        }

        // Check sectors per cluster
        if !self.sectors_per_cluster.is_power_of_two()
            || self.sectors_per_cluster > MAX_SECTORS_PER_CLUSTER
        {
            return false;
        }

        // Check reserved sectors
        if self.reserved_sectors == 0
            || self.fs_info_sector == 0
            || self.fs_info_sector >= self.reserved_sectors
        {
            return false;
        }

        // Check FAT count
        if self.fat_count == 0 || self.fat_count > MAX_FAT_COUNT {
            return false;
        }

        // FAT12/16 volumes fill the 16-bit size instead
        if self.sectors_per_fat_16 != 0 || self.sectors_per_fat == 0 {
            return false;
        }

        self.total_sectors != 0 && self.root_cluster >= 2
    }
}

/// Layout of a mounted volume, in absolute block indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    volume_start: u32,
    sectors_per_cluster: u32,
    bytes_per_cluster: u32,
    fat_start: u32,
    fat_size: u32,
    fat_count: u32,
    first_data_sector: u32,
    data_sectors: u32,
    cluster_count: u32,
    root_cluster: Cluster,
    fs_info_sector: u32,
}

impl Geometry {
    /// Derives the volume layout from a boot sector found at `volume_start`.
    pub fn new(volume_start: u32, bs: &BootSector) -> FatResult<Self> {
        if !bs.validate() {
            return Err(FatError::InvalidFormat);
        }

        let sectors_per_cluster = u32::from(bs.sectors_per_cluster());
        let fat_count = u32::from(bs.fat_count());
        let fat_size = bs.sectors_per_fat();

        let metadata_sectors = fat_count
            .checked_mul(fat_size)
            .and_then(|fats| fats.checked_add(u32::from(bs.reserved_sectors())))
            .ok_or(FatError::InvalidFormat)?;
        let data_sectors = bs
            .total_sectors()
            .checked_sub(metadata_sectors)
            .ok_or(FatError::InvalidFormat)?;
        volume_start
            .checked_add(bs.total_sectors())
            .ok_or(FatError::InvalidFormat)?;

        let cluster_count = data_sectors / sectors_per_cluster;
        if cluster_count < MIN_CLUSTERS {
            return Err(FatError::InvalidFormat);
        }

        // Clusters the FAT has no entry for can never be allocated
        let indexable = fat_size.saturating_mul(ENTRIES_PER_SECTOR).saturating_sub(2);
        let cluster_count = cluster_count.min(indexable).min(MAX_CLUSTERS);
        if cluster_count < MIN_CLUSTERS {
            return Err(FatError::InvalidFormat);
        }

        let root_cluster = Cluster::new(bs.root_cluster());
        if root_cluster.value() - 2 >= cluster_count {
            return Err(FatError::InvalidFormat);
        }

        let fat_start = volume_start + u32::from(bs.reserved_sectors());
        Ok(Self {
            volume_start,
            sectors_per_cluster,
            bytes_per_cluster: bs.bytes_per_cluster(),
            fat_start,
            fat_size,
            fat_count,
            first_data_sector: volume_start + metadata_sectors,
            data_sectors,
            cluster_count,
            root_cluster,
            fs_info_sector: volume_start + u32::from(bs.fs_info_sector()),
        })
    }

    #[must_use]
    #[inline]
    /// Returns the first block of the volume.
    pub const fn volume_start(&self) -> u32 {
        self.volume_start
    }

    #[must_use]
    #[inline]
    pub const fn sectors_per_cluster(&self) -> u32 {
        self.sectors_per_cluster
    }

    #[must_use]
    #[inline]
    pub const fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_cluster
    }

    #[must_use]
    #[inline]
    /// Returns the first block of the first FAT.
    pub const fn fat_start(&self) -> u32 {
        self.fat_start
    }

    #[must_use]
    #[inline]
    /// Returns the size of one FAT, in sectors.
    pub const fn fat_size(&self) -> u32 {
        self.fat_size
    }

    #[must_use]
    #[inline]
    pub const fn fat_count(&self) -> u32 {
        self.fat_count
    }

    #[must_use]
    #[inline]
    /// Returns the block holding the first sector of cluster 2.
    pub const fn first_data_sector(&self) -> u32 {
        self.first_data_sector
    }

    #[must_use]
    #[inline]
    pub const fn data_sectors(&self) -> u32 {
        self.data_sectors
    }

    #[must_use]
    #[inline]
    /// Returns the number of allocatable clusters, numbered from 2.
    pub const fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    #[must_use]
    #[inline]
    pub const fn root_cluster(&self) -> Cluster {
        self.root_cluster
    }

    #[must_use]
    #[inline]
    /// Returns the absolute block of the FSInfo sector.
    pub const fn fs_info_sector(&self) -> u32 {
        self.fs_info_sector
    }

    #[must_use]
    #[inline]
    /// Returns the block holding the first sector of `cluster`.
    ///
    /// `cluster` must be a data cluster of this volume.
    pub const fn cluster_to_sector(&self, cluster: Cluster) -> u32 {
        self.first_data_sector + (cluster.value() - 2) * self.sectors_per_cluster
    }

    #[must_use]
    #[inline]
    /// Returns the block of the first FAT holding the entry of `cluster`,
    /// and the byte offset of the entry within that block.
    pub const fn fat_position(&self, cluster: Cluster) -> (u32, usize) {
        let byte = cluster.value() as usize * 4;
        (
            self.fat_start + (byte / BLOCK_SIZE) as u32,
            byte % BLOCK_SIZE,
        )
    }
}

/// FS Information Sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsInfo {
    raw: Block,
}

impl FsInfo {
    const LEAD_SIGNATURE: u32 = 0x4161_5252;
    const STRUCT_SIGNATURE: u32 = 0x6141_7272;
    const TRAIL_SIGNATURE: u32 = 0xAA55_0000;

    const LEAD_OFFSET: usize = 0;
    const STRUCT_OFFSET: usize = 484;
    const FREE_COUNT_OFFSET: usize = 488;
    const NEXT_FREE_OFFSET: usize = 492;
    const TRAIL_OFFSET: usize = 508;

    /// Value of both counters when they are not known.
    pub const UNKNOWN: u32 = 0xFFFF_FFFF;

    #[must_use]
    /// Creates a signed sector with unknown counters.
    pub fn new() -> Self {
        let mut raw = [0; BLOCK_SIZE];
        write_u32(&mut raw, Self::LEAD_OFFSET, Self::LEAD_SIGNATURE);
        write_u32(&mut raw, Self::STRUCT_OFFSET, Self::STRUCT_SIGNATURE);
        write_u32(&mut raw, Self::FREE_COUNT_OFFSET, Self::UNKNOWN);
        write_u32(&mut raw, Self::NEXT_FREE_OFFSET, Self::UNKNOWN);
        write_u32(&mut raw, Self::TRAIL_OFFSET, Self::TRAIL_SIGNATURE);
        Self { raw }
    }

    #[must_use]
    #[inline]
    pub const fn from_block(block: &Block) -> Self {
        Self { raw: *block }
    }

    #[must_use]
    #[inline]
    pub const fn as_block(&self) -> &Block {
        &self.raw
    }

    #[must_use]
    /// Returns true if all three signatures are in place.
    pub const fn is_valid(&self) -> bool {
        read_u32(&self.raw, Self::LEAD_OFFSET) == Self::LEAD_SIGNATURE
            && read_u32(&self.raw, Self::STRUCT_OFFSET) == Self::STRUCT_SIGNATURE
            && read_u32(&self.raw, Self::TRAIL_OFFSET) == Self::TRAIL_SIGNATURE
    }

    #[must_use]
    #[inline]
    pub const fn free_count(&self) -> u32 {
        read_u32(&self.raw, Self::FREE_COUNT_OFFSET)
    }

    #[inline]
    pub fn set_free_count(&mut self, count: u32) {
        write_u32(&mut self.raw, Self::FREE_COUNT_OFFSET, count);
    }

    #[must_use]
    #[inline]
    pub const fn next_free(&self) -> u32 {
        read_u32(&self.raw, Self::NEXT_FREE_OFFSET)
    }

    #[inline]
    pub fn set_next_free(&mut self, cluster: u32) {
        write_u32(&mut self.raw, Self::NEXT_FREE_OFFSET, cluster);
    }
}

impl Default for FsInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory copy of the FSInfo sector, written back after every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsInfoCache {
    /// Absolute block of the sector.
    sector: u32,
    info: FsInfo,
}

impl FsInfoCache {
    #[must_use]
    /// Wraps a sector loaded from `sector`, forgetting counters that cannot
    /// belong to a volume of `cluster_count` clusters.
    pub fn new(sector: u32, mut info: FsInfo, cluster_count: u32) -> Self {
        if info.free_count() != FsInfo::UNKNOWN && info.free_count() > cluster_count {
            info.set_free_count(FsInfo::UNKNOWN);
        }
        if info.next_free() != FsInfo::UNKNOWN
            && (info.next_free() < 2 || info.next_free() - 2 >= cluster_count)
        {
            info.set_next_free(FsInfo::UNKNOWN);
        }
        Self { sector, info }
    }
}

impl CommitCache for FsInfoCache {
    fn free_count(&self) -> Option<u32> {
        Some(self.info.free_count()).filter(|&count| count != FsInfo::UNKNOWN)
    }

    fn next_free(&self) -> Option<Cluster> {
        Some(self.info.next_free())
            .filter(|&hint| hint != FsInfo::UNKNOWN)
            .map(Cluster::new)
    }

    fn record_allocation(&mut self, cluster: Cluster) {
        if let Some(count) = self.free_count() {
            self.info.set_free_count(count.saturating_sub(1));
        }
        self.info.set_next_free(cluster.value() + 1);
    }

    fn record_release(&mut self, count: u32, lowest: Cluster) {
        if let Some(free) = self.free_count() {
            self.info.set_free_count(free.saturating_add(count));
        }
        if self.info.next_free() > lowest.value() {
            self.info.set_next_free(lowest.value());
        }
    }

    fn commit<D: BlockDevice>(&mut self, device: &mut D) -> FatResult<()> {
        device.write_block(self.sector, self.info.as_block())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Boot sector of a 64 MiB volume with 512-byte clusters.
    fn boot_block() -> Block {
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0xEB;
        block[1] = 0x58;
        block[2] = 0x90;
        write_u16(&mut block, 11, 512);
        block[13] = 1;
        write_u16(&mut block, 14, 32);
        block[16] = 2;
        write_u32(&mut block, 32, 131_072);
        write_u32(&mut block, 36, 1_009);
        write_u32(&mut block, 44, 2);
        write_u16(&mut block, 48, 1);
        block[510] = 0x55;
        block[511] = 0xAA;
        block
    }

    fn mbr_block(partition_type: u8, start: u32) -> Block {
        let mut block = [0u8; BLOCK_SIZE];
        block[446] = 0x80;
        block[446 + 4] = partition_type;
        write_u32(&mut block, 446 + 8, start);
        write_u32(&mut block, 446 + 12, 131_072);
        block[510] = 0x55;
        block[511] = 0xAA;
        block
    }

    #[test]
    fn test_classify_sectors() {
        let boot = boot_block();
        assert!(is_boot_sector(&boot));
        assert!(!is_partition_table(&boot));

        let mbr = mbr_block(PartitionEntry::TYPE_FAT32_LBA, 2048);
        assert!(is_partition_table(&mbr));
        assert!(!is_boot_sector(&mbr));

        let blank = [0u8; BLOCK_SIZE];
        assert!(!is_boot_sector(&blank));
        assert!(!is_partition_table(&blank));
    }

    #[test]
    fn test_locate_volume() {
        assert_eq!(locate_volume(&boot_block()), Ok(0));
        assert_eq!(
            locate_volume(&mbr_block(PartitionEntry::TYPE_FAT32_CHS, 63)),
            Ok(63)
        );
        // FAT16 partition only
        assert_eq!(
            locate_volume(&mbr_block(0x06, 63)),
            Err(FatError::InvalidFormat)
        );
        // A partition starting at block 0 is never used
        assert_eq!(
            locate_volume(&mbr_block(PartitionEntry::TYPE_FAT32_LBA, 0)),
            Err(FatError::InvalidFormat)
        );
        assert_eq!(
            locate_volume(&[0u8; BLOCK_SIZE]),
            Err(FatError::InvalidFormat)
        );
    }

    #[test]
    fn test_locate_volume_skips_bad_boot_indicator() {
        let mut mbr = mbr_block(PartitionEntry::TYPE_FAT32_LBA, 2048);
        mbr[446] = 0x12;
        let second = 446 + 16;
        mbr[second + 4] = PartitionEntry::TYPE_FAT32_LBA;
        write_u32(&mut mbr, second + 8, 4096);
        assert_eq!(locate_volume(&mbr), Ok(4096));
    }

    #[test]
    fn test_boot_sector_with_table_noise() {
        // Boot code bytes landing in the partition type slot
        let mut block = boot_block();
        block[446 + 4] = 0x20;
        assert!(is_partition_table(&block));
        assert_eq!(locate_volume(&block), Ok(0));
    }

    #[test]
    fn test_parse_boot_sector() {
        let bs = BootSector::parse(&boot_block());
        assert_eq!(bs.bytes_per_sector(), 512);
        assert_eq!(bs.sectors_per_cluster(), 1);
        assert_eq!(bs.reserved_sectors(), 32);
        assert_eq!(bs.fat_count(), 2);
        assert_eq!(bs.total_sectors(), 131_072);
        assert_eq!(bs.sectors_per_fat(), 1_009);
        assert_eq!(bs.root_cluster(), 2);
        assert_eq!(bs.fs_info_sector(), 1);
        assert_eq!(bs.bytes_per_cluster(), 512);
        assert!(bs.validate());
    }

    #[test]
    fn test_boot_sector_validation() {
        let cases: [(usize, &[u8]); 8] = [
            // 1024-byte sectors
            (11, &[0x00, 0x04]),
            // 3 sectors per cluster
            (13, &[3]),
            // No reserved sectors
            (14, &[0, 0]),
            // Three FATs
            (16, &[3]),
            // FAT16 size field in use
            (22, &[0x10, 0]),
            // No total sectors
            (32, &[0, 0, 0, 0]),
            // No FAT32 size
            (36, &[0, 0, 0, 0]),
            // Missing signature
            (510, &[0, 0]),
        ];

        for (offset, bytes) in cases {
            let mut block = boot_block();
            block[offset..offset + bytes.len()].copy_from_slice(bytes);
            let bs = BootSector::parse(&block);
            assert!(!bs.validate(), "offset {offset} should be rejected");
            assert_eq!(Geometry::new(0, &bs), Err(FatError::InvalidFormat));
        }
    }

    #[test]
    fn test_geometry() {
        let bs = BootSector::parse(&boot_block());
        let geometry = Geometry::new(2048, &bs).unwrap();

        assert_eq!(geometry.volume_start(), 2048);
        assert_eq!(geometry.fat_start(), 2048 + 32);
        assert_eq!(geometry.first_data_sector(), 2048 + 32 + 2 * 1_009);
        assert_eq!(geometry.data_sectors(), 131_072 - 32 - 2 * 1_009);
        assert_eq!(geometry.cluster_count(), 131_072 - 32 - 2 * 1_009);
        assert_eq!(geometry.fs_info_sector(), 2049);
        assert_eq!(geometry.root_cluster(), Cluster::new(2));

        assert_eq!(
            geometry.cluster_to_sector(Cluster::new(2)),
            geometry.first_data_sector()
        );
        assert_eq!(
            geometry.cluster_to_sector(Cluster::new(10)),
            geometry.first_data_sector() + 8
        );
        assert_eq!(geometry.fat_position(Cluster::new(2)), (2048 + 32, 8));
        assert_eq!(geometry.fat_position(Cluster::new(128)), (2048 + 33, 0));
    }

    #[test]
    fn test_geometry_rejects_small_volumes() {
        let mut block = boot_block();
        // 8 sectors per cluster leaves ~16k clusters
        block[13] = 8;
        let bs = BootSector::parse(&block);
        assert!(bs.validate());
        assert_eq!(Geometry::new(0, &bs), Err(FatError::InvalidFormat));
    }

    #[test]
    fn test_geometry_clamps_to_fat_capacity() {
        let mut block = boot_block();
        // One FAT sector less than needed
        write_u32(&mut block, 36, 1_000);
        let bs = BootSector::parse(&block);
        let geometry = Geometry::new(0, &bs).unwrap();
        assert_eq!(geometry.cluster_count(), 1_000 * ENTRIES_PER_SECTOR - 2);
    }

    #[test]
    fn test_fs_info() {
        let mut info = FsInfo::new();
        assert!(info.is_valid());
        assert_eq!(info.free_count(), FsInfo::UNKNOWN);
        assert_eq!(info.next_free(), FsInfo::UNKNOWN);

        info.set_free_count(1234);
        info.set_next_free(7);
        let copy = FsInfo::from_block(info.as_block());
        assert_eq!(copy.free_count(), 1234);
        assert_eq!(copy.next_free(), 7);

        let mut raw = *info.as_block();
        raw[511] = 0;
        assert!(!FsInfo::from_block(&raw).is_valid());
        let mut raw = *info.as_block();
        raw[484] ^= 1;
        assert!(!FsInfo::from_block(&raw).is_valid());
        let mut raw = *info.as_block();
        raw[0] = 0;
        assert!(!FsInfo::from_block(&raw).is_valid());
    }

    #[test]
    fn test_fs_info_cache() {
        let mut info = FsInfo::new();
        info.set_free_count(100);
        info.set_next_free(10);
        let mut cache = FsInfoCache::new(1, info, 200);

        cache.record_allocation(Cluster::new(10));
        assert_eq!(cache.free_count(), Some(99));
        assert_eq!(cache.next_free(), Some(Cluster::new(11)));

        cache.record_release(3, Cluster::new(20));
        assert_eq!(cache.free_count(), Some(102));
        // Never raised by a release
        assert_eq!(cache.next_free(), Some(Cluster::new(11)));

        cache.record_release(1, Cluster::new(4));
        assert_eq!(cache.next_free(), Some(Cluster::new(4)));
    }

    #[test]
    fn test_fs_info_cache_unknown_counters() {
        let mut cache = FsInfoCache::new(1, FsInfo::new(), 200);
        assert_eq!(cache.free_count(), None);
        assert_eq!(cache.next_free(), None);

        cache.record_allocation(Cluster::new(2));
        assert_eq!(cache.free_count(), None);

        cache.record_release(5, Cluster::new(40));
        assert_eq!(cache.free_count(), None);
        assert_eq!(cache.next_free(), Some(Cluster::new(3)));

        let mut cache = FsInfoCache::new(1, FsInfo::new(), 200);
        cache.record_release(5, Cluster::new(40));
        assert_eq!(cache.next_free(), Some(Cluster::new(40)));

        // Out-of-range counters are dropped on load
        let mut info = FsInfo::new();
        info.set_free_count(500);
        info.set_next_free(1);
        let cache = FsInfoCache::new(1, info, 200);
        assert_eq!(cache.free_count(), None);
        assert_eq!(cache.next_free(), None);
    }
}
