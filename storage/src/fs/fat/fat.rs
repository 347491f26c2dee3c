use super::{
    Cluster, FatError, FatResult,
    bs::{FsInfoCache, Geometry, read_u32, write_u32},
};
use crate::{BLOCK_SIZE, Block, BlockDevice};
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// FAT32 table entry
pub enum FatEntry {
    /// Free cluster
    Free,
    /// Used cluster, pointing to the next cluster in the chain
    Next(Cluster),
    /// Last cluster in the chain
    EndOfChain,
    /// Bad cluster
    Bad,
    /// Reserved cluster
    Reserved,
}

impl FatEntry {
    #[must_use]
    /// Decodes a masked 28-bit entry value.
    pub const fn from_raw(value: u32) -> Self {
        match value & Cluster::MASK {
            0 => Self::Free,
            0x0FFF_FFF7 => Self::Bad,
            0x0FFF_FFF8..=0x0FFF_FFFF => Self::EndOfChain,
            1 | 0x0FFF_FFF0..=0x0FFF_FFF6 => Self::Reserved,
            val => Self::Next(Cluster::new(val)),
        }
    }

    #[must_use]
    /// Encodes the entry as its 28-bit on-disk value.
    pub const fn to_raw(self) -> u32 {
        match self {
            Self::Free => 0,
            Self::Next(next) => next.value() & Cluster::MASK,
            Self::EndOfChain => 0x0FFF_FFFF,
            Self::Bad => 0x0FFF_FFF7,
            Self::Reserved => 0x0FFF_FFF6,
        }
    }
}

/// Free-space bookkeeping updated by the allocator.
///
/// Updates are applied to the in-memory copy first and then handed to
/// `commit`, one call per allocator operation.
pub trait CommitCache {
    /// Returns the number of free clusters, if known.
    fn free_count(&self) -> Option<u32>;
    /// Returns the cluster where the next free-cluster scan should start, if known.
    fn next_free(&self) -> Option<Cluster>;
    /// Records that `cluster` went from free to used.
    fn record_allocation(&mut self, cluster: Cluster);
    /// Records that `count` clusters were freed, the lowest of them being `lowest`.
    fn record_release(&mut self, count: u32, lowest: Cluster);
    /// Persists the cache.
    fn commit<D: BlockDevice>(&mut self, device: &mut D) -> FatResult<()>;
}

/// Byte access to the data region, one cluster at a time.
pub trait ClusterIo {
    #[must_use]
    fn bytes_per_cluster(&self) -> u32;

    /// Reads `dst.len()` bytes starting `offset` bytes into `cluster`.
    ///
    /// The range must fit inside the cluster.
    fn read_cluster(&mut self, cluster: Cluster, offset: u32, dst: &mut [u8]) -> FatResult<()>;

    /// Writes `src` starting `offset` bytes into `cluster`.
    ///
    /// The range must fit inside the cluster.
    fn write_cluster(&mut self, cluster: Cluster, offset: u32, src: &[u8]) -> FatResult<()>;

    /// Fills `cluster` with zeroes.
    fn zero_cluster(&mut self, cluster: Cluster) -> FatResult<()>;
}

/// Collection of FAT entries, with the cluster allocator built on top of it.
pub trait FatEntries {
    #[must_use]
    /// Returns the number of data clusters, numbered from 2.
    fn cluster_count(&self) -> u32;

    /// Returns the 28-bit entry value for the given cluster.
    fn read_entry(&mut self, cluster: Cluster) -> FatResult<u32>;

    /// Sets the 28-bit entry value for the given cluster, keeping the 4 reserved high bits.
    fn write_entry(&mut self, cluster: Cluster, value: u32) -> FatResult<()>;

    #[must_use]
    /// Returns the cluster where free-cluster scans start, if known.
    fn next_free_hint(&self) -> Option<Cluster>;

    /// Records and persists the allocation of `cluster`.
    fn record_allocation(&mut self, cluster: Cluster) -> FatResult<()>;

    /// Records and persists the release of `count` clusters.
    fn record_release(&mut self, count: u32, lowest: Cluster) -> FatResult<()>;

    #[must_use]
    #[inline]
    /// Returns true if `cluster` is a data cluster of this table.
    fn contains(&self, cluster: Cluster) -> bool {
        cluster.value() >= 2 && cluster.value() - 2 < self.cluster_count()
    }

    /// Returns the entry for the given cluster
    fn get(&mut self, cluster: Cluster) -> FatResult<FatEntry> {
        self.read_entry(cluster).map(FatEntry::from_raw)
    }

    /// Sets the entry for the given cluster
    fn set(&mut self, cluster: Cluster, entry: FatEntry) -> FatResult<()> {
        self.write_entry(cluster, entry.to_raw())
    }

    /// Returns the cluster following `cluster` in its chain, or `None` at the end of the chain.
    ///
    /// Links to free, bad, reserved or out-of-range clusters are reported as a corrupt volume.
    fn next_link(&mut self, cluster: Cluster) -> FatResult<Option<Cluster>> {
        match self.get(cluster)? {
            FatEntry::Next(next) if self.contains(next) => Ok(Some(next)),
            FatEntry::EndOfChain => Ok(None),
            _ => Err(FatError::InvalidFormat),
        }
    }

    /// Finds the first free cluster at or after the scan hint.
    ///
    /// The scan never wraps around below the hint.
    fn find_free_cluster(&mut self) -> FatResult<Cluster> {
        let end = self.cluster_count() + 2;
        let start = self
            .next_free_hint()
            .filter(|&hint| self.contains(hint))
            .map_or(2, |hint| hint.value());

        for index in start..end {
            let cluster = Cluster::new(index);
            if self.read_entry(cluster)? == 0 {
                return Ok(cluster);
            }
        }

        Err(FatError::DiskFull)
    }

    /// Allocates a one-cluster chain and returns its cluster.
    fn allocate_chain(&mut self) -> FatResult<Cluster> {
        let cluster = self.find_free_cluster()?;
        self.set(cluster, FatEntry::EndOfChain)?;
        self.record_allocation(cluster)?;
        debug!("allocated cluster {}", cluster.value());
        Ok(cluster)
    }

    /// Appends a free cluster to the chain whose last cluster is `tail`.
    fn extend_chain(&mut self, tail: Cluster) -> FatResult<Cluster> {
        if self.get(tail)? != FatEntry::EndOfChain {
            return Err(FatError::InvalidParameter);
        }

        let cluster = self.find_free_cluster()?;
        self.set(tail, FatEntry::Next(cluster))?;
        self.set(cluster, FatEntry::EndOfChain)?;
        self.record_allocation(cluster)?;
        debug!(
            "extended chain at cluster {} with cluster {}",
            tail.value(),
            cluster.value()
        );
        Ok(cluster)
    }

    /// Frees every cluster of the chain starting at `start` and returns how many were freed.
    ///
    /// Clusters freed before a corrupt link is met stay freed and are accounted for.
    fn release_chain(&mut self, start: Cluster) -> FatResult<u32> {
        if !self.contains(start) {
            return Err(FatError::InvalidParameter);
        }

        let mut freed = 0_u32;
        let mut lowest = start;
        let mut current = start;
        let outcome = loop {
            if freed >= self.cluster_count() {
                break Err(FatError::InvalidFormat);
            }
            let next = match self.next_link(current) {
                Ok(next) => next,
                Err(error) => break Err(error),
            };
            if let Err(error) = self.set(current, FatEntry::Free) {
                break Err(error);
            }
            freed += 1;
            lowest = lowest.min(current);
            match next {
                Some(next) => current = next,
                None => break Ok(()),
            }
        };

        if freed > 0 {
            self.record_release(freed, lowest)?;
            debug!(
                "released {freed} clusters from cluster {}, lowest {}",
                start.value(),
                lowest.value()
            );
        }
        outcome.map(|()| freed)
    }

    /// Follows `n` links from `start`.
    ///
    /// Fails with `InvalidPosition` instead of stepping past the end of the chain.
    fn walk(&mut self, start: Cluster, n: u32) -> FatResult<Cluster> {
        let mut current = start;
        for _ in 0..n {
            current = self
                .next_link(current)?
                .ok_or(FatError::InvalidPosition)?;
        }
        Ok(current)
    }

    /// Returns an iterator over all clusters in a chain starting from the given cluster
    fn chain_iter(&mut self, start: Cluster) -> FatChainIter<'_, Self>
    where
        Self: Sized,
    {
        let remaining = self.cluster_count();
        FatChainIter {
            fat: self,
            next: Some(start),
            remaining,
        }
    }
}

/// Iterator over a chain of clusters
pub struct FatChainIter<'a, T: FatEntries> {
    fat: &'a mut T,
    next: Option<Cluster>,
    remaining: u32,
}

impl<T: FatEntries> Iterator for FatChainIter<'_, T> {
    type Item = FatResult<Cluster>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;

        // A chain cannot be longer than the volume
        if self.remaining == 0 {
            return Some(Err(FatError::InvalidFormat));
        }
        self.remaining -= 1;

        match self.fat.next_link(current) {
            Ok(next) => {
                self.next = next;
                Some(Ok(current))
            }
            Err(error) => Some(Err(error)),
        }
    }
}

impl<T: FatEntries + ?Sized> FatEntries for &mut T {
    #[inline]
    fn cluster_count(&self) -> u32 {
        (**self).cluster_count()
    }

    #[inline]
    fn read_entry(&mut self, cluster: Cluster) -> FatResult<u32> {
        (**self).read_entry(cluster)
    }

    #[inline]
    fn write_entry(&mut self, cluster: Cluster, value: u32) -> FatResult<()> {
        (**self).write_entry(cluster, value)
    }

    #[inline]
    fn next_free_hint(&self) -> Option<Cluster> {
        (**self).next_free_hint()
    }

    #[inline]
    fn record_allocation(&mut self, cluster: Cluster) -> FatResult<()> {
        (**self).record_allocation(cluster)
    }

    #[inline]
    fn record_release(&mut self, count: u32, lowest: Cluster) -> FatResult<()> {
        (**self).record_release(count, lowest)
    }
}

impl<T: ClusterIo + ?Sized> ClusterIo for &mut T {
    #[inline]
    fn bytes_per_cluster(&self) -> u32 {
        (**self).bytes_per_cluster()
    }

    #[inline]
    fn read_cluster(&mut self, cluster: Cluster, offset: u32, dst: &mut [u8]) -> FatResult<()> {
        (**self).read_cluster(cluster, offset, dst)
    }

    #[inline]
    fn write_cluster(&mut self, cluster: Cluster, offset: u32, src: &[u8]) -> FatResult<()> {
        (**self).write_cluster(cluster, offset, src)
    }

    #[inline]
    fn zero_cluster(&mut self, cluster: Cluster) -> FatResult<()> {
        (**self).zero_cluster(cluster)
    }
}

/// FAT and data region of a mounted volume.
///
/// All sector traffic goes through a single working buffer owned by the table.
/// FAT updates are written to every FAT copy.
pub struct FatTable<'a, D: BlockDevice, C: CommitCache = FsInfoCache> {
    device: &'a mut D,
    geometry: &'a Geometry,
    cache: &'a mut C,
    buffer: Block,
    /// Block currently held in `buffer`.
    buffered: Option<u32>,
}

impl<'a, D: BlockDevice, C: CommitCache> FatTable<'a, D, C> {
    #[must_use]
    #[inline]
    pub const fn new(device: &'a mut D, geometry: &'a Geometry, cache: &'a mut C) -> Self {
        Self {
            device,
            geometry,
            cache,
            buffer: [0; BLOCK_SIZE],
            buffered: None,
        }
    }

    #[must_use]
    #[inline]
    pub const fn geometry(&self) -> &Geometry {
        self.geometry
    }

    #[must_use]
    #[inline]
    /// Returns the number of free clusters, if known.
    pub fn free_count(&self) -> Option<u32> {
        self.cache.free_count()
    }

    /// Loads `sector` into the working buffer, unless it is already there.
    fn load(&mut self, sector: u32) -> FatResult<()> {
        if self.buffered != Some(sector) {
            self.buffered = None;
            self.device.read_block(sector, &mut self.buffer)?;
            self.buffered = Some(sector);
        }
        Ok(())
    }

    /// Writes the working buffer to `sector` and keeps it as the buffered block.
    fn store(&mut self, sector: u32) -> FatResult<()> {
        self.buffered = None;
        self.device.write_block(sector, &self.buffer)?;
        self.buffered = Some(sector);
        Ok(())
    }

    fn commit(&mut self) -> FatResult<()> {
        self.buffered = None;
        self.cache.commit(&mut *self.device)
    }

    /// Checks that `cluster` is a data cluster and that `len` bytes at `offset` fit inside it.
    fn check_range(&self, cluster: Cluster, offset: u32, len: usize) -> FatResult<()> {
        let end = usize::try_from(offset)
            .ok()
            .and_then(|offset| offset.checked_add(len));
        match end {
            Some(end)
                if self.contains(cluster)
                    && end <= self.geometry.bytes_per_cluster() as usize =>
            {
                Ok(())
            }
            _ => Err(FatError::InvalidParameter),
        }
    }
}

impl<D: BlockDevice, C: CommitCache> FatEntries for FatTable<'_, D, C> {
    #[inline]
    fn cluster_count(&self) -> u32 {
        self.geometry.cluster_count()
    }

    fn read_entry(&mut self, cluster: Cluster) -> FatResult<u32> {
        if !self.contains(cluster) {
            return Err(FatError::InvalidParameter);
        }

        let (sector, offset) = self.geometry.fat_position(cluster);
        self.load(sector)?;
        Ok(read_u32(&self.buffer, offset) & Cluster::MASK)
    }

    fn write_entry(&mut self, cluster: Cluster, value: u32) -> FatResult<()> {
        if !self.contains(cluster) {
            return Err(FatError::InvalidParameter);
        }

        let (sector, offset) = self.geometry.fat_position(cluster);
        self.load(sector)?;
        let old = read_u32(&self.buffer, offset);
        write_u32(
            &mut self.buffer,
            offset,
            (old & !Cluster::MASK) | (value & Cluster::MASK),
        );

        for copy in 0..self.geometry.fat_count() {
            self.store(sector + copy * self.geometry.fat_size())?;
        }
        // The buffer still mirrors the first FAT
        self.buffered = Some(sector);
        Ok(())
    }

    #[inline]
    fn next_free_hint(&self) -> Option<Cluster> {
        self.cache.next_free()
    }

    fn record_allocation(&mut self, cluster: Cluster) -> FatResult<()> {
        self.cache.record_allocation(cluster);
        self.commit()
    }

    fn record_release(&mut self, count: u32, lowest: Cluster) -> FatResult<()> {
        self.cache.record_release(count, lowest);
        self.commit()
    }
}

impl<D: BlockDevice, C: CommitCache> ClusterIo for FatTable<'_, D, C> {
    #[inline]
    fn bytes_per_cluster(&self) -> u32 {
        self.geometry.bytes_per_cluster()
    }

    fn read_cluster(&mut self, cluster: Cluster, offset: u32, dst: &mut [u8]) -> FatResult<()> {
        self.check_range(cluster, offset, dst.len())?;

        let first = self.geometry.cluster_to_sector(cluster);
        let mut offset = offset as usize;
        let mut done = 0;
        while done < dst.len() {
            let sector = first + (offset / BLOCK_SIZE) as u32;
            let in_sector = offset % BLOCK_SIZE;
            let chunk = (dst.len() - done).min(BLOCK_SIZE - in_sector);

            self.load(sector)?;
            dst[done..done + chunk].copy_from_slice(&self.buffer[in_sector..in_sector + chunk]);

            done += chunk;
            offset += chunk;
        }
        Ok(())
    }

    fn write_cluster(&mut self, cluster: Cluster, offset: u32, src: &[u8]) -> FatResult<()> {
        self.check_range(cluster, offset, src.len())?;

        let first = self.geometry.cluster_to_sector(cluster);
        let mut offset = offset as usize;
        let mut done = 0;
        while done < src.len() {
            let sector = first + (offset / BLOCK_SIZE) as u32;
            let in_sector = offset % BLOCK_SIZE;
            let chunk = (src.len() - done).min(BLOCK_SIZE - in_sector);

            // Whole sectors are overwritten without reading them first
            if chunk == BLOCK_SIZE {
                self.buffered = None;
            } else {
                self.load(sector)?;
            }
            self.buffer[in_sector..in_sector + chunk].copy_from_slice(&src[done..done + chunk]);
            self.store(sector)?;

            done += chunk;
            offset += chunk;
        }
        Ok(())
    }

    fn zero_cluster(&mut self, cluster: Cluster) -> FatResult<()> {
        self.check_range(cluster, 0, 0)?;

        let first = self.geometry.cluster_to_sector(cluster);
        self.buffer = [0; BLOCK_SIZE];
        for sector in first..first + self.geometry.sectors_per_cluster() {
            self.store(sector)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fat::mock::MockFat;

    #[test]
    fn test_entry_encoding() {
        assert_eq!(FatEntry::from_raw(0), FatEntry::Free);
        assert_eq!(FatEntry::from_raw(1), FatEntry::Reserved);
        assert_eq!(FatEntry::from_raw(5), FatEntry::Next(Cluster::new(5)));
        assert_eq!(FatEntry::from_raw(0x0FFF_FFF7), FatEntry::Bad);
        assert_eq!(FatEntry::from_raw(0x0FFF_FFF8), FatEntry::EndOfChain);
        assert_eq!(FatEntry::from_raw(0x0FFF_FFFF), FatEntry::EndOfChain);
        assert_eq!(FatEntry::from_raw(0x0FFF_FFF0), FatEntry::Reserved);
        // The high nibble is not part of the entry
        assert_eq!(FatEntry::from_raw(0xF000_0000), FatEntry::Free);
        assert_eq!(FatEntry::from_raw(0xFFFF_FFFF), FatEntry::EndOfChain);

        assert_eq!(FatEntry::EndOfChain.to_raw(), 0x0FFF_FFFF);
        assert_eq!(FatEntry::Next(Cluster::new(42)).to_raw(), 42);
        assert_eq!(FatEntry::Free.to_raw(), 0);
    }

    #[test]
    fn test_find_free_cluster() {
        let mut fat = MockFat::new(16, 512);
        assert_eq!(fat.find_free_cluster(), Ok(Cluster::new(2)));

        fat.set(Cluster::new(2), FatEntry::EndOfChain).unwrap();
        fat.set(Cluster::new(3), FatEntry::Bad).unwrap();
        assert_eq!(fat.find_free_cluster(), Ok(Cluster::new(4)));

        // Starts at the hint, without looking back
        fat.next_free = Some(Cluster::new(10));
        assert_eq!(fat.find_free_cluster(), Ok(Cluster::new(10)));

        // Out-of-range hints are ignored
        fat.next_free = Some(Cluster::new(100));
        assert_eq!(fat.find_free_cluster(), Ok(Cluster::new(4)));
    }

    #[test]
    fn test_find_free_cluster_disk_full() {
        let mut fat = MockFat::new(8, 512);
        for index in 2..10 {
            fat.set(Cluster::new(index), FatEntry::EndOfChain).unwrap();
        }
        assert_eq!(fat.find_free_cluster(), Err(FatError::DiskFull));

        fat.set(Cluster::new(3), FatEntry::Free).unwrap();
        fat.next_free = Some(Cluster::new(5));
        // Free cluster sits below the hint
        assert_eq!(fat.find_free_cluster(), Err(FatError::DiskFull));
        fat.next_free = None;
        assert_eq!(fat.find_free_cluster(), Ok(Cluster::new(3)));
    }

    #[test]
    fn test_extend_and_release() {
        let mut fat = MockFat::new(64, 512);
        fat.free_count = Some(64);

        let head = fat.allocate_chain().unwrap();
        let second = fat.extend_chain(head).unwrap();
        let third = fat.extend_chain(second).unwrap();
        assert_eq!(fat.free_count, Some(61));
        assert_eq!(fat.get(head), Ok(FatEntry::Next(second)));
        assert_eq!(fat.get(second), Ok(FatEntry::Next(third)));
        assert_eq!(fat.get(third), Ok(FatEntry::EndOfChain));
        assert_eq!(fat.commits, 3);

        let chain: Vec<_> = fat.chain_iter(head).collect::<FatResult<_>>().unwrap();
        assert_eq!(chain, [head, second, third]);

        assert_eq!(fat.release_chain(head), Ok(3));
        assert_eq!(fat.free_count, Some(64));
        assert!(fat.next_free.unwrap() <= head);
        assert_eq!(fat.commits, 4);
        for cluster in chain {
            assert_eq!(fat.get(cluster), Ok(FatEntry::Free));
        }
    }

    #[test]
    fn test_extend_requires_tail() {
        let mut fat = MockFat::new(16, 512);
        let head = fat.create_chain(&[2, 3]);
        assert_eq!(fat.extend_chain(head), Err(FatError::InvalidParameter));
        assert_eq!(fat.extend_chain(Cluster::new(9)), Err(FatError::InvalidParameter));
    }

    #[test]
    fn test_release_invalid_start() {
        let mut fat = MockFat::new(16, 512);
        assert_eq!(
            fat.release_chain(Cluster::new(0)),
            Err(FatError::InvalidParameter)
        );
        assert_eq!(
            fat.release_chain(Cluster::new(1)),
            Err(FatError::InvalidParameter)
        );
        assert_eq!(fat.commits, 0);
    }

    #[test]
    fn test_release_corrupt_chain() {
        let mut fat = MockFat::new(16, 512);
        fat.free_count = Some(10);
        let head = fat.create_chain(&[4, 5]);
        // 5 points to a free cluster
        fat.set(Cluster::new(5), FatEntry::Next(Cluster::new(9))).unwrap();

        assert_eq!(fat.release_chain(head), Err(FatError::InvalidFormat));
        assert_eq!(fat.get(Cluster::new(4)), Ok(FatEntry::Free));
        assert_eq!(fat.get(Cluster::new(5)), Ok(FatEntry::Free));
        assert_eq!(fat.free_count, Some(12));
        assert_eq!(fat.next_free, Some(Cluster::new(4)));
    }

    #[test]
    fn test_release_cycle() {
        let mut fat = MockFat::new(4, 512);
        let head = fat.create_chain(&[2, 3]);
        fat.set(Cluster::new(3), FatEntry::Next(head)).unwrap();
        assert!(fat.release_chain(head).is_err());
    }

    #[test]
    fn test_walk() {
        let mut fat = MockFat::new(16, 512);
        let head = fat.create_chain(&[2, 7, 4]);

        assert_eq!(fat.walk(head, 0), Ok(Cluster::new(2)));
        assert_eq!(fat.walk(head, 1), Ok(Cluster::new(7)));
        assert_eq!(fat.walk(head, 2), Ok(Cluster::new(4)));
        assert_eq!(fat.walk(head, 2), Ok(Cluster::new(4)));
        assert_eq!(fat.walk(head, 3), Err(FatError::InvalidPosition));
        assert_eq!(fat.walk(Cluster::new(1), 1), Err(FatError::InvalidParameter));
        assert_eq!(fat.commits, 0);
    }

    #[test]
    fn test_write_entry_keeps_high_bits() {
        let mut fat = MockFat::new(16, 512);
        fat.entries[5] = 0xA000_0000;
        fat.set(Cluster::new(5), FatEntry::EndOfChain).unwrap();
        assert_eq!(fat.entries[5], 0xAFFF_FFFF);
        assert_eq!(fat.read_entry(Cluster::new(5)), Ok(0x0FFF_FFFF));
    }
}
