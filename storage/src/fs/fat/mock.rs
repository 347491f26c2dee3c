//! In-memory FAT used by unit tests.
use super::{
    Cluster, FatError, FatResult,
    fat::{ClusterIo, FatEntries, FatEntry},
};
use alloc::{vec, vec::Vec};

/// Simple in-memory FAT and data region.
pub struct MockFat {
    /// Raw entries, indexed by cluster number
    pub entries: Vec<u32>,
    pub data: Vec<u8>,
    pub free_count: Option<u32>,
    pub next_free: Option<Cluster>,
    /// Number of allocator operations committed
    pub commits: usize,
    bytes_per_cluster: u32,
}

impl MockFat {
    pub fn new(cluster_count: u32, bytes_per_cluster: u32) -> Self {
        let mut entries = vec![0; cluster_count as usize + 2];
        entries[0] = 0x0FFF_FFF8;
        entries[1] = 0x0FFF_FFFF;
        Self {
            entries,
            data: vec![0; (cluster_count * bytes_per_cluster) as usize],
            free_count: None,
            next_free: None,
            commits: 0,
            bytes_per_cluster,
        }
    }

    /// Links `clusters` into a chain and returns its first cluster.
    pub fn create_chain(&mut self, clusters: &[u32]) -> Cluster {
        for pair in clusters.windows(2) {
            self.entries[pair[0] as usize] = pair[1];
        }
        if let Some(&last) = clusters.last() {
            self.entries[last as usize] = FatEntry::EndOfChain.to_raw();
        }
        Cluster::new(clusters.first().copied().unwrap_or(0))
    }

    fn data_range(&self, cluster: Cluster, offset: u32, len: usize) -> FatResult<usize> {
        if !self.contains(cluster) || offset as usize + len > self.bytes_per_cluster as usize {
            return Err(FatError::InvalidParameter);
        }
        Ok(((cluster.value() - 2) * self.bytes_per_cluster + offset) as usize)
    }
}

impl FatEntries for MockFat {
    fn cluster_count(&self) -> u32 {
        self.entries.len() as u32 - 2
    }

    fn read_entry(&mut self, cluster: Cluster) -> FatResult<u32> {
        if !self.contains(cluster) {
            return Err(FatError::InvalidParameter);
        }
        Ok(self.entries[cluster.value() as usize] & Cluster::MASK)
    }

    fn write_entry(&mut self, cluster: Cluster, value: u32) -> FatResult<()> {
        if !self.contains(cluster) {
            return Err(FatError::InvalidParameter);
        }
        let entry = &mut self.entries[cluster.value() as usize];
        *entry = (*entry & !Cluster::MASK) | (value & Cluster::MASK);
        Ok(())
    }

    fn next_free_hint(&self) -> Option<Cluster> {
        self.next_free
    }

    fn record_allocation(&mut self, cluster: Cluster) -> FatResult<()> {
        if let Some(count) = self.free_count.as_mut() {
            *count = count.saturating_sub(1);
        }
        self.next_free = Some(Cluster::new(cluster.value() + 1));
        self.commits += 1;
        Ok(())
    }

    fn record_release(&mut self, count: u32, lowest: Cluster) -> FatResult<()> {
        if let Some(free) = self.free_count.as_mut() {
            *free = free.saturating_add(count);
        }
        self.next_free = Some(self.next_free.map_or(lowest, |hint| hint.min(lowest)));
        self.commits += 1;
        Ok(())
    }
}

impl ClusterIo for MockFat {
    fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_cluster
    }

    fn read_cluster(&mut self, cluster: Cluster, offset: u32, dst: &mut [u8]) -> FatResult<()> {
        let start = self.data_range(cluster, offset, dst.len())?;
        dst.copy_from_slice(&self.data[start..start + dst.len()]);
        Ok(())
    }

    fn write_cluster(&mut self, cluster: Cluster, offset: u32, src: &[u8]) -> FatResult<()> {
        let start = self.data_range(cluster, offset, src.len())?;
        self.data[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn zero_cluster(&mut self, cluster: Cluster) -> FatResult<()> {
        let start = self.data_range(cluster, 0, 0)?;
        self.data[start..start + self.bytes_per_cluster as usize].fill(0);
        Ok(())
    }
}
