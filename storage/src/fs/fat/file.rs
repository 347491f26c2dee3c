use super::{
    Cluster, FatError, FatResult,
    dir::{DirectoryEntry, EntryLocation, MAX_DIR_SIZE},
    fat::{ClusterIo, FatEntries, FatEntry},
};
use log::debug;

/// File abstraction.
///
/// A position that is a non-zero multiple of the cluster size is held as the
/// end of the previous cluster, so that a file filling its last cluster exactly
/// does not need a successor until more data is written.
pub struct FatFile<T: FatEntries + ClusterIo> {
    /// The FAT entries.
    fat: T,
    /// First cluster of the file, 0 while nothing is allocated.
    first_cluster: Cluster,
    /// Current position within the file.
    position: u32,
    /// Size of the file in bytes.
    size: u32,
    /// Current cluster.
    current_cluster: Cluster,
    /// Offset within current cluster, up to and including the cluster size.
    cluster_offset: u32,
    /// Short entry describing the file, if any.
    entry: Option<EntryLocation>,
    is_directory: bool,
    /// The entry is behind the in-memory size or first cluster.
    dirty: bool,
}

impl<T: FatEntries + ClusterIo> FatFile<T> {
    /// Creates a file handle that is not tied to a directory entry.
    pub fn new(fat: T, first_cluster: Cluster, size: u32) -> FatResult<Self> {
        Self::with_entry(fat, first_cluster, size, None, false)
    }

    /// Creates a handle reading the raw contents of a directory.
    pub fn directory(fat: T, first_cluster: Cluster) -> FatResult<Self> {
        Self::with_entry(fat, first_cluster, 0, None, true)
    }

    /// Opens the file or directory described by `entry`.
    pub fn from_entry(fat: T, entry: &DirectoryEntry) -> FatResult<Self> {
        Self::with_entry(
            fat,
            entry.first_cluster(),
            entry.size(),
            Some(entry.location()),
            entry.is_directory(),
        )
    }

    fn with_entry(
        fat: T,
        first_cluster: Cluster,
        size: u32,
        entry: Option<EntryLocation>,
        is_directory: bool,
    ) -> FatResult<Self> {
        if first_cluster.value() != 0 && !fat.contains(first_cluster) {
            return Err(FatError::InvalidParameter);
        }
        // A directory always owns at least one cluster
        if is_directory && first_cluster.value() == 0 {
            return Err(FatError::InvalidFormat);
        }

        Ok(Self {
            fat,
            first_cluster,
            position: 0,
            size,
            current_cluster: first_cluster,
            cluster_offset: 0,
            entry,
            is_directory,
            dirty: false,
        })
    }

    #[must_use]
    #[inline]
    /// Returns the current position within the file
    pub const fn position(&self) -> u32 {
        self.position
    }

    #[must_use]
    #[inline]
    /// Returns the size of the file in bytes
    pub const fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    #[inline]
    /// Returns the first cluster of the file, 0 if it has none
    pub const fn first_cluster(&self) -> Cluster {
        self.first_cluster
    }

    #[must_use]
    #[inline]
    pub const fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// Splits a non-zero position into a chain index and an offset in `1..=bytes_per_cluster`.
    fn split(&self, position: u32) -> (u32, u32) {
        let bytes_per_cluster = self.fat.bytes_per_cluster();
        if position == 0 {
            return (0, 0);
        }
        let index = (position - 1) / bytes_per_cluster;
        (index, position - index * bytes_per_cluster)
    }

    /// Seeks to a position in the file
    ///
    /// The target is found by walking the chain from the first cluster.
    /// Seeking past the end of a file, or past the allocated chain, fails with
    /// `InvalidPosition`; files only grow through `write`.
    pub fn seek(&mut self, position: u32) -> FatResult<u32> {
        if !self.is_directory && position > self.size {
            return Err(FatError::InvalidPosition);
        }

        if self.first_cluster.value() == 0 {
            if position != 0 {
                return Err(FatError::InvalidPosition);
            }
        } else {
            let (index, offset) = self.split(position);
            self.current_cluster = self.fat.walk(self.first_cluster, index)?;
            self.cluster_offset = offset;
        }
        self.position = position;

        Ok(self.position)
    }

    /// Reads data from the file into the provided buffer
    ///
    /// Returns 0 at the end of the file. A directory chain longer than the
    /// largest possible directory fails with `InvalidFormat`.
    pub fn read(&mut self, buffer: &mut [u8]) -> FatResult<usize> {
        let limit = if self.is_directory {
            MAX_DIR_SIZE
        } else {
            self.size
        };
        if self.first_cluster.value() == 0 {
            return Ok(0);
        }
        if self.position >= limit {
            if self.is_directory
                && self.cluster_offset >= self.fat.bytes_per_cluster()
                && self.fat.next_link(self.current_cluster)?.is_some()
            {
                return Err(FatError::InvalidFormat);
            }
            return Ok(0);
        }

        let available = usize::try_from(limit - self.position).unwrap_or(usize::MAX);
        let bytes_to_read = buffer.len().min(available);
        let bytes_per_cluster = self.fat.bytes_per_cluster();
        let mut bytes_read = 0;

        while bytes_read < bytes_to_read {
            // Move to the next cluster if necessary
            if self.cluster_offset >= bytes_per_cluster {
                match self.fat.next_link(self.current_cluster)? {
                    Some(next) => {
                        self.current_cluster = next;
                        self.cluster_offset = 0;
                    }
                    // End of chain reached
                    None => break,
                }
            }

            // Calculate how many bytes we can read from the current cluster
            let cluster_remaining = (bytes_per_cluster - self.cluster_offset) as usize;
            let chunk_size = (bytes_to_read - bytes_read).min(cluster_remaining);

            self.fat.read_cluster(
                self.current_cluster,
                self.cluster_offset,
                &mut buffer[bytes_read..bytes_read + chunk_size],
            )?;

            bytes_read += chunk_size;
            // Bounded by the cluster size
            self.position += chunk_size as u32;
            self.cluster_offset += chunk_size as u32;
        }

        Ok(bytes_read)
    }

    /// Writes data to the file from the provided buffer
    ///
    /// The chain is extended as needed and the directory entry is updated
    /// before returning, even if the write failed halfway.
    pub fn write(&mut self, buffer: &[u8]) -> FatResult<usize> {
        if self.is_directory {
            return Err(FatError::IsADirectory);
        }
        if buffer.is_empty() {
            return Ok(0);
        }
        // File sizes are 32-bit
        u32::try_from(buffer.len())
            .ok()
            .and_then(|len| self.position.checked_add(len))
            .ok_or(FatError::InvalidParameter)?;

        let outcome = self.write_chunks(buffer);
        let flushed = self.flush();
        let written = outcome?;
        flushed?;
        Ok(written)
    }

    fn write_chunks(&mut self, buffer: &[u8]) -> FatResult<usize> {
        let bytes_per_cluster = self.fat.bytes_per_cluster();

        // Ensure we have a valid starting cluster
        if self.first_cluster.value() == 0 {
            self.first_cluster = self.fat.allocate_chain()?;
            self.current_cluster = self.first_cluster;
            self.cluster_offset = 0;
            self.dirty = true;
        }

        let mut bytes_written = 0;
        while bytes_written < buffer.len() {
            // Move to the next cluster, allocating it at the end of the chain
            if self.cluster_offset >= bytes_per_cluster {
                self.current_cluster = match self.fat.next_link(self.current_cluster)? {
                    Some(next) => next,
                    None => self.fat.extend_chain(self.current_cluster)?,
                };
                self.cluster_offset = 0;
            }

            let cluster_remaining = (bytes_per_cluster - self.cluster_offset) as usize;
            let chunk_size = (buffer.len() - bytes_written).min(cluster_remaining);

            self.fat.write_cluster(
                self.current_cluster,
                self.cluster_offset,
                &buffer[bytes_written..bytes_written + chunk_size],
            )?;

            bytes_written += chunk_size;
            self.position += chunk_size as u32;
            self.cluster_offset += chunk_size as u32;

            if self.position > self.size {
                self.size = self.position;
                self.dirty = true;
            }
        }

        Ok(bytes_written)
    }

    /// Cuts the file at the current position, releasing the clusters past it.
    pub fn truncate(&mut self) -> FatResult<()> {
        if self.is_directory {
            return Err(FatError::IsADirectory);
        }

        if self.first_cluster.value() != 0 {
            if self.position == 0 {
                // Free all clusters
                let first = self.first_cluster;
                self.first_cluster = Cluster::new(0);
                self.current_cluster = Cluster::new(0);
                self.cluster_offset = 0;
                self.dirty = true;
                self.fat.release_chain(first)?;
            } else if let Some(next) = self.fat.next_link(self.current_cluster)? {
                self.fat.set(self.current_cluster, FatEntry::EndOfChain)?;
                self.fat.release_chain(next)?;
            }
        }

        if self.size != self.position {
            debug!("truncated file from {} to {} bytes", self.size, self.position);
            self.size = self.position;
            self.dirty = true;
        }
        self.flush()
    }

    /// Writes the size and first cluster back to the directory entry.
    pub fn flush(&mut self) -> FatResult<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(location) = self.entry {
            let mut entry = location.load(&mut self.fat)?;
            entry.set_file_size(self.size);
            entry.set_first_cluster(self.first_cluster);
            location.store(&mut self.fat, &entry)?;
        }
        self.dirty = false;
        Ok(())
    }

    /// Flushes pending entry updates and releases the handle.
    pub fn close(mut self) -> FatResult<T> {
        self.flush()?;
        Ok(self.fat)
    }
}
