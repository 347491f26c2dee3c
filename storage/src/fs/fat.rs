//! File Allocation Table (FAT32) file system implementation.
use super::{FileMetadata, FileType, Path};
use crate::{BLOCK_SIZE, Block, BlockDevice, BlockDeviceError};
use alloc::vec::Vec;
use bs::{BootSector, FsInfo, FsInfoCache, Geometry};
use dir::{Directory, DirectoryEntry};
use dirent::{Attributes, DirEntry, validate_name};
use fat::{ClusterIo, FatEntries, FatTable};
use file::FatFile;
use thiserror::Error;

pub mod bs;
pub mod dir;
pub mod dirent;
#[expect(clippy::module_inception, reason = "FS is named after this table")]
pub mod fat;
pub mod file;
#[cfg(test)]
pub(crate) mod mock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cluster(u32);

impl Cluster {
    /// Significant bits of a FAT32 entry
    pub const MASK: u32 = 0x0FFF_FFFF;

    #[must_use]
    #[inline]
    pub const fn new(cluster: u32) -> Self {
        Self(cluster)
    }

    #[must_use]
    #[inline]
    pub const fn value(&self) -> u32 {
        self.0
    }

    #[must_use]
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.0 >= 2 && self.0 <= 0x0FFF_FFF6
    }

    #[must_use]
    #[inline]
    pub const fn is_end_of_chain(&self) -> bool {
        self.0 >= 0x0FFF_FFF8 && self.0 <= 0x0FFF_FFFF
    }

    #[must_use]
    #[inline]
    pub const fn is_bad(&self) -> bool {
        self.0 == 0x0FFF_FFF7
    }

    #[must_use]
    #[inline]
    pub const fn is_free(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    #[inline]
    pub const fn is_reserved(&self) -> bool {
        self.0 == 1 || self.0 == 0x0FFF_FFF0 || self.0 == 0x0FFF_FFF6
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
/// Error type for FAT filesystem operations
pub enum FatError {
    #[error("No card")]
    NoCard,
    #[error("Invalid format")]
    InvalidFormat,
    #[error("Invalid parameter")]
    InvalidParameter,
    #[error("Invalid position")]
    InvalidPosition,
    #[error("Disk full")]
    DiskFull,
    #[error("Already exists")]
    AlreadyExists,
    #[error("Not found")]
    NotFound,
    #[error("Directory not empty")]
    NotEmpty,
    #[error("Read failed")]
    ReadFailed,
    #[error("Write failed")]
    WriteFailed,
    #[error("Invalid path")]
    InvalidPath,
    #[error("Not a directory")]
    NotADirectory,
    #[error("Is a directory")]
    IsADirectory,
}

impl FatError {
    #[must_use]
    /// Returns the message displayed for this error.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoCard => "No card",
            Self::InvalidFormat => "Invalid format",
            Self::InvalidParameter => "Invalid parameter",
            Self::InvalidPosition => "Invalid position",
            Self::DiskFull => "Disk full",
            Self::AlreadyExists => "Already exists",
            Self::NotFound => "Not found",
            Self::NotEmpty => "Directory not empty",
            Self::ReadFailed => "Read failed",
            Self::WriteFailed => "Write failed",
            Self::InvalidPath => "Invalid path",
            Self::NotADirectory => "Not a directory",
            Self::IsADirectory => "Is a directory",
        }
    }
}

impl From<BlockDeviceError> for FatError {
    fn from(error: BlockDeviceError) -> Self {
        match error {
            BlockDeviceError::Read => Self::ReadFailed,
            BlockDeviceError::Write => Self::WriteFailed,
            BlockDeviceError::NoCard => Self::NoCard,
        }
    }
}

pub type FatResult<T> = Result<T, FatError>;

/// Open file on a mounted volume.
pub type File<'a, D> = FatFile<FatTable<'a, D>>;
/// Open directory on a mounted volume.
pub type Dir<'a, D> = Directory<FatTable<'a, D>>;

/// Derived state of a mounted volume.
struct Volume {
    geometry: Geometry,
    fs_info: FsInfoCache,
    /// First cluster of the working directory
    cwd: Cluster,
}

impl Volume {
    /// Locates, validates and loads the volume found on `device`.
    fn load<D: BlockDevice>(device: &mut D) -> FatResult<Self> {
        device.init()?;

        let mut block: Block = [0; BLOCK_SIZE];
        device.read_block(0, &mut block)?;
        let volume_start = bs::locate_volume(&block)?;
        if volume_start != 0 {
            device.read_block(volume_start, &mut block)?;
        }

        let boot_sector = BootSector::parse(&block);
        let geometry = Geometry::new(volume_start, &boot_sector)?;

        device.read_block(geometry.fs_info_sector(), &mut block)?;
        let info = FsInfo::from_block(&block);
        if !info.is_valid() {
            return Err(FatError::InvalidFormat);
        }
        let fs_info = FsInfoCache::new(geometry.fs_info_sector(), info, geometry.cluster_count());

        Ok(Self {
            cwd: geometry.root_cluster(),
            geometry,
            fs_info,
        })
    }
}

enum MountState {
    /// No volume is available, `reason` tells why.
    Unmounted { reason: FatError },
    Mounted(Volume),
}

/// A FAT32 volume on a removable block device.
///
/// Every path-level operation first runs the readiness check, so a card
/// that was swapped or reinserted is mounted again transparently.
pub struct FatFs<D: BlockDevice> {
    device: D,
    state: MountState,
}

impl<D: BlockDevice> FatFs<D> {
    #[must_use]
    #[inline]
    /// Wraps `device`, without touching it.
    pub const fn new(device: D) -> Self {
        Self {
            device,
            state: MountState::Unmounted {
                reason: FatError::NoCard,
            },
        }
    }

    #[must_use]
    #[inline]
    pub const fn device(&self) -> &D {
        &self.device
    }

    #[must_use]
    #[inline]
    pub const fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    #[must_use]
    #[inline]
    pub fn into_inner(self) -> D {
        self.device
    }

    /// Mounts the volume found on the device.
    ///
    /// Mounting an already mounted volume does nothing.
    pub fn mount(&mut self) -> FatResult<()> {
        if !self.device.card_present() {
            self.state = MountState::Unmounted {
                reason: FatError::NoCard,
            };
            return Err(FatError::NoCard);
        }
        if self.is_mounted() {
            return Ok(());
        }

        match Volume::load(&mut self.device) {
            Ok(volume) => {
                log::info!(
                    "Mounted FAT32 volume at block {}: {} clusters of {} bytes",
                    volume.geometry.volume_start(),
                    volume.geometry.cluster_count(),
                    volume.geometry.bytes_per_cluster()
                );
                self.state = MountState::Mounted(volume);
                Ok(())
            }
            Err(error) => {
                log::warn!("Failed to mount FAT32 volume: {error}");
                self.state = MountState::Unmounted { reason: error };
                Err(error)
            }
        }
    }

    /// Forgets the mounted volume and everything derived from it.
    pub fn unmount(&mut self) {
        if self.is_mounted() {
            log::info!("Unmounted FAT32 volume");
        }
        self.state = MountState::Unmounted {
            reason: FatError::NoCard,
        };
    }

    #[must_use]
    #[inline]
    pub const fn is_mounted(&self) -> bool {
        matches!(self.state, MountState::Mounted(_))
    }

    /// Returns true if a volume is mounted, mounting it if the card is present.
    pub fn is_ready(&mut self) -> bool {
        if !self.poll_card() {
            self.state = MountState::Unmounted {
                reason: FatError::NoCard,
            };
            return false;
        }
        self.is_mounted() || self.mount().is_ok()
    }

    /// Runs the readiness check and reports why the volume is unavailable, if it is.
    pub fn status(&mut self) -> FatResult<()> {
        if self.is_ready() {
            return Ok(());
        }
        match self.state {
            MountState::Unmounted { reason } => Err(reason),
            MountState::Mounted(_) => Ok(()),
        }
    }

    /// Checks card presence, unmounting the volume if the card is gone.
    pub fn poll_card(&mut self) -> bool {
        let present = self.device.card_present();
        if !present && self.is_mounted() {
            log::warn!("Card removed, unmounting FAT32 volume");
            self.state = MountState::Unmounted {
                reason: FatError::NoCard,
            };
        }
        present
    }

    #[must_use]
    pub const fn geometry(&self) -> Option<&Geometry> {
        match &self.state {
            MountState::Mounted(volume) => Some(&volume.geometry),
            MountState::Unmounted { .. } => None,
        }
    }

    #[must_use]
    /// Returns the cached free cluster count, if known.
    pub fn free_clusters(&self) -> Option<u32> {
        match &self.state {
            MountState::Mounted(volume) => fat::CommitCache::free_count(&volume.fs_info),
            MountState::Unmounted { .. } => None,
        }
    }

    #[must_use]
    /// Returns the cluster where the next allocation scan starts, if known.
    pub fn next_free_hint(&self) -> Option<Cluster> {
        match &self.state {
            MountState::Mounted(volume) => fat::CommitCache::next_free(&volume.fs_info),
            MountState::Unmounted { .. } => None,
        }
    }

    #[must_use]
    /// Returns the first cluster of the working directory.
    pub const fn current_dir(&self) -> Option<Cluster> {
        match &self.state {
            MountState::Mounted(volume) => Some(volume.cwd),
            MountState::Unmounted { .. } => None,
        }
    }

    /// Gives access to the FAT and data region of the mounted volume.
    pub fn table(&mut self) -> FatResult<FatTable<'_, D>> {
        self.resolver().map(|resolver| resolver.fat)
    }

    fn resolver(&mut self) -> FatResult<Resolver<FatTable<'_, D>>> {
        self.status()?;
        match &mut self.state {
            MountState::Mounted(volume) => Ok(Resolver {
                root: volume.geometry.root_cluster(),
                cwd: volume.cwd,
                fat: FatTable::new(&mut self.device, &volume.geometry, &mut volume.fs_info),
            }),
            MountState::Unmounted { reason } => Err(*reason),
        }
    }

    /// Changes the working directory used to resolve relative paths.
    pub fn set_current_dir<'p>(&mut self, path: impl Into<Path<'p>>) -> FatResult<()> {
        let cluster = {
            let mut resolver = self.resolver()?;
            let node = resolver.resolve(path.into())?;
            node.dir_cluster(resolver.root)?
        };
        if let MountState::Mounted(volume) = &mut self.state {
            volume.cwd = cluster;
        }
        Ok(())
    }

    /// Opens a file, or a directory for raw reading.
    pub fn open<'p>(&mut self, path: impl Into<Path<'p>>) -> FatResult<File<'_, D>> {
        let mut resolver = self.resolver()?;
        match resolver.resolve(path.into())? {
            Node::Dir(cluster) => FatFile::directory(resolver.fat, cluster),
            Node::Entry { entry, .. } => FatFile::from_entry(resolver.fat, &entry),
        }
    }

    /// Creates an empty file and opens it.
    pub fn create<'p>(&mut self, path: impl Into<Path<'p>>) -> FatResult<File<'_, D>> {
        let mut resolver = self.resolver()?;
        let entry = resolver.create_file(path.into())?;
        FatFile::from_entry(resolver.fat, &entry)
    }

    /// Creates an empty directory.
    pub fn create_dir<'p>(&mut self, path: impl Into<Path<'p>>) -> FatResult<()> {
        self.resolver()?.create_dir(path.into()).map(|_| ())
    }

    pub fn open_dir<'p>(&mut self, path: impl Into<Path<'p>>) -> FatResult<Dir<'_, D>> {
        let mut resolver = self.resolver()?;
        let cluster = resolver.resolve(path.into())?.dir_cluster(resolver.root)?;
        Directory::new(resolver.fat, cluster)
    }

    /// Lists a directory, leaving out `.`, `..` and volume labels.
    pub fn read_dir<'p>(&mut self, path: impl Into<Path<'p>>) -> FatResult<Vec<DirectoryEntry>> {
        self.open_dir(path)?.entries()
    }

    /// Deletes a file or an empty directory and releases its clusters.
    pub fn delete<'p>(&mut self, path: impl Into<Path<'p>>) -> FatResult<()> {
        let entry = self.resolver()?.delete(path.into())?;
        if let MountState::Mounted(volume) = &mut self.state
            && entry.is_directory()
            && volume.cwd == entry.first_cluster()
        {
            volume.cwd = volume.geometry.root_cluster();
        }
        Ok(())
    }

    /// Moves an entry to a new name, possibly in another directory.
    ///
    /// The data clusters are left in place.
    pub fn rename<'p, 'q>(
        &mut self,
        from: impl Into<Path<'p>>,
        to: impl Into<Path<'q>>,
    ) -> FatResult<()> {
        self.resolver()?
            .rename(from.into(), to.into())
            .map(|_| ())
    }

    pub fn metadata<'p>(&mut self, path: impl Into<Path<'p>>) -> FatResult<FileMetadata> {
        let mut resolver = self.resolver()?;
        Ok(match resolver.resolve(path.into())? {
            Node::Dir(cluster) => FileMetadata::new(0, FileType::Directory, cluster.value()),
            Node::Entry { entry, .. } => entry.metadata(),
        })
    }

    pub fn exists<'p>(&mut self, path: impl Into<Path<'p>>) -> FatResult<bool> {
        match self.resolver()?.resolve(path.into()) {
            Ok(_) => Ok(true),
            Err(FatError::NotFound) => Ok(false),
            Err(error) => Err(error),
        }
    }
}

/// Result of a path lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    /// A directory reached without an entry: the root, the start directory or `..`.
    Dir(Cluster),
    Entry {
        /// Directory holding the entry
        parent: Cluster,
        entry: DirectoryEntry,
    },
}

impl Node {
    /// Returns the first cluster of the directory this node designates.
    fn dir_cluster(&self, root: Cluster) -> FatResult<Cluster> {
        match self {
            Self::Dir(cluster) => Ok(*cluster),
            Self::Entry { entry, .. } if entry.is_directory() => {
                let cluster = entry.first_cluster();
                Ok(if cluster.value() == 0 { root } else { cluster })
            }
            Self::Entry { .. } => Err(FatError::NotADirectory),
        }
    }
}

/// Path-level operations over the FAT of a mounted volume.
struct Resolver<T: FatEntries + ClusterIo> {
    fat: T,
    root: Cluster,
    /// Start of relative lookups
    cwd: Cluster,
}

impl<T: FatEntries + ClusterIo> Resolver<T> {
    fn directory(&mut self, cluster: Cluster) -> FatResult<Directory<&mut T>> {
        Directory::new(&mut self.fat, cluster)
    }

    /// Value stored in the `..` entry of a child of `dir`.
    fn dotdot_value(&self, dir: Cluster) -> Cluster {
        if dir == self.root {
            Cluster::new(0)
        } else {
            dir
        }
    }

    fn parent_of(&mut self, dir: Cluster) -> FatResult<Cluster> {
        if dir == self.root {
            return Ok(self.root);
        }
        let parent = self
            .directory(dir)?
            .parent_cluster()?
            .ok_or(FatError::InvalidFormat)?;
        Ok(if parent.value() == 0 { self.root } else { parent })
    }

    /// Returns true if `dir` is `ancestor` or lies underneath it.
    fn is_within(&mut self, dir: Cluster, ancestor: Cluster) -> FatResult<bool> {
        let mut current = dir;
        for _ in 0..self.fat.cluster_count() {
            if current == ancestor {
                return Ok(true);
            }
            if current == self.root {
                return Ok(false);
            }
            current = self.parent_of(current)?;
        }
        Err(FatError::InvalidFormat)
    }

    fn resolve(&mut self, path: Path<'_>) -> FatResult<Node> {
        let start = if path.is_absolute() {
            self.root
        } else {
            self.cwd
        };

        let mut node = Node::Dir(start);
        for component in path.components() {
            let dir = node.dir_cluster(self.root)?;
            node = match component {
                "." => Node::Dir(dir),
                ".." => Node::Dir(self.parent_of(dir)?),
                name => {
                    let entry = self
                        .directory(dir)?
                        .find(name)?
                        .ok_or(FatError::NotFound)?;
                    Node::Entry { parent: dir, entry }
                }
            };
        }
        Ok(node)
    }

    /// Resolves the directory that holds the last component of `path`.
    fn resolve_parent<'p>(&mut self, path: Path<'p>) -> FatResult<(Cluster, &'p str)> {
        let (parent, name) = path.split_last().ok_or(FatError::InvalidPath)?;
        validate_name(name)?;
        let dir = self.resolve(parent)?.dir_cluster(self.root)?;
        Ok((dir, name))
    }

    fn create_file(&mut self, path: Path<'_>) -> FatResult<DirectoryEntry> {
        let (dir, name) = self.resolve_parent(path)?;
        let mut directory = self.directory(dir)?;
        if directory.find(name)?.is_some() {
            return Err(FatError::AlreadyExists);
        }
        let template = DirEntry::new(
            [b' '; 11],
            Attributes::new(Attributes::ARCHIVE),
            Cluster::new(0),
        );
        directory.insert(name, &template)
    }

    fn create_dir(&mut self, path: Path<'_>) -> FatResult<DirectoryEntry> {
        let (parent, name) = self.resolve_parent(path)?;
        if self.directory(parent)?.find(name)?.is_some() {
            return Err(FatError::AlreadyExists);
        }

        let cluster = self.fat.allocate_chain()?;
        let outcome = self.fill_dir(cluster, parent, name);
        if outcome.is_err()
            && let Err(error) = self.fat.release_chain(cluster)
        {
            log::warn!(
                "Failed to release cluster {} of unfinished directory: {error}",
                cluster.value()
            );
        }
        outcome
    }

    fn fill_dir(
        &mut self,
        cluster: Cluster,
        parent: Cluster,
        name: &str,
    ) -> FatResult<DirectoryEntry> {
        self.fat.zero_cluster(cluster)?;
        let dotdot = self.dotdot_value(parent);
        self.directory(cluster)?.write_dot_entries(dotdot)?;

        let template = DirEntry::new([b' '; 11], Attributes::new(Attributes::DIRECTORY), cluster);
        self.directory(parent)?.insert(name, &template)
    }

    fn delete(&mut self, path: Path<'_>) -> FatResult<DirectoryEntry> {
        // The root and `..` have no entry of their own
        let Node::Entry { parent, entry } = self.resolve(path)? else {
            return Err(FatError::InvalidPath);
        };

        if entry.is_directory() && !self.directory(entry.first_cluster())?.is_empty()? {
            return Err(FatError::NotEmpty);
        }

        self.directory(parent)?.remove(&entry)?;
        let first = entry.first_cluster();
        if self.fat.contains(first) {
            self.fat.release_chain(first)?;
        }
        Ok(entry)
    }

    fn rename(&mut self, from: Path<'_>, to: Path<'_>) -> FatResult<DirectoryEntry> {
        let Node::Entry {
            parent: source,
            entry,
        } = self.resolve(from)?
        else {
            return Err(FatError::InvalidPath);
        };

        let (target, name) = self.resolve_parent(to)?;
        if entry.is_directory() && self.is_within(target, entry.first_cluster())? {
            return Err(FatError::InvalidPath);
        }

        let mut directory = self.directory(target)?;
        if let Some(existing) = directory.find(name)? {
            // Renaming onto itself only changes the spelling
            if target != source || existing.location() != entry.location() {
                return Err(FatError::AlreadyExists);
            }
        }
        let moved = directory.insert(name, entry.short_entry())?;
        self.directory(source)?.remove(&entry)?;

        if entry.is_directory() && target != source {
            let dotdot = self.dotdot_value(target);
            self.directory(entry.first_cluster())?
                .set_parent_cluster(dotdot)?;
        }
        Ok(moved)
    }
}
