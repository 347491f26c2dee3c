use super::{
    Cluster, FatError, FatResult,
    dirent::{
        Attributes, DIR_ENTRY_SIZE, DirEntry, LongNameEntry, ShortNameBasis, build_long_filename,
        calc_short_name_checksum, exact_short_name, long_name_entries, names_match, validate_name,
    },
    fat::{ClusterIo, FatEntries},
};
use crate::fs::{FileMetadata, FileType};
use alloc::{string::String, vec::Vec};
use log::debug;

/// A FAT directory holds at most this many 32-byte slots.
const MAX_DIR_SLOTS: u32 = 65_536;
/// Largest size of a directory chain, in bytes.
pub const MAX_DIR_SIZE: u32 = MAX_DIR_SLOTS * DIR_ENTRY_SIZE as u32;
/// Highest numeric tail tried for short aliases.
const MAX_ALIAS_TAIL: u32 = 999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Position of a 32-byte slot inside a directory chain
pub struct EntryLocation {
    cluster: Cluster,
    /// Byte offset of the slot within `cluster`
    offset: u32,
}

impl EntryLocation {
    #[must_use]
    #[inline]
    pub const fn new(cluster: Cluster, offset: u32) -> Self {
        Self { cluster, offset }
    }

    #[must_use]
    #[inline]
    pub const fn cluster(&self) -> Cluster {
        self.cluster
    }

    #[must_use]
    #[inline]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Reads the short entry stored at this location.
    pub fn load<T: ClusterIo>(&self, fat: &mut T) -> FatResult<DirEntry> {
        let mut raw = [0; DIR_ENTRY_SIZE];
        fat.read_cluster(self.cluster, self.offset, &mut raw)?;
        Ok(DirEntry::parse(&raw))
    }

    /// Overwrites the slot at this location with `entry`.
    pub fn store<T: ClusterIo>(&self, fat: &mut T, entry: &DirEntry) -> FatResult<()> {
        fat.write_cluster(self.cluster, self.offset, &entry.to_bytes())
    }
}

/// Directory entry with long filename support
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// The short name entry
    short_entry: DirEntry,
    /// Long filename (if available)
    long_name: Option<String>,
    /// Slot of the short entry
    location: EntryLocation,
    /// First slot used by the entry, long name fragments included
    first_slot: EntryLocation,
    /// Number of slots used, long name fragments included
    slot_count: u32,
}

impl DirectoryEntry {
    #[must_use]
    /// Returns the long name if there is one, the short name otherwise
    pub fn name(&self) -> String {
        self.long_name
            .clone()
            .unwrap_or_else(|| self.short_entry.short_name())
    }

    #[must_use]
    #[inline]
    pub fn long_name(&self) -> Option<&str> {
        self.long_name.as_deref()
    }

    #[must_use]
    #[inline]
    pub fn short_name(&self) -> String {
        self.short_entry.short_name()
    }

    #[must_use]
    #[inline]
    pub const fn short_entry(&self) -> &DirEntry {
        &self.short_entry
    }

    #[must_use]
    #[inline]
    pub const fn location(&self) -> EntryLocation {
        self.location
    }

    #[must_use]
    #[inline]
    pub const fn first_slot(&self) -> EntryLocation {
        self.first_slot
    }

    #[must_use]
    #[inline]
    pub const fn slot_count(&self) -> u32 {
        self.slot_count
    }

    #[must_use]
    #[inline]
    pub const fn is_directory(&self) -> bool {
        self.short_entry.is_directory()
    }

    #[must_use]
    #[inline]
    pub const fn attributes(&self) -> Attributes {
        self.short_entry.attributes()
    }

    #[must_use]
    #[inline]
    pub const fn size(&self) -> u32 {
        self.short_entry.file_size()
    }

    #[must_use]
    #[inline]
    pub fn first_cluster(&self) -> Cluster {
        self.short_entry.first_cluster()
    }

    #[must_use]
    pub fn metadata(&self) -> FileMetadata {
        let file_type = if self.is_directory() {
            FileType::Directory
        } else {
            FileType::File
        };
        FileMetadata::new(self.size(), file_type, self.first_cluster().value())
    }

    #[must_use]
    /// Returns true if `name` designates this entry, by long or short name
    pub fn matches(&self, name: &str) -> bool {
        self.long_name
            .as_deref()
            .is_some_and(|long| names_match(long, name))
            || names_match(&self.short_entry.short_name(), name)
    }

    /// Entries shown in listings and reachable by name
    fn is_visible(&self) -> bool {
        !self.short_entry.is_dot() && !self.short_entry.is_volume_id()
    }
}

/// Read position inside a directory chain
#[derive(Debug, Clone, Copy)]
struct Cursor {
    /// Next slot to read, `None` past the end of the chain
    next: Option<EntryLocation>,
    /// Index of `next` within the directory
    index: u32,
}

/// A directory in a FAT filesystem
pub struct Directory<T: FatEntries + ClusterIo> {
    /// The FAT entries
    fat: T,
    /// First cluster of the directory
    first_cluster: Cluster,
}

impl<T: FatEntries + ClusterIo> Directory<T> {
    /// Creates a new directory handle
    pub fn new(fat: T, first_cluster: Cluster) -> FatResult<Self> {
        if !fat.contains(first_cluster) {
            return Err(FatError::InvalidParameter);
        }

        Ok(Self { fat, first_cluster })
    }

    #[must_use]
    #[inline]
    pub const fn first_cluster(&self) -> Cluster {
        self.first_cluster
    }

    #[must_use]
    #[inline]
    pub fn into_inner(self) -> T {
        self.fat
    }

    const fn start(&self) -> Cursor {
        Cursor {
            next: Some(EntryLocation::new(self.first_cluster, 0)),
            index: 0,
        }
    }

    fn read_slot(&mut self, location: EntryLocation) -> FatResult<[u8; DIR_ENTRY_SIZE]> {
        let mut raw = [0; DIR_ENTRY_SIZE];
        self.fat
            .read_cluster(location.cluster, location.offset, &mut raw)?;
        Ok(raw)
    }

    /// Returns the slot following slot number `index`, or `None` at the end of the chain.
    ///
    /// A chain running past the largest possible directory is corrupt (or loops),
    /// and fails with `InvalidFormat`.
    fn advance_checked(
        &mut self,
        location: EntryLocation,
        index: u32,
    ) -> FatResult<Option<EntryLocation>> {
        let next = self.advance(location)?;
        if next.is_some() && index + 1 >= MAX_DIR_SLOTS {
            return Err(FatError::InvalidFormat);
        }
        Ok(next)
    }

    /// Returns the slot following `location`, or `None` at the end of the chain.
    fn advance(&mut self, location: EntryLocation) -> FatResult<Option<EntryLocation>> {
        let offset = location.offset + DIR_ENTRY_SIZE as u32;
        if offset < self.fat.bytes_per_cluster() {
            return Ok(Some(EntryLocation::new(location.cluster, offset)));
        }
        Ok(self
            .fat
            .next_link(location.cluster)?
            .map(|next| EntryLocation::new(next, 0)))
    }

    /// Reads the next live entry, assembling its long name.
    ///
    /// Deleted slots are skipped; `.`, `..` and volume labels are returned.
    fn read_entry(&mut self, cursor: &mut Cursor) -> FatResult<Option<DirectoryEntry>> {
        let mut fragments: Vec<LongNameEntry> = Vec::new();
        let mut fragments_start: Option<EntryLocation> = None;

        while let Some(location) = cursor.next {
            let raw = self.read_slot(location)?;

            // Check if we reached the end of the directory
            if raw[0] == DirEntry::END_OF_ENTRIES {
                cursor.next = None;
                return Ok(None);
            }
            cursor.next = self.advance_checked(location, cursor.index)?;
            cursor.index += 1;

            // Skip deleted entries
            if raw[0] == DirEntry::DELETED_ENTRY {
                fragments.clear();
                fragments_start = None;
                continue;
            }

            let entry = DirEntry::parse(&raw);
            if entry.is_long_name() {
                let fragment = LongNameEntry::parse(&raw);
                if fragment.is_last() {
                    fragments.clear();
                    fragments_start = Some(location);
                } else if fragments_start.is_none() {
                    // Orphan fragment
                    continue;
                }
                if fragments.len() < LongNameEntry::MAX_ENTRIES {
                    fragments.push(fragment);
                }
                continue;
            }

            let checksum = calc_short_name_checksum(&entry.filename_raw());
            let long_name = build_long_filename(&fragments, checksum);
            let (first_slot, slot_count) = match (&long_name, fragments_start) {
                (Some(_), Some(start)) => (start, fragments.len() as u32 + 1),
                _ => (location, 1),
            };

            return Ok(Some(DirectoryEntry {
                short_entry: entry,
                long_name,
                location,
                first_slot,
                slot_count,
            }));
        }

        Ok(None)
    }

    /// Returns every visible entry of the directory.
    pub fn entries(&mut self) -> FatResult<Vec<DirectoryEntry>> {
        let mut cursor = self.start();
        let mut entries = Vec::new();
        while let Some(entry) = self.read_entry(&mut cursor)? {
            if entry.is_visible() {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Looks up `name`, ignoring case, by long or short name.
    pub fn find(&mut self, name: &str) -> FatResult<Option<DirectoryEntry>> {
        let mut cursor = self.start();
        while let Some(entry) = self.read_entry(&mut cursor)? {
            if entry.is_visible() && entry.matches(name) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Returns the first cluster of the parent directory, 0 standing for the root.
    pub fn parent_cluster(&mut self) -> FatResult<Option<Cluster>> {
        let mut cursor = self.start();
        while let Some(entry) = self.read_entry(&mut cursor)? {
            if &entry.short_entry.filename_raw() == DirEntry::DOTDOT_ENTRY {
                return Ok(Some(entry.first_cluster()));
            }
        }
        Ok(None)
    }

    /// Returns true if the directory holds nothing besides `.` and `..`.
    pub fn is_empty(&mut self) -> FatResult<bool> {
        let mut cursor = self.start();
        while let Some(entry) = self.read_entry(&mut cursor)? {
            if !entry.short_entry.is_dot() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Finds `count` consecutive free slots, growing the directory if needed.
    fn find_free_run(&mut self, count: u32) -> FatResult<EntryLocation> {
        let slots_per_cluster = self.fat.bytes_per_cluster() / DIR_ENTRY_SIZE as u32;
        let mut run_start: Option<EntryLocation> = None;
        let mut run_len = 0;
        let mut slots = 0;
        let mut last = self.first_cluster;
        let mut next = Some(EntryLocation::new(self.first_cluster, 0));

        while let Some(location) = next {
            last = location.cluster;
            slots += 1;
            let marker = self.read_slot(location)?[0];
            if marker == DirEntry::END_OF_ENTRIES || marker == DirEntry::DELETED_ENTRY {
                let start = *run_start.get_or_insert(location);
                run_len += 1;
                if run_len == count {
                    return Ok(start);
                }
            } else {
                run_start = None;
                run_len = 0;
            }
            next = self.advance_checked(location, slots - 1)?;
        }

        loop {
            if slots + slots_per_cluster > MAX_DIR_SLOTS {
                return Err(FatError::DiskFull);
            }
            let cluster = self.fat.extend_chain(last)?;
            self.fat.zero_cluster(cluster)?;
            debug!(
                "grew directory at cluster {} with cluster {}",
                self.first_cluster.value(),
                cluster.value()
            );

            let start = *run_start.get_or_insert(EntryLocation::new(cluster, 0));
            run_len += slots_per_cluster;
            slots += slots_per_cluster;
            if run_len >= count {
                return Ok(start);
            }
            last = cluster;
        }
    }

    /// Picks a short alias for `name` that no entry of the directory uses.
    fn unique_alias(&mut self, name: &str) -> FatResult<[u8; 11]> {
        let mut taken = Vec::new();
        let mut cursor = self.start();
        while let Some(entry) = self.read_entry(&mut cursor)? {
            taken.push(entry.short_entry.filename_raw());
        }

        let basis = ShortNameBasis::new(name);
        (1..=MAX_ALIAS_TAIL)
            .map(|n| basis.with_tail(n))
            .find(|alias| !taken.contains(alias))
            .ok_or(FatError::AlreadyExists)
    }

    /// Adds an entry named `name`, copying everything but the name from `template`.
    ///
    /// The caller is responsible for checking that the name is not taken.
    pub fn insert(&mut self, name: &str, template: &DirEntry) -> FatResult<DirectoryEntry> {
        validate_name(name)?;

        let (short_name, fragments) = match exact_short_name(name) {
            Some(short_name) => (short_name, Vec::new()),
            None => {
                let alias = self.unique_alias(name)?;
                let fragments = long_name_entries(name, calc_short_name_checksum(&alias))?;
                (alias, fragments)
            }
        };

        let mut short_entry = *template;
        short_entry.set_filename_raw(short_name);

        let slot_count = fragments.len() as u32 + 1;
        let first_slot = self.find_free_run(slot_count)?;
        let mut location = first_slot;
        for fragment in &fragments {
            self.fat
                .write_cluster(location.cluster, location.offset, &fragment.to_bytes())?;
            location = self.advance(location)?.ok_or(FatError::InvalidFormat)?;
        }
        location.store(&mut self.fat, &short_entry)?;
        debug!(
            "inserted {name:?} in directory at cluster {}",
            self.first_cluster.value()
        );

        Ok(DirectoryEntry {
            short_entry,
            long_name: (!fragments.is_empty()).then(|| String::from(name)),
            location,
            first_slot,
            slot_count,
        })
    }

    /// Writes the `.` and `..` entries of a freshly zeroed directory.
    ///
    /// `parent` is 0 when the parent is the root directory.
    pub fn write_dot_entries(&mut self, parent: Cluster) -> FatResult<()> {
        let attributes = Attributes::new(Attributes::DIRECTORY);
        let dot = DirEntry::new(*DirEntry::DOT_ENTRY, attributes, self.first_cluster);
        let dotdot = DirEntry::new(*DirEntry::DOTDOT_ENTRY, attributes, parent);
        EntryLocation::new(self.first_cluster, 0).store(&mut self.fat, &dot)?;
        EntryLocation::new(self.first_cluster, DIR_ENTRY_SIZE as u32).store(&mut self.fat, &dotdot)
    }

    /// Points the `..` entry at `parent`, 0 standing for the root.
    pub fn set_parent_cluster(&mut self, parent: Cluster) -> FatResult<()> {
        let mut cursor = self.start();
        while let Some(mut entry) = self.read_entry(&mut cursor)? {
            if &entry.short_entry.filename_raw() == DirEntry::DOTDOT_ENTRY {
                entry.short_entry.set_first_cluster(parent);
                return entry.location.store(&mut self.fat, &entry.short_entry);
            }
        }
        Err(FatError::InvalidFormat)
    }

    /// Marks every slot of `entry` as deleted.
    pub fn remove(&mut self, entry: &DirectoryEntry) -> FatResult<()> {
        let mut location = entry.first_slot;
        for i in 0..entry.slot_count {
            self.fat.write_cluster(
                location.cluster,
                location.offset,
                &[DirEntry::DELETED_ENTRY],
            )?;
            if i + 1 < entry.slot_count {
                location = self.advance(location)?.ok_or(FatError::InvalidFormat)?;
            }
        }
        debug!(
            "removed {:?} from directory at cluster {}",
            entry.name(),
            self.first_cluster.value()
        );
        Ok(())
    }
}
