use super::{
    Cluster, FatError, FatResult,
    bs::{read_u16, read_u32, write_u16, write_u32},
};
use alloc::{string::String, vec::Vec};

/// Size of a directory entry in bytes (always 32 bytes)
pub const DIR_ENTRY_SIZE: usize = 32;

/// Longest name accepted, in UTF-16 code units.
pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Directory entry attributes
pub struct Attributes(u8);

impl Attributes {
    /// Read-only attribute
    pub const READ_ONLY: u8 = 0x01;
    /// Hidden attribute
    pub const HIDDEN: u8 = 0x02;
    /// System attribute
    pub const SYSTEM: u8 = 0x04;
    /// Volume ID attribute
    pub const VOLUME_ID: u8 = 0x08;
    /// Directory attribute
    pub const DIRECTORY: u8 = 0x10;
    /// Archive attribute
    pub const ARCHIVE: u8 = 0x20;
    /// Long file name attribute
    pub const LONG_NAME: u8 = Self::READ_ONLY | Self::HIDDEN | Self::SYSTEM | Self::VOLUME_ID;
    /// Long file name mask
    pub const LONG_NAME_MASK: u8 = Self::READ_ONLY
        | Self::HIDDEN
        | Self::SYSTEM
        | Self::VOLUME_ID
        | Self::DIRECTORY
        | Self::ARCHIVE;

    #[must_use]
    #[inline]
    /// Creates a new attribute set
    pub const fn new(attributes: u8) -> Self {
        Self(attributes)
    }

    #[must_use]
    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is read-only
    pub const fn is_read_only(self) -> bool {
        self.0 & Self::READ_ONLY != 0
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is hidden
    pub const fn is_hidden(self) -> bool {
        self.0 & Self::HIDDEN != 0
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is a volume ID
    pub const fn is_volume_id(self) -> bool {
        self.0 & Self::VOLUME_ID != 0
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is a directory
    pub const fn is_directory(self) -> bool {
        self.0 & Self::DIRECTORY != 0
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is archived
    pub const fn is_archive(self) -> bool {
        self.0 & Self::ARCHIVE != 0
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is a long file name
    pub const fn is_long_name(self) -> bool {
        (self.0 & Self::LONG_NAME_MASK) == Self::LONG_NAME
    }
}

/// FAT directory entry
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    /// Filename (8 bytes) followed by the extension (3 bytes)
    name: [u8; 11],
    /// File attributes
    attr: u8,
    /// Case flags of the short name
    nt_res: u8,
    /// Creation time, tenths of a second
    creation_tenths: u8,
    /// Creation time
    creation_time: u16,
    /// Creation date
    creation_date: u16,
    /// Last access date
    last_access_date: u16,
    /// High word of first cluster number
    first_cluster_high: u16,
    /// Last modification time
    write_time: u16,
    /// Last modification date
    write_date: u16,
    /// Low word of first cluster number
    first_cluster_low: u16,
    /// File size in bytes
    file_size: u32,
}

impl DirEntry {
    /// Deleted entry marker (first byte)
    pub const DELETED_ENTRY: u8 = 0xE5;
    /// End of directory marker (first byte)
    pub const END_OF_ENTRIES: u8 = 0x00;
    /// Stands for a leading 0xE5 byte in a live name
    const ESCAPED_E5: u8 = 0x05;
    /// Dot entry (current directory)
    pub const DOT_ENTRY: &'static [u8; 11] = b".          ";
    /// Dotdot entry (parent directory)
    pub const DOTDOT_ENTRY: &'static [u8; 11] = b"..         ";
    /// 1980-01-01, the first day DOS dates can encode
    pub const DOS_EPOCH_DATE: u16 = (1 << 5) | 1;

    /// Base name is stored upper case but displayed lower case
    const LOWER_BASE: u8 = 0x08;
    /// Extension is stored upper case but displayed lower case
    const LOWER_EXT: u8 = 0x10;

    #[must_use]
    /// Creates a new directory entry stamped with the DOS epoch
    pub const fn new(name: [u8; 11], attributes: Attributes, first_cluster: Cluster) -> Self {
        Self {
            name,
            attr: attributes.bits(),
            nt_res: 0,
            creation_tenths: 0,
            creation_time: 0,
            creation_date: Self::DOS_EPOCH_DATE,
            last_access_date: Self::DOS_EPOCH_DATE,
            first_cluster_high: (first_cluster.value() >> 16) as u16,
            write_time: 0,
            write_date: Self::DOS_EPOCH_DATE,
            first_cluster_low: (first_cluster.value() & 0xFFFF) as u16,
            file_size: 0,
        }
    }

    #[must_use]
    pub const fn parse(raw: &[u8; DIR_ENTRY_SIZE]) -> Self {
        let mut name = [0; 11];
        let mut i = 0;
        while i < name.len() {
            name[i] = raw[i];
            i += 1;
        }
        Self {
            name,
            attr: raw[11],
            nt_res: raw[12],
            creation_tenths: raw[13],
            creation_time: read_u16(raw, 14),
            creation_date: read_u16(raw, 16),
            last_access_date: read_u16(raw, 18),
            first_cluster_high: read_u16(raw, 20),
            write_time: read_u16(raw, 22),
            write_date: read_u16(raw, 24),
            first_cluster_low: read_u16(raw, 26),
            file_size: read_u32(raw, 28),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut raw = [0; DIR_ENTRY_SIZE];
        raw[..11].copy_from_slice(&self.name);
        raw[11] = self.attr;
        raw[12] = self.nt_res;
        raw[13] = self.creation_tenths;
        write_u16(&mut raw, 14, self.creation_time);
        write_u16(&mut raw, 16, self.creation_date);
        write_u16(&mut raw, 18, self.last_access_date);
        write_u16(&mut raw, 20, self.first_cluster_high);
        write_u16(&mut raw, 22, self.write_time);
        write_u16(&mut raw, 24, self.write_date);
        write_u16(&mut raw, 26, self.first_cluster_low);
        write_u32(&mut raw, 28, self.file_size);
        raw
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is free (unused)
    pub const fn is_free(&self) -> bool {
        self.name[0] == Self::END_OF_ENTRIES
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is deleted
    pub const fn is_deleted(&self) -> bool {
        self.name[0] == Self::DELETED_ENTRY
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is valid
    pub const fn is_valid(&self) -> bool {
        !self.is_free() && !self.is_deleted()
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is a directory
    pub const fn is_directory(&self) -> bool {
        self.attributes().is_directory()
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is a file
    pub const fn is_file(&self) -> bool {
        self.is_valid() && !self.is_directory() && !self.is_volume_id()
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is a volume ID
    pub const fn is_volume_id(&self) -> bool {
        self.attributes().is_volume_id()
    }

    #[must_use]
    #[inline]
    /// Returns true if the entry is a long filename
    pub const fn is_long_name(&self) -> bool {
        self.attributes().is_long_name()
    }

    #[must_use]
    /// Returns true for the `.` and `..` entries of a subdirectory
    pub fn is_dot(&self) -> bool {
        &self.name == Self::DOT_ENTRY || &self.name == Self::DOTDOT_ENTRY
    }

    #[must_use]
    #[inline]
    /// Returns the file attributes
    pub const fn attributes(&self) -> Attributes {
        Attributes::new(self.attr)
    }

    #[inline]
    /// Sets the file attributes
    pub const fn set_attributes(&mut self, attributes: Attributes) {
        self.attr = attributes.0;
    }

    #[must_use]
    #[inline]
    /// Returns the full 8.3 filename as stored on disk
    pub const fn filename_raw(&self) -> [u8; 11] {
        self.name
    }

    #[inline]
    /// Replaces the 8.3 filename, dropping its case flags
    pub const fn set_filename_raw(&mut self, name: [u8; 11]) {
        self.name = name;
        self.nt_res &= !(Self::LOWER_BASE | Self::LOWER_EXT);
    }

    #[must_use]
    /// Returns the short name in its `NAME.EXT` display form
    pub fn short_name(&self) -> String {
        let mut name = self.name;
        if name[0] == Self::ESCAPED_E5 {
            name[0] = Self::DELETED_ENTRY;
        }

        let lower = |bytes: &[u8], flag: u8| -> String {
            bytes
                .iter()
                .map(|&b| {
                    let c = char::from(b);
                    if self.nt_res & flag == 0 {
                        c
                    } else {
                        c.to_ascii_lowercase()
                    }
                })
                .collect()
        };

        let base = lower(trim_spaces(&name[..8]), Self::LOWER_BASE);
        let ext = trim_spaces(&name[8..]);
        if ext.is_empty() {
            base
        } else {
            let mut display = base;
            display.push('.');
            display.push_str(&lower(ext, Self::LOWER_EXT));
            display
        }
    }

    #[must_use]
    /// Returns the first cluster number
    pub fn first_cluster(&self) -> Cluster {
        Cluster::new(
            ((u32::from(self.first_cluster_high) << 16) | u32::from(self.first_cluster_low))
                & Cluster::MASK,
        )
    }

    /// Sets the first cluster number
    pub const fn set_first_cluster(&mut self, cluster: Cluster) {
        self.first_cluster_low = (cluster.value() & 0xFFFF) as u16;
        self.first_cluster_high = ((cluster.value() >> 16) & 0xFFFF) as u16;
    }

    #[must_use]
    #[inline]
    /// Returns the file size
    pub const fn file_size(&self) -> u32 {
        self.file_size
    }

    #[inline]
    /// Sets the file size
    pub const fn set_file_size(&mut self, size: u32) {
        self.file_size = size;
    }

    #[must_use]
    #[inline]
    /// Returns the raw DOS creation date
    pub const fn creation_date(&self) -> u16 {
        self.creation_date
    }

    #[must_use]
    #[inline]
    /// Returns the raw DOS modification date
    pub const fn write_date(&self) -> u16 {
        self.write_date
    }
}

fn trim_spaces(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Entry for long file name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongNameEntry {
    /// Sequence number (1-based, bit 6 set for last entry)
    seq_num: u8,
    /// First 5 characters of long name (UTF-16)
    name1: [u8; 10],
    /// Checksum of short name
    checksum: u8,
    /// Next 6 characters of long name
    name2: [u8; 12],
    /// Last 2 characters of long name
    name3: [u8; 4],
}

impl LongNameEntry {
    /// Last entry marker in sequence number
    pub const LAST_ENTRY: u8 = 0x40;
    /// Character count per LFN entry
    pub const CHARS_PER_ENTRY: usize = 13;
    /// Most fragments a single name can use
    pub const MAX_ENTRIES: usize = MAX_NAME_LEN.div_ceil(Self::CHARS_PER_ENTRY);

    #[must_use]
    #[inline]
    /// Creates a new long name entry
    pub const fn new(seq_num: u8, checksum: u8, is_last: bool) -> Self {
        let mut seq = seq_num;
        if is_last {
            seq |= Self::LAST_ENTRY;
        }

        Self {
            seq_num: seq,
            name1: [0; 10],
            checksum,
            name2: [0; 12],
            name3: [0; 4],
        }
    }

    #[must_use]
    pub fn parse(raw: &[u8; DIR_ENTRY_SIZE]) -> Self {
        let mut entry = Self::new(raw[0], raw[13], false);
        entry.name1.copy_from_slice(&raw[1..11]);
        entry.name2.copy_from_slice(&raw[14..26]);
        entry.name3.copy_from_slice(&raw[28..32]);
        entry
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut raw = [0; DIR_ENTRY_SIZE];
        raw[0] = self.seq_num;
        raw[1..11].copy_from_slice(&self.name1);
        raw[11] = Attributes::LONG_NAME;
        raw[13] = self.checksum;
        raw[14..26].copy_from_slice(&self.name2);
        raw[28..32].copy_from_slice(&self.name3);
        raw
    }

    #[must_use]
    #[inline]
    /// Returns true if this is the last entry in the long name sequence
    pub const fn is_last(&self) -> bool {
        self.seq_num & Self::LAST_ENTRY != 0
    }

    #[must_use]
    #[inline]
    /// Returns the sequence number
    pub const fn seq_num(&self) -> u8 {
        self.seq_num & !Self::LAST_ENTRY
    }

    #[must_use]
    #[inline]
    /// Returns the checksum
    pub const fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Sets the name part at the given index (0-12)
    pub const fn set_name(&mut self, idx: usize, ch: u16) -> FatResult<()> {
        if idx >= Self::CHARS_PER_ENTRY {
            return Err(FatError::InvalidParameter);
        }

        let bytes = ch.to_le_bytes();

        if idx < 5 {
            self.name1[idx * 2] = bytes[0];
            self.name1[idx * 2 + 1] = bytes[1];
        } else if idx < 11 {
            let idx = idx - 5;
            self.name2[idx * 2] = bytes[0];
            self.name2[idx * 2 + 1] = bytes[1];
        } else {
            let idx = idx - 11;
            self.name3[idx * 2] = bytes[0];
            self.name3[idx * 2 + 1] = bytes[1];
        }

        Ok(())
    }

    /// Gets the name part at the given index (0-12)
    pub const fn get_name(&self, idx: usize) -> FatResult<u16> {
        if idx >= Self::CHARS_PER_ENTRY {
            return Err(FatError::InvalidParameter);
        }

        let bytes = if idx < 5 {
            [self.name1[idx * 2], self.name1[idx * 2 + 1]]
        } else if idx < 11 {
            let idx = idx - 5;
            [self.name2[idx * 2], self.name2[idx * 2 + 1]]
        } else {
            let idx = idx - 11;
            [self.name3[idx * 2], self.name3[idx * 2 + 1]]
        };

        Ok(u16::from_le_bytes(bytes))
    }
}

/// Calculate the checksum for a 8.3 filename
#[must_use]
pub fn calc_short_name_checksum(name: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &b in name {
        sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b);
    }
    sum
}

/// Builds the long-name fragments of `name`, in on-disk order (last fragment first).
pub fn long_name_entries(name: &str, checksum: u8) -> FatResult<Vec<LongNameEntry>> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.is_empty() || units.len() > MAX_NAME_LEN {
        return Err(FatError::InvalidPath);
    }

    let count = units.len().div_ceil(LongNameEntry::CHARS_PER_ENTRY);
    let mut entries = Vec::with_capacity(count);
    for (i, chunk) in units.chunks(LongNameEntry::CHARS_PER_ENTRY).enumerate() {
        let seq = u8::try_from(i + 1).map_err(|_| FatError::InvalidPath)?;
        let mut entry = LongNameEntry::new(seq, checksum, i + 1 == count);
        for idx in 0..LongNameEntry::CHARS_PER_ENTRY {
            let unit = match idx.cmp(&chunk.len()) {
                core::cmp::Ordering::Less => chunk[idx],
                core::cmp::Ordering::Equal => 0x0000,
                core::cmp::Ordering::Greater => 0xFFFF,
            };
            entry.set_name(idx, unit)?;
        }
        entries.push(entry);
    }
    entries.reverse();
    Ok(entries)
}

/// Reassembles a long name from its fragments, given in on-disk order.
///
/// Returns `None` if the fragments are not a complete sequence belonging to
/// the short entry with checksum `checksum`.
#[must_use]
pub fn build_long_filename(entries: &[LongNameEntry], checksum: u8) -> Option<String> {
    let first = entries.first()?;
    if !first.is_last() || usize::from(first.seq_num()) != entries.len() {
        return None;
    }

    let mut units = Vec::with_capacity(entries.len() * LongNameEntry::CHARS_PER_ENTRY);
    for (entry, expected) in entries.iter().rev().zip(1..) {
        if entry.seq_num() != expected || entry.checksum() != checksum {
            return None;
        }
        for idx in 0..LongNameEntry::CHARS_PER_ENTRY {
            match entry.get_name(idx).ok()? {
                0x0000 => break,
                unit => units.push(unit),
            }
        }
    }

    let name: String = char::decode_utf16(units.iter().copied())
        .collect::<Result<_, _>>()
        .ok()?;
    (!name.is_empty()).then_some(name)
}

/// Checks that `name` can be stored as a directory entry name.
pub fn validate_name(name: &str) -> FatResult<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.encode_utf16().count() > MAX_NAME_LEN
        || name.ends_with(' ')
        || name.ends_with('.')
        || name
            .chars()
            .any(|c| c.is_control() || "\"*/:<>?\\|".contains(c))
    {
        return Err(FatError::InvalidPath);
    }
    Ok(())
}

fn is_short_char(c: u8) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || b"$%'-_@~`!(){}^#&".contains(&c)
}

#[must_use]
/// Returns the on-disk form of `name` if it is already a valid upper-case 8.3 name.
pub fn exact_short_name(name: &str) -> Option<[u8; 11]> {
    let (base, ext) = match name.rsplit_once('.') {
        Some((base, ext)) => (base, ext),
        None => (name, ""),
    };
    if base.is_empty()
        || base.len() > 8
        || ext.len() > 3
        || !base.bytes().chain(ext.bytes()).all(is_short_char)
    {
        return None;
    }

    let mut raw = [b' '; 11];
    raw[..base.len()].copy_from_slice(base.as_bytes());
    raw[8..8 + ext.len()].copy_from_slice(ext.as_bytes());
    Some(raw)
}

/// Basis of the short alias generated for a long name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortNameBasis {
    base: [u8; 8],
    base_len: usize,
    ext: [u8; 3],
}

impl ShortNameBasis {
    #[must_use]
    pub fn new(name: &str) -> Self {
        let name = name.trim_start_matches('.');
        let (base, ext) = match name.rsplit_once('.') {
            Some((base, ext)) => (base, ext),
            None => (name, ""),
        };

        let convert = |c: char| -> Option<u8> {
            match c {
                ' ' | '.' => None,
                c if c.is_ascii() => {
                    let b = c.to_ascii_uppercase() as u8;
                    Some(if is_short_char(b) { b } else { b'_' })
                }
                _ => Some(b'_'),
            }
        };

        let mut basis = Self {
            base: [b' '; 8],
            base_len: 0,
            ext: [b' '; 3],
        };
        for b in base.chars().filter_map(convert).take(8) {
            basis.base[basis.base_len] = b;
            basis.base_len += 1;
        }
        if basis.base_len == 0 {
            basis.base[0] = b'_';
            basis.base_len = 1;
        }
        for (slot, b) in basis.ext.iter_mut().zip(ext.chars().filter_map(convert)) {
            *slot = b;
        }
        basis
    }

    #[must_use]
    /// Returns the alias `BASE~N.EXT`, the base being cut to make room for the tail.
    pub fn with_tail(&self, n: u32) -> [u8; 11] {
        let mut digits = [0u8; 10];
        let mut len = 0;
        let mut value = n;
        loop {
            digits[len] = b'0' + (value % 10) as u8;
            len += 1;
            value /= 10;
            if value == 0 {
                break;
            }
        }

        let keep = self.base_len.min(8 - 1 - len);
        let mut raw = [b' '; 11];
        raw[..keep].copy_from_slice(&self.base[..keep]);
        raw[keep] = b'~';
        for (i, &d) in digits[..len].iter().rev().enumerate() {
            raw[keep + 1 + i] = d;
        }
        raw[8..].copy_from_slice(&self.ext);
        raw
    }
}

#[must_use]
/// Compares two names the way FAT does, ignoring case.
pub fn names_match(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_uppercase)
        .eq(b.chars().flat_map(char::to_uppercase))
}
