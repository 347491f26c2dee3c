use alloc::string::String;

pub mod dev;
pub mod fat;

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct PathBuf(String);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Path<'a>(&'a str);

impl PathBuf {
    #[must_use]
    #[inline]
    /// Creates a new `PathBuf` from the given string.
    pub fn new(path: &str) -> Self {
        Self(String::from(path))
    }

    #[inline]
    #[doc(alias = "push_str")]
    /// Pushes a new path to the current path.
    pub fn push(&mut self, path: &str) {
        self.0.push_str(path);
    }

    #[must_use]
    #[inline]
    pub fn as_path(&self) -> Path<'_> {
        Path(&self.0)
    }

    #[must_use]
    /// Returns a new path with `name` appended as a single component.
    pub fn join(&self, name: &str) -> Self {
        let mut new_path = self.0.clone();
        if !new_path.ends_with('/') {
            new_path.push('/');
        }
        new_path.push_str(name.trim_start_matches('/'));
        Self(new_path)
    }
}

impl core::borrow::Borrow<str> for PathBuf {
    #[inline]
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl<'a> Path<'a> {
    #[must_use]
    #[inline]
    /// Creates a new `Path` from the given string slice.
    pub const fn new(path: &'a str) -> Self {
        Self(path)
    }

    #[must_use]
    #[inline]
    pub const fn as_str(&self) -> &'a str {
        self.0
    }

    #[must_use]
    #[inline]
    /// Returns true if the path starts at the volume root.
    pub fn is_absolute(&self) -> bool {
        self.0.starts_with('/')
    }

    /// Returns the non-empty components of the path, in order.
    ///
    /// Repeated and trailing separators are ignored.
    pub fn components(self) -> impl Iterator<Item = &'a str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    #[must_use]
    /// Splits the path into its parent directory and final component.
    ///
    /// Returns `None` when the path has no final component (the root, or an empty path).
    /// The parent of a bare name is the empty path, which denotes the working directory.
    pub fn split_last(&self) -> Option<(Path<'a>, &'a str)> {
        let trimmed = self.0.trim_end_matches('/');
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.rfind('/') {
            Some(0) => Some((Path("/"), &trimmed[1..])),
            Some(idx) => Some((Path(&trimmed[..idx]), &trimmed[idx + 1..])),
            None => Some((Path(""), trimmed)),
        }
    }
}

impl<'a> From<&'a str> for Path<'a> {
    #[inline]
    fn from(value: &'a str) -> Self {
        Self(value)
    }
}

impl core::ops::Deref for Path<'_> {
    type Target = str;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FileType {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FileMetadata {
    size: u32,
    file_type: FileType,
    first_cluster: u32,
}

impl FileMetadata {
    #[must_use]
    #[inline]
    pub const fn new(size: u32, file_type: FileType, first_cluster: u32) -> Self {
        Self {
            size,
            file_type,
            first_cluster,
        }
    }

    #[must_use]
    #[inline]
    pub const fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    #[inline]
    pub const fn file_type(&self) -> FileType {
        self.file_type
    }

    #[must_use]
    #[inline]
    /// Returns the first data cluster, 0 for an empty file.
    pub const fn first_cluster(&self) -> u32 {
        self.first_cluster
    }

    #[must_use]
    #[inline]
    pub const fn is_dir(&self) -> bool {
        matches!(self.file_type, FileType::Directory)
    }
}
