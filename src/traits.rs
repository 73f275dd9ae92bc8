use crate::error::FvdeError;

/// Kind of an entry in a [`DirectoryTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Links, devices and anything else that is neither walked nor read
    Other,
}

/// A single directory entry. `id` is whatever the implementation needs to find the entry again
/// (for HFS+ this is the catalog node ID)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub id: u64,
    pub name: String,
    pub kind: EntryKind,
    /// Logical size of the file contents
    pub size: u64,
}

/// Implementing this trait allows the boot volume file search to run over any filesystem, as long
/// as it can list directories and read regular files.
pub trait DirectoryTree {
    /// The root directory of the filesystem
    fn root(&mut self) -> Result<TreeEntry, FvdeError>;

    /// Entries directly below `directory`, in on-disk order
    fn list_directory(&mut self, directory: &TreeEntry) -> Result<Vec<TreeEntry>, FvdeError>;

    /// Full contents of a regular file, `file.size` bytes long
    fn read_file(&mut self, file: &TreeEntry) -> Result<Vec<u8>, FvdeError>;
}
