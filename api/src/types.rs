//! Types shared between the query layer, the pool and the FUSE adapter.
//!
//! Nothing in here touches the database; these are the plain data shapes the
//! rest of the workspace passes around. The one structural rule they encode
//! is that all persistent state lives in five tables whose names carry a
//! common, user-chosen prefix; see [`TableSet`].

/// Size of one file data block, in bytes.
///
/// Files are partitioned into chunks of this size, stored one per row; only
/// chunks that were actually written exist as rows, and missing chunks
/// inside a file's extent read back as zeros.
pub const DATA_BLOCK_SIZE: u64 = 4096;

/// Longest path accepted from the host, in bytes.
pub const PATH_MAX: usize = 4096;

/// Longest single directory entry name, in bytes. Matches the width of the
/// `name` column.
pub const NAME_MAX: usize = 255;

/// The names of the five backing tables, all sharing one prefix.
///
/// Built once at startup from configuration and passed by reference into
/// every query function; there is no process-wide table-name state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSet {
    /// One row per inode: mode, ownership, times, derived size, refcounts.
    pub inodes: String,
    /// One row per directory entry: `(parent, name) -> inode`.
    pub tree: String,
    /// One row per non-hole file block: `(inode, seq) -> data`.
    pub data_blocks: String,
    /// Informational key/value counters, rebuilt by fsck.
    pub statistics: String,
    /// One row per extended attribute: `(inode, name) -> value`.
    pub xattrs: String,
}

impl TableSet {
    /// Build the table names from a prefix. An empty prefix yields the bare
    /// table names.
    ///
    /// The prefix ends up interpolated into SQL, so callers must validate it
    /// against identifier syntax before constructing a `TableSet`; the mount
    /// binary rejects anything outside `[A-Za-z0-9_]`.
    pub fn with_prefix(prefix: &str) -> TableSet {
        TableSet {
            inodes: format!("{}inodes", prefix),
            tree: format!("{}tree", prefix),
            data_blocks: format!("{}data_blocks", prefix),
            statistics: format!("{}statistics", prefix),
            xattrs: format!("{}xattrs", prefix),
        }
    }

    /// All table names, in schema order. Used by the startup presence check.
    pub fn all(&self) -> [&str; 5] {
        [
            &self.inodes,
            &self.tree,
            &self.data_blocks,
            &self.statistics,
            &self.xattrs,
        ]
    }
}

/// The outcome of resolving an absolute path against the tree table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntry {
    /// Inode the final path component refers to.
    pub inode: u64,
    /// Stored name of the final component (`b"/"` for the root).
    pub name: Vec<u8>,
    /// Inode of the containing directory; `None` only for the root entry.
    pub parent: Option<u64>,
    /// Number of tree rows referencing `inode`. Computed only when the
    /// caller asked for it; otherwise reported as 1.
    pub nlinks: u64,
}

/// A snapshot of one inode row, as needed to answer `getattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeStat {
    /// POSIX mode, including the file type bits.
    pub mode: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Last access time, seconds since the epoch.
    pub atime: u64,
    /// Last modification time, seconds since the epoch.
    pub mtime: u64,
    /// Last status change time, seconds since the epoch.
    pub ctime: u64,
    /// File size in bytes; derived from the block rows and kept consistent
    /// by every writer.
    pub size: u64,
}

/// How a `setxattr` call treats an already-present attribute name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattrSet {
    /// `XATTR_CREATE`: fail if the name already exists.
    Create,
    /// `XATTR_REPLACE`: fail if the name does not exist.
    Replace,
    /// No flag: create or overwrite.
    Either,
}
