//! The adapter between host filesystem callbacks and the query layer.
//!
//! The host dispatches callbacks concurrently and hands each one an
//! absolute path (plus the file handle for handle-based operations). Every
//! callback borrows one database session from the pool for its whole
//! duration, translates into query layer calls, and maps the outcome onto
//! an errno. No state survives a callback's return except the inode number
//! cached in an open file handle, so attributes are handed to the kernel
//! with a zero TTL.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuse_mt::{
    CallbackResult, CreatedEntry, DirectoryEntry, FileAttr, FileType, FilesystemMT, RequestInfo,
    ResultCreate, ResultData, ResultEmpty, ResultEntry, ResultOpen, ResultReaddir, ResultSlice,
    ResultStatfs, ResultWrite, ResultXattr, Statfs, Xattr,
};
use libc::c_int;
use mysql::Conn;

use sqlfs_api::error::{FsError, Result};
use sqlfs_api::pool::Pool;
use sqlfs_api::types::{InodeStat, TableSet, XattrSet, DATA_BLOCK_SIZE};

use crate::{io, meta, path, stats, tree, xattr};

/// Attributes are never cached by the kernel; the database is the only
/// source of truth.
const TTL: Duration = Duration::from_secs(0);

/// Arbitrary headroom added to the free counts so the filesystem never
/// reports itself full.
const STATFS_FILE_HEADROOM: u64 = 1024;
const STATFS_BLOCK_HEADROOM: u64 = 10240;

/// The mounted filesystem: a session pool plus the table names, nothing
/// else.
pub struct SqlFs {
    pool: Pool,
    tables: TableSet,
}

impl SqlFs {
    /// Wrap a warmed pool and table set into a mountable filesystem.
    pub fn new(pool: Pool, tables: TableSet) -> SqlFs {
        SqlFs { pool, tables }
    }

    /// Run one callback body with a pooled session, translating errors to
    /// errnos at the boundary.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Conn) -> Result<T>,
    ) -> std::result::Result<T, c_int> {
        let mut sess = self.pool.acquire().map_err(|e| {
            log::error!("session acquire failed: {}", e);
            e.errno()
        })?;
        f(sess.conn()).map_err(|e| {
            match e {
                // Expected outcomes, not faults.
                FsError::NotFound | FsError::NoAttr | FsError::NotEmpty | FsError::AttrExists => {}
                _ => log::error!("{}", e),
            }
            e.errno()
        })
    }

    fn attr_of(&self, conn: &mut Conn, target: &Path) -> Result<FileAttr> {
        let entry = path::resolve(conn, &self.tables, target, true)?;
        let st = meta::stat(conn, &self.tables, entry.inode)?;
        Ok(file_attr(&st, entry.nlinks))
    }

    /// The inode behind a callback: the handle if one was opened, the path
    /// otherwise.
    fn inode_for(&self, conn: &mut Conn, target: &Path, fh: Option<u64>) -> Result<u64> {
        match fh {
            Some(handle) => Ok(handle),
            None => path::resolve_inode(conn, &self.tables, target),
        }
    }

    /// Create an inode under `parent` and report its fresh attributes.
    fn create_node(
        &self,
        conn: &mut Conn,
        req: &RequestInfo,
        parent: &Path,
        name: &OsStr,
        mode: u32,
    ) -> Result<(u64, FileAttr)> {
        let parent_inode = path::resolve_inode(conn, &self.tables, parent)?;
        let inode = tree::make_node(
            conn,
            &self.tables,
            Some(parent_inode),
            name.as_bytes(),
            mode,
            req.uid,
            req.gid,
        )?;
        let st = meta::stat(conn, &self.tables, inode)?;
        Ok((inode, file_attr(&st, 1)))
    }
}

impl FilesystemMT for SqlFs {
    fn init(&self, _req: RequestInfo) -> ResultEmpty {
        log::info!("filesystem mounted");
        Ok(())
    }

    fn destroy(&self) {
        log::info!("filesystem unmounted");
    }

    fn getattr(&self, _req: RequestInfo, path: &Path, _fh: Option<u64>) -> ResultEntry {
        log::debug!("getattr({:?})", path);
        let attr = self.with_conn(|conn| self.attr_of(conn, path))?;
        Ok((TTL, attr))
    }

    fn chmod(&self, _req: RequestInfo, path: &Path, fh: Option<u64>, mode: u32) -> ResultEmpty {
        log::debug!("chmod({:?}, {:o})", path, mode);
        self.with_conn(|conn| {
            let inode = self.inode_for(conn, path, fh)?;
            meta::set_mode(conn, &self.tables, inode, mode)
        })
    }

    fn chown(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: Option<u64>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> ResultEmpty {
        log::debug!("chown({:?}, {:?}, {:?})", path, uid, gid);
        self.with_conn(|conn| {
            let inode = self.inode_for(conn, path, fh)?;
            meta::set_owner(conn, &self.tables, inode, uid, gid)
        })
    }

    fn truncate(&self, _req: RequestInfo, path: &Path, fh: Option<u64>, size: u64) -> ResultEmpty {
        log::debug!("truncate({:?}, {})", path, size);
        self.with_conn(|conn| {
            let inode = self.inode_for(conn, path, fh)?;
            io::truncate(conn, &self.tables, inode, size)
        })
    }

    fn utimens(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: Option<u64>,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> ResultEmpty {
        log::debug!("utimens({:?})", path);
        self.with_conn(|conn| {
            let inode = self.inode_for(conn, path, fh)?;
            meta::set_times(
                conn,
                &self.tables,
                inode,
                atime.map(epoch_secs),
                mtime.map(epoch_secs),
            )
        })
    }

    fn readlink(&self, _req: RequestInfo, path: &Path) -> ResultData {
        log::debug!("readlink({:?})", path);
        self.with_conn(|conn| {
            let inode = path::resolve_inode(conn, &self.tables, path)?;
            let size = meta::size(conn, &self.tables, inode)?;
            io::read(conn, &self.tables, inode, size, 0)
        })
    }

    fn mknod(
        &self,
        req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        mode: u32,
        _rdev: u32,
    ) -> ResultEntry {
        log::debug!("mknod({:?}, {:?}, {:o})", parent, name, mode);
        let (_, attr) = self.with_conn(|conn| self.create_node(conn, &req, parent, name, mode))?;
        Ok((TTL, attr))
    }

    fn mkdir(&self, req: RequestInfo, parent: &Path, name: &OsStr, mode: u32) -> ResultEntry {
        log::debug!("mkdir({:?}, {:?}, {:o})", parent, name, mode);
        let mode = mode | libc::S_IFDIR;
        let (_, attr) = self.with_conn(|conn| self.create_node(conn, &req, parent, name, mode))?;
        Ok((TTL, attr))
    }

    fn unlink(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        log::debug!("unlink({:?}, {:?})", parent, name);
        self.with_conn(|conn| tree::remove_path(conn, &self.tables, &parent.join(name)))
    }

    fn rmdir(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        log::debug!("rmdir({:?}, {:?})", parent, name);
        // Same operation as unlink; the emptiness check inside tells the
        // two apart.
        self.with_conn(|conn| tree::remove_path(conn, &self.tables, &parent.join(name)))
    }

    fn symlink(
        &self,
        req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        target: &Path,
    ) -> ResultEntry {
        log::debug!("symlink({:?}, {:?} -> {:?})", parent, name, target);
        let attr = self.with_conn(|conn| {
            let mode = libc::S_IFLNK | 0o755;
            let (inode, _) = self.create_node(conn, &req, parent, name, mode)?;
            io::write(conn, &self.tables, inode, target.as_os_str().as_bytes(), 0)?;
            let st = meta::stat(conn, &self.tables, inode)?;
            Ok(file_attr(&st, 1))
        })?;
        Ok((TTL, attr))
    }

    fn rename(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        newparent: &Path,
        newname: &OsStr,
    ) -> ResultEmpty {
        log::debug!(
            "rename({:?}/{:?} -> {:?}/{:?})",
            parent,
            name,
            newparent,
            newname
        );
        self.with_conn(|conn| {
            tree::rename_path(conn, &self.tables, parent, name, newparent, newname)
        })
    }

    fn link(
        &self,
        _req: RequestInfo,
        path: &Path,
        newparent: &Path,
        newname: &OsStr,
    ) -> ResultEntry {
        log::debug!("link({:?} -> {:?}/{:?})", path, newparent, newname);
        let attr = self.with_conn(|conn| {
            let inode = path::resolve_inode(conn, &self.tables, path)?;
            let parent_inode = path::resolve_inode(conn, &self.tables, newparent)?;
            tree::add_entry(conn, &self.tables, inode, newname.as_bytes(), parent_inode)?;
            self.attr_of(conn, &newparent.join(newname))
        })?;
        Ok((TTL, attr))
    }

    fn open(&self, _req: RequestInfo, path: &Path, flags: u32) -> ResultOpen {
        log::debug!("open({:?})", path);
        let inode = self.with_conn(|conn| {
            let inode = path::resolve_inode(conn, &self.tables, path)?;
            meta::adjust_inuse(conn, &self.tables, inode, 1)?;
            Ok(inode)
        })?;
        // The handle carries the inode so reads and writes skip path
        // resolution entirely.
        Ok((inode, flags))
    }

    fn read(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: u64,
        offset: u64,
        size: u32,
        callback: impl FnOnce(ResultSlice<'_>) -> CallbackResult,
    ) -> CallbackResult {
        log::debug!("read({:?}, {}@{})", path, size, offset);
        match self.with_conn(|conn| io::read(conn, &self.tables, fh, u64::from(size), offset)) {
            Ok(data) => callback(Ok(&data)),
            Err(errno) => callback(Err(errno)),
        }
    }

    fn write(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: u64,
        offset: u64,
        data: Vec<u8>,
        _flags: u32,
    ) -> ResultWrite {
        log::debug!("write({:?}, {}@{})", path, data.len(), offset);
        let written =
            self.with_conn(|conn| io::write(conn, &self.tables, fh, &data, offset))?;
        Ok(written as u32)
    }

    fn release(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> ResultEmpty {
        log::debug!("release({:?})", path);
        self.with_conn(|conn| {
            meta::adjust_inuse(conn, &self.tables, fh, -1)?;
            meta::purge_deleted(conn, &self.tables, fh)
        })
    }

    fn readdir(&self, _req: RequestInfo, path: &Path, _fh: u64) -> ResultReaddir {
        log::debug!("readdir({:?})", path);
        let rows = self.with_conn(|conn| {
            let inode = path::resolve_inode(conn, &self.tables, path)?;
            tree::list_dir(conn, &self.tables, inode)
        })?;

        let mut entries = vec![
            DirectoryEntry {
                name: ".".into(),
                kind: FileType::Directory,
            },
            DirectoryEntry {
                name: "..".into(),
                kind: FileType::Directory,
            },
        ];
        entries.extend(rows.into_iter().map(|(name, mode)| DirectoryEntry {
            name: OsStr::from_bytes(&name).to_os_string(),
            kind: kind_of(mode),
        }));
        Ok(entries)
    }

    fn statfs(&self, _req: RequestInfo, _path: &Path) -> ResultStatfs {
        log::debug!("statfs()");
        self.with_conn(|conn| {
            let files = stats::total_inodes(conn, &self.tables)?;
            let blocks = stats::total_blocks(conn, &self.tables)?;
            Ok(Statfs {
                blocks: blocks + STATFS_BLOCK_HEADROOM,
                bfree: STATFS_BLOCK_HEADROOM,
                bavail: STATFS_BLOCK_HEADROOM,
                files: files + STATFS_FILE_HEADROOM,
                ffree: STATFS_FILE_HEADROOM,
                bsize: DATA_BLOCK_SIZE as u32,
                namelen: 255,
                frsize: DATA_BLOCK_SIZE as u32,
            })
        })
    }

    fn setxattr(
        &self,
        _req: RequestInfo,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: u32,
        _position: u32,
    ) -> ResultEmpty {
        log::debug!("setxattr({:?}, {:?})", path, name);
        let mode = if flags & libc::XATTR_CREATE as u32 != 0 {
            XattrSet::Create
        } else if flags & libc::XATTR_REPLACE as u32 != 0 {
            XattrSet::Replace
        } else {
            XattrSet::Either
        };
        self.with_conn(|conn| {
            let inode = path::resolve_inode(conn, &self.tables, path)?;
            xattr::set(conn, &self.tables, inode, name.as_bytes(), value, mode)
        })
    }

    fn getxattr(&self, _req: RequestInfo, path: &Path, name: &OsStr, size: u32) -> ResultXattr {
        log::debug!("getxattr({:?}, {:?})", path, name);
        let data = self.with_conn(|conn| {
            let inode = path::resolve_inode(conn, &self.tables, path)?;
            xattr::get(conn, &self.tables, inode, name.as_bytes())
        })?;
        xattr_reply(data, size)
    }

    fn listxattr(&self, _req: RequestInfo, path: &Path, size: u32) -> ResultXattr {
        log::debug!("listxattr({:?})", path);
        let names = self.with_conn(|conn| {
            let inode = path::resolve_inode(conn, &self.tables, path)?;
            xattr::list(conn, &self.tables, inode)
        })?;
        let mut data = Vec::new();
        for name in names {
            data.extend_from_slice(&name);
            data.push(0);
        }
        xattr_reply(data, size)
    }

    fn removexattr(&self, _req: RequestInfo, path: &Path, name: &OsStr) -> ResultEmpty {
        log::debug!("removexattr({:?}, {:?})", path, name);
        self.with_conn(|conn| {
            let inode = path::resolve_inode(conn, &self.tables, path)?;
            xattr::remove(conn, &self.tables, inode, name.as_bytes())
        })
    }

    fn create(
        &self,
        req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> ResultCreate {
        log::debug!("create({:?}, {:?}, {:o})", parent, name, mode);
        let mode = if mode & libc::S_IFMT == 0 {
            mode | libc::S_IFREG
        } else {
            mode
        };
        let (inode, attr) = self.with_conn(|conn| {
            let (inode, attr) = self.create_node(conn, &req, parent, name, mode)?;
            meta::adjust_inuse(conn, &self.tables, inode, 1)?;
            Ok((inode, attr))
        })?;
        Ok(CreatedEntry {
            ttl: TTL,
            attr,
            fh: inode,
            flags,
        })
    }
}

/// The xattr size-probe protocol: a zero `size` asks for the required
/// length, anything else must fit the data.
fn xattr_reply(data: Vec<u8>, size: u32) -> ResultXattr {
    if size == 0 {
        Ok(Xattr::Size(data.len() as u32))
    } else if data.len() <= size as usize {
        Ok(Xattr::Data(data))
    } else {
        Err(FsError::BadRange.errno())
    }
}

fn file_attr(st: &InodeStat, nlinks: u64) -> FileAttr {
    FileAttr {
        size: st.size,
        blocks: (st.size + 511) / 512,
        atime: systime(st.atime),
        mtime: systime(st.mtime),
        ctime: systime(st.ctime),
        crtime: systime(st.ctime),
        kind: kind_of(st.mode),
        perm: (st.mode & 0o7777) as u16,
        nlink: nlinks as u32,
        uid: st.uid,
        gid: st.gid,
        rdev: 0,
        flags: 0,
    }
}

fn kind_of(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn systime(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_the_type_bits() {
        assert_eq!(kind_of(libc::S_IFDIR | 0o755), FileType::Directory);
        assert_eq!(kind_of(libc::S_IFLNK | 0o777), FileType::Symlink);
        assert_eq!(kind_of(libc::S_IFREG | 0o644), FileType::RegularFile);
        assert_eq!(kind_of(0o644), FileType::RegularFile);
    }

    #[test]
    fn attr_blocks_are_integer_512_byte_units() {
        let st = InodeStat {
            mode: libc::S_IFREG | 0o644,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            size: 513,
        };
        let attr = file_attr(&st, 1);
        assert_eq!(attr.blocks, 2);
        assert_eq!(attr.size, 513);
        assert_eq!(attr.perm, 0o644);

        let st = InodeStat { size: 0, ..st };
        assert_eq!(file_attr(&st, 1).blocks, 0);
    }

    #[test]
    fn xattr_probe_reports_size_then_data() {
        assert!(matches!(
            xattr_reply(vec![1, 2, 3], 0),
            Ok(Xattr::Size(3))
        ));
        assert!(matches!(
            xattr_reply(vec![1, 2, 3], 3),
            Ok(Xattr::Data(_))
        ));
        assert!(matches!(
            xattr_reply(vec![1, 2, 3], 2),
            Err(e) if e == libc::ERANGE
        ));
    }
}
