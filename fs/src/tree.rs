//! Directory tree operations: creating and removing entries, listing a
//! directory, hard links and rename.
//!
//! The tree table holds one row per directory entry; hard links are simply
//! several rows sharing an inode. The root is the single row whose `parent`
//! is NULL and whose name is `"/"`.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use mysql::prelude::Queryable;
use mysql::{Conn, TxOpts, Value};

use sqlfs_api::error::{FsError, Result};
use sqlfs_api::types::{ResolvedEntry, TableSet, NAME_MAX};

use crate::meta;
use crate::path;

/// Reject names wider than the `name` column.
fn check_name(name: &[u8]) -> Result<()> {
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

/// Create an inode together with its first directory entry, in one
/// transaction.
///
/// `parent` is `None` only for the root bootstrap, which inserts the single
/// `(name='/', parent=NULL)` row. Timestamps are taken server-side. Returns
/// the new inode number.
pub fn make_node(
    conn: &mut Conn,
    tables: &TableSet,
    parent: Option<u64>,
    name: &[u8],
    mode: u32,
    uid: u32,
    gid: u32,
) -> Result<u64> {
    let mut tx = conn.start_transaction(TxOpts::default())?;
    let inode = insert_node(&mut tx, tables, parent, name, mode, uid, gid)?;
    tx.commit()?;
    Ok(inode)
}

/// The statements behind [`make_node`], usable inside a larger transaction.
pub fn insert_node(
    q: &mut impl Queryable,
    tables: &TableSet,
    parent: Option<u64>,
    name: &[u8],
    mode: u32,
    uid: u32,
    gid: u32,
) -> Result<u64> {
    check_name(name)?;

    // The inode row goes first: its auto-increment key is the new inode
    // number, and the tree row references it.
    let sql = format!(
        "INSERT INTO {} (mode, uid, gid, atime, ctime, mtime) \
         VALUES (?, ?, ?, UNIX_TIMESTAMP(NOW()), UNIX_TIMESTAMP(NOW()), UNIX_TIMESTAMP(NOW()))",
        tables.inodes
    );
    log::debug!("sql={}", sql);
    let inode = q
        .exec_iter(&sql, (mode, uid, gid))?
        .last_insert_id()
        .ok_or(FsError::BadReply)?;

    let sql = format!(
        "INSERT INTO {} (name, parent, inode) VALUES (?, ?, ?)",
        tables.tree
    );
    log::debug!("sql={}", sql);
    q.exec_drop(
        &sql,
        (Value::Bytes(name.to_vec()), Value::from(parent), inode),
    )?;

    Ok(inode)
}

/// Add a directory entry for an existing inode (`link`).
pub fn add_entry(
    q: &mut impl Queryable,
    tables: &TableSet,
    inode: u64,
    name: &[u8],
    parent: u64,
) -> Result<()> {
    check_name(name)?;

    let sql = format!(
        "INSERT INTO {} (name, parent, inode) VALUES (?, ?, ?)",
        tables.tree
    );
    log::debug!("sql={}", sql);
    q.exec_drop(&sql, (Value::Bytes(name.to_vec()), parent, inode))?;
    Ok(())
}

/// Number of directory entries below the given inode. Non-directories never
/// have children, so this doubles as the emptiness test behind `rmdir`.
pub fn children_count(q: &mut impl Queryable, tables: &TableSet, inode: u64) -> Result<u64> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE parent = ?", tables.tree);
    log::debug!("sql={}", sql);

    let count: Option<u64> = q.exec_first(&sql, (inode,))?;
    count.ok_or(FsError::BadReply)
}

/// Every entry below a directory inode, as `(name, mode)` pairs. Names are
/// emitted exactly as stored; the order is whatever the database returns.
pub fn list_dir(
    q: &mut impl Queryable,
    tables: &TableSet,
    inode: u64,
) -> Result<Vec<(Vec<u8>, u32)>> {
    let sql = format!(
        "SELECT t.name, i.mode FROM {tree} t JOIN {inodes} i ON i.inode = t.inode \
         WHERE t.parent = ?",
        tree = tables.tree,
        inodes = tables.inodes,
    );
    log::debug!("sql={}", sql);

    Ok(q.exec(&sql, (inode,))?)
}

/// Remove an already-resolved directory entry, honoring the two-phase
/// delete lifecycle.
///
/// Fails with [`FsError::NotEmpty`] when the entry is a directory that
/// still has children. When the removed entry was the inode's last link,
/// the inode is tombstoned and a purge is attempted; with open handles the
/// purge does nothing and `release` finishes the job later.
pub fn remove_resolved(
    q: &mut impl Queryable,
    tables: &TableSet,
    entry: &ResolvedEntry,
) -> Result<()> {
    let parent = entry
        .parent
        .ok_or(FsError::InvalidArgument("cannot unlink the root entry"))?;

    if children_count(q, tables, entry.inode)? > 0 {
        return Err(FsError::NotEmpty);
    }

    let sql = format!(
        "DELETE FROM {} WHERE name = ? AND parent = ?",
        tables.tree
    );
    log::debug!("sql={}", sql);
    q.exec_drop(&sql, (Value::Bytes(entry.name.clone()), parent))?;

    // Further links keep the inode alive; the tombstone is only for the
    // last one.
    if entry.nlinks <= 1 {
        meta::set_deleted(q, tables, entry.inode)?;
        meta::purge_deleted(q, tables, entry.inode)?;
    }
    Ok(())
}

/// Resolve a path and remove its directory entry. `unlink` and `rmdir` are
/// the same operation here; the emptiness check inside tells them apart.
pub fn remove_path(q: &mut impl Queryable, tables: &TableSet, target: &Path) -> Result<()> {
    let entry = path::resolve(q, tables, target, true)?;
    remove_resolved(q, tables, &entry)
}

/// Move a directory entry to a new `(parent, name)`, in one transaction.
///
/// An entry already sitting at the destination is unlinked first,
/// best-effort: its failure is logged and ignored, and the rename itself
/// proceeds. Rolling back on any other failure leaves both names intact.
pub fn rename_path(
    conn: &mut Conn,
    tables: &TableSet,
    from_dir: &Path,
    from_name: &OsStr,
    to_dir: &Path,
    to_name: &OsStr,
) -> Result<()> {
    check_name(to_name.as_bytes())?;
    let from_path = from_dir.join(from_name);
    let to_path = to_dir.join(to_name);

    let mut tx = conn.start_transaction(TxOpts::default())?;

    match path::resolve(&mut tx, tables, &to_path, true) {
        Ok(target) => {
            if let Err(e) = remove_resolved(&mut tx, tables, &target) {
                log::warn!("rename: could not unlink target {:?}: {}", to_path, e);
            }
        }
        Err(FsError::NotFound) => {}
        Err(e) => return Err(e),
    }

    let entry = path::resolve(&mut tx, tables, &from_path, false)?;
    let old_parent = entry
        .parent
        .ok_or(FsError::InvalidArgument("cannot rename the root entry"))?;
    let new_parent = path::resolve_inode(&mut tx, tables, to_dir)?;

    let sql = format!(
        "UPDATE {} SET name = ?, parent = ? WHERE inode = ? AND name = ? AND parent = ?",
        tables.tree
    );
    log::debug!("sql={}", sql);
    tx.exec_drop(
        &sql,
        (
            Value::Bytes(to_name.as_bytes().to_vec()),
            new_parent,
            entry.inode,
            Value::Bytes(entry.name.clone()),
            old_parent,
        ),
    )?;

    tx.commit()?;
    Ok(())
}

/// Make sure the root entry exists, creating it through the regular mknod
/// path if the schema was seeded without one.
pub fn ensure_root(conn: &mut Conn, tables: &TableSet) -> Result<()> {
    match path::resolve(conn, tables, Path::new("/"), false) {
        Ok(_) => Ok(()),
        Err(FsError::NotFound) => {
            log::warn!("root entry missing, creating it");
            make_node(conn, tables, None, b"/", libc::S_IFDIR | 0o755, 0, 0)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_width_matches_the_column() {
        assert!(check_name(&[b'a'; NAME_MAX]).is_ok());
        assert!(matches!(
            check_name(&[b'a'; NAME_MAX + 1]),
            Err(FsError::NameTooLong)
        ));
        assert!(check_name(b"").is_ok());
    }
}
