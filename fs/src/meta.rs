//! Inode metadata operations: attribute reads and the single-row updates
//! behind `chmod`, `chown`, `utime`, `open` and the delete lifecycle.
//!
//! Deletion is two-phase. Removing the last directory entry only *marks* an
//! inode deleted while handles remain open (`inuse > 0`); the row is
//! physically purged once both `inuse = 0` and `deleted = 1` hold, and the
//! referential cascades reclaim its blocks and attributes.

use mysql::prelude::Queryable;
use mysql::Value;

use sqlfs_api::error::{FsError, Result};
use sqlfs_api::types::{InodeStat, TableSet};

/// Read one inode's attributes. A missing row means the inode went away
/// between resolution and this read.
pub fn stat(q: &mut impl Queryable, tables: &TableSet, inode: u64) -> Result<InodeStat> {
    let sql = format!(
        "SELECT mode, uid, gid, atime, mtime, ctime, size FROM {} WHERE inode = ?",
        tables.inodes
    );
    log::debug!("sql={}", sql);

    let row: Option<(u32, u32, u32, u64, u64, u64, u64)> = q.exec_first(&sql, (inode,))?;
    match row {
        Some((mode, uid, gid, atime, mtime, ctime, size)) => Ok(InodeStat {
            mode,
            uid,
            gid,
            atime,
            mtime,
            ctime,
            size,
        }),
        None => Err(FsError::NotFound),
    }
}

/// Read an inode's recorded size.
///
/// The value is the one maintained by the writers (`write`, `truncate`,
/// fsck), not a live sum over the block rows.
pub fn size(q: &mut impl Queryable, tables: &TableSet, inode: u64) -> Result<u64> {
    let sql = format!("SELECT size FROM {} WHERE inode = ?", tables.inodes);
    log::debug!("sql={}", sql);

    let row: Option<u64> = q.exec_first(&sql, (inode,))?;
    row.ok_or(FsError::BadReply)
}

/// Change an inode's permission bits, preserving the file type bits of the
/// stored mode.
pub fn set_mode(q: &mut impl Queryable, tables: &TableSet, inode: u64, mode: u32) -> Result<()> {
    // 61440 = S_IFMT, 4095 = permission bits incl. suid/sgid/sticky.
    let sql = format!(
        "UPDATE {} SET mode = ((mode & 61440) | (? & 4095)) WHERE inode = ?",
        tables.inodes
    );
    log::debug!("sql={}", sql);

    q.exec_drop(&sql, (mode, inode))?;
    Ok(())
}

/// Build an UPDATE that sets only the supplied columns of one inode row.
/// Returns `None` when no column is supplied at all.
fn partial_update(
    tables: &TableSet,
    inode: u64,
    fields: &[(&str, Option<u64>)],
) -> Option<(String, Vec<Value>)> {
    let mut sets = Vec::new();
    let mut params = Vec::new();
    for (column, value) in fields {
        if let Some(v) = value {
            sets.push(format!("{} = ?", column));
            params.push(Value::from(*v));
        }
    }
    if sets.is_empty() {
        return None;
    }
    params.push(Value::from(inode));
    Some((
        format!(
            "UPDATE {} SET {} WHERE inode = ?",
            tables.inodes,
            sets.join(", ")
        ),
        params,
    ))
}

/// Change an inode's owning uid and/or gid. An absent value leaves the
/// corresponding column untouched; with both absent there is nothing to do
/// and no statement is issued.
pub fn set_owner(
    q: &mut impl Queryable,
    tables: &TableSet,
    inode: u64,
    uid: Option<u32>,
    gid: Option<u32>,
) -> Result<()> {
    let fields = [
        ("uid", uid.map(u64::from)),
        ("gid", gid.map(u64::from)),
    ];
    match partial_update(tables, inode, &fields) {
        Some((sql, params)) => {
            log::debug!("sql={}", sql);
            q.exec_drop(&sql, params)?;
            Ok(())
        }
        None => Ok(()),
    }
}

/// Update an inode's access and/or modification times (epoch seconds).
/// Absent values leave the corresponding column untouched.
pub fn set_times(
    q: &mut impl Queryable,
    tables: &TableSet,
    inode: u64,
    atime: Option<u64>,
    mtime: Option<u64>,
) -> Result<()> {
    let fields = [("atime", atime), ("mtime", mtime)];
    match partial_update(tables, inode, &fields) {
        Some((sql, params)) => {
            log::debug!("sql={}", sql);
            q.exec_drop(&sql, params)?;
            Ok(())
        }
        None => Ok(()),
    }
}

/// Adjust the open-handle reference count by `delta` (+1 on `open`, -1 on
/// `release`).
pub fn adjust_inuse(
    q: &mut impl Queryable,
    tables: &TableSet,
    inode: u64,
    delta: i64,
) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET inuse = inuse + ? WHERE inode = ?",
        tables.inodes
    );
    log::debug!("sql={}", sql);

    q.exec_drop(&sql, (delta, inode))?;
    Ok(())
}

/// Mark an inode deleted, but only if no directory entry references it any
/// more. The guard lives in the statement itself: the LEFT JOIN finds no
/// tree row exactly when the last entry is gone.
pub fn set_deleted(q: &mut impl Queryable, tables: &TableSet, inode: u64) -> Result<()> {
    let sql = format!(
        "UPDATE {inodes} i LEFT JOIN {tree} t ON i.inode = t.inode \
         SET i.deleted = 1 WHERE i.inode = ? AND t.name IS NULL",
        inodes = tables.inodes,
        tree = tables.tree,
    );
    log::debug!("sql={}", sql);

    q.exec_drop(&sql, (inode,))?;
    Ok(())
}

/// Physically delete an inode that is tombstoned and no longer open.
/// Block and attribute rows go with it through the cascades.
pub fn purge_deleted(q: &mut impl Queryable, tables: &TableSet, inode: u64) -> Result<()> {
    let sql = format!(
        "DELETE FROM {} WHERE inode = ? AND inuse = 0 AND deleted = 1",
        tables.inodes
    );
    log::debug!("sql={}", sql);

    q.exec_drop(&sql, (inode,))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> TableSet {
        TableSet::with_prefix("")
    }

    #[test]
    fn partial_update_with_no_fields_builds_nothing() {
        assert!(partial_update(&tables(), 7, &[("uid", None), ("gid", None)]).is_none());
    }

    #[test]
    fn partial_update_sets_only_supplied_columns() {
        let (sql, params) =
            partial_update(&tables(), 7, &[("uid", Some(1000)), ("gid", None)]).unwrap();
        assert_eq!(sql, "UPDATE inodes SET uid = ? WHERE inode = ?");
        assert_eq!(params.len(), 2);

        let (sql, params) =
            partial_update(&tables(), 7, &[("atime", Some(1)), ("mtime", Some(2))]).unwrap();
        assert_eq!(sql, "UPDATE inodes SET atime = ?, mtime = ? WHERE inode = ?");
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn partial_update_respects_table_prefix() {
        let t = TableSet::with_prefix("fs_");
        let (sql, _) = partial_update(&t, 1, &[("gid", Some(5))]).unwrap();
        assert!(sql.starts_with("UPDATE fs_inodes SET gid = ?"));
    }
}
