//! Extended attributes: CRUD over `(inode, name) -> value`.
//!
//! Flag semantics follow setxattr(2): `XATTR_CREATE` refuses to overwrite,
//! `XATTR_REPLACE` refuses to create, and no flag does either. The
//! size-probe protocol of getxattr(2)/listxattr(2) is handled by the FUSE
//! adapter; this module only moves bytes.

use mysql::prelude::Queryable;
use mysql::Value;

use sqlfs_api::error::{FsError, Result};
use sqlfs_api::types::{TableSet, XattrSet};

/// Set one attribute on an inode.
pub fn set(
    q: &mut impl Queryable,
    tables: &TableSet,
    inode: u64,
    name: &[u8],
    value: &[u8],
    mode: XattrSet,
) -> Result<()> {
    match mode {
        XattrSet::Create => {
            if exists(q, tables, inode, name)? {
                return Err(FsError::AttrExists);
            }
            let sql = format!(
                "INSERT INTO {} (inode, name, value) VALUES (?, ?, ?)",
                tables.xattrs
            );
            log::debug!("sql={}", sql);
            q.exec_drop(
                &sql,
                (inode, Value::Bytes(name.to_vec()), Value::Bytes(value.to_vec())),
            )?;
        }
        XattrSet::Replace => {
            if !exists(q, tables, inode, name)? {
                return Err(FsError::NoAttr);
            }
            let sql = format!(
                "UPDATE {} SET value = ? WHERE inode = ? AND name = ?",
                tables.xattrs
            );
            log::debug!("sql={}", sql);
            q.exec_drop(
                &sql,
                (Value::Bytes(value.to_vec()), inode, Value::Bytes(name.to_vec())),
            )?;
        }
        XattrSet::Either => {
            let sql = format!(
                "INSERT INTO {} (inode, name, value) VALUES (?, ?, ?) \
                 ON DUPLICATE KEY UPDATE value = ?",
                tables.xattrs
            );
            log::debug!("sql={}", sql);
            q.exec_drop(
                &sql,
                (
                    inode,
                    Value::Bytes(name.to_vec()),
                    Value::Bytes(value.to_vec()),
                    Value::Bytes(value.to_vec()),
                ),
            )?;
        }
    }
    Ok(())
}

/// Read one attribute's value.
pub fn get(
    q: &mut impl Queryable,
    tables: &TableSet,
    inode: u64,
    name: &[u8],
) -> Result<Vec<u8>> {
    let sql = format!(
        "SELECT value FROM {} WHERE inode = ? AND name = ?",
        tables.xattrs
    );
    log::debug!("sql={}", sql);

    let row: Option<Vec<u8>> = q.exec_first(&sql, (inode, Value::Bytes(name.to_vec())))?;
    row.ok_or(FsError::NoAttr)
}

/// All attribute names on an inode.
pub fn list(q: &mut impl Queryable, tables: &TableSet, inode: u64) -> Result<Vec<Vec<u8>>> {
    let sql = format!(
        "SELECT name FROM {} WHERE inode = ? ORDER BY name",
        tables.xattrs
    );
    log::debug!("sql={}", sql);

    Ok(q.exec(&sql, (inode,))?)
}

/// Remove one attribute. Removing an absent name reports [`FsError::NoAttr`].
pub fn remove(q: &mut impl Queryable, tables: &TableSet, inode: u64, name: &[u8]) -> Result<()> {
    let sql = format!(
        "DELETE FROM {} WHERE inode = ? AND name = ?",
        tables.xattrs
    );
    log::debug!("sql={}", sql);

    let affected = q
        .exec_iter(&sql, (inode, Value::Bytes(name.to_vec())))?
        .affected_rows();
    if affected == 0 {
        return Err(FsError::NoAttr);
    }
    Ok(())
}

fn exists(q: &mut impl Queryable, tables: &TableSet, inode: u64, name: &[u8]) -> Result<bool> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE inode = ? AND name = ?",
        tables.xattrs
    );
    log::debug!("sql={}", sql);

    let count: Option<u64> = q.exec_first(&sql, (inode, Value::Bytes(name.to_vec())))?;
    Ok(count.ok_or(FsError::BadReply)? > 0)
}
