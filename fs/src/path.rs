//! Path resolution over the self-joining tree table.
//!
//! An absolute path of depth `d` resolves with a single SELECT that joins
//! the tree table onto itself `d` times, anchored at the root row
//! (`t0.parent IS NULL`) and constraining each level's `name`. All path
//! components are bound as parameters; only table names and join aliases
//! are interpolated.

use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use mysql::prelude::Queryable;
use mysql::Value;

use sqlfs_api::error::{FsError, Result};
use sqlfs_api::types::{ResolvedEntry, TableSet, PATH_MAX};

/// Split a path into its non-empty components, as raw bytes.
///
/// Repeated and trailing slashes produce empty components, which are
/// discarded; the root path yields no components at all.
pub fn components(path: &Path) -> Vec<&[u8]> {
    path.as_os_str()
        .as_bytes()
        .split(|b| *b == b'/')
        .filter(|c| !c.is_empty())
        .collect()
}

/// Build the resolution statement for a path of the given depth.
///
/// With `want_nlinks` the link count comes from a correlated subquery over
/// the tree table; without it the statement reports a constant 1 and spares
/// the database the extra scan.
pub fn resolution_sql(tables: &TableSet, depth: usize, want_nlinks: bool) -> String {
    let mut from = format!("{} AS t0", tables.tree);
    let mut cond = String::from("t0.parent IS NULL");
    for level in 1..=depth {
        from.push_str(&format!(
            " JOIN {} AS t{} ON t{}.inode = t{}.parent",
            tables.tree,
            level,
            level - 1,
            level
        ));
        cond.push_str(&format!(" AND t{}.name = ?", level));
    }

    if want_nlinks {
        format!(
            "SELECT t{d}.inode, t{d}.name, t{d}.parent, \
             (SELECT COUNT(inode) FROM {tree} AS t{n} WHERE t{n}.inode = t{d}.inode) AS nlinks \
             FROM {from} WHERE {cond}",
            d = depth,
            n = depth + 1,
            tree = tables.tree,
            from = from,
            cond = cond,
        )
    } else {
        format!(
            "SELECT t{d}.inode, t{d}.name, t{d}.parent, 1 AS nlinks FROM {from} WHERE {cond}",
            d = depth,
            from = from,
            cond = cond,
        )
    }
}

/// Resolve an absolute path to its directory entry.
///
/// Fails with [`FsError::NotFound`] when the path does not name exactly one
/// entry, and with [`FsError::NameTooLong`] when the path itself exceeds
/// `PATH_MAX`.
pub fn resolve(
    q: &mut impl Queryable,
    tables: &TableSet,
    path: &Path,
    want_nlinks: bool,
) -> Result<ResolvedEntry> {
    if path.as_os_str().as_bytes().len() >= PATH_MAX {
        return Err(FsError::NameTooLong);
    }

    let parts = components(path);
    let sql = resolution_sql(tables, parts.len(), want_nlinks);
    log::debug!("sql={}", sql);

    let params: Vec<Value> = parts
        .iter()
        .map(|part| Value::Bytes(part.to_vec()))
        .collect();
    let row: Option<(u64, Vec<u8>, Option<u64>, u64)> = q.exec_first(&sql, params)?;

    match row {
        Some((inode, name, parent, nlinks)) => Ok(ResolvedEntry {
            inode,
            name,
            parent,
            nlinks,
        }),
        None => Err(FsError::NotFound),
    }
}

/// Resolve an absolute path to its inode number.
pub fn resolve_inode(q: &mut impl Queryable, tables: &TableSet, path: &Path) -> Result<u64> {
    Ok(resolve(q, tables, path, false)?.inode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn tables() -> TableSet {
        TableSet::with_prefix("")
    }

    #[test]
    fn components_discard_empty_parts() {
        assert_eq!(components(Path::new("/")), Vec::<&[u8]>::new());
        assert_eq!(components(Path::new("/a/b")), vec![b"a" as &[u8], b"b"]);
        assert_eq!(components(Path::new("//a///b/")), vec![b"a" as &[u8], b"b"]);
    }

    #[test]
    fn components_keep_raw_bytes() {
        let path = Path::new(OsStr::from_bytes(b"/sp ace/.hidden"));
        assert_eq!(
            components(path),
            vec![b"sp ace" as &[u8], b".hidden" as &[u8]]
        );
    }

    #[test]
    fn depth_zero_anchors_at_the_root_row() {
        let sql = resolution_sql(&tables(), 0, false);
        assert_eq!(
            sql,
            "SELECT t0.inode, t0.name, t0.parent, 1 AS nlinks \
             FROM tree AS t0 WHERE t0.parent IS NULL"
        );
    }

    #[test]
    fn each_level_adds_one_join_and_one_placeholder() {
        let sql = resolution_sql(&tables(), 3, false);
        assert_eq!(sql.matches(" JOIN tree AS ").count(), 3);
        assert_eq!(sql.matches('?').count(), 3);
        assert!(sql.contains("t2.inode = t3.parent"));
        assert!(sql.contains("SELECT t3.inode, t3.name, t3.parent"));
    }

    #[test]
    fn nlinks_come_from_a_correlated_subquery() {
        let sql = resolution_sql(&tables(), 1, true);
        assert!(sql.contains("SELECT COUNT(inode) FROM tree AS t2 WHERE t2.inode = t1.inode"));
        // Still one placeholder per path component.
        assert_eq!(sql.matches('?').count(), 1);
    }

    #[test]
    fn prefixed_tables_appear_in_the_join() {
        let sql = resolution_sql(&TableSet::with_prefix("fs_"), 2, false);
        assert!(sql.starts_with("SELECT t2.inode"));
        assert!(sql.contains("FROM fs_tree AS t0 JOIN fs_tree AS t1"));
    }
}
