//! Offline consistency repair.
//!
//! Every derived field in the schema (`inuse`, `datalength`, `size`, the
//! statistics counters) can be rebuilt from ground truth, and a crashed
//! mount can leave tombstoned inodes or orphan rows behind. `run` walks the
//! repair stages in order, each as its own statement; a stage is never
//! rolled back, and the first fault ends the run with the database error.

use mysql::prelude::Queryable;
use mysql::Conn;

use sqlfs_api::error::{FsError, Result};
use sqlfs_api::types::TableSet;

/// Run all repair stages.
pub fn run(conn: &mut Conn, tables: &TableSet) -> Result<()> {
    log::info!("fsck: starting");

    step(
        conn,
        "stage 1: drop tombstoned inodes",
        format!("DELETE FROM {} WHERE deleted = 1", tables.inodes),
    )?;

    step(
        conn,
        "stage 2: drop directory entries without an inode",
        format!(
            "DELETE FROM {} WHERE inode NOT IN (SELECT inode FROM {})",
            tables.tree, tables.inodes
        ),
    )?;

    step(
        conn,
        "stage 3: clear open-handle counts",
        format!("UPDATE {} SET inuse = 0", tables.inodes),
    )?;

    step(
        conn,
        "stage 4: drop data blocks without an inode",
        format!(
            "DELETE FROM {} WHERE inode NOT IN (SELECT inode FROM {})",
            tables.data_blocks, tables.inodes
        ),
    )?;
    step(
        conn,
        "stage 4: drop attributes without an inode",
        format!(
            "DELETE FROM {} WHERE inode NOT IN (SELECT inode FROM {})",
            tables.xattrs, tables.inodes
        ),
    )?;

    step(
        conn,
        "stage 5: resync cached block lengths",
        format!(
            "UPDATE {} SET datalength = OCTET_LENGTH(data)",
            tables.data_blocks
        ),
    )?;
    step(
        conn,
        "stage 5: recompute inode sizes",
        format!(
            "UPDATE {inodes} i \
             LEFT JOIN (SELECT inode, SUM(datalength) AS total FROM {blocks} GROUP BY inode) b \
             ON b.inode = i.inode \
             SET i.size = CAST(IFNULL(b.total, 0) AS UNSIGNED)",
            inodes = tables.inodes,
            blocks = tables.data_blocks,
        ),
    )?;

    step(
        conn,
        "stage 6: rebuild inode count",
        format!(
            "INSERT INTO {stats} (`key`, `value`) \
             SELECT 'total_inodes_count', CAST(COUNT(*) AS CHAR) FROM {inodes} \
             ON DUPLICATE KEY UPDATE `value` = VALUES(`value`)",
            stats = tables.statistics,
            inodes = tables.inodes,
        ),
    )?;
    step(
        conn,
        "stage 6: rebuild total size",
        format!(
            "INSERT INTO {stats} (`key`, `value`) \
             SELECT 'total_inodes_size', CAST(IFNULL(SUM(size), 0) AS CHAR) FROM {inodes} \
             ON DUPLICATE KEY UPDATE `value` = VALUES(`value`)",
            stats = tables.statistics,
            inodes = tables.inodes,
        ),
    )?;

    step(
        conn,
        "stage 7: optimize inode table",
        format!("OPTIMIZE TABLE {}", tables.inodes),
    )?;
    step(
        conn,
        "stage 7: optimize tree table",
        format!("OPTIMIZE TABLE {}", tables.tree),
    )?;

    log::info!("fsck: done");
    Ok(())
}

fn step(conn: &mut Conn, what: &str, sql: String) -> Result<()> {
    log::info!("fsck: {}", what);
    log::debug!("sql={}", sql);
    conn.query_drop(sql).map_err(|e| {
        log::error!("fsck: {} failed: {}", what, e);
        FsError::Db(e)
    })
}
