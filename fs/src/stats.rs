//! Readers for the statistics table.
//!
//! The two counters feeding `statfs` are stored as strings and rebuilt by
//! fsck; writers do not maintain them transactionally, so the values are
//! informational only and clients must not rely on them for correctness.

use mysql::prelude::Queryable;

use sqlfs_api::error::{FsError, Result};
use sqlfs_api::types::{TableSet, DATA_BLOCK_SIZE};

/// Total number of inodes, as last recorded by fsck.
pub fn total_inodes(q: &mut impl Queryable, tables: &TableSet) -> Result<u64> {
    let sql = format!(
        "SELECT CAST(`value` AS UNSIGNED) FROM {} WHERE `key` = 'total_inodes_count'",
        tables.statistics
    );
    log::debug!("sql={}", sql);

    let row: Option<u64> = q.query_first(&sql)?;
    row.ok_or(FsError::BadReply)
}

/// Total data blocks implied by the recorded byte total, rounded up to
/// whole blocks.
pub fn total_blocks(q: &mut impl Queryable, tables: &TableSet) -> Result<u64> {
    let sql = format!(
        "SELECT CAST(CEIL(CAST(`value` AS UNSIGNED) / {}) AS UNSIGNED) \
         FROM {} WHERE `key` = 'total_inodes_size'",
        DATA_BLOCK_SIZE, tables.statistics
    );
    log::debug!("sql={}", sql);

    let row: Option<u64> = q.query_first(&sql)?;
    row.ok_or(FsError::BadReply)
}
