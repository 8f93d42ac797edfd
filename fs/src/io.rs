//! Block-addressed file I/O.
//!
//! File contents live in the data block table, one row per block actually
//! written; a row's `data` may be shorter than the block size, and rows
//! missing inside a file's extent are holes that read back as zeros. Every
//! multi-statement mutation (`write`, `truncate`) runs in one transaction:
//! dropping an uncommitted transaction rolls it back, so an early `?`
//! return leaves the file untouched, including the seed row inserted for
//! a block that did not exist yet.

use mysql::prelude::Queryable;
use mysql::{Conn, TxOpts, Value};

use sqlfs_api::error::{FsError, Result};
use sqlfs_api::types::{TableSet, DATA_BLOCK_SIZE};

use crate::blocks;

/// Read up to `size` bytes at `offset`.
///
/// Returns the bytes actually produced, which may be fewer than requested:
/// the walk stops early at a first block too short to cover the requested
/// offset, and a request past the end of the stored blocks simply runs out
/// of rows. Partial returns are legal, the host re-issues.
pub fn read(
    q: &mut impl Queryable,
    tables: &TableSet,
    inode: u64,
    size: u64,
    offset: u64,
) -> Result<Vec<u8>> {
    let span = blocks::span(size, offset);

    let sql = if span.seq_first == span.seq_last {
        format!(
            "SELECT seq, data, datalength FROM {} WHERE inode = ? AND seq = ?",
            tables.data_blocks
        )
    } else {
        format!(
            "SELECT seq, data, datalength FROM {} \
             WHERE inode = ? AND seq >= ? AND seq <= ? ORDER BY seq ASC",
            tables.data_blocks
        )
    };
    log::debug!("sql={}", sql);

    let rows: Vec<(u64, Vec<u8>, u64)> = if span.seq_first == span.seq_last {
        q.exec(&sql, (inode, span.seq_first))?
    } else {
        q.exec(&sql, (inode, span.seq_first, span.seq_last))?
    };

    let zeroes = vec![0u8; DATA_BLOCK_SIZE as usize];
    let mut out = Vec::with_capacity(size as usize);
    let mut row_iter = rows.into_iter().peekable();

    for seq in span.seq_first..=span.seq_last {
        let row = if row_iter.peek().map(|r| r.0) == Some(seq) {
            row_iter.next()
        } else {
            None
        };
        // A missing row is a sparse hole: a full block of zeros.
        let (data, datalength): (&[u8], u64) = match &row {
            Some((_, d, l)) => (d.as_slice(), (*l).min(d.len() as u64)),
            None => (zeroes.as_slice(), DATA_BLOCK_SIZE),
        };

        if seq == span.seq_first {
            if datalength < span.offset_first {
                // Short block: nothing stored at the requested offset.
                break;
            }
            let take = (datalength - span.offset_first).min(span.length_first) as usize;
            let start = span.offset_first as usize;
            out.extend_from_slice(&data[start..start + take]);
        } else if seq == span.seq_last {
            let take = span.length_last.min(datalength) as usize;
            out.extend_from_slice(&data[..take]);
        } else {
            let take = DATA_BLOCK_SIZE.min(datalength) as usize;
            out.extend_from_slice(&data[..take]);
        }
    }

    Ok(out)
}

/// Write `data` at `offset`, in one transaction.
///
/// The range is split on block boundaries: a partial head at
/// `(seq_first, offset_first)`, full intermediate blocks, and a tail of
/// `length_last` bytes. The inode's recorded size is recomputed from the
/// block rows before the commit. Returns the number of bytes written.
pub fn write(
    conn: &mut Conn,
    tables: &TableSet,
    inode: u64,
    data: &[u8],
    offset: u64,
) -> Result<usize> {
    let span = blocks::span(data.len() as u64, offset);
    let mut tx = conn.start_transaction(TxOpts::default())?;

    let head = &data[..span.length_first as usize];
    let mut written = write_one_block(
        &mut tx,
        tables,
        inode,
        span.seq_first,
        head,
        span.offset_first,
    )?;

    if span.seq_first != span.seq_last {
        let mut rest = &data[span.length_first as usize..];
        for seq in span.seq_first + 1..span.seq_last {
            written += write_one_block(
                &mut tx,
                tables,
                inode,
                seq,
                &rest[..DATA_BLOCK_SIZE as usize],
                0,
            )?;
            rest = &rest[DATA_BLOCK_SIZE as usize..];
        }
        // The tail is empty when the range ends exactly on a boundary.
        written += write_one_block(&mut tx, tables, inode, span.seq_last, rest, 0)?;
    }

    refresh_size(&mut tx, tables, inode)?;
    tx.commit()?;
    Ok(written)
}

/// Set a file's length to `new_len`, in one transaction: drop whole blocks
/// past the boundary, pad or trim the boundary block with RPAD, refresh its
/// cached length, and record the new size.
pub fn truncate(conn: &mut Conn, tables: &TableSet, inode: u64, new_len: u64) -> Result<()> {
    let span = blocks::span(new_len, 0);
    let mut tx = conn.start_transaction(TxOpts::default())?;

    let sql = format!(
        "DELETE FROM {} WHERE inode = ? AND seq > ?",
        tables.data_blocks
    );
    log::debug!("sql={}", sql);
    tx.exec_drop(&sql, (inode, span.seq_last))?;

    // Both trims and zero-pads the boundary block; a no-op when that block
    // was never written.
    let sql = format!(
        "UPDATE {} SET data = RPAD(data, {}, '\\0') WHERE inode = ? AND seq = ?",
        tables.data_blocks, span.length_last
    );
    log::debug!("sql={}", sql);
    tx.exec_drop(&sql, (inode, span.seq_last))?;

    refresh_datalength(&mut tx, tables, inode, span.seq_last)?;

    let sql = format!("UPDATE {} SET size = ? WHERE inode = ?", tables.inodes);
    log::debug!("sql={}", sql);
    tx.exec_drop(&sql, (new_len, inode))?;

    tx.commit()?;
    Ok(())
}

/// Write `buf` into one block at byte `off` within that block.
///
/// The caller is responsible for splitting on block boundaries; a range
/// crossing one is an internal invariant violation. A block row that does
/// not exist yet is seeded empty first, inside the caller's transaction,
/// so a later failure discards the seed. Returns `buf.len()`.
pub fn write_one_block(
    q: &mut impl Queryable,
    tables: &TableSet,
    inode: u64,
    seq: u64,
    buf: &[u8],
    off: u64,
) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let len = buf.len() as u64;
    if off + len > DATA_BLOCK_SIZE {
        return Err(FsError::InvalidArgument("block write crosses a boundary"));
    }

    let current = match block_length(q, tables, inode, seq)? {
        Some(n) => n,
        None => {
            let sql = format!(
                "INSERT INTO {} (inode, seq, data, datalength) VALUES (?, ?, '', 0)",
                tables.data_blocks
            );
            log::debug!("sql={}", sql);
            q.exec_drop(&sql, (inode, seq))?;
            0
        }
    };

    let sql = block_update_sql(tables, off, len, current);
    log::debug!("sql={}", sql);
    q.exec_drop(&sql, (Value::Bytes(buf.to_vec()), inode, seq))?;

    refresh_datalength(q, tables, inode, seq)?;
    Ok(buf.len())
}

/// Choose the UPDATE shape for one block write. The payload is always the
/// single `?` placeholder; only trusted arithmetic is interpolated.
///
/// * Fresh block written from its start: plain assignment.
/// * Write starting exactly at the current end: append via CONCAT.
/// * Anything else: a splice. Left-pad the existing data with NULs out to
///   `off` (which also fills a gap inside the block), insert the payload,
///   and keep whatever tail survives past `off + len`.
fn block_update_sql(tables: &TableSet, off: u64, len: u64, current: u64) -> String {
    if off == 0 && current == 0 {
        format!(
            "UPDATE {} SET data = ? WHERE inode = ? AND seq = ?",
            tables.data_blocks
        )
    } else if off == current {
        format!(
            "UPDATE {} SET data = CONCAT(data, ?) WHERE inode = ? AND seq = ?",
            tables.data_blocks
        )
    } else {
        let mut parts = Vec::new();
        if off > 0 {
            parts.push(format!("RPAD(IFNULL(data, ''), {}, '\\0')", off));
        }
        parts.push(String::from("?"));
        if off + len < current {
            parts.push(format!("SUBSTRING(data FROM {})", off + len + 1));
        }
        format!(
            "UPDATE {} SET data = CONCAT({}) WHERE inode = ? AND seq = ?",
            tables.data_blocks,
            parts.join(", ")
        )
    }
}

/// Cached length of one block, or `None` when the row does not exist.
fn block_length(
    q: &mut impl Queryable,
    tables: &TableSet,
    inode: u64,
    seq: u64,
) -> Result<Option<u64>> {
    let sql = format!(
        "SELECT datalength FROM {} WHERE inode = ? AND seq = ?",
        tables.data_blocks
    );
    log::debug!("sql={}", sql);
    Ok(q.exec_first(&sql, (inode, seq))?)
}

/// Re-derive `datalength` from the stored bytes of one block.
fn refresh_datalength(
    q: &mut impl Queryable,
    tables: &TableSet,
    inode: u64,
    seq: u64,
) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET datalength = OCTET_LENGTH(data) WHERE inode = ? AND seq = ?",
        tables.data_blocks
    );
    log::debug!("sql={}", sql);
    q.exec_drop(&sql, (inode, seq))?;
    Ok(())
}

/// Re-derive an inode's size as the sum of its blocks' cached lengths.
fn refresh_size(q: &mut impl Queryable, tables: &TableSet, inode: u64) -> Result<()> {
    let sql = format!(
        "UPDATE {inodes} SET size = \
         (SELECT CAST(IFNULL(SUM(datalength), 0) AS UNSIGNED) FROM {blocks} WHERE inode = ?) \
         WHERE inode = ?",
        inodes = tables.inodes,
        blocks = tables.data_blocks,
    );
    log::debug!("sql={}", sql);
    q.exec_drop(&sql, (inode, inode))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> TableSet {
        TableSet::with_prefix("")
    }

    #[test]
    fn fresh_block_from_offset_zero_is_plain_assignment() {
        let sql = block_update_sql(&tables(), 0, 100, 0);
        assert_eq!(sql, "UPDATE data_blocks SET data = ? WHERE inode = ? AND seq = ?");
    }

    #[test]
    fn write_at_current_end_appends() {
        let sql = block_update_sql(&tables(), 100, 50, 100);
        assert_eq!(
            sql,
            "UPDATE data_blocks SET data = CONCAT(data, ?) WHERE inode = ? AND seq = ?"
        );
    }

    #[test]
    fn overwrite_in_the_middle_keeps_the_tail() {
        // 200 bytes stored; writing 50 at offset 100 must keep [150..200).
        let sql = block_update_sql(&tables(), 100, 50, 200);
        assert!(sql.contains("RPAD(IFNULL(data, ''), 100, '\\0')"));
        assert!(sql.contains("SUBSTRING(data FROM 151)"));
        assert_eq!(sql.matches('?').count(), 3);
    }

    #[test]
    fn gap_fill_pads_but_keeps_no_tail() {
        // 10 bytes stored; writing 20 at offset 50 pads the gap and the
        // old tail is gone (off + len >= current).
        let sql = block_update_sql(&tables(), 50, 20, 10);
        assert!(sql.contains("RPAD(IFNULL(data, ''), 50, '\\0')"));
        assert!(!sql.contains("SUBSTRING"));
    }

    #[test]
    fn overwrite_of_shrunken_prefix_keeps_tail_without_padding() {
        // Writing at offset 0 over a longer block: no RPAD, tail kept.
        let sql = block_update_sql(&tables(), 0, 50, 200);
        assert!(!sql.contains("RPAD"));
        assert!(sql.contains("SUBSTRING(data FROM 51)"));
    }
}
