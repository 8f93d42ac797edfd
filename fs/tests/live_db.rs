//! End-to-end tests of the query layer against a real MySQL server.
//!
//! These are ignored by default because they need a live server; point
//! `SQLFS_TEST_URL` at a scratch database and run
//! `cargo test -- --ignored` to exercise them. Each test works in its own
//! set of prefixed tables, so the suite is safe to run in parallel.

mod util;

use std::path::Path;
use std::time::Duration;

use mysql::prelude::Queryable;

use sqlfs::{fsck, io, meta, path, stats, tree, xattr};
use sqlfs_api::error::FsError;
use sqlfs_api::pool::{Pool, PoolConfig};
use sqlfs_api::types::{TableSet, XattrSet, DATA_BLOCK_SIZE};

fn mknod_at(
    conn: &mut mysql::Conn,
    tables: &TableSet,
    dir: &str,
    name: &str,
    mode: u32,
) -> u64 {
    let parent = path::resolve_inode(conn, tables, Path::new(dir)).unwrap();
    tree::make_node(conn, tables, Some(parent), name.as_bytes(), mode, 1000, 1000).unwrap()
}

#[test]
#[ignore = "requires a MySQL server (SQLFS_TEST_URL)"]
fn write_then_read_roundtrip() {
    let (mut conn, t) = util::fresh_tables("it_rw_");
    let ino = mknod_at(&mut conn, &t, "/", "a", libc::S_IFREG | 0o644);

    assert_eq!(io::write(&mut conn, &t, ino, b"abcdefghij", 0).unwrap(), 10);
    assert_eq!(io::read(&mut conn, &t, ino, 10, 0).unwrap(), b"abcdefghij");
    assert_eq!(meta::size(&mut conn, &t, ino).unwrap(), 10);
    assert_eq!(util::block_rows(&mut conn, &t, ino), vec![(0, 10)]);
}

#[test]
#[ignore = "requires a MySQL server (SQLFS_TEST_URL)"]
fn sparse_blocks_read_as_zeros() {
    let (mut conn, t) = util::fresh_tables("it_sparse_");
    let ino = mknod_at(&mut conn, &t, "/", "b", libc::S_IFREG | 0o644);

    io::write(&mut conn, &t, ino, b"X", 2 * DATA_BLOCK_SIZE).unwrap();

    assert_eq!(
        io::read(&mut conn, &t, ino, 1, 2 * DATA_BLOCK_SIZE).unwrap(),
        b"X"
    );
    // The untouched leading blocks are holes and read back as zeros,
    // without any block row being fabricated for them.
    assert_eq!(io::read(&mut conn, &t, ino, 4, 0).unwrap(), vec![0u8; 4]);
    assert_eq!(util::block_rows(&mut conn, &t, ino), vec![(2, 1)]);
    // The recorded size is the sum of the stored block lengths; holes do
    // not count.
    assert_eq!(meta::size(&mut conn, &t, ino).unwrap(), 1);
}

#[test]
#[ignore = "requires a MySQL server (SQLFS_TEST_URL)"]
fn unlink_refuses_populated_directories() {
    let (mut conn, t) = util::fresh_tables("it_rmdir_");
    mknod_at(&mut conn, &t, "/", "d", libc::S_IFDIR | 0o755);
    mknod_at(&mut conn, &t, "/d", "f", libc::S_IFREG | 0o644);

    assert!(matches!(
        tree::remove_path(&mut conn, &t, Path::new("/d")),
        Err(FsError::NotEmpty)
    ));

    tree::remove_path(&mut conn, &t, Path::new("/d/f")).unwrap();
    tree::remove_path(&mut conn, &t, Path::new("/d")).unwrap();
    assert!(matches!(
        path::resolve_inode(&mut conn, &t, Path::new("/d")),
        Err(FsError::NotFound)
    ));
}

#[test]
#[ignore = "requires a MySQL server (SQLFS_TEST_URL)"]
fn hard_links_share_content() {
    let (mut conn, t) = util::fresh_tables("it_link_");
    let ino = mknod_at(&mut conn, &t, "/", "x", libc::S_IFREG | 0o644);
    io::write(&mut conn, &t, ino, b"payload", 0).unwrap();

    let root = path::resolve_inode(&mut conn, &t, Path::new("/")).unwrap();
    tree::add_entry(&mut conn, &t, ino, b"y", root).unwrap();

    let linked = path::resolve(&mut conn, &t, Path::new("/y"), true).unwrap();
    assert_eq!(linked.inode, ino);
    assert_eq!(linked.nlinks, 2);

    tree::remove_path(&mut conn, &t, Path::new("/x")).unwrap();

    let left = path::resolve(&mut conn, &t, Path::new("/y"), true).unwrap();
    assert_eq!(left.nlinks, 1);
    assert_eq!(io::read(&mut conn, &t, ino, 7, 0).unwrap(), b"payload");
}

#[test]
#[ignore = "requires a MySQL server (SQLFS_TEST_URL)"]
fn truncate_trims_and_pads() {
    let (mut conn, t) = util::fresh_tables("it_trunc_");
    let ino = mknod_at(&mut conn, &t, "/", "c", libc::S_IFREG | 0o644);

    io::write(&mut conn, &t, ino, &vec![b'A'; 10000], 0).unwrap();
    io::truncate(&mut conn, &t, ino, 5000).unwrap();

    assert_eq!(meta::size(&mut conn, &t, ino).unwrap(), 5000);
    assert_eq!(io::read(&mut conn, &t, ino, 1, 4999).unwrap(), b"A");
    // Past the new end there is nothing left to read.
    assert_eq!(io::read(&mut conn, &t, ino, 1, 5000).unwrap(), b"");
    // Blocks past the boundary are gone, the boundary block is trimmed.
    assert_eq!(
        util::block_rows(&mut conn, &t, ino),
        vec![(0, DATA_BLOCK_SIZE), (1, 5000 - DATA_BLOCK_SIZE)]
    );

    // Truncating up zero-pads the boundary block.
    io::truncate(&mut conn, &t, ino, 6000).unwrap();
    assert_eq!(meta::size(&mut conn, &t, ino).unwrap(), 6000);
    assert_eq!(io::read(&mut conn, &t, ino, 2, 4999).unwrap(), b"A\0");
}

#[test]
#[ignore = "requires a MySQL server (SQLFS_TEST_URL)"]
fn symlink_stores_its_target() {
    let (mut conn, t) = util::fresh_tables("it_symlink_");
    let ino = mknod_at(&mut conn, &t, "/", "s", libc::S_IFLNK | 0o755);
    io::write(&mut conn, &t, ino, b"target", 0).unwrap();

    let size = meta::size(&mut conn, &t, ino).unwrap();
    assert_eq!(io::read(&mut conn, &t, ino, size, 0).unwrap(), b"target");

    let st = meta::stat(&mut conn, &t, ino).unwrap();
    assert_eq!(st.mode & libc::S_IFMT, libc::S_IFLNK);
}

#[test]
#[ignore = "requires a MySQL server (SQLFS_TEST_URL)"]
fn three_block_write_is_head_middle_tail() {
    let (mut conn, t) = util::fresh_tables("it_span_");
    let ino = mknod_at(&mut conn, &t, "/", "f", libc::S_IFREG | 0o644);

    // Non-aligned start and end, spanning three blocks.
    let data: Vec<u8> = (0..(DATA_BLOCK_SIZE + 200) as usize)
        .map(|i| (i % 251) as u8)
        .collect();
    let offset = DATA_BLOCK_SIZE - 100;
    io::write(&mut conn, &t, ino, &data, offset).unwrap();

    let rows = util::block_rows(&mut conn, &t, ino);
    assert_eq!(
        rows,
        vec![(0, DATA_BLOCK_SIZE), (1, DATA_BLOCK_SIZE), (2, 100)]
    );
    assert_eq!(
        io::read(&mut conn, &t, ino, data.len() as u64, offset).unwrap(),
        data
    );
}

#[test]
#[ignore = "requires a MySQL server (SQLFS_TEST_URL)"]
fn overwrite_inside_a_block_preserves_the_tail() {
    let (mut conn, t) = util::fresh_tables("it_splice_");
    let ino = mknod_at(&mut conn, &t, "/", "f", libc::S_IFREG | 0o644);

    io::write(&mut conn, &t, ino, b"ABCDEF", 0).unwrap();
    io::write(&mut conn, &t, ino, b"xy", 2).unwrap();
    assert_eq!(io::read(&mut conn, &t, ino, 6, 0).unwrap(), b"ABxyEF");

    // Writing into a gap inside the block zero-fills up to the offset.
    io::write(&mut conn, &t, ino, b"Z", 10).unwrap();
    assert_eq!(io::read(&mut conn, &t, ino, 11, 0).unwrap(), b"ABxyEF\0\0\0\0Z");
}

#[test]
#[ignore = "requires a MySQL server (SQLFS_TEST_URL)"]
fn chmod_keeps_file_type_bits() {
    let (mut conn, t) = util::fresh_tables("it_chmod_");
    let ino = mknod_at(&mut conn, &t, "/", "f", libc::S_IFREG | 0o644);

    meta::set_mode(&mut conn, &t, ino, 0o600).unwrap();
    let st = meta::stat(&mut conn, &t, ino).unwrap();
    assert_eq!(st.mode & 0o7777, 0o600);
    assert_eq!(st.mode & libc::S_IFMT, libc::S_IFREG);

    meta::set_owner(&mut conn, &t, ino, Some(1), None).unwrap();
    meta::set_owner(&mut conn, &t, ino, None, None).unwrap();
    let st = meta::stat(&mut conn, &t, ino).unwrap();
    assert_eq!((st.uid, st.gid), (1, 1000));

    meta::set_times(&mut conn, &t, ino, Some(11), Some(22)).unwrap();
    let st = meta::stat(&mut conn, &t, ino).unwrap();
    assert_eq!((st.atime, st.mtime), (11, 22));
}

#[test]
#[ignore = "requires a MySQL server (SQLFS_TEST_URL)"]
fn rename_moves_and_replaces() {
    let (mut conn, t) = util::fresh_tables("it_rename_");
    mknod_at(&mut conn, &t, "/", "d", libc::S_IFDIR | 0o755);
    let a = mknod_at(&mut conn, &t, "/", "a", libc::S_IFREG | 0o644);
    let b = mknod_at(&mut conn, &t, "/d", "b", libc::S_IFREG | 0o644);
    io::write(&mut conn, &t, a, b"from a", 0).unwrap();

    // Rename over an existing target: the target entry goes away.
    tree::rename_path(
        &mut conn,
        &t,
        Path::new("/"),
        "a".as_ref(),
        Path::new("/d"),
        "b".as_ref(),
    )
    .unwrap();

    assert!(matches!(
        path::resolve_inode(&mut conn, &t, Path::new("/a")),
        Err(FsError::NotFound)
    ));
    let moved = path::resolve_inode(&mut conn, &t, Path::new("/d/b")).unwrap();
    assert_eq!(moved, a);
    assert_eq!(io::read(&mut conn, &t, a, 6, 0).unwrap(), b"from a");
    // The replaced inode is gone with its last entry.
    assert!(matches!(
        meta::stat(&mut conn, &t, b),
        Err(FsError::NotFound)
    ));
}

#[test]
#[ignore = "requires a MySQL server (SQLFS_TEST_URL)"]
fn open_unlinked_file_stays_readable_until_release() {
    let (mut conn, t) = util::fresh_tables("it_orphan_");
    let ino = mknod_at(&mut conn, &t, "/", "f", libc::S_IFREG | 0o644);
    io::write(&mut conn, &t, ino, b"still here", 0).unwrap();

    // open
    meta::adjust_inuse(&mut conn, &t, ino, 1).unwrap();
    // last unlink while the handle is open
    tree::remove_path(&mut conn, &t, Path::new("/f")).unwrap();

    assert!(matches!(
        path::resolve_inode(&mut conn, &t, Path::new("/f")),
        Err(FsError::NotFound)
    ));
    assert_eq!(io::read(&mut conn, &t, ino, 10, 0).unwrap(), b"still here");

    // release: the refcount drops and the purge reclaims the inode.
    meta::adjust_inuse(&mut conn, &t, ino, -1).unwrap();
    meta::purge_deleted(&mut conn, &t, ino).unwrap();
    assert!(matches!(
        meta::stat(&mut conn, &t, ino),
        Err(FsError::NotFound)
    ));
    assert!(util::block_rows(&mut conn, &t, ino).is_empty());
}

#[test]
#[ignore = "requires a MySQL server (SQLFS_TEST_URL)"]
fn xattr_flag_semantics() {
    let (mut conn, t) = util::fresh_tables("it_xattr_");
    let ino = mknod_at(&mut conn, &t, "/", "f", libc::S_IFREG | 0o644);

    xattr::set(&mut conn, &t, ino, b"user.one", b"1", XattrSet::Create).unwrap();
    assert!(matches!(
        xattr::set(&mut conn, &t, ino, b"user.one", b"1", XattrSet::Create),
        Err(FsError::AttrExists)
    ));
    assert!(matches!(
        xattr::set(&mut conn, &t, ino, b"user.two", b"2", XattrSet::Replace),
        Err(FsError::NoAttr)
    ));

    xattr::set(&mut conn, &t, ino, b"user.one", b"1'", XattrSet::Replace).unwrap();
    xattr::set(&mut conn, &t, ino, b"user.two", b"2", XattrSet::Either).unwrap();

    assert_eq!(xattr::get(&mut conn, &t, ino, b"user.one").unwrap(), b"1'");
    assert_eq!(
        xattr::list(&mut conn, &t, ino).unwrap(),
        vec![b"user.one".to_vec(), b"user.two".to_vec()]
    );

    xattr::remove(&mut conn, &t, ino, b"user.one").unwrap();
    assert!(matches!(
        xattr::remove(&mut conn, &t, ino, b"user.one"),
        Err(FsError::NoAttr)
    ));
}

#[test]
#[ignore = "requires a MySQL server (SQLFS_TEST_URL)"]
fn fsck_rebuilds_derived_fields() {
    let (mut conn, t) = util::fresh_tables("it_fsck_");
    let ino = mknod_at(&mut conn, &t, "/", "f", libc::S_IFREG | 0o644);
    io::write(&mut conn, &t, ino, b"0123456789", 0).unwrap();

    // Break every derived field fsck is supposed to repair.
    conn.exec_drop(
        format!("UPDATE {} SET datalength = 999 WHERE inode = ?", t.data_blocks),
        (ino,),
    )
    .unwrap();
    conn.exec_drop(
        format!("UPDATE {} SET size = 12345, inuse = 7 WHERE inode = ?", t.inodes),
        (ino,),
    )
    .unwrap();
    conn.query_drop(format!(
        "UPDATE {} SET `value` = '0'",
        t.statistics
    ))
    .unwrap();

    fsck::run(&mut conn, &t).unwrap();

    assert_eq!(util::block_rows(&mut conn, &t, ino), vec![(0, 10)]);
    assert_eq!(meta::size(&mut conn, &t, ino).unwrap(), 10);
    // Root plus the one file.
    assert_eq!(stats::total_inodes(&mut conn, &t).unwrap(), 2);
    assert_eq!(stats::total_blocks(&mut conn, &t).unwrap(), 1);

    let inuse: u64 = conn
        .exec_first(
            format!("SELECT inuse FROM {} WHERE inode = ?", t.inodes),
            (ino,),
        )
        .unwrap()
        .unwrap();
    assert_eq!(inuse, 0);
}

#[test]
#[ignore = "requires a MySQL server (SQLFS_TEST_URL)"]
fn pool_bounds_open_sessions() {
    let (_conn, t) = util::fresh_tables("it_pool_");
    let url = std::env::var("SQLFS_TEST_URL").unwrap();
    let opts = mysql::Opts::from_url(&url).unwrap();

    let cfg = PoolConfig {
        init_conns: 1,
        max_idling_conns: 2,
        max_open_conns: 2,
        acquire_timeout: Duration::from_millis(200),
    };
    let pool = Pool::init(opts, cfg, &t).unwrap();

    let first = pool.acquire().unwrap();
    let second = pool.acquire().unwrap();
    assert_eq!(pool.open_sessions(), 2);

    // At the ceiling with nothing released, the deadline expires.
    assert!(matches!(pool.acquire(), Err(FsError::PoolExhausted)));

    drop(first);
    let third = pool.acquire().unwrap();
    drop(second);
    drop(third);
    assert_eq!(pool.open_sessions(), 2);
}
