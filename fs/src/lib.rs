//! sqlfs mounts a MySQL database as a POSIX directory tree.
//!
//! All persistent state (the directory tree, inode metadata, file
//! contents, extended attributes and usage statistics) lives in relational
//! tables; reads and writes under the mount point become SQL against them.
//! The crate is layered the way the data flows:
//!
//! 1. [`blocks`]: pure arithmetic mapping byte ranges onto fixed-size
//!    blocks.
//! 2. [`path`], [`meta`], [`tree`], [`io`], [`xattr`], [`stats`]: the
//!    query layer, stateless functions issuing one logical filesystem
//!    operation each over a borrowed database session.
//! 3. [`fuse`]: the adapter dispatching host callbacks into the query
//!    layer and mapping results onto errnos.
//! 4. [`fsck`]: offline repair rebuilding every derived field from ground
//!    truth.
//!
//! The session pool and the shared types live in the companion crate
//! `sqlfs_api`. The `sqlfs` binary (`src/main.rs`) wires configuration,
//! pool and adapter together.

#![deny(missing_docs)]

pub mod blocks;
pub mod config;
pub mod fsck;
pub mod fuse;
pub mod io;
pub mod meta;
pub mod path;
pub mod stats;
pub mod tree;
pub mod xattr;
