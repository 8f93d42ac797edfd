//! Shared foundation of the sqlfs workspace: the data shapes the query layer
//! speaks, the workspace-wide error type, and the database session pool.
//!
//! The companion crate `sqlfs` builds the actual filesystem on top of this:
//! a query layer translating POSIX operations into SQL, and a FUSE adapter
//! dispatching host callbacks into it. This crate stays free of any
//! filesystem semantics so that the split mirrors the responsibility line:
//! everything here is about *talking to the database safely from many
//! threads*, nothing here is about *what a filesystem means*.

#![deny(missing_docs)]

pub mod error;
pub mod pool;
pub mod types;
