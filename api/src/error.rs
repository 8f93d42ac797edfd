//! The error type shared by the pool, the query layer and the FUSE adapter.
//!
//! Every operation in this project returns [`Result`]. The taxonomy is
//! deliberately small: each variant corresponds to exactly one POSIX errno,
//! and anything the database reports (bad SQL, a lost connection, a failed
//! prepare/bind/execute, an unexpected result shape) collapses into an I/O
//! error at the host boundary. Errors propagate upward unchanged; logging is
//! a side channel and never rewrites the returned code.

use libc::c_int;
use thiserror::Error;

/// Error type used across both crates of this workspace.
#[derive(Error, Debug)]
pub enum FsError {
    /// Path resolution produced no row, or an inode vanished underneath us.
    #[error("no such entry")]
    NotFound,

    /// Attempt to remove a directory that still has children.
    #[error("directory not empty")]
    NotEmpty,

    /// A path exceeded `PATH_MAX` or a single name exceeded `NAME_MAX`.
    #[error("name too long")]
    NameTooLong,

    /// The session pool hit its connection ceiling and the acquire deadline
    /// expired before another caller released a session.
    #[error("session pool exhausted")]
    PoolExhausted,

    /// Extended attribute not present on the inode.
    #[error("no such attribute")]
    NoAttr,

    /// `XATTR_CREATE` on a name that is already set.
    #[error("attribute already exists")]
    AttrExists,

    /// The caller's buffer is too small for the attribute data.
    #[error("buffer too small")]
    BadRange,

    /// An internal contract was violated, e.g. a block write that was not
    /// split on a block boundary by its caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Any fault reported by the database client.
    #[error("database error: {0}")]
    Db(#[from] mysql::Error),

    /// A statement succeeded but returned a result of unexpected shape,
    /// e.g. a scalar query that produced no row.
    #[error("unexpected result shape")]
    BadReply,
}

impl FsError {
    /// The errno this error maps to at the host boundary.
    ///
    /// Returned as a positive value; the FUSE dispatch layer negates it on
    /// the wire.
    pub fn errno(&self) -> c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::PoolExhausted => libc::EMFILE,
            FsError::NoAttr => libc::ENODATA,
            FsError::AttrExists => libc::EEXIST,
            FsError::BadRange => libc::ERANGE,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::Db(_) | FsError::BadReply => libc::EIO,
        }
    }
}

/// Generic alias for a `Result` with the error type [`FsError`].
pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::NotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(FsError::PoolExhausted.errno(), libc::EMFILE);
        assert_eq!(FsError::BadReply.errno(), libc::EIO);
        assert_eq!(FsError::InvalidArgument("x").errno(), libc::EINVAL);
    }
}
