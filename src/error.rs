//! Error types for magmad

use thiserror::Error;

/// Result type alias using the magmad Error
pub type Result<T> = std::result::Result<T, Error>;

/// magmad error types
///
/// Every variant maps to a wire `errno` via [`Error::to_errno`], per the
/// propagation policy in the error handling design: handlers translate any
/// local failure into `(result=-1, errno=k)` before it goes out on the wire.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error talking to the hashpath or catalog file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Local catalog (SQLite) error
    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    /// Configuration error (bad CLI flags, missing hashpath, ...)
    #[error("configuration error: {0}")]
    Config(String),

    /// No volcano owns this key (empty ring, or topology corruption)
    #[error("routing error: {0}")]
    Routing(String),

    /// Malformed request/response on the wire
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Join, topology transmit, or coordinated boot failure
    #[error("membership error: {0}")]
    Membership(String),

    /// Replica task failed (logged, does not undo the owner's success)
    #[error("replication error: {0}")]
    Replication(String),

    /// uid/gid/ACL denial
    #[error("permission denied")]
    PermissionDenied,

    /// Path has no flare
    #[error("no such flare: {0}")]
    NotFound(String),

    /// Operation required a directory
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Operation forbade a directory
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// rmdir on a non-empty directory
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// mknod/mkdir/symlink on an existing path
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// rename always fails: MAGMA has no cross-owner rename
    #[error("cross-device link")]
    CrossDevice,

    /// Bad argument to an operation (e.g. mknod with S_IFDIR)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Sender exhausted RETRY_LIMIT * AGAIN_LIMIT without a reply
    #[error("would retry")]
    WouldRetry,
}

impl Error {
    /// Convert to a POSIX errno for the wire response header.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Catalog(_) => libc::EIO,
            Error::Config(_) => libc::EINVAL,
            Error::Routing(_) => libc::EIO,
            Error::Protocol(_) => libc::EIO,
            Error::Membership(_) => libc::EIO,
            Error::Replication(_) => libc::EIO,
            Error::PermissionDenied => libc::EACCES,
            Error::NotFound(_) => libc::ENOENT,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::CrossDevice => libc::EXDEV,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::WouldRetry => libc::EIO,
        }
    }
}
