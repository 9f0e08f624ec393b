//! Adapter-level errors and their POSIX errno mapping.
//!
//! Kernel-bridge crates (`chatfs-fuse` today) each speak their own error
//! vocabulary, but all of them ultimately need to answer one question for
//! every failed call: which errno goes back to the kernel. Centralizing that
//! mapping here keeps it consistent if a second binding is ever added.

use chatfs_core::{ChunkError, CryptoError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no such file or directory")]
    NotFound,

    #[error("file already exists")]
    AlreadyExists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("operation not supported")]
    NotSupported,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl AdapterError {
    /// The POSIX error code the kernel should see for this failure.
    #[must_use]
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::AlreadyExists => libc::EEXIST,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::InvalidPath(_) => libc::EINVAL,
            Self::NotSupported => libc::ENOTSUP,
            Self::Crypto(_) | Self::Chunk(_) => libc::EIO,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Internal(_) => libc::EIO,
        }
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_enoent() {
        assert_eq!(AdapterError::NotFound.to_errno(), libc::ENOENT);
    }

    #[test]
    fn not_empty_maps_to_enotempty() {
        assert_eq!(AdapterError::NotEmpty.to_errno(), libc::ENOTEMPTY);
    }

    #[test]
    fn crypto_failures_surface_as_eio() {
        assert_eq!(AdapterError::Crypto(CryptoError::Corrupted).to_errno(), libc::EIO);
    }

    #[test]
    fn io_error_preserves_its_raw_errno_when_present() {
        let io_err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(AdapterError::Io(io_err).to_errno(), libc::EACCES);
    }
}
