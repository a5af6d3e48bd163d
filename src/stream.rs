//! Platform stream handles and their reconstruction.
//!
//! Contexts store streams by handle value; this module is the one place
//! that knows how a handle flattens into an object payload and turns back
//! into a usable stream. Linux descriptors are small integers that a
//! participant inherits by table position, so the payload is just the
//! value in a fixed-width encoding. A port to another platform replaces
//! this file.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd};
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};

/// A raw platform handle lifted out of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamHandle(RawFd);

impl StreamHandle {
    /// Flatten into an object payload.
    pub(crate) fn to_payload(self) -> [u8; 8] {
        (self.0 as i64).to_le_bytes()
    }

    /// Recover a handle from an object payload.
    pub(crate) fn from_payload(payload: &[u8]) -> Result<StreamHandle> {
        let bytes: [u8; 8] = payload.try_into().map_err(|_| {
            Error::PlatformHandle(format!(
                "handle payload is {} bytes, expected 8",
                payload.len()
            ))
        })?;
        let wide = i64::from_le_bytes(bytes);
        let fd = RawFd::try_from(wide)
            .ok()
            .filter(|fd| *fd >= 0)
            .ok_or_else(|| Error::PlatformHandle(format!("{wide} is not a stream handle")))?;
        Ok(StreamHandle(fd))
    }
}

impl AsRawFd for StreamHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Take the platform handle behind a stream.
pub fn extract_handle<F: AsFd>(stream: &F) -> StreamHandle {
    StreamHandle(stream.as_fd().as_raw_fd())
}

/// Rebuild a stream from a stored handle.
///
/// Duplicates the handle, so the returned file owns its own descriptor
/// while sharing the original's open file description, read position
/// included. Fails with [`Error::PlatformHandle`] when the handle is not
/// open here.
pub fn reconstruct_stream(handle: StreamHandle) -> Result<File> {
    // SAFETY: the borrow never outlives this call, and the worst a stale
    // number yields is EBADF from the duplication below.
    let borrowed = unsafe { BorrowedFd::borrow_raw(handle.0) };
    let owned = rustix::io::fcntl_dupfd_cloexec(borrowed, 0).map_err(|e| {
        Error::PlatformHandle(format!("cannot adopt stream handle {}: {e}", handle.0))
    })?;
    Ok(File::from(owned))
}
