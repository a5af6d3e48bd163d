//! Delivery of transfer handles between processes.
//!
//! A prepared context crosses as one descriptor. When the participant is
//! spawned by the host it inherits that descriptor directly, but a
//! pre-existing participant needs it delivered; this module sends it over
//! a Unix domain socket as an `SCM_RIGHTS` ancillary message, tagged with
//! a fixed envelope so a stray message on the socket is not mistaken for
//! a context.

use crate::arena::TransferHandle;
use crate::error::{Error, Result};
use rustix::fd::{BorrowedFd, OwnedFd};
use rustix::net::{
    recvmsg, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags,
};
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;

/// Fixed payload accompanying the descriptor, checked on receive.
const ENVELOPE: [u8; 8] = *b"HVRCTX01";

/// Send a prepared context's handle to a participant.
///
/// # Example
///
/// ```rust,ignore
/// use std::os::unix::net::UnixStream;
/// use handover::{prelude::*, transfer::send_handle};
///
/// let (host_side, _participant_side) = UnixStream::pair()?;
/// let mut ctx = Context::new()?;
/// ctx.add_object("config", b"threads=4")?;
///
/// let handle = ctx.prepare()?;
/// send_handle(&host_side, handle)?;
/// ```
pub fn send_handle(socket: &UnixStream, handle: TransferHandle) -> Result<()> {
    let raw = handle.as_raw_fd();
    if raw < 0 {
        return Err(Error::PlatformHandle(format!(
            "transfer handle {raw} is not an open descriptor"
        )));
    }
    // SAFETY: the borrow is scoped to this call; a stale number fails the
    // sendmsg below with EBADF.
    let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
    let fds = [borrowed];

    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = SendAncillaryBuffer::new(&mut ancillary_space);
    if !ancillary.push(SendAncillaryMessage::ScmRights(&fds)) {
        return Err(Error::PlatformHandle(
            "cannot stage transfer handle for sending".into(),
        ));
    }

    let iov = [IoSlice::new(&ENVELOPE)];
    sendmsg(socket, &iov, &mut ancillary, SendFlags::empty())?;
    tracing::debug!("transfer handle {} sent", raw);
    Ok(())
}

/// Receive a context handle sent with [`send_handle`].
///
/// The returned descriptor owns the image; keep it open until the context
/// has been inherited from it.
///
/// # Example
///
/// ```rust,ignore
/// use handover::{prelude::*, transfer::recv_handle};
///
/// let image = recv_handle(&participant_side)?;
/// let ctx = unsafe { Context::inherit(TransferHandle::from_raw_fd(image.as_raw_fd()))? };
/// ```
pub fn recv_handle(socket: &UnixStream) -> Result<OwnedFd> {
    let mut envelope = [0u8; ENVELOPE.len()];
    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = RecvAncillaryBuffer::new(&mut ancillary_space);

    let mut iov = [IoSliceMut::new(&mut envelope)];
    let result = recvmsg(socket, &mut iov, &mut ancillary, RecvFlags::empty())?;

    if result.bytes != ENVELOPE.len() || envelope != ENVELOPE {
        return Err(Error::InvalidImage(format!(
            "unexpected envelope of {} bytes on the transfer socket",
            result.bytes
        )));
    }

    let mut fds: Vec<OwnedFd> = Vec::new();
    for message in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = message {
            fds.extend(rights);
        }
    }
    if fds.len() != 1 {
        return Err(Error::InvalidImage(format!(
            "expected exactly one transfer handle, got {}",
            fds.len()
        )));
    }
    let fd = fds.remove(0);
    tracing::debug!("transfer handle received as fd {}", fd.as_raw_fd());
    Ok(fd)
}
