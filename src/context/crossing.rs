//! The two sides of a boundary crossing.
//!
//! [`Context::prepare`] runs in the host immediately before handing the
//! context over; [`Context::inherit`] runs in the participant once the
//! transfer handle has arrived. Both walk the element records in
//! registration order and stop at the first failure, leaving earlier
//! elements applied. There is no rollback; a failed inherit means the
//! participant's image is not trustworthy and it should bail out.

use super::{element, Context, Element};
use crate::addr::{AddrDescriptor, ModuleMap};
use crate::arena::{clear_cloexec, Arena, ArenaFlags, ArenaOffset, TransferHandle};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd};
use std::os::unix::io::RawFd;
use std::ptr;

impl Context {
    /// Capture live state into the image and return the crossing handle.
    ///
    /// The root arena's own handle is primed to survive the crossing,
    /// then elements are walked in registration order: static regions get
    /// their current bytes copied into their records and nested arena
    /// handles are primed in turn. Objects were complete at registration.
    /// Call this once, right before the crossing; calling again simply
    /// re-captures.
    pub fn prepare(&mut self) -> Result<TransferHandle> {
        let map = ModuleMap::current()?;
        self.prepare_with(&map)
    }

    pub(crate) fn prepare_with(&mut self, map: &ModuleMap) -> Result<TransferHandle> {
        let handle = self.arena.prime_for_transfer()?;
        let offsets: Vec<ArenaOffset> = self
            .arena
            .chunks()
            .map(|chunk| chunk.map(|c| c.offset))
            .collect::<Result<_>>()?;

        // Decoding borrows the image, so lift what each step needs out of
        // the record before writing back into it.
        enum Step {
            Capture { size: usize, location: AddrDescriptor },
            Prime { handle: RawFd },
            Keep,
        }

        let mut statics = 0usize;
        let mut arenas = 0usize;
        let mut objects = 0usize;
        for at in offsets {
            let step = match element::decode(self.arena.bytes(at)?)? {
                Element::Static {
                    module,
                    offset,
                    payload,
                } => Step::Capture {
                    size: payload.len(),
                    location: AddrDescriptor {
                        offset,
                        module: module.to_string(),
                    },
                },
                Element::Arena { handle, .. } => Step::Prime { handle },
                Element::Object { .. } => Step::Keep,
            };
            match step {
                Step::Capture { size, location } => {
                    let address = map.denormalize(&location)?;
                    let record = self.arena.bytes_mut(at)?;
                    let payload = &mut record[element::STATIC_PAYLOAD..element::STATIC_PAYLOAD + size];
                    // SAFETY: registration promised [address, address + size)
                    // is readable global state in this process.
                    unsafe {
                        ptr::copy_nonoverlapping(address as *const u8, payload.as_mut_ptr(), size);
                    }
                    statics += 1;
                }
                Step::Prime { handle } => {
                    if handle < 0 {
                        return Err(Error::PlatformHandle(format!(
                            "arena record holds invalid handle {handle}"
                        )));
                    }
                    // SAFETY: the registered arena outlives the context per
                    // add_arena's contract, so its descriptor is open.
                    let fd = unsafe { BorrowedFd::borrow_raw(handle) };
                    clear_cloexec(fd)?;
                    arenas += 1;
                }
                Step::Keep => objects += 1,
            }
        }
        tracing::debug!(
            "context prepared: {} statics, {} arenas, {} objects",
            statics,
            arenas,
            objects
        );
        Ok(handle)
    }

    /// Bind a prepared image and apply it to this process.
    ///
    /// The root arena is bound from `handle`, then elements are applied in
    /// registration order: static payloads are copied over the addresses
    /// their descriptors resolve to here, nested arenas are bound (identity
    /// arenas at their recorded base, an arena transferred twice is bound
    /// once), and objects wait for lookup.
    ///
    /// # Safety
    ///
    /// `handle` must name an open descriptor carrying an image produced by
    /// [`prepare`](Context::prepare) for this same program image. Static
    /// records are applied by writing through the addresses they resolve
    /// to, so every record must denote a region that is valid, writable
    /// global state here and safe to overwrite wholesale; that obligation
    /// extends to any later `prepare` of the returned context. Identity
    /// arenas are mapped over their recorded base ranges, which must be
    /// free for that use.
    pub unsafe fn inherit(handle: TransferHandle) -> Result<Context> {
        let map = ModuleMap::current()?;
        // SAFETY: same contract, forwarded.
        unsafe { Self::inherit_with(handle, &map) }
    }

    pub(crate) unsafe fn inherit_with(
        handle: TransferHandle,
        map: &ModuleMap,
    ) -> Result<Context> {
        // SAFETY: the caller asserts the handle names a prepared image.
        let arena = unsafe { Arena::bind_from_handle(handle, ArenaFlags::NONE, None)? };
        let mut nested: Vec<Arena> = Vec::new();
        let mut bound = vec![file_identity(arena.as_fd())?];

        let offsets: Vec<ArenaOffset> = arena
            .chunks()
            .map(|chunk| chunk.map(|c| c.offset))
            .collect::<Result<_>>()?;

        let mut statics = 0usize;
        let mut arenas = 0usize;
        let mut objects = 0usize;
        for at in offsets {
            match element::decode(arena.bytes(at)?)? {
                Element::Static {
                    module,
                    offset,
                    payload,
                } => {
                    let address = map.resolve(module, offset)?;
                    // SAFETY: the caller asserts every static record denotes
                    // writable global state in this process image.
                    unsafe {
                        ptr::copy_nonoverlapping(payload.as_ptr(), address as *mut u8, payload.len());
                    }
                    statics += 1;
                }
                Element::Arena {
                    handle,
                    flags,
                    identity_base,
                } => {
                    if handle < 0 {
                        return Err(Error::PlatformHandle(format!(
                            "arena record holds invalid handle {handle}"
                        )));
                    }
                    // SAFETY: handles recorded in the image stay open across
                    // the crossing per the prepare/inherit protocol.
                    let fd = unsafe { BorrowedFd::borrow_raw(handle) };
                    let identity = file_identity(fd)?;
                    arenas += 1;
                    if !bound.contains(&identity) {
                        // SAFETY: nested images fall under the caller's
                        // contract, identity base ranges included.
                        let sub = unsafe {
                            Arena::bind_from_handle(
                                TransferHandle::from_raw_fd(handle),
                                flags,
                                identity_base,
                            )?
                        };
                        bound.push(identity);
                        nested.push(sub);
                    }
                }
                Element::Object { .. } => objects += 1,
            }
        }
        tracing::debug!(
            "context inherited: {} statics, {} arenas, {} objects",
            statics,
            arenas,
            objects
        );
        Ok(Context { arena, nested })
    }
}

/// Identity of the open file behind a descriptor, for arena deduplication.
fn file_identity(fd: BorrowedFd<'_>) -> Result<(u64, u64)> {
    let stat = rustix::fs::fstat(fd)?;
    Ok((stat.st_dev as u64, stat.st_ino as u64))
}
