//! Offset-addressed shared-memory arena for context images.
//!
//! An arena is a growable bump allocator over a `memfd` mapping. Everything
//! a context records lives in one arena, so the whole container crosses a
//! process boundary as a single file descriptor: the sender primes the
//! descriptor for transfer, the receiver binds it and sees the same bytes.
//!
//! # Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ ImageHeader (64 bytes, cache-line aligned)                  │
//! │ magic: u64 │ version: u32 │ flags: u32                      │
//! │ capacity: u64 │ used: u64                                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │ chunk: len u64 │ payload (len bytes) │ pad to 8             │
//! ├─────────────────────────────────────────────────────────────┤
//! │ chunk: len u64 │ payload ...                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Chunk headers record the exact requested size, so variable-length tails
//! inside a payload stay recoverable; padding only moves the next chunk
//! start to an 8-byte boundary. All addressing is by [`ArenaOffset`], which
//! survives both arena growth and rebinding in another process.
//!
//! The arena has no internal synchronization. One logical owner mutates it
//! at a time; `&mut self` on the mutating operations makes that structural.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::io::FdFlags;
use rustix::mm::{MapFlags, MremapFlags, ProtFlags};
use std::ffi::{c_void, CString};
use std::fmt;
use std::ops::BitOr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;

/// Magic number identifying a context arena image.
const IMAGE_MAGIC: u64 = 0x4856_525F_4354_5854; // "HVR_CTXT" in ASCII

/// Current image format version.
const IMAGE_VERSION: u32 = 1;

/// Default capacity for a fresh arena.
pub(crate) const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Chunk starts are aligned to this.
const CHUNK_ALIGN: usize = 8;

/// Bookkeeping bytes before each chunk payload (the exact-size field).
const CHUNK_HEADER: usize = 8;

/// Backing file sizes are rounded up to this.
const PAGE_SIZE: usize = 4096;

/// Header at the start of every arena image.
///
/// Plain fields, not atomics: the crossing protocol is strictly
/// write-then-transfer, so the header is never mutated concurrently.
#[repr(C, align(64))]
struct ImageHeader {
    magic: u64,
    version: u32,
    flags: u32,
    capacity: u64,
    used: u64,
}

/// First chunk header position; the image header pads out to its alignment.
const DATA_START: usize = std::mem::size_of::<ImageHeader>();

impl ImageHeader {
    fn validate(&self, mapped: usize) -> Result<()> {
        if self.magic != IMAGE_MAGIC {
            return Err(Error::InvalidImage(format!(
                "bad magic: expected {:#x}, got {:#x}",
                IMAGE_MAGIC, self.magic
            )));
        }
        if self.version != IMAGE_VERSION {
            return Err(Error::InvalidImage(format!(
                "unsupported version: expected {}, got {}",
                IMAGE_VERSION, self.version
            )));
        }
        let capacity = self.capacity as usize;
        let used = self.used as usize;
        if capacity > mapped || used > capacity || used < DATA_START {
            return Err(Error::InvalidImage(format!(
                "inconsistent sizes: mapped {mapped}, capacity {capacity}, used {used}"
            )));
        }
        Ok(())
    }
}

/// Behavior flags for an arena.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaFlags(u32);

impl ArenaFlags {
    /// No flags set.
    pub const NONE: ArenaFlags = ArenaFlags(0);
    /// The arena may grow beyond its initial capacity.
    pub const RESIZE: ArenaFlags = ArenaFlags(1);
    /// The mapping may relocate when the arena grows.
    pub const MAYMOVE: ArenaFlags = ArenaFlags(1 << 1);
    /// The arena must be bound at the same base address in every process.
    pub const IDENTITY: ArenaFlags = ArenaFlags(1 << 2);

    /// Whether all flags in `other` are set in `self`.
    pub const fn contains(self, other: ArenaFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) const fn bits(self) -> u32 {
        self.0
    }

    pub(crate) const fn from_bits(bits: u32) -> ArenaFlags {
        ArenaFlags(bits)
    }
}

impl BitOr for ArenaFlags {
    type Output = ArenaFlags;

    fn bitor(self, rhs: ArenaFlags) -> ArenaFlags {
        ArenaFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for ArenaFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (flag, name) in [
            (Self::RESIZE, "RESIZE"),
            (Self::MAYMOVE, "MAYMOVE"),
            (Self::IDENTITY, "IDENTITY"),
        ] {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        let known = Self::RESIZE.0 | Self::MAYMOVE.0 | Self::IDENTITY.0;
        if self.0 & !known != 0 {
            if !first {
                f.write_str(" | ")?;
            }
            write!(f, "{:#x}", self.0 & !known)?;
        }
        Ok(())
    }
}

/// Stable offset of a chunk payload within an arena image.
///
/// Offsets remain valid across arena growth and across process boundaries;
/// they are the only form of addressing stored inside an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArenaOffset(u64);

impl ArenaOffset {
    /// The offset as a plain integer.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub(crate) const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// OS-level token by which an arena image crosses a process boundary.
///
/// A handle does not own the descriptor it names; the arena (or whoever
/// received the descriptor) does. It stays valid only while that owner
/// keeps the descriptor open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferHandle(RawFd);

impl TransferHandle {
    /// Wrap a raw descriptor number, typically one received over a socket
    /// or inherited through exec.
    pub const fn from_raw_fd(fd: RawFd) -> TransferHandle {
        TransferHandle(fd)
    }
}

impl AsRawFd for TransferHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Clear close-on-exec so a descriptor survives into an exec'd child.
pub(crate) fn clear_cloexec(fd: BorrowedFd<'_>) -> Result<()> {
    let mut flags = rustix::io::fcntl_getfd(fd)?;
    flags.remove(FdFlags::CLOEXEC);
    rustix::io::fcntl_setfd(fd, flags)?;
    Ok(())
}

/// Growable shared-memory arena backed by a `memfd`.
///
/// Created arenas own a fresh backing file; bound arenas map an image
/// received from another process (or another binding in this one). Both
/// unmap on drop, and dropping the creator closes the backing descriptor.
pub struct Arena {
    /// The memfd file descriptor.
    fd: OwnedFd,
    /// Base pointer of the mapping.
    base: NonNull<u8>,
    /// Length of the mapping; always equals the image capacity.
    mapped: usize,
    /// Behavior flags for this binding.
    flags: ArenaFlags,
    /// Whether this binding created the backing file.
    owner: bool,
}

// SAFETY: the mapping is exclusive to this value and mutation goes through
// `&mut self`; shared references only ever read.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Create a new arena with the default capacity.
    pub fn new(flags: ArenaFlags) -> Result<Arena> {
        Self::with_capacity("handover-arena", flags, DEFAULT_CAPACITY)
    }

    /// Create a new arena with a debug name and an initial capacity.
    ///
    /// The capacity is rounded up to a page multiple. Allocations beyond it
    /// fail unless [`ArenaFlags::RESIZE`] is set.
    pub fn with_capacity(name: &str, flags: ArenaFlags, capacity: usize) -> Result<Arena> {
        let capacity = capacity.max(DATA_START + CHUNK_HEADER);
        let capacity = (capacity + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

        let cname = CString::new(name).map_err(|e| Error::AllocationFailed(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, capacity as u64)
            .map_err(|e| Error::AllocationFailed(format!("sizing arena to {capacity} bytes: {e}")))?;

        // SAFETY: mapping a freshly sized file we own, with no address hint.
        let base = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                capacity,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let base = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        // SAFETY: the mapping is at least DATA_START bytes and exclusively ours.
        unsafe {
            base.cast::<ImageHeader>().as_ptr().write(ImageHeader {
                magic: IMAGE_MAGIC,
                version: IMAGE_VERSION,
                flags: flags.bits(),
                capacity: capacity as u64,
                used: DATA_START as u64,
            });
        }

        tracing::trace!("arena created: {} bytes, flags {:?}", capacity, flags);

        Ok(Arena {
            fd,
            base,
            mapped: capacity,
            flags,
            owner: true,
        })
    }

    /// Bind an arena image from a transfer handle.
    ///
    /// The handle's descriptor is duplicated, sized via `fstat`, mapped
    /// (at `identity_base` when given) and its header validated. The
    /// returned arena reads and writes the same pages as every other
    /// binding of the image.
    ///
    /// # Safety
    ///
    /// `handle` must name a descriptor that is open in this process for the
    /// duration of the call. With `identity_base`, the caller asserts that
    /// mapping over that fixed address range is sound in this process.
    pub unsafe fn bind_from_handle(
        handle: TransferHandle,
        flags: ArenaFlags,
        identity_base: Option<u64>,
    ) -> Result<Arena> {
        let raw = handle.as_raw_fd();
        if raw < 0 {
            return Err(Error::PlatformHandle(format!(
                "transfer handle {raw} is not an open descriptor"
            )));
        }
        // SAFETY: caller keeps the descriptor open across this call.
        let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
        let fd = rustix::io::fcntl_dupfd_cloexec(borrowed, 0)?;

        let stat = rustix::fs::fstat(&fd)?;
        let mapped = stat.st_size as usize;
        if mapped < DATA_START {
            return Err(Error::InvalidImage(format!(
                "image of {mapped} bytes is too small for a header"
            )));
        }

        let (hint, map_flags) = match identity_base {
            Some(addr) => (addr as *mut c_void, MapFlags::SHARED | MapFlags::FIXED),
            None => (std::ptr::null_mut(), MapFlags::SHARED),
        };
        // SAFETY: length comes from fstat; for fixed mappings the caller
        // vouched for the target range.
        let base = unsafe {
            rustix::mm::mmap(
                hint,
                mapped,
                ProtFlags::READ | ProtFlags::WRITE,
                map_flags,
                &fd,
                0,
            )?
        };
        let base = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        // Construct before validating so the mapping is unmapped on the
        // error path as well.
        let arena = Arena {
            fd,
            base,
            mapped,
            flags,
            owner: false,
        };
        arena.header().validate(mapped)?;

        tracing::trace!(
            "arena bound: {} bytes at {:p}, flags {:?}",
            mapped,
            arena.base.as_ptr(),
            flags
        );
        Ok(arena)
    }

    fn header(&self) -> &ImageHeader {
        // SAFETY: the mapping is at least DATA_START bytes, suitably
        // aligned, and initialized at creation or validated at bind.
        unsafe { self.base.cast::<ImageHeader>().as_ref() }
    }

    fn header_mut(&mut self) -> &mut ImageHeader {
        // SAFETY: as in `header`, and `&mut self` makes the access unique.
        unsafe { self.base.cast::<ImageHeader>().as_mut() }
    }

    /// Bytes in use, including the image header region.
    pub fn used(&self) -> usize {
        self.header().used as usize
    }

    /// Current capacity of the backing file.
    pub fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    /// Behavior flags of this binding.
    pub fn flags(&self) -> ArenaFlags {
        self.flags
    }

    /// Base address of the mapping in this process.
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Whether this binding created the backing file.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Transfer handle for this arena.
    ///
    /// Meaningful for a crossing only after [`Arena::prime_for_transfer`].
    pub fn handle(&self) -> TransferHandle {
        TransferHandle(self.fd.as_raw_fd())
    }

    /// Allocate a chunk of exactly `size` bytes, zero-filled.
    ///
    /// Fails with [`Error::AllocationFailed`] when the arena is full and
    /// not resizable, or when growth itself fails. Previously allocated
    /// chunks are untouched by a failed allocation.
    pub fn alloc(&mut self, size: usize) -> Result<ArenaOffset> {
        if size == 0 {
            return Err(Error::AllocationFailed("zero-size allocation".into()));
        }
        let start = self.used();
        let payload = start + CHUNK_HEADER;
        let end = payload
            .checked_add(size)
            .and_then(|e| e.checked_add(CHUNK_ALIGN - 1))
            .map(|e| e & !(CHUNK_ALIGN - 1))
            .ok_or_else(|| Error::AllocationFailed(format!("allocation of {size} bytes overflows")))?;
        if end > self.capacity() {
            self.grow(end)?;
        }

        // SAFETY: start..end lies within the mapping after the growth check;
        // chunk starts are CHUNK_ALIGN aligned so the u64 write is aligned.
        unsafe {
            self.base.as_ptr().add(start).cast::<u64>().write(size as u64);
        }
        self.header_mut().used = end as u64;
        Ok(ArenaOffset(payload as u64))
    }

    fn grow(&mut self, required: usize) -> Result<()> {
        if !self.flags.contains(ArenaFlags::RESIZE) {
            return Err(Error::AllocationFailed(format!(
                "arena full: {} of {} bytes used",
                self.used(),
                self.capacity()
            )));
        }
        let mut target = self.mapped;
        while target < required {
            target = target
                .checked_mul(2)
                .ok_or_else(|| Error::AllocationFailed("arena size overflow".into()))?;
        }
        rustix::fs::ftruncate(&self.fd, target as u64)
            .map_err(|e| Error::AllocationFailed(format!("growing arena to {target} bytes: {e}")))?;

        let remap_flags = if self.flags.contains(ArenaFlags::MAYMOVE) {
            MremapFlags::MAYMOVE
        } else {
            MremapFlags::empty()
        };
        // SAFETY: base and mapped describe the current mapping; on success
        // the returned mapping supersedes it.
        let new_base = unsafe {
            rustix::mm::mremap(self.base.as_ptr().cast(), self.mapped, target, remap_flags)
        }
        .map_err(|e| Error::AllocationFailed(format!("remapping arena to {target} bytes: {e}")))?;
        self.base = NonNull::new(new_base.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mremap returned null".into()))?;
        self.mapped = target;
        self.header_mut().capacity = target as u64;

        tracing::trace!("arena grown to {} bytes", target);
        Ok(())
    }

    fn chunk_bounds(&self, at: ArenaOffset) -> Result<(usize, usize)> {
        let payload = at.as_usize();
        let used = self.used();
        if payload < DATA_START + CHUNK_HEADER || payload % CHUNK_ALIGN != 0 || payload > used {
            return Err(Error::InvalidImage(format!(
                "offset {payload:#x} outside image"
            )));
        }
        // SAFETY: payload - CHUNK_HEADER is within the mapping and aligned.
        let len = unsafe {
            self.base
                .as_ptr()
                .add(payload - CHUNK_HEADER)
                .cast::<u64>()
                .read()
        } as usize;
        let end = payload
            .checked_add(len)
            .ok_or_else(|| Error::InvalidImage(format!("chunk at {payload:#x} overruns image")))?;
        if len == 0 || end > used {
            return Err(Error::InvalidImage(format!(
                "chunk at {payload:#x} overruns image"
            )));
        }
        Ok((payload, len))
    }

    /// The payload of the chunk at `at`, bounds-checked.
    pub fn bytes(&self, at: ArenaOffset) -> Result<&[u8]> {
        let (payload, len) = self.chunk_bounds(at)?;
        // SAFETY: bounds validated against the mapping.
        Ok(unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(payload), len) })
    }

    /// Mutable payload of the chunk at `at`, bounds-checked.
    pub fn bytes_mut(&mut self, at: ArenaOffset) -> Result<&mut [u8]> {
        let (payload, len) = self.chunk_bounds(at)?;
        // SAFETY: bounds validated; `&mut self` makes the access unique.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(payload), len) })
    }

    /// Iterate chunks in allocation order.
    pub fn chunks(&self) -> Chunks<'_> {
        Chunks {
            arena: self,
            pos: DATA_START,
            failed: false,
        }
    }

    /// Make this arena's descriptor survive into an exec'd child and
    /// return the handle to cross with.
    pub fn prime_for_transfer(&mut self) -> Result<TransferHandle> {
        clear_cloexec(self.fd.as_fd())?;
        tracing::trace!("arena primed for transfer: fd {}", self.fd.as_raw_fd());
        Ok(self.handle())
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: base and mapped describe a mapping this value owns.
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.mapped);
        }
    }
}

impl AsFd for Arena {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("fd", &self.fd.as_raw_fd())
            .field("used", &self.used())
            .field("capacity", &self.capacity())
            .field("flags", &self.flags)
            .field("owner", &self.owner)
            .finish()
    }
}

/// One chunk yielded by [`Arena::chunks`].
pub struct Chunk<'a> {
    /// Offset of the payload within the image.
    pub offset: ArenaOffset,
    /// The payload bytes.
    pub bytes: &'a [u8],
}

/// Iterator over arena chunks in allocation order.
///
/// Yields an error and stops if the image's chunk chain is corrupt.
pub struct Chunks<'a> {
    arena: &'a Arena,
    pos: usize,
    failed: bool,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Result<Chunk<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let used = self.arena.used();
        if self.pos >= used {
            return None;
        }
        if self.pos + CHUNK_HEADER > used {
            self.failed = true;
            return Some(Err(Error::InvalidImage(format!(
                "truncated chunk header at {:#x}",
                self.pos
            ))));
        }
        let offset = ArenaOffset((self.pos + CHUNK_HEADER) as u64);
        match self.arena.bytes(offset) {
            Ok(bytes) => {
                let advance = CHUNK_HEADER + bytes.len();
                self.pos = (self.pos + advance + CHUNK_ALIGN - 1) & !(CHUNK_ALIGN - 1);
                Some(Ok(Chunk { offset, bytes }))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_alloc_and_read_back() {
        let mut arena = Arena::new(ArenaFlags::RESIZE | ArenaFlags::MAYMOVE).unwrap();
        let at = arena.alloc(11).unwrap();
        arena.bytes_mut(at).unwrap().copy_from_slice(b"hello world");
        assert_eq!(arena.bytes(at).unwrap(), b"hello world");
        // Exact size is preserved, not rounded.
        assert_eq!(arena.bytes(at).unwrap().len(), 11);
    }

    #[test]
    fn test_fresh_chunks_are_zeroed() {
        let mut arena = Arena::new(ArenaFlags::NONE).unwrap();
        let at = arena.alloc(64).unwrap();
        assert!(arena.bytes(at).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_size_alloc_fails() {
        let mut arena = Arena::new(ArenaFlags::NONE).unwrap();
        assert!(matches!(
            arena.alloc(0),
            Err(Error::AllocationFailed(_))
        ));
    }

    #[test]
    fn test_chunks_iterate_in_allocation_order() {
        let mut arena = Arena::new(ArenaFlags::NONE).unwrap();
        let mut offsets = Vec::new();
        for i in 0..5u8 {
            let at = arena.alloc(3).unwrap();
            arena.bytes_mut(at).unwrap().copy_from_slice(&[i; 3]);
            offsets.push(at);
        }
        let seen: Vec<_> = arena
            .chunks()
            .map(|c| c.unwrap().offset)
            .collect();
        assert_eq!(seen, offsets);
        for (i, chunk) in arena.chunks().enumerate() {
            assert_eq!(chunk.unwrap().bytes, &[i as u8; 3]);
        }
    }

    #[test]
    fn test_growth_preserves_offsets_and_contents() {
        let mut arena =
            Arena::with_capacity("grow-test", ArenaFlags::RESIZE | ArenaFlags::MAYMOVE, 4096)
                .unwrap();
        let first = arena.alloc(16).unwrap();
        arena.bytes_mut(first).unwrap().copy_from_slice(&[0xAB; 16]);

        let initial_capacity = arena.capacity();
        let mut offsets = Vec::new();
        while arena.capacity() == initial_capacity {
            offsets.push(arena.alloc(1000).unwrap());
        }
        assert!(arena.capacity() > initial_capacity);
        assert_eq!(arena.bytes(first).unwrap(), &[0xAB; 16]);
        for at in offsets {
            assert_eq!(arena.bytes(at).unwrap().len(), 1000);
        }
    }

    #[test]
    fn test_exhaustion_without_resize_keeps_existing_chunks() {
        let mut arena = Arena::with_capacity("fixed-test", ArenaFlags::NONE, 4096).unwrap();
        let at = arena.alloc(8).unwrap();
        arena.bytes_mut(at).unwrap().copy_from_slice(&[7; 8]);

        let err = loop {
            match arena.alloc(512) {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Error::AllocationFailed(_)));
        assert_eq!(arena.bytes(at).unwrap(), &[7; 8]);
    }

    #[test]
    fn test_prime_clears_cloexec() {
        let mut arena = Arena::new(ArenaFlags::NONE).unwrap();
        let flags = rustix::io::fcntl_getfd(arena.as_fd()).unwrap();
        assert!(flags.contains(FdFlags::CLOEXEC));

        arena.prime_for_transfer().unwrap();
        let flags = rustix::io::fcntl_getfd(arena.as_fd()).unwrap();
        assert!(!flags.contains(FdFlags::CLOEXEC));
    }

    #[test]
    fn test_bind_sees_the_same_bytes() {
        let mut arena = Arena::new(ArenaFlags::NONE).unwrap();
        let at = arena.alloc(5).unwrap();
        arena.bytes_mut(at).unwrap().copy_from_slice(b"cross");
        let handle = arena.prime_for_transfer().unwrap();

        let bound = unsafe { Arena::bind_from_handle(handle, ArenaFlags::NONE, None) }.unwrap();
        assert!(!bound.is_owner());
        assert_eq!(bound.used(), arena.used());
        assert_eq!(bound.bytes(at).unwrap(), b"cross");

        // Shared pages: writes through one binding are visible in the other.
        arena.bytes_mut(at).unwrap()[0] = b'C';
        assert_eq!(bound.bytes(at).unwrap(), b"Cross");
    }

    #[test]
    fn test_bind_rejects_foreign_image() {
        let name = CString::new("not-an-arena").unwrap();
        let fd = rustix::fs::memfd_create(&name, rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, 4096).unwrap();
        let handle = TransferHandle::from_raw_fd(fd.as_raw_fd());

        let err = unsafe { Arena::bind_from_handle(handle, ArenaFlags::NONE, None) }.unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
    }

    #[test]
    fn test_bind_rejects_truncated_image() {
        let name = CString::new("tiny").unwrap();
        let fd = rustix::fs::memfd_create(&name, rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, 8).unwrap();
        let handle = TransferHandle::from_raw_fd(fd.as_raw_fd());

        let err = unsafe { Arena::bind_from_handle(handle, ArenaFlags::NONE, None) }.unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
    }

    fn forged_image(version: u32, capacity: u64, used: u64, file_len: u64) -> std::fs::File {
        let name = CString::new("forged").unwrap();
        let fd = rustix::fs::memfd_create(&name, rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, file_len).unwrap();

        let mut header = vec![0u8; DATA_START];
        header[0..8].copy_from_slice(&IMAGE_MAGIC.to_ne_bytes());
        header[8..12].copy_from_slice(&version.to_ne_bytes());
        header[16..24].copy_from_slice(&capacity.to_ne_bytes());
        header[24..32].copy_from_slice(&used.to_ne_bytes());

        let mut file = std::fs::File::from(fd);
        file.write_all(&header).unwrap();
        file
    }

    #[test]
    fn test_bind_rejects_unsupported_version() {
        let file = forged_image(IMAGE_VERSION + 1, 4096, DATA_START as u64, 4096);
        let handle = TransferHandle::from_raw_fd(file.as_raw_fd());

        let err = unsafe { Arena::bind_from_handle(handle, ArenaFlags::NONE, None) }.unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
    }

    #[test]
    fn test_bind_rejects_inconsistent_sizes() {
        // One forgery per arm of the size check.
        let forgeries = [(8192u64, DATA_START as u64), (4096, 4097), (4096, 8)];
        for (capacity, used) in forgeries {
            let file = forged_image(IMAGE_VERSION, capacity, used, 4096);
            let handle = TransferHandle::from_raw_fd(file.as_raw_fd());

            let err =
                unsafe { Arena::bind_from_handle(handle, ArenaFlags::NONE, None) }.unwrap_err();
            assert!(matches!(err, Error::InvalidImage(_)));
        }
    }

    #[test]
    fn test_flags_debug_lists_names() {
        assert_eq!(format!("{:?}", ArenaFlags::NONE), "NONE");
        assert_eq!(
            format!("{:?}", ArenaFlags::RESIZE | ArenaFlags::IDENTITY),
            "RESIZE | IDENTITY"
        );
    }

    #[test]
    fn test_bad_offsets_are_rejected() {
        let mut arena = Arena::new(ArenaFlags::NONE).unwrap();
        let at = arena.alloc(8).unwrap();

        // Past the in-use region.
        let past = ArenaOffset(arena.used() as u64 + 64);
        assert!(matches!(arena.bytes(past), Err(Error::InvalidImage(_))));
        // Misaligned.
        let skewed = ArenaOffset(at.as_u64() + 1);
        assert!(matches!(arena.bytes(skewed), Err(Error::InvalidImage(_))));
    }
}
