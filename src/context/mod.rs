//! Execution contexts: relocatable containers of process state.
//!
//! A context records what a participant process must see to continue the
//! host's work: static regions of global memory, whole nested arenas, and
//! named opaque objects (including OS stream handles). Everything lives in
//! one root arena, so the container crosses the process boundary as a
//! single primed descriptor.
//!
//! ```text
//!  host                                participant
//!  ────────────────────────            ────────────────────────
//!  Context::new()
//!  add_static / add_arena /
//!  add_object / add_file
//!  prepare() ─────► handle ──crossing──► inherit(handle)
//!                                        get_object / get_file
//! ```
//!
//! Registration order is preserved and is also application order during
//! [`Context::inherit`]. A context is single-owner; the mutating
//! operations take `&mut self` and nothing suspends mid-operation.

mod crossing;
mod element;

pub use element::{Element, Tag};

use crate::addr::ModuleMap;
use crate::arena::{Arena, ArenaFlags, TransferHandle, DEFAULT_CAPACITY};
use crate::error::{Error, Result};
use crate::stream;
use rustix::fd::AsFd;
use std::ffi::c_void;
use std::fmt;
use std::fs::File;
use std::os::unix::io::AsRawFd;

/// Construction options for a [`Context`].
#[derive(Clone, Debug)]
pub struct ContextOptions {
    /// Initial root arena capacity in bytes.
    pub initial_capacity: usize,
    /// Whether the root arena may grow beyond the initial capacity.
    pub resize: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        ContextOptions {
            initial_capacity: DEFAULT_CAPACITY,
            resize: true,
        }
    }
}

/// A relocatable snapshot container for crossing into another process.
///
/// Dropping a context releases its root arena mapping and handle, plus any
/// nested arena bindings an inherited context holds.
pub struct Context {
    /// Root arena holding every element record.
    arena: Arena,
    /// Nested arena bindings kept alive for an inherited context.
    nested: Vec<Arena>,
}

impl Context {
    /// Create an empty context with default options.
    pub fn new() -> Result<Context> {
        Self::with_options(ContextOptions::default())
    }

    /// Create an empty context.
    pub fn with_options(options: ContextOptions) -> Result<Context> {
        let flags = if options.resize {
            ArenaFlags::RESIZE | ArenaFlags::MAYMOVE
        } else {
            ArenaFlags::NONE
        };
        let arena = Arena::with_capacity("handover-context", flags, options.initial_capacity)?;
        tracing::debug!("context created: {} bytes capacity", arena.capacity());
        Ok(Context {
            arena,
            nested: Vec::new(),
        })
    }

    /// Register a static region of global memory.
    ///
    /// The address is normalized to a module-relative descriptor now, so
    /// registration fails if it cannot be attributed to a loaded module.
    /// The region's bytes are captured later, during
    /// [`prepare`](Context::prepare), to reflect the state at crossing
    /// time.
    ///
    /// # Safety
    ///
    /// `[address, address + size)` must be global state that stays valid
    /// for the context's lifetime, readable when `prepare` runs, and whose
    /// counterpart in a participant process may be overwritten wholesale
    /// during inherit.
    pub unsafe fn add_static(&mut self, address: *const c_void, size: usize) -> Result<()> {
        let map = ModuleMap::current()?;
        // SAFETY: same contract, forwarded.
        unsafe { self.add_static_with(&map, address, size) }
    }

    pub(crate) unsafe fn add_static_with(
        &mut self,
        map: &ModuleMap,
        address: *const c_void,
        size: usize,
    ) -> Result<()> {
        let location = map.normalize(address as usize)?;
        let at = self.arena.alloc(element::static_record_len(&location.module, size))?;
        let record = self.arena.bytes_mut(at)?;
        element::encode_static(record, &location, size);
        tracing::debug!(
            "registered static: module {}, offset {:#x}, {} bytes",
            location.module,
            location.offset,
            size
        );
        Ok(())
    }

    /// Register a nested arena to transfer by handle.
    ///
    /// The arena itself is not copied; its descriptor is primed during
    /// [`prepare`](Context::prepare) and bound on the other side. Identity
    /// arenas additionally record their base address so the participant
    /// binds them at the same place. The arena (and so its descriptor)
    /// must outlive the crossing.
    pub fn add_arena(&mut self, arena: &Arena) -> Result<()> {
        let identity_base = if arena.flags().contains(ArenaFlags::IDENTITY) {
            arena.base_addr() as u64
        } else {
            0
        };
        let at = self.arena.alloc(element::ARENA_RECORD)?;
        let record = self.arena.bytes_mut(at)?;
        element::encode_arena(
            record,
            arena.handle().as_raw_fd(),
            arena.flags(),
            identity_base,
        );
        tracing::debug!(
            "registered nested arena: fd {}, flags {:?}",
            arena.handle().as_raw_fd(),
            arena.flags()
        );
        Ok(())
    }

    /// Store a named opaque payload.
    ///
    /// Duplicate names are allowed; lookup returns the earliest insertion.
    pub fn add_object(&mut self, name: &str, payload: &[u8]) -> Result<()> {
        let at = self.arena.alloc(element::object_record_len(name, payload))?;
        let record = self.arena.bytes_mut(at)?;
        element::encode_object(record, name, payload);
        tracing::debug!("stored object {:?}: {} bytes", name, payload.len());
        Ok(())
    }

    /// Look up the payload of the first object stored under `name`.
    pub fn get_object(&self, name: &str) -> Result<&[u8]> {
        for element in self.elements() {
            if let Element::Object {
                name: stored,
                payload,
            } = element?
            {
                if stored == name {
                    return Ok(payload);
                }
            }
        }
        Err(Error::ObjectNotFound {
            name: name.to_string(),
        })
    }

    /// Store a stream's platform handle under `name`.
    ///
    /// The handle is recorded by value; the participant reconstructs a
    /// stream from it with [`get_file`](Context::get_file). The underlying
    /// descriptor must survive the crossing (inherited descriptor tables
    /// do this for free).
    pub fn add_file<F: AsFd>(&mut self, name: &str, stream: &F) -> Result<()> {
        let handle = stream::extract_handle(stream);
        self.add_object(name, &handle.to_payload())
    }

    /// Reconstruct the stream stored under `name`.
    ///
    /// The returned file shares the stored handle's open file description,
    /// so it reads at that description's current position.
    pub fn get_file(&self, name: &str) -> Result<File> {
        let payload = self.get_object(name)?;
        let handle = stream::StreamHandle::from_payload(payload)?;
        stream::reconstruct_stream(handle)
    }

    /// Transfer handle of the root arena.
    ///
    /// Meaningful for a crossing only after [`prepare`](Context::prepare).
    pub fn handle(&self) -> TransferHandle {
        self.arena.handle()
    }

    /// Nested arena bindings this context holds.
    ///
    /// Empty on a freshly built context; [`inherit`](Context::inherit)
    /// fills it with one binding per distinct arena recorded in the image,
    /// and the bindings stay mapped for the context's lifetime.
    pub fn nested_arenas(&self) -> &[Arena] {
        &self.nested
    }

    /// Iterate decoded element views in registration order.
    pub fn elements(&self) -> impl Iterator<Item = Result<Element<'_>>> + '_ {
        self.arena
            .chunks()
            .map(|chunk| chunk.and_then(|c| element::decode(c.bytes)))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("arena", &self.arena)
            .field("nested", &self.nested.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Module;
    use std::io::{Read, Seek, SeekFrom, Write};

    fn leaked_region(len: usize) -> (&'static mut [u8], usize) {
        let region = Box::leak(vec![0u8; len].into_boxed_slice());
        let base = region.as_ptr() as usize;
        (region, base)
    }

    #[test]
    fn test_objects_round_trip() {
        let mut ctx = Context::new().unwrap();
        ctx.add_object("config", b"threads=4").unwrap();
        assert_eq!(ctx.get_object("config").unwrap(), b"threads=4");
    }

    #[test]
    fn test_missing_objects_are_not_found() {
        let ctx = Context::new().unwrap();
        assert!(matches!(
            ctx.get_object("absent"),
            Err(Error::ObjectNotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_names_resolve_to_the_first() {
        let mut ctx = Context::new().unwrap();
        ctx.add_object("winner", b"first").unwrap();
        ctx.add_object("winner", b"second").unwrap();
        assert_eq!(ctx.get_object("winner").unwrap(), b"first");
    }

    #[test]
    fn test_elements_keep_registration_order() {
        let (region, base) = leaked_region(16);
        let map = ModuleMap::from_modules(vec![Module::new("libfake.so", base, base + 16)]);
        let sub = Arena::new(ArenaFlags::NONE).unwrap();

        let mut ctx = Context::new().unwrap();
        ctx.add_object("first", b"1").unwrap();
        unsafe { ctx.add_static_with(&map, region.as_ptr().cast(), 8) }.unwrap();
        ctx.add_arena(&sub).unwrap();
        ctx.add_object("last", b"9").unwrap();

        let tags: Vec<Tag> = ctx
            .elements()
            .map(|e| match e.unwrap() {
                Element::Static { .. } => Tag::Static,
                Element::Arena { .. } => Tag::Arena,
                Element::Object { .. } => Tag::Object,
            })
            .collect();
        assert_eq!(tags, [Tag::Object, Tag::Static, Tag::Arena, Tag::Object]);
    }

    #[test]
    fn test_unattributable_static_is_rejected_at_registration() {
        let map = ModuleMap::from_modules(vec![]);
        let mut ctx = Context::new().unwrap();
        let err = unsafe { ctx.add_static_with(&map, 0x10 as *const c_void, 4) }.unwrap_err();
        assert!(matches!(err, Error::AddressNotResolvable { .. }));

        // The failure leaves the context usable.
        ctx.add_object("after", b"ok").unwrap();
        assert_eq!(ctx.get_object("after").unwrap(), b"ok");
    }

    #[test]
    fn test_exhaustion_keeps_earlier_elements_retrievable() {
        let mut ctx = Context::with_options(ContextOptions {
            initial_capacity: 4096,
            resize: false,
        })
        .unwrap();
        ctx.add_object("keep", b"kept").unwrap();

        let err = loop {
            match ctx.add_object("filler", &[0u8; 512]) {
                Ok(()) => continue,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Error::AllocationFailed(_)));
        assert_eq!(ctx.get_object("keep").unwrap(), b"kept");
    }

    #[test]
    fn test_files_reconstruct_at_the_shared_position() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abcdef").unwrap();

        let mut ctx = Context::new().unwrap();
        ctx.add_file("input", file.as_file()).unwrap();

        // The reconstructed stream shares the description's position.
        file.seek(SeekFrom::Start(2)).unwrap();
        let mut restored = ctx.get_file("input").unwrap();
        let mut rest = String::new();
        restored.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "cdef");
    }

    #[test]
    fn test_get_file_rejects_non_handle_objects() {
        let mut ctx = Context::new().unwrap();
        ctx.add_object("not-a-handle", b"xyz").unwrap();
        assert!(matches!(
            ctx.get_file("not-a-handle"),
            Err(Error::PlatformHandle(_))
        ));
    }

    #[test]
    fn test_debug_reports_the_arena_and_bindings() {
        let ctx = Context::new().unwrap();
        let shown = format!("{:?}", ctx);
        assert!(shown.starts_with("Context"));
        assert!(shown.contains("nested: 0"));
    }
}
