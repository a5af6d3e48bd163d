//! # Handover
//!
//! Relocatable execution-context snapshots for sandboxed process crossings.
//!
//! A host process packs the state a sandboxed participant must resume with:
//! static regions of global memory, whole memory arenas, and named opaque
//! objects, stream handles included. The container lives in one
//! shared-memory arena, so it crosses the process boundary as a single
//! descriptor.
//!
//! ## Features
//!
//! - **Relocatable images**: statics are recorded as module + offset and
//!   applied wherever the participant's modules landed
//! - **Two-phase crossing**: capture on the host with [`Context::prepare`],
//!   apply in the participant with [`Context::inherit`]
//! - **Nested arenas**: transferred by handle, optionally pinned to their
//!   host base address
//! - **Linux-native**: memfd images, `SCM_RIGHTS` handle delivery
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use handover::prelude::*;
//! use handover::transfer::{recv_handle, send_handle};
//!
//! // Host: pack state and prepare the crossing.
//! let mut ctx = Context::new()?;
//! ctx.add_object("config", b"threads=4")?;
//! unsafe { ctx.add_static((&COUNTER as *const AtomicU32).cast(), 4)? };
//! send_handle(&host_socket, ctx.prepare()?)?;
//!
//! // Participant: bind the image and resume.
//! let image = recv_handle(&participant_socket)?;
//! let ctx = unsafe { Context::inherit(TransferHandle::from_raw_fd(image.as_raw_fd()))? };
//! let config = ctx.get_object("config")?;
//! ```
//!
//! [`Context::prepare`]: context::Context::prepare
//! [`Context::inherit`]: context::Context::inherit

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod addr;
pub mod arena;
pub mod context;
pub mod error;
pub mod stream;
pub mod transfer;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::addr::{AddrDescriptor, Module, ModuleMap, MODULE_SELF};
    pub use crate::arena::{Arena, ArenaFlags, ArenaOffset, TransferHandle};
    pub use crate::context::{Context, ContextOptions, Element, Tag};
    pub use crate::error::{Error, Result};
}

pub use error::{Error, Result};
