//! Tagged element records inside a context image.
//!
//! Every element is one arena chunk. A 32-bit tag comes first in every
//! record so iteration can dispatch without knowing the concrete layout;
//! the remaining fields are fixed-width, with variable-length tails whose
//! sizes are derivable from the chunk's exact length. Records use native
//! byte order; images do not cross endianness or architecture boundaries.

use crate::addr::AddrDescriptor;
use crate::arena::ArenaFlags;
use crate::error::{Error, Result};
use std::os::unix::io::RawFd;

/// Discriminator stored first in every element record.
///
/// The integer values are the wire contract between the two sides of a
/// crossing; they never change.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    /// A static region of global memory.
    Static = 0,
    /// A nested arena transferred by handle.
    Arena = 1,
    /// A named opaque payload.
    Object = 2,
}

impl Tag {
    fn from_u32(value: u32) -> Option<Tag> {
        match value {
            0 => Some(Tag::Static),
            1 => Some(Tag::Arena),
            2 => Some(Tag::Object),
            _ => None,
        }
    }
}

// Record layouts. Chunk payloads start 8-byte aligned, and every field
// below sits at a naturally aligned offset.
//
// Static: tag u32 | pad | location offset u64 | size u64 | bytes | module
// Arena:  tag u32 | pad | handle i64 | flags u32 | pad | identity base u64
// Object: tag u32 | pad | name length u64 | name | payload

/// Start of a static record's captured bytes.
pub(crate) const STATIC_PAYLOAD: usize = 24;
/// Total size of an arena record.
pub(crate) const ARENA_RECORD: usize = 32;
/// Start of an object record's name.
const OBJECT_HEADER: usize = 16;

/// Decoded view of one element record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Element<'a> {
    /// A static region: live memory captured during prepare and restored
    /// during inherit.
    Static {
        /// Name of the module the region belongs to.
        module: &'a str,
        /// Offset of the region from the module's load base.
        offset: u64,
        /// Captured bytes; zero until prepare fills them.
        payload: &'a [u8],
    },
    /// A nested arena transferred by handle.
    Arena {
        /// Raw descriptor number of the arena's backing file.
        handle: RawFd,
        /// Flags to bind the arena with on the other side.
        flags: ArenaFlags,
        /// Fixed base address, for identity arenas.
        identity_base: Option<u64>,
    },
    /// A named opaque payload.
    Object {
        /// Lookup name.
        name: &'a str,
        /// The stored bytes.
        payload: &'a [u8],
    },
}

fn corrupt(message: impl Into<String>) -> Error {
    Error::InvalidImage(message.into())
}

fn get_u32(record: &[u8], at: usize) -> Option<u32> {
    let bytes = record.get(at..at + 4)?;
    Some(u32::from_ne_bytes(bytes.try_into().ok()?))
}

fn get_u64(record: &[u8], at: usize) -> Option<u64> {
    let bytes = record.get(at..at + 8)?;
    Some(u64::from_ne_bytes(bytes.try_into().ok()?))
}

fn put_u32(record: &mut [u8], at: usize, value: u32) {
    record[at..at + 4].copy_from_slice(&value.to_ne_bytes());
}

fn put_u64(record: &mut [u8], at: usize, value: u64) {
    record[at..at + 8].copy_from_slice(&value.to_ne_bytes());
}

pub(crate) fn static_record_len(module: &str, size: usize) -> usize {
    STATIC_PAYLOAD + size + module.len()
}

/// Fill a freshly allocated (zeroed) chunk with a static record. The
/// captured-bytes region stays zero; prepare overwrites it.
pub(crate) fn encode_static(record: &mut [u8], location: &AddrDescriptor, size: usize) {
    put_u32(record, 0, Tag::Static as u32);
    put_u64(record, 8, location.offset);
    put_u64(record, 16, size as u64);
    record[STATIC_PAYLOAD + size..].copy_from_slice(location.module.as_bytes());
}

pub(crate) fn encode_arena(record: &mut [u8], handle: RawFd, flags: ArenaFlags, identity_base: u64) {
    put_u32(record, 0, Tag::Arena as u32);
    put_u64(record, 8, handle as i64 as u64);
    put_u32(record, 16, flags.bits());
    put_u64(record, 24, identity_base);
}

pub(crate) fn object_record_len(name: &str, payload: &[u8]) -> usize {
    OBJECT_HEADER + name.len() + payload.len()
}

pub(crate) fn encode_object(record: &mut [u8], name: &str, payload: &[u8]) {
    put_u32(record, 0, Tag::Object as u32);
    put_u64(record, 8, name.len() as u64);
    record[OBJECT_HEADER..OBJECT_HEADER + name.len()].copy_from_slice(name.as_bytes());
    record[OBJECT_HEADER + name.len()..].copy_from_slice(payload);
}

/// Decode one element record. Unknown tags and short or inconsistent
/// records are image corruption.
pub(crate) fn decode(record: &[u8]) -> Result<Element<'_>> {
    let raw_tag = get_u32(record, 0).ok_or_else(|| corrupt("record too short for a tag"))?;
    let tag = Tag::from_u32(raw_tag)
        .ok_or_else(|| corrupt(format!("unknown element tag {raw_tag}")))?;

    match tag {
        Tag::Static => {
            let offset = get_u64(record, 8).ok_or_else(|| corrupt("short static record"))?;
            let size = get_u64(record, 16).ok_or_else(|| corrupt("short static record"))? as usize;
            let rest = record
                .get(STATIC_PAYLOAD..)
                .ok_or_else(|| corrupt("short static record"))?;
            let payload = rest
                .get(..size)
                .ok_or_else(|| corrupt("static payload exceeds its record"))?;
            let module = std::str::from_utf8(&rest[size..])
                .map_err(|_| corrupt("static module name is not UTF-8"))?;
            Ok(Element::Static {
                module,
                offset,
                payload,
            })
        }
        Tag::Arena => {
            if record.len() < ARENA_RECORD {
                return Err(corrupt("short arena record"));
            }
            let raw_handle = get_u64(record, 8).ok_or_else(|| corrupt("short arena record"))? as i64;
            let handle = RawFd::try_from(raw_handle)
                .map_err(|_| corrupt(format!("arena handle {raw_handle} out of range")))?;
            let flags = ArenaFlags::from_bits(
                get_u32(record, 16).ok_or_else(|| corrupt("short arena record"))?,
            );
            let base = get_u64(record, 24).ok_or_else(|| corrupt("short arena record"))?;
            Ok(Element::Arena {
                handle,
                flags,
                identity_base: (base != 0).then_some(base),
            })
        }
        Tag::Object => {
            let name_len =
                get_u64(record, 8).ok_or_else(|| corrupt("short object record"))? as usize;
            let rest = record
                .get(OBJECT_HEADER..)
                .ok_or_else(|| corrupt("short object record"))?;
            let name_bytes = rest
                .get(..name_len)
                .ok_or_else(|| corrupt("object name exceeds its record"))?;
            let name = std::str::from_utf8(name_bytes)
                .map_err(|_| corrupt("object name is not UTF-8"))?;
            Ok(Element::Object {
                name,
                payload: &rest[name_len..],
            })
        }
    }
}
