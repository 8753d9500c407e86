//! Name-record codec for the FS buffer region.
//!
//! Every entry of the tree occupies one variable-length record: a one-byte
//! kind tag, a little-endian parent back-link offset, a little-endian name
//! length and the raw name bytes (no terminator). Offsets are absolute
//! positions within the region, which caps the region at 4 GiB.

use byteorder::{ByteOrder, LittleEndian};
use num_traits::FromPrimitive;

use crate::fs_buf::{Error, Result};

/// Fixed part of a record preceding the name bytes.
pub const RECORD_HEADER_LEN: u32 = 7;

/// Encoded size of an end-of-children sentinel (a record with an empty name).
pub const SENTINEL_LEN: u32 = RECORD_HEADER_LEN;

/// Kind tag stored in the first byte of a record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_derive::FromPrimitive)]
#[repr(u8)]
pub enum RecordKind {
    /// Regular file; symlinks are recorded as files as well.
    File = 0x00,
    /// Directory, immediately followed by its children in preorder.
    Directory = 0x01,
    /// Closes the child list of the nearest unclosed directory.
    EndOfChildren = 0x7F,
}

/// Decoded view of one record inside the region.
#[derive(Debug, Copy, Clone)]
pub struct Record<'a> {
    pub kind: RecordKind,
    /// Offset of the parent directory record; `0` points at the root path.
    pub parent: u32,
    pub name: &'a [u8],
}

impl Record<'_> {
    /// Encoded size of this record in bytes.
    pub fn encoded_len(&self) -> u32 {
        record_len(self.name.len())
    }
}

/// Encoded size of a record carrying a name of `name_len` bytes.
pub fn record_len(name_len: usize) -> u32 {
    RECORD_HEADER_LEN + name_len as u32
}

/// Decodes the record starting at `off`, borrowing the name from `region`.
pub fn decode(region: &[u8], off: u32) -> Result<Record<'_>> {
    let start = off as usize;
    let names_at = start + RECORD_HEADER_LEN as usize;
    if names_at > region.len() {
        return Err(Error::Truncated);
    }
    let kind = RecordKind::from_u8(region[start]).ok_or(Error::Truncated)?;
    let parent = LittleEndian::read_u32(&region[start + 1..start + 5]);
    let name_len = LittleEndian::read_u16(&region[start + 5..start + 7]) as usize;
    let end = names_at + name_len;
    if end > region.len() {
        return Err(Error::Truncated);
    }
    Ok(Record { kind, parent, name: &region[names_at..end] })
}

/// Encodes a record into `dst`, which must be exactly `record_len(name.len())` bytes.
pub fn encode(dst: &mut [u8], kind: RecordKind, parent: u32, name: &[u8]) {
    dst[0] = kind as u8;
    LittleEndian::write_u32(&mut dst[1..5], parent);
    LittleEndian::write_u16(&mut dst[5..7], name.len() as u16);
    dst[RECORD_HEADER_LEN as usize..].copy_from_slice(name);
}

/// Rewrites only the parent back-link of the record at `off`.
pub fn set_parent(region: &mut [u8], off: u32, parent: u32) {
    let start = off as usize;
    LittleEndian::write_u32(&mut region[start + 1..start + 5], parent);
}
