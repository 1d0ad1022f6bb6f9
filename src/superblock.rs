//! Superblock location and parsing.

use log::{debug, warn};

use crate::error::Error;
use crate::io::{ByteSource, Cursor, Hdf5Ctx};
use crate::symbol_table::{EntryCache, SymbolTableEntry};

/// HDF5 file signature.
pub const HDF5_MAGIC: &[u8; 8] = b"\x89HDF\r\n\x1a\n";

/// Enough for any superblock version with 8-byte offsets.
const SUPERBLOCK_MAX_SIZE: usize = 128;

/// Where the root group is described.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootGroup {
    /// Versions 0 and 1: the root symbol table entry.
    SymbolTable(SymbolTableEntry),
    /// Versions 2 and 3: the root object header address.
    ObjectHeader(u64),
}

impl RootGroup {
    pub fn object_header(&self) -> u64 {
        match self {
            RootGroup::SymbolTable(entry) => entry.object_header,
            RootGroup::ObjectHeader(address) => *address,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub version: u8,
    pub ctx: Hdf5Ctx,
    /// Absolute file position that relative addresses are measured from.
    pub base_address: u64,
    pub eof_address: u64,
    pub root: RootGroup,
}

impl Superblock {
    /// Scans offsets 0, 512, 1024, 2048, ... for the signature and parses
    /// the superblock found there.
    pub fn find(source: &dyn ByteSource) -> Result<Self, Error> {
        let offset = find_signature(source)?;
        let take = (source.len() - offset).min(SUPERBLOCK_MAX_SIZE as u64) as usize;
        let mut buf = vec![0u8; take];
        source.read_at(offset, &mut buf)?;
        let superblock = Self::parse(&buf, offset)?;
        debug!(
            "superblock v{} at {} (O={}, L={})",
            superblock.version, offset, superblock.ctx.offset_size, superblock.ctx.length_size
        );
        Ok(superblock)
    }

    /// Parses superblock bytes found at absolute position `position`.
    pub fn parse(data: &[u8], position: u64) -> Result<Self, Error> {
        let mut c = Cursor::new(data, Hdf5Ctx::default());
        let magic = c.read_bytes(8)?;
        if magic != HDF5_MAGIC {
            return Err(Error::InvalidMagicNumber { found: magic.to_vec() });
        }
        let version = c.read_u8()?;
        match version {
            0 | 1 => parse_v0(data, version, position),
            2 | 3 => parse_v2(data, version, position),
            other => Err(Error::InvalidFileStructure(format!(
                "Unsupported HDF5 superblock version: {}",
                other
            ))),
        }
    }
}

fn find_signature(source: &dyn ByteSource) -> Result<u64, Error> {
    let len = source.len();
    let mut magic = [0u8; 8];
    let mut offset = 0u64;
    while offset + 8 <= len {
        source.read_at(offset, &mut magic)?;
        if &magic == HDF5_MAGIC {
            return Ok(offset);
        }
        offset = if offset == 0 { 512 } else { offset * 2 };
    }
    let mut found = vec![0u8; len.min(8) as usize];
    source.read_at(0, &mut found)?;
    Err(Error::InvalidMagicNumber { found })
}

/// Relative addresses count from the superblock when the stored base disagrees.
fn resolve_base(stored: u64, position: u64) -> u64 {
    if stored != position {
        if stored != 0 {
            warn!(
                "Superblock base address {} differs from its position {}; using the position",
                stored, position
            );
        }
        return position;
    }
    stored
}

// Layout after the version byte:
//   free-space, root symbol table and shared header versions, reserved,
//   O, L, reserved, group leaf K (2), group internal K (2), flags (4),
//   [v1: indexed storage K (2), reserved (2)],
//   base, free-space info, end of file and driver info addresses (O each),
//   root group symbol table entry.
fn parse_v0(data: &[u8], version: u8, position: u64) -> Result<Superblock, Error> {
    let sizes = data.get(13..15).ok_or(Error::UnexpectedEof)?;
    let ctx = Hdf5Ctx::new(sizes[0] as usize, sizes[1] as usize)?;
    let mut c = Cursor::new(data, ctx);
    c.seek(if version == 0 { 24 } else { 28 });
    let base_address = resolve_base(c.read_offset()?, position);
    let _free_space = c.read_offset()?;
    let eof_address = c.read_offset()?;
    let _driver_info = c.read_offset()?;
    let entry = SymbolTableEntry::read(&mut c)?;
    if !matches!(entry.cache, EntryCache::Group { .. }) {
        debug!("root symbol table entry carries no cached group addresses");
    }
    Ok(Superblock {
        version,
        ctx,
        base_address,
        eof_address,
        root: RootGroup::SymbolTable(entry),
    })
}

// Layout after the version byte: O, L, flags, then base, superblock
// extension, end of file and root object header addresses, then a checksum.
fn parse_v2(data: &[u8], version: u8, position: u64) -> Result<Superblock, Error> {
    let sizes = data.get(9..11).ok_or(Error::UnexpectedEof)?;
    let ctx = Hdf5Ctx::new(sizes[0] as usize, sizes[1] as usize)?;
    let mut c = Cursor::new(data, ctx);
    c.seek(12);
    let base_address = resolve_base(c.read_offset()?, position);
    let _extension = c.read_offset()?;
    let eof_address = c.read_offset()?;
    let root = c.read_offset()?;
    Ok(Superblock {
        version,
        ctx,
        base_address,
        eof_address,
        root: RootGroup::ObjectHeader(root),
    })
}
