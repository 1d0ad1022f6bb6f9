//! Random-access byte sources and the field readers used by every on-disk
//! structure parser.
//!
//! File-level reads go through [`OpenFile`], which resolves addresses against
//! the superblock base address and knows the file's offset and length widths.
//! Parsers copy a block out with [`OpenFile::read_bytes`] and walk it with a
//! [`Cursor`].

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use memmap2::{Mmap, MmapOptions};

use crate::error::Error;

/// Normalized form of the all-ones "undefined address" of any offset width.
pub const UNDEF_ADDR: u64 = u64::MAX;

// ---- Byte sources ----

/// A random-access, read-only view of file bytes.
pub trait ByteSource: Send + Sync {
    /// Total length in bytes.
    fn len(&self) -> u64;

    /// Fills `buf` with the bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn copy_range(data: &[u8], offset: u64, buf: &mut [u8]) -> Result<(), Error> {
    let start = usize::try_from(offset).map_err(|_| Error::UnexpectedEof)?;
    let end = start.checked_add(buf.len()).ok_or(Error::UnexpectedEof)?;
    let src = data.get(start..end).ok_or(Error::UnexpectedEof)?;
    buf.copy_from_slice(src);
    Ok(())
}

/// Memory-mapped file.
pub struct MmapSource {
    // Empty files cannot be mapped on every platform.
    mmap: Option<Mmap>,
}

impl MmapSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = File::open(path.as_ref())?;
        if file.metadata()?.len() == 0 {
            return Ok(Self { mmap: None });
        }
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(Self { mmap: Some(mmap) })
    }

    fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }
}

impl ByteSource for MmapSource {
    fn len(&self) -> u64 {
        self.bytes().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        copy_range(self.bytes(), offset, buf)
    }
}

/// Bytes held in memory, cheap to clone.
#[derive(Clone)]
pub struct MemorySource {
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }
}

impl ByteSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        copy_range(&self.data, offset, buf)
    }
}

/// Produces independent byte sources over the same file.
///
/// Concurrent readers give every worker its own source instead of sharing one.
pub trait SourceOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn ByteSource>, Error>;

    /// Human-readable location, used in log messages.
    fn location(&self) -> String;
}

/// Opens a fresh memory map of a path on every call.
pub struct PathOpener {
    path: PathBuf,
}

impl PathOpener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SourceOpener for PathOpener {
    fn open(&self) -> Result<Box<dyn ByteSource>, Error> {
        Ok(Box::new(MmapSource::open(&self.path)?))
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Hands out views of one shared in-memory buffer.
pub struct MemoryOpener {
    data: Arc<[u8]>,
}

impl MemoryOpener {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }
}

impl SourceOpener for MemoryOpener {
    fn open(&self) -> Result<Box<dyn ByteSource>, Error> {
        Ok(Box::new(MemorySource {
            data: Arc::clone(&self.data),
        }))
    }

    fn location(&self) -> String {
        format!("<memory, {} bytes>", self.data.len())
    }
}

// ---- Variable-width field context ----

/// Offset and length widths stored in the superblock, threaded through every parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hdf5Ctx {
    pub offset_size: usize,
    pub length_size: usize,
}

impl Default for Hdf5Ctx {
    fn default() -> Self {
        Hdf5Ctx {
            offset_size: 8,
            length_size: 8,
        }
    }
}

impl Hdf5Ctx {
    pub fn new(offset_size: usize, length_size: usize) -> Result<Self, Error> {
        if !(1..=8).contains(&offset_size) || !(1..=8).contains(&length_size) {
            return Err(Error::InvalidFileStructure(format!(
                "Invalid HDF5 offset/length sizes: O={}, L={}",
                offset_size, length_size
            )));
        }
        Ok(Hdf5Ctx {
            offset_size,
            length_size,
        })
    }

    /// True for the undefined address, in raw or normalized form.
    pub fn is_undefined(&self, address: u64) -> bool {
        address == UNDEF_ADDR || address == all_ones(self.offset_size)
    }
}

fn all_ones(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

/// Reads a little-endian unsigned integer of `size` bytes (0..=8).
pub fn read_uint(data: &[u8], pos: usize, size: usize) -> Result<u64, Error> {
    if size > 8 {
        return Err(Error::InvalidFileStructure(format!(
            "Integer field of {} bytes is wider than 8",
            size
        )));
    }
    if size == 0 {
        return Ok(0);
    }
    let end = pos.checked_add(size).ok_or(Error::UnexpectedEof)?;
    let bytes = data.get(pos..end).ok_or(Error::UnexpectedEof)?;
    Ok(LittleEndian::read_uint(bytes, size))
}

/// Number of bytes needed to encode `max` (at least one).
pub fn bytes_needed(max: u64) -> usize {
    if max == 0 {
        1
    } else {
        (63 - max.leading_zeros() as usize) / 8 + 1
    }
}

/// floor(log2(n)) for n > 0, zero otherwise.
pub fn log2_floor(n: u64) -> u32 {
    if n == 0 { 0 } else { 63 - n.leading_zeros() }
}

// ---- Cursor ----

/// Sequential reader over a block of bytes copied out of the file.
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    ctx: Hdf5Ctx,
    big_endian: bool,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8], ctx: Hdf5Ctx) -> Self {
        Cursor {
            data,
            pos: 0,
            ctx,
            big_endian: false,
        }
    }

    /// Switches fixed-width reads to big-endian. Offsets and lengths stay little-endian.
    pub fn with_big_endian(mut self, big_endian: bool) -> Self {
        self.big_endian = big_endian;
        self
    }

    pub fn ctx(&self) -> Hdf5Ctx {
        self.ctx
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), Error> {
        self.read_bytes(n).map(|_| ())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self.pos.checked_add(n).ok_or(Error::UnexpectedEof)?;
        let bytes = self.data.get(self.pos..end).ok_or(Error::UnexpectedEof)?;
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        let b = self.read_bytes(2)?;
        Ok(if self.big_endian {
            BigEndian::read_u16(b)
        } else {
            LittleEndian::read_u16(b)
        })
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        let b = self.read_bytes(4)?;
        Ok(if self.big_endian {
            BigEndian::read_u32(b)
        } else {
            LittleEndian::read_u32(b)
        })
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        let b = self.read_bytes(8)?;
        Ok(if self.big_endian {
            BigEndian::read_u64(b)
        } else {
            LittleEndian::read_u64(b)
        })
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        self.read_u32().map(|v| v as i32)
    }

    pub fn read_i64(&mut self) -> Result<i64, Error> {
        self.read_u64().map(|v| v as i64)
    }

    /// Reads an unsigned little-endian integer whose width is only known at runtime.
    pub fn read_uint(&mut self, width: usize) -> Result<u64, Error> {
        let value = read_uint(self.data, self.pos, width)?;
        self.pos += width;
        Ok(value)
    }

    /// Reads an offset-sized address, normalizing the undefined address to [`UNDEF_ADDR`].
    pub fn read_offset(&mut self) -> Result<u64, Error> {
        let raw = self.read_uint(self.ctx.offset_size)?;
        Ok(if raw == all_ones(self.ctx.offset_size) {
            UNDEF_ADDR
        } else {
            raw
        })
    }

    /// Reads a length-sized unsigned integer.
    pub fn read_length(&mut self) -> Result<u64, Error> {
        self.read_uint(self.ctx.length_size)
    }

    /// Consumes a 4-byte signature, failing if it does not match.
    pub fn expect_signature(&mut self, signature: &[u8; 4], address: u64) -> Result<(), Error> {
        let found = self.read_bytes(4)?;
        if found != signature {
            return Err(Error::InvalidSignature {
                expected: String::from_utf8_lossy(signature).into_owned(),
                found: found.to_vec(),
                address,
            });
        }
        Ok(())
    }
}

/// Reads a NUL-terminated string from `data` starting at `pos`.
pub fn read_cstring(data: &[u8], pos: usize) -> Result<String, Error> {
    let tail = data.get(pos..).ok_or(Error::UnexpectedEof)?;
    let end = tail.iter().position(|&b| b == 0).ok_or(Error::UnexpectedEof)?;
    String::from_utf8(tail[..end].to_vec()).map_err(|e| {
        Error::InvalidFileStructure(format!("Invalid UTF-8 in HDF5 string: {}", e))
    })
}

// ---- OpenFile ----

/// A byte source bound to one file's size classes and base address.
pub struct OpenFile {
    source: Box<dyn ByteSource>,
    ctx: Hdf5Ctx,
    base_address: u64,
}

impl OpenFile {
    pub fn new(source: Box<dyn ByteSource>, ctx: Hdf5Ctx, base_address: u64) -> Self {
        OpenFile {
            source,
            ctx,
            base_address,
        }
    }

    /// Opens a new source through `opener` with the same layout parameters.
    pub fn reopen(opener: &dyn SourceOpener, ctx: Hdf5Ctx, base_address: u64) -> Result<Self, Error> {
        Ok(Self::new(opener.open()?, ctx, base_address))
    }

    pub fn ctx(&self) -> Hdf5Ctx {
        self.ctx
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    pub fn len(&self) -> u64 {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    /// Absolute position of a file address.
    pub fn file_offset(&self, address: u64) -> Result<u64, Error> {
        if self.ctx.is_undefined(address) {
            return Err(Error::InvalidFileStructure(
                "Attempt to read from the undefined address".to_string(),
            ));
        }
        self.base_address
            .checked_add(address)
            .ok_or(Error::UnexpectedEof)
    }

    /// Copies `len` bytes starting at file address `address`.
    pub fn read_bytes(&self, address: u64, len: usize) -> Result<Vec<u8>, Error> {
        let offset = self.file_offset(address)?;
        let end = offset.checked_add(len as u64).ok_or(Error::UnexpectedEof)?;
        if end > self.source.len() {
            return Err(Error::UnexpectedEof);
        }
        let mut buf = vec![0u8; len];
        self.source.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Copies at most `len` bytes, stopping early at end of file.
    pub fn read_bytes_upto(&self, address: u64, len: usize) -> Result<Vec<u8>, Error> {
        let offset = self.file_offset(address)?;
        let available = self.source.len().saturating_sub(offset);
        let take = (len as u64).min(available) as usize;
        self.read_bytes(address, take)
    }

    /// Reads a block and checks its leading 4-byte signature.
    pub fn read_signed_block(
        &self,
        address: u64,
        len: usize,
        signature: &[u8; 4],
    ) -> Result<Vec<u8>, Error> {
        let block = self.read_bytes(address, len)?;
        Cursor::new(&block, self.ctx).expect_signature(signature, address)?;
        Ok(block)
    }

    /// Reads an unsigned integer of runtime-chosen width at `address`.
    pub fn read_uint_at(&self, address: u64, width: usize) -> Result<u64, Error> {
        let bytes = self.read_bytes(address, width)?;
        read_uint(&bytes, 0, width)
    }
}
