//! Fixed array chunk index (`FAHD` header, `FADB` data block).
//!
//! One element per chunk, in linear chunk order over the maximum dims. Large
//! data blocks are split into pages, each present only if its bit in the
//! page-init bitmap is set.

use log::debug;

use crate::chunk_index::{chunk_bytes, ChunkGrid, ChunkIndex, ChunkIter, ChunkLocation};
use crate::error::Error;
use crate::io::{Cursor, OpenFile};
use crate::tiling::Tiling;

const FAHD_SIGNATURE: &[u8; 4] = b"FAHD";
const FADB_SIGNATURE: &[u8; 4] = b"FADB";

/// Signature, version and client id plus the trailing checksum.
pub(crate) const ARRAY_METADATA_PREFIX_SIZE: usize = 4 + 1 + 1 + 4;

pub(crate) const CLIENT_CHUNK: u8 = 0;
pub(crate) const CLIENT_FILTERED_CHUNK: u8 = 1;

/// Decodes chunk elements shared by the fixed and extensible arrays.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ElementCodec {
    pub client_id: u8,
    pub element_size: usize,
    pub chunk_bytes: u64,
}

impl ElementCodec {
    pub(crate) fn new(client_id: u8, element_size: usize, storage_dims: &[i64], offset_size: usize) -> Result<Self, Error> {
        let min = match client_id {
            CLIENT_CHUNK => offset_size,
            CLIENT_FILTERED_CHUNK => offset_size + 1 + 4,
            other => {
                return Err(Error::InvalidFileStructure(format!(
                    "Unknown array index client id {}",
                    other
                )));
            }
        };
        if element_size < min {
            return Err(Error::InvalidFileStructure(format!(
                "Array index element size {} too small for client {}",
                element_size, client_id
            )));
        }
        Ok(ElementCodec {
            client_id,
            element_size,
            chunk_bytes: chunk_bytes(storage_dims),
        })
    }

    /// Reads one element; unallocated chunks come back as missing.
    pub(crate) fn read(&self, c: &mut Cursor<'_>, offsets: Vec<i64>) -> Result<ChunkLocation, Error> {
        let start = c.position();
        let address = c.read_offset()?;
        let location = if self.client_id == CLIENT_FILTERED_CHUNK {
            let size_width = self.element_size - c.ctx().offset_size - 4;
            let size = c.read_uint(size_width)?;
            let mask = c.read_u32()?;
            ChunkLocation::new(offsets, address, size, Some(mask))
        } else {
            ChunkLocation::new(offsets, address, self.chunk_bytes, None)
        };
        c.seek(start + self.element_size);
        if location.is_missing() {
            return Ok(ChunkLocation::missing(location.offsets));
        }
        Ok(location)
    }
}

/// Whether bit `i` of a page-init bitmap is set; bits run from the MSB.
pub(crate) fn page_initialized(bitmap: &[u8], i: usize) -> bool {
    bitmap
        .get(i / 8)
        .is_some_and(|b| b & (0x80 >> (i % 8)) != 0)
}

/// Elements per data block page, `2^bits`.
pub(crate) fn page_elements(bits: u8) -> Result<usize, Error> {
    1usize.checked_shl(bits as u32).ok_or_else(|| {
        Error::InvalidFileStructure(format!("Array index page size 2^{} out of range", bits))
    })
}

fn too_large(address: u64) -> Error {
    Error::InvalidFileStructure(format!("Fixed array at {} is too large", address))
}

#[derive(Debug, Clone, Copy)]
struct FixedArrayHeader {
    client_id: u8,
    element_size: usize,
    page_bits: u8,
    num_elements: u64,
    data_block_address: u64,
}

fn read_header(file: &OpenFile, address: u64) -> Result<FixedArrayHeader, Error> {
    let ctx = file.ctx();
    let len = ARRAY_METADATA_PREFIX_SIZE + 2 + ctx.length_size + ctx.offset_size;
    let raw = file.read_signed_block(address, len, FAHD_SIGNATURE)?;
    let mut c = Cursor::new(&raw, ctx);
    c.skip(4)?;
    let version = c.read_u8()?;
    if version != 0 {
        return Err(Error::InvalidFileStructure(format!(
            "Unsupported fixed array header version {} at {}",
            version, address
        )));
    }
    Ok(FixedArrayHeader {
        client_id: c.read_u8()?,
        element_size: c.read_u8()? as usize,
        page_bits: c.read_u8()?,
        num_elements: c.read_length()?,
        data_block_address: c.read_offset()?,
    })
}

/// All chunk elements of a fixed array, indexed by linear chunk number.
pub struct FixedArrayIndex {
    tiling: Tiling,
    grid: ChunkGrid,
    entries: Vec<ChunkLocation>,
}

impl FixedArrayIndex {
    pub fn open(
        file: &OpenFile,
        header_address: u64,
        shape: &[i64],
        max_shape: Option<&[u64]>,
        storage_dims: &[i64],
    ) -> Result<Self, Error> {
        let ctx = file.ctx();
        let header = read_header(file, header_address)?;
        let codec = ElementCodec::new(header.client_id, header.element_size, storage_dims, ctx.offset_size)?;
        let grid = ChunkGrid::new(shape, max_shape, storage_dims, None);
        if header.num_elements > grid.count() {
            return Err(Error::InvalidFileStructure(format!(
                "Fixed array at {} holds {} elements for {} chunks",
                header_address,
                header.num_elements,
                grid.count()
            )));
        }

        let mut entries = Vec::new();
        // unallocated data block: every chunk is missing
        if !ctx.is_undefined(header.data_block_address) {
            let n = usize::try_from(header.num_elements).map_err(|_| too_large(header_address))?;
            let elem = codec.element_size;
            let element_bytes = n.checked_mul(elem).ok_or_else(|| too_large(header_address))?;
            if element_bytes as u64 > file.len() {
                return Err(Error::InvalidFileStructure(format!(
                    "Fixed array at {} needs {} element bytes, file has {}",
                    header_address,
                    element_bytes,
                    file.len()
                )));
            }
            entries.reserve(n);

            let dblock = header.data_block_address;
            let prefix = ARRAY_METADATA_PREFIX_SIZE + ctx.offset_size;
            let page_nelmts = page_elements(header.page_bits)?;

            if n <= page_nelmts {
                let raw = file.read_signed_block(dblock, prefix + element_bytes, FADB_SIGNATURE)?;
                let mut c = Cursor::new(&raw, ctx);
                // checksum follows the elements
                c.seek(prefix - 4);
                for i in 0..n {
                    entries.push(codec.read(&mut c, grid.offsets(i as u64))?);
                }
            } else {
                let npages = n.div_ceil(page_nelmts);
                let bitmap_size = npages.div_ceil(8);
                let raw = file.read_signed_block(dblock, prefix + bitmap_size, FADB_SIGNATURE)?;
                let bitmap = &raw[prefix - 4..prefix - 4 + bitmap_size];
                // page_nelmts < n here, so this cannot overflow
                let page_size = (page_nelmts * elem + 4) as u64;
                let mut page_address = dblock.saturating_add((prefix + bitmap_size) as u64);

                for page in 0..npages {
                    let first = page * page_nelmts;
                    let count = page_nelmts.min(n - first);
                    if page_initialized(bitmap, page) {
                        let bytes = file.read_bytes(page_address, count * elem)?;
                        let mut c = Cursor::new(&bytes, ctx);
                        for i in first..first + count {
                            entries.push(codec.read(&mut c, grid.offsets(i as u64))?);
                        }
                    } else {
                        debug!("fixed array page {} at {} not initialized", page, page_address);
                        entries.extend((first..first + count).map(|i| ChunkLocation::missing(grid.offsets(i as u64))));
                    }
                    page_address = page_address.saturating_add(page_size);
                }
            }
        }
        debug!("fixed array index at {}: {} elements", header_address, entries.len());

        Ok(FixedArrayIndex {
            tiling: Tiling::new(shape, storage_dims),
            grid,
            entries,
        })
    }
}

impl ChunkIndex for FixedArrayIndex {
    fn kind(&self) -> &'static str {
        "fixed array"
    }

    fn tiling(&self) -> &Tiling {
        &self.tiling
    }

    fn chunks(&self) -> ChunkIter<'_> {
        Box::new(self.entries.iter().filter(|e| !e.is_missing()).cloned().map(Ok))
    }

    fn find_chunk(&self, offsets: &[i64]) -> Result<Option<ChunkLocation>, Error> {
        let entry = usize::try_from(self.grid.linear(offsets))
            .ok()
            .and_then(|i| self.entries.get(i));
        Ok(entry.filter(|e| !e.is_missing()).cloned())
    }
}
