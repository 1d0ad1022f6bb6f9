//! Extensible array chunk index (`EAHD`, `EAIB`, `EASB`, `EADB`).
//!
//! The first elements live in the index block itself. The rest are spread
//! over data blocks grouped into super blocks whose sizes double every other
//! super block; the data blocks of the first few super blocks are addressed
//! straight from the index block, the others through secondary blocks.

use std::collections::HashMap;

use log::{debug, warn};

use crate::chunk_index::{ChunkGrid, ChunkIndex, ChunkIter, ChunkLocation};
use crate::error::Error;
use crate::fixed_array::{page_elements, page_initialized, ElementCodec, ARRAY_METADATA_PREFIX_SIZE};
use crate::io::{log2_floor, Cursor, OpenFile};
use crate::layout::ExtensibleArrayParams;
use crate::tiling::Tiling;

const EAHD_SIGNATURE: &[u8; 4] = b"EAHD";
const EAIB_SIGNATURE: &[u8; 4] = b"EAIB";
const EASB_SIGNATURE: &[u8; 4] = b"EASB";
const EADB_SIGNATURE: &[u8; 4] = b"EADB";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SuperBlockInfo {
    ndblks: usize,
    dblk_nelmts: usize,
    start_idx: u64,
    start_dblk: usize,
}

fn super_block_table(params: &ExtensibleArrayParams) -> Result<Vec<SuperBlockInfo>, Error> {
    let min = params.data_block_min_elements as u64;
    if min == 0 || !min.is_power_of_two() || params.max_nelmts_bits as u32 > 63 {
        return Err(Error::InvalidFileStructure(format!(
            "Bad extensible array parameters {:?}",
            params
        )));
    }
    let nsblks = 1 + (params.max_nelmts_bits as usize).saturating_sub(log2_floor(min) as usize);
    let mut table = Vec::with_capacity(nsblks);
    let (mut start_idx, mut start_dblk) = (0u64, 0usize);
    for u in 0..nsblks {
        let info = SuperBlockInfo {
            ndblks: 1 << (u / 2),
            dblk_nelmts: (1usize << u.div_ceil(2)) * min as usize,
            start_idx,
            start_dblk,
        };
        start_idx += (info.ndblks * info.dblk_nelmts) as u64;
        start_dblk += info.ndblks;
        table.push(info);
    }
    Ok(table)
}

#[derive(Debug)]
struct Header {
    params: ExtensibleArrayParams,
    codec: ElementCodec,
    max_index_set: u64,
    index_block_address: u64,
}

/// All chunk elements of an extensible array, keyed by linear chunk number.
pub struct ExtensibleArrayIndex {
    tiling: Tiling,
    grid: ChunkGrid,
    entries: HashMap<u64, ChunkLocation>,
}

struct Walk<'a> {
    file: &'a OpenFile,
    header: &'a Header,
    grid: &'a ChunkGrid,
    /// Elements per data block page.
    page_nelmts: usize,
    entries: HashMap<u64, ChunkLocation>,
}

impl<'a> Walk<'a> {
    fn push(&mut self, c: &mut Cursor<'_>, idx: u64) -> Result<(), Error> {
        let location = self.header.codec.read(c, self.grid.offsets(idx))?;
        if !location.is_missing() {
            self.entries.insert(idx, location);
        }
        Ok(())
    }

    fn arr_off_size(&self) -> usize {
        (self.header.params.max_nelmts_bits as usize).div_ceil(8)
    }

    /// Reads the elements of one data block starting at element `first`.
    fn data_block(&mut self, address: u64, nelmts: usize, first: u64, page_init: Option<&[u8]>) -> Result<(), Error> {
        let ctx = self.file.ctx();
        let elem = self.header.codec.element_size;
        let prefix = ARRAY_METADATA_PREFIX_SIZE + ctx.offset_size + self.arr_off_size();
        let page_nelmts = self.page_nelmts;
        let wanted = self.header.max_index_set.saturating_sub(first).min(nelmts as u64) as usize;

        if nelmts <= page_nelmts {
            let raw = self.file.read_signed_block(address, prefix + wanted * elem, EADB_SIGNATURE)?;
            let mut c = Cursor::new(&raw, ctx);
            c.seek(prefix - 4);
            for i in 0..wanted {
                self.push(&mut c, first + i as u64)?;
            }
            return Ok(());
        }

        self.file.read_signed_block(address, prefix, EADB_SIGNATURE)?;
        let page_size = page_nelmts * elem + 4;
        for page in 0..nelmts / page_nelmts {
            let start = page * page_nelmts;
            if start >= wanted {
                break;
            }
            if page_init.is_some_and(|bits| !page_initialized(bits, page)) {
                continue;
            }
            let count = page_nelmts.min(wanted - start);
            let page_address = address.saturating_add((prefix + page * page_size) as u64);
            let bytes = self.file.read_bytes(page_address, count * elem)?;
            let mut c = Cursor::new(&bytes, ctx);
            for i in 0..count {
                self.push(&mut c, first + (start + i) as u64)?;
            }
        }
        Ok(())
    }

    /// Data block addresses and page-init bitmaps of a secondary block.
    fn super_block(&self, address: u64, info: &SuperBlockInfo) -> Result<(Vec<u64>, Vec<Vec<u8>>), Error> {
        let ctx = self.file.ctx();
        let npages = if info.dblk_nelmts > self.page_nelmts {
            info.dblk_nelmts / self.page_nelmts
        } else {
            0
        };
        let bitmap_size = npages.div_ceil(8);
        let head = ARRAY_METADATA_PREFIX_SIZE - 4 + ctx.offset_size + self.arr_off_size();
        let len = head + info.ndblks * (bitmap_size + ctx.offset_size) + 4;
        let raw = self.file.read_signed_block(address, len, EASB_SIGNATURE)?;
        let mut c = Cursor::new(&raw, ctx);
        c.seek(head);
        let bitmaps = (0..info.ndblks)
            .map(|_| c.read_bytes(bitmap_size).map(<[u8]>::to_vec))
            .collect::<Result<Vec<_>, _>>()?;
        let addresses = (0..info.ndblks)
            .map(|_| c.read_offset())
            .collect::<Result<Vec<_>, _>>()?;
        Ok((addresses, bitmaps))
    }
}

fn read_header(file: &OpenFile, address: u64, storage_dims: &[i64]) -> Result<Header, Error> {
    let ctx = file.ctx();
    let len = ARRAY_METADATA_PREFIX_SIZE + 6 + 6 * ctx.length_size + ctx.offset_size;
    let raw = file.read_signed_block(address, len, EAHD_SIGNATURE)?;
    let mut c = Cursor::new(&raw, ctx);
    c.skip(4)?;
    let version = c.read_u8()?;
    if version != 0 {
        return Err(Error::InvalidFileStructure(format!(
            "Unsupported extensible array header version {} at {}",
            version, address
        )));
    }
    let client_id = c.read_u8()?;
    let element_size = c.read_u8()? as usize;
    let params = ExtensibleArrayParams {
        max_nelmts_bits: c.read_u8()?,
        index_block_elements: c.read_u8()?,
        data_block_min_elements: c.read_u8()?,
        super_block_min_data_ptrs: c.read_u8()?,
        max_dblk_page_nelmts_bits: c.read_u8()?,
    };
    // super block count and size, data block count and size
    for _ in 0..4 {
        c.read_length()?;
    }
    let max_index_set = c.read_length()?;
    let _realized = c.read_length()?;
    let index_block_address = c.read_offset()?;
    Ok(Header {
        codec: ElementCodec::new(client_id, element_size, storage_dims, ctx.offset_size)?,
        params,
        max_index_set,
        index_block_address,
    })
}

impl ExtensibleArrayIndex {
    pub fn open(
        file: &OpenFile,
        header_address: u64,
        shape: &[i64],
        max_shape: Option<&[u64]>,
        storage_dims: &[i64],
        layout_params: &ExtensibleArrayParams,
    ) -> Result<Self, Error> {
        let ctx = file.ctx();
        let header = read_header(file, header_address, storage_dims)?;
        if header.params != *layout_params {
            warn!(
                "extensible array at {}: header parameters {:?} differ from layout {:?}",
                header_address, header.params, layout_params
            );
        }
        let unlimited = max_shape.and_then(|m| m.iter().position(|&d| d == u64::MAX));
        let grid = ChunkGrid::new(shape, max_shape, storage_dims, unlimited);
        let mut walk = Walk {
            file,
            header: &header,
            grid: &grid,
            page_nelmts: page_elements(header.params.max_dblk_page_nelmts_bits)?,
            entries: HashMap::new(),
        };

        if !ctx.is_undefined(header.index_block_address) && header.max_index_set > 0 {
            let params = &header.params;
            let table = super_block_table(params)?;
            let min_ptrs = params.super_block_min_data_ptrs as usize;
            let iblock_nsblks = 2 * log2_floor(min_ptrs.max(1) as u64) as usize;
            let ndblk_addrs = 2 * min_ptrs.saturating_sub(1);
            let nsblk_addrs = table.len().saturating_sub(iblock_nsblks);
            let nelmts = params.index_block_elements as usize;
            let elem = header.codec.element_size;

            let head = ARRAY_METADATA_PREFIX_SIZE - 4 + ctx.offset_size;
            let len = head + nelmts * elem + (ndblk_addrs + nsblk_addrs) * ctx.offset_size + 4;
            let raw = file.read_signed_block(header.index_block_address, len, EAIB_SIGNATURE)?;
            let mut c = Cursor::new(&raw, ctx);
            c.seek(head);
            for i in 0..nelmts {
                if (i as u64) < header.max_index_set {
                    walk.push(&mut c, i as u64)?;
                } else {
                    c.skip(elem)?;
                }
            }
            let dblk_addrs = (0..ndblk_addrs)
                .map(|_| c.read_offset())
                .collect::<Result<Vec<_>, _>>()?;
            let sblk_addrs = (0..nsblk_addrs)
                .map(|_| c.read_offset())
                .collect::<Result<Vec<_>, _>>()?;

            for (u, info) in table.iter().enumerate() {
                let first = nelmts as u64 + info.start_idx;
                if first >= header.max_index_set {
                    break;
                }
                let (addresses, bitmaps) = if u < iblock_nsblks {
                    let end = (info.start_dblk + info.ndblks).min(dblk_addrs.len());
                    (dblk_addrs[info.start_dblk.min(end)..end].to_vec(), Vec::new())
                } else {
                    let address = sblk_addrs.get(u - iblock_nsblks).copied().unwrap_or(u64::MAX);
                    if ctx.is_undefined(address) {
                        continue;
                    }
                    walk.super_block(address, info)?
                };
                for (k, &address) in addresses.iter().enumerate() {
                    let block_first = first + (k * info.dblk_nelmts) as u64;
                    if block_first >= header.max_index_set {
                        break;
                    }
                    if ctx.is_undefined(address) || address == 0 {
                        continue;
                    }
                    let bits = bitmaps.get(k).filter(|b| !b.is_empty()).map(Vec::as_slice);
                    walk.data_block(address, info.dblk_nelmts, block_first, bits)?;
                }
            }
        }
        let entries = walk.entries;
        debug!(
            "extensible array index at {}: {} chunks of {} set",
            header_address,
            entries.len(),
            header.max_index_set
        );

        Ok(ExtensibleArrayIndex {
            tiling: Tiling::new(shape, storage_dims),
            grid,
            entries,
        })
    }
}

impl ChunkIndex for ExtensibleArrayIndex {
    fn kind(&self) -> &'static str {
        "extensible array"
    }

    fn tiling(&self) -> &Tiling {
        &self.tiling
    }

    fn chunks(&self) -> ChunkIter<'_> {
        Box::new(self.entries.values().cloned().map(Ok))
    }

    fn find_chunk(&self, offsets: &[i64]) -> Result<Option<ChunkLocation>, Error> {
        Ok(self.entries.get(&self.grid.linear(offsets)).cloned())
    }
}
