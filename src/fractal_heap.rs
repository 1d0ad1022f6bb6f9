//! Fractal heaps.
//!
//! A fractal heap stores variable-sized objects (link messages of dense
//! groups, dense attributes) in a doubling table of direct blocks, reached
//! through a tree of indirect blocks. Objects are addressed by heap IDs:
//! managed IDs hold an offset into the heap's linear address space, huge IDs
//! are resolved through a v2 B-tree, and tiny IDs carry the object inline.

use log::{debug, warn};

use crate::btree2::{BTree2, BTree2Record};
use crate::error::Error;
use crate::filters::{FilterPipeline, FilterRegistry};
use crate::io::{bytes_needed, log2_floor, Cursor, OpenFile};

const FRHP_SIGNATURE: &[u8; 4] = b"FRHP";
const FHIB_SIGNATURE: &[u8; 4] = b"FHIB";
const FHDB_SIGNATURE: &[u8; 4] = b"FHDB";

const HEAP_ID_MANAGED: u8 = 0;
const HEAP_ID_HUGE: u8 = 1;
const HEAP_ID_TINY: u8 = 2;

/// Parsed fractal heap header (FRHP).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FractalHeapHeader {
    pub heap_id_len: usize,
    pub io_filter_len: usize,
    pub flags: u8,
    pub max_managed_object_size: u32,
    pub next_huge_id: u64,
    pub huge_btree_address: u64,
    pub free_space: u64,
    pub free_space_manager_address: u64,
    pub managed_space: u64,
    pub allocated_managed_space: u64,
    pub direct_block_iterator_offset: u64,
    pub managed_objects: u64,
    pub huge_objects_size: u64,
    pub huge_objects: u64,
    pub tiny_objects_size: u64,
    pub tiny_objects: u64,
    pub table_width: u16,
    pub starting_block_size: u64,
    pub max_direct_block_size: u64,
    /// log2 of the heap's linear address space.
    pub max_heap_size: u16,
    pub starting_root_rows: u16,
    pub root_block_address: u64,
    /// 0 means the root block is a direct block.
    pub current_root_rows: u16,
    pub filtered_root_size: u64,
    pub root_filter_mask: u32,
}

impl FractalHeapHeader {
    /// Bytes used by heap offsets in block headers and managed heap IDs.
    pub fn offset_width(&self) -> usize {
        (self.max_heap_size as usize).div_ceil(8)
    }

    /// Bytes used by the length of managed heap IDs.
    pub fn length_width(&self) -> usize {
        let max_block_offset = (log2_floor(self.max_direct_block_size) as usize + 7) / 8;
        max_block_offset.min(bytes_needed(self.max_managed_object_size as u64))
    }

    /// Size of the blocks in doubling table row `row`.
    pub fn row_block_size(&self, row: usize) -> u64 {
        if row <= 1 {
            self.starting_block_size
        } else {
            self.starting_block_size << (row - 1).min(63)
        }
    }

    /// Rows of an indirect block that hold direct blocks.
    fn max_direct_rows(&self) -> usize {
        (log2_floor(self.max_direct_block_size) as usize)
            .saturating_sub(log2_floor(self.starting_block_size) as usize)
            + 2
    }

    fn has_filters(&self) -> bool {
        self.io_filter_len > 0
    }
}

/// A direct block of the doubling table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectBlock {
    pub address: u64,
    /// Offset of the block in the heap's linear address space.
    pub offset: u64,
    pub size: u64,
    /// Stored size when the heap is filtered.
    pub filtered_size: Option<u64>,
    pub filter_mask: u32,
}

/// A decoded heap ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapId {
    Managed { offset: u64, length: u64 },
    Huge { id: u64, raw: Vec<u8> },
    Tiny { data: Vec<u8> },
}

/// Where a heap object's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapObjectPos {
    InFile { address: u64, length: u64 },
    /// Bytes already in hand: tiny objects, or objects in filtered blocks.
    Embedded(Vec<u8>),
}

pub struct FractalHeap<'f> {
    file: &'f OpenFile,
    address: u64,
    header: FractalHeapHeader,
    filters: Option<FilterPipeline>,
    direct_blocks: Vec<DirectBlock>,
    max_depth: usize,
}

impl<'f> FractalHeap<'f> {
    pub fn open(file: &'f OpenFile, address: u64, max_depth: usize) -> Result<Self, Error> {
        let ctx = file.ctx();
        let (o, l) = (ctx.offset_size, ctx.length_size);
        let fixed = 4 + 1 + 2 + 2 + 1 + 4 + l + o + l + o + 4 * l + 4 * l + 2 + l + l + 2 + 2 + o + 2;
        let raw = file.read_signed_block(address, fixed, FRHP_SIGNATURE)?;
        let mut c = Cursor::new(&raw, ctx);
        c.skip(4)?;
        let version = c.read_u8()?;
        if version != 0 {
            return Err(Error::InvalidFileStructure(format!(
                "Unsupported fractal heap version {} at {}",
                version, address
            )));
        }
        let mut header = FractalHeapHeader {
            heap_id_len: c.read_u16()? as usize,
            io_filter_len: c.read_u16()? as usize,
            flags: c.read_u8()?,
            max_managed_object_size: c.read_u32()?,
            next_huge_id: c.read_length()?,
            huge_btree_address: c.read_offset()?,
            free_space: c.read_length()?,
            free_space_manager_address: c.read_offset()?,
            managed_space: c.read_length()?,
            allocated_managed_space: c.read_length()?,
            direct_block_iterator_offset: c.read_length()?,
            managed_objects: c.read_length()?,
            huge_objects_size: c.read_length()?,
            huge_objects: c.read_length()?,
            tiny_objects_size: c.read_length()?,
            tiny_objects: c.read_length()?,
            table_width: c.read_u16()?,
            starting_block_size: c.read_length()?,
            max_direct_block_size: c.read_length()?,
            max_heap_size: c.read_u16()?,
            starting_root_rows: c.read_u16()?,
            root_block_address: c.read_offset()?,
            current_root_rows: c.read_u16()?,
            filtered_root_size: 0,
            root_filter_mask: 0,
        };

        if header.table_width == 0 || header.starting_block_size == 0 || header.max_heap_size > 64 {
            return Err(Error::InvalidFileStructure(format!(
                "Fractal heap at {} has table width {}, starting block size {}, max heap size {}",
                address, header.table_width, header.starting_block_size, header.max_heap_size
            )));
        }

        let filters = if header.has_filters() {
            let extra = file.read_bytes(address + fixed as u64, l + 4 + header.io_filter_len)?;
            let mut c = Cursor::new(&extra, ctx);
            header.filtered_root_size = c.read_length()?;
            header.root_filter_mask = c.read_u32()?;
            Some(FilterPipeline::parse(c.read_bytes(header.io_filter_len)?)?)
        } else {
            None
        };

        let mut heap = FractalHeap {
            file,
            address,
            header,
            filters,
            direct_blocks: Vec::new(),
            max_depth,
        };
        heap.read_root()?;
        debug!(
            "Fractal heap at {}: {} direct blocks, {} managed objects",
            address,
            heap.direct_blocks.len(),
            heap.header.managed_objects
        );
        Ok(heap)
    }

    pub fn header(&self) -> &FractalHeapHeader {
        &self.header
    }

    pub fn direct_blocks(&self) -> &[DirectBlock] {
        &self.direct_blocks
    }

    fn read_root(&mut self) -> Result<(), Error> {
        let root = self.header.root_block_address;
        if self.file.ctx().is_undefined(root) {
            return Ok(());
        }
        if self.header.current_root_rows == 0 {
            let filtered = self.header.has_filters();
            let block = DirectBlock {
                address: root,
                offset: 0,
                size: self.header.starting_block_size,
                filtered_size: filtered.then_some(self.header.filtered_root_size),
                filter_mask: self.header.root_filter_mask,
            };
            self.check_direct_block(&block)?;
            self.direct_blocks.push(block);
            Ok(())
        } else {
            let nrows = self.header.current_root_rows as usize;
            self.read_indirect_block(root, nrows, 0, 0)
        }
    }

    fn read_indirect_block(&mut self, address: u64, nrows: usize, heap_offset: u64, depth: usize) -> Result<(), Error> {
        if depth > self.max_depth {
            return Err(Error::InvalidFileStructure(
                "Fractal heap indirect block recursion depth exceeded".to_string(),
            ));
        }
        let ctx = self.file.ctx();
        let width = self.header.table_width as usize;
        let direct_rows = nrows.min(self.header.max_direct_rows());
        let indirect_rows = nrows - direct_rows;
        let filtered = self.header.has_filters();
        let direct_entry = ctx.offset_size + if filtered { ctx.length_size + 4 } else { 0 };
        let prefix = 5 + ctx.offset_size + self.header.offset_width();
        let len = prefix + direct_rows * width * direct_entry + indirect_rows * width * ctx.offset_size;

        let raw = self.file.read_signed_block(address, len, FHIB_SIGNATURE)?;
        let mut c = Cursor::new(&raw, ctx);
        c.skip(5)?;
        let heap_address = c.read_offset()?;
        if heap_address != self.address {
            return Err(Error::InvalidFileStructure(format!(
                "Indirect block at {} belongs to heap {}, not {}",
                address, heap_address, self.address
            )));
        }
        let stored_offset = c.read_uint(self.header.offset_width())?;
        if stored_offset != heap_offset {
            warn!(
                "Indirect block at {} claims heap offset {}, expected {}",
                address, stored_offset, heap_offset
            );
        }

        let mut offset = heap_offset;
        for row in 0..direct_rows {
            let size = self.header.row_block_size(row);
            for _ in 0..width {
                let block_address = c.read_offset()?;
                let (filtered_size, filter_mask) = if filtered {
                    (Some(c.read_length()?), c.read_u32()?)
                } else {
                    (None, 0)
                };
                if !ctx.is_undefined(block_address) && block_address != 0 {
                    let block = DirectBlock {
                        address: block_address,
                        offset,
                        size,
                        filtered_size,
                        filter_mask,
                    };
                    self.check_direct_block(&block)?;
                    self.direct_blocks.push(block);
                }
                offset += size;
            }
        }

        for row in direct_rows..nrows {
            let size = self.header.row_block_size(row);
            let child_rows = (log2_floor(size) as usize + 1).saturating_sub(log2_floor(
                self.header.starting_block_size * width as u64,
            ) as usize);
            for _ in 0..width {
                let child = c.read_offset()?;
                if !ctx.is_undefined(child) && child != 0 {
                    self.read_indirect_block(child, child_rows, offset, depth + 1)?;
                }
                offset += size;
            }
        }
        Ok(())
    }

    /// Validates the header of an unfiltered direct block.
    fn check_direct_block(&self, block: &DirectBlock) -> Result<(), Error> {
        if block.filtered_size.is_some() {
            return Ok(());
        }
        let ctx = self.file.ctx();
        let len = 5 + ctx.offset_size + self.header.offset_width();
        let raw = self.file.read_signed_block(block.address, len, FHDB_SIGNATURE)?;
        let mut c = Cursor::new(&raw, ctx);
        c.skip(5)?;
        let heap_address = c.read_offset()?;
        if heap_address != self.address {
            return Err(Error::InvalidFileStructure(format!(
                "Direct block at {} belongs to heap {}, not {}",
                block.address, heap_address, self.address
            )));
        }
        let stored_offset = c.read_uint(self.header.offset_width())?;
        if stored_offset != block.offset {
            warn!(
                "Direct block at {} claims heap offset {}, expected {}",
                block.address, stored_offset, block.offset
            );
        }
        Ok(())
    }

    /// Decodes the type and fields of a heap ID.
    pub fn decode_id(&self, id: &[u8]) -> Result<HeapId, Error> {
        let first = *id.first().ok_or(Error::UnexpectedEof)?;
        if first & 0xc0 != 0 {
            return Err(Error::InvalidFileStructure(format!(
                "Unsupported heap ID version {}",
                first >> 6
            )));
        }
        let mut c = Cursor::new(id, self.file.ctx());
        c.skip(1)?;
        match (first & 0x30) >> 4 {
            HEAP_ID_MANAGED => Ok(HeapId::Managed {
                offset: c.read_uint(self.header.offset_width())?,
                length: c.read_uint(self.header.length_width())?,
            }),
            HEAP_ID_HUGE => {
                let width = (id.len() - 1).min(8);
                Ok(HeapId::Huge {
                    id: c.read_uint(width)?,
                    raw: id[1..].to_vec(),
                })
            }
            HEAP_ID_TINY => {
                let (length, start) = if id.len() <= 18 {
                    ((first & 0x0f) as usize + 1, 1)
                } else {
                    let second = *id.get(1).ok_or(Error::UnexpectedEof)?;
                    ((((first & 0x0f) as usize) << 8 | second as usize) + 1, 2)
                };
                let data = id.get(start..start + length).ok_or(Error::UnexpectedEof)?;
                Ok(HeapId::Tiny { data: data.to_vec() })
            }
            other => Err(Error::InvalidFileStructure(format!("Unknown heap ID type {}", other))),
        }
    }

    /// Locates the object named by `id`.
    pub fn resolve(&self, id: &[u8]) -> Result<HeapObjectPos, Error> {
        match self.decode_id(id)? {
            HeapId::Managed { offset, length } => self.resolve_managed(offset, length),
            HeapId::Huge { id, raw } => self.resolve_huge(id, &raw),
            HeapId::Tiny { data } => Ok(HeapObjectPos::Embedded(data)),
        }
    }

    fn resolve_managed(&self, offset: u64, length: u64) -> Result<HeapObjectPos, Error> {
        let block = self
            .direct_blocks
            .iter()
            .find(|b| offset >= b.offset && offset < b.offset + b.size)
            .ok_or_else(|| {
                Error::InvalidFileStructure(format!(
                    "Heap offset {} is not in any direct block of heap {}",
                    offset, self.address
                ))
            })?;
        let local = offset - block.offset;
        match block.filtered_size {
            None => Ok(HeapObjectPos::InFile {
                address: block.address + local,
                length,
            }),
            Some(stored) => {
                let data = self.read_filtered(block.address, stored, block.filter_mask)?;
                let start = local as usize;
                let bytes = data
                    .get(start..start + length as usize)
                    .ok_or(Error::UnexpectedEof)?;
                Ok(HeapObjectPos::Embedded(bytes.to_vec()))
            }
        }
    }

    fn resolve_huge(&self, id: u64, raw: &[u8]) -> Result<HeapObjectPos, Error> {
        let btree_address = self.header.huge_btree_address;
        if self.file.ctx().is_undefined(btree_address) || btree_address == 0 {
            return Err(Error::HugeObjectUnresolved(format!(
                "heap {} has no huge object B-tree for id {}",
                self.address, id
            )));
        }
        let tree = BTree2::open(self.file, btree_address, 0, 0)?;
        match tree.record_type() {
            // directly accessed: address and length sit in the ID
            3 | 4 => {
                let mut c = Cursor::new(raw, self.file.ctx());
                let address = c.read_offset()?;
                let length = c.read_length()?;
                if tree.record_type() == 4 {
                    let mask = c.read_u32()?;
                    let data = self.read_filtered(address, length, mask)?;
                    return Ok(HeapObjectPos::Embedded(data));
                }
                Ok(HeapObjectPos::InFile { address, length })
            }
            _ => {
                for record in tree.records()? {
                    match record {
                        BTree2Record::HugeObject {
                            address,
                            length,
                            id: rid,
                        } if rid == id => return Ok(HeapObjectPos::InFile { address, length }),
                        BTree2Record::FilteredHugeObject {
                            address,
                            filtered_length,
                            filter_mask,
                            id: rid,
                            ..
                        } if rid == id => {
                            let data = self.read_filtered(address, filtered_length, filter_mask)?;
                            return Ok(HeapObjectPos::Embedded(data));
                        }
                        _ => {}
                    }
                }
                Err(Error::HugeObjectUnresolved(format!(
                    "id {} not found in heap {}",
                    id, self.address
                )))
            }
        }
    }

    fn read_filtered(&self, address: u64, stored: u64, mask: u32) -> Result<Vec<u8>, Error> {
        let raw = self.file.read_bytes(address, stored as usize)?;
        match &self.filters {
            Some(pipeline) => pipeline.apply(raw, mask, &FilterRegistry::default(), 1),
            None => Ok(raw),
        }
    }

    /// Reads the bytes of the object named by `id`.
    pub fn read_object(&self, id: &[u8]) -> Result<Vec<u8>, Error> {
        match self.resolve(id)? {
            HeapObjectPos::InFile { address, length } => self.file.read_bytes(address, length as usize),
            HeapObjectPos::Embedded(data) => Ok(data),
        }
    }
}
