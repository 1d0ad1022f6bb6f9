//! Symbol table nodes and local heaps of old-style groups.

use log::warn;

use crate::error::Error;
use crate::io::{read_cstring, Cursor, OpenFile};

const SNOD_SIGNATURE: &[u8; 4] = b"SNOD";
const HEAP_SIGNATURE: &[u8; 4] = b"HEAP";

/// Scratch-pad contents of a symbol table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryCache {
    None,
    /// The entry is a group; its B-tree and local heap.
    Group { btree_address: u64, heap_address: u64 },
    /// The entry is a soft link; the target path sits at this local heap offset.
    SoftLink { link_offset: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTableEntry {
    pub name_offset: u64,
    pub object_header: u64,
    pub cache: EntryCache,
}

impl SymbolTableEntry {
    /// Encoded size: two offsets, cache type, reserved word, 16-byte scratch pad.
    pub fn size(cursor: &Cursor<'_>) -> usize {
        2 * cursor.ctx().offset_size + 24
    }

    pub fn read(cursor: &mut Cursor<'_>) -> Result<Self, Error> {
        let start = cursor.position();
        let name_offset = cursor.read_offset()?;
        let object_header = cursor.read_offset()?;
        let cache_type = cursor.read_u32()?;
        cursor.skip(4)?;
        let cache = match cache_type {
            1 => EntryCache::Group {
                btree_address: cursor.read_offset()?,
                heap_address: cursor.read_offset()?,
            },
            2 => EntryCache::SoftLink {
                link_offset: cursor.read_u32()?,
            },
            _ => EntryCache::None,
        };
        cursor.seek(start + Self::size(cursor));
        Ok(SymbolTableEntry {
            name_offset,
            object_header,
            cache,
        })
    }
}

/// Reads the entries of the symbol table node (SNOD) at `address`.
///
/// Entries without an object header are dropped unless they are soft links.
pub fn read_symbol_table_node(file: &OpenFile, address: u64) -> Result<Vec<SymbolTableEntry>, Error> {
    let ctx = file.ctx();
    let header = file.read_signed_block(address, 8, SNOD_SIGNATURE)?;
    let mut cursor = Cursor::new(&header, ctx);
    cursor.skip(6)?;
    let num_symbols = cursor.read_u16()? as usize;

    let entry_size = 2 * ctx.offset_size + 24;
    let body = file.read_bytes(address + 8, num_symbols * entry_size)?;
    let mut cursor = Cursor::new(&body, ctx);
    let mut entries = Vec::with_capacity(num_symbols);
    for _ in 0..num_symbols {
        let entry = SymbolTableEntry::read(&mut cursor)?;
        let soft_link = matches!(entry.cache, EntryCache::SoftLink { .. });
        if !soft_link && (entry.object_header == 0 || ctx.is_undefined(entry.object_header)) {
            warn!("Symbol table node {} has an entry with no object header", address);
            continue;
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// The data segment of a local heap, holding the link names of one group.
#[derive(Debug, Clone)]
pub struct LocalHeap {
    data: Vec<u8>,
}

impl LocalHeap {
    pub fn load(file: &OpenFile, address: u64) -> Result<Self, Error> {
        let ctx = file.ctx();
        // HEAP: sig(4) + version(1) + reserved(3) + data_seg_size(L) + free_list_head(L) + data_seg_addr(O)
        let header_len = 8 + 2 * ctx.length_size + ctx.offset_size;
        let header = file.read_signed_block(address, header_len, HEAP_SIGNATURE)?;
        let mut cursor = Cursor::new(&header, ctx);
        cursor.skip(8)?;
        let size = cursor.read_length()?;
        let _free_list = cursor.read_length()?;
        let data_address = cursor.read_offset()?;
        let size = usize::try_from(size).map_err(|_| Error::UnexpectedEof)?;
        Ok(LocalHeap {
            data: file.read_bytes_upto(data_address, size)?,
        })
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        LocalHeap { data }
    }

    /// The NUL-terminated string at `offset` into the data segment.
    pub fn name_at(&self, offset: u64) -> Result<String, Error> {
        let pos = usize::try_from(offset).map_err(|_| Error::UnexpectedEof)?;
        read_cstring(&self.data, pos)
    }
}
