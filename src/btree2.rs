//! Version 2 B-trees.
//!
//! Used for huge fractal heap objects, the name and creation-order indexes of
//! dense groups, and the chunk index of datasets with more than one unlimited
//! dimension. Records are parsed per record type; checksums are skipped.

use log::debug;

use crate::error::Error;
use crate::io::{bytes_needed, Cursor, OpenFile, UNDEF_ADDR};

const BTHD_SIGNATURE: &[u8; 4] = b"BTHD";
const BTIN_SIGNATURE: &[u8; 4] = b"BTIN";
const BTLF_SIGNATURE: &[u8; 4] = b"BTLF";

/// Signature, version and type of every node.
const NODE_PREFIX_SIZE: usize = 6;
/// Node prefix plus the trailing checksum.
const METADATA_PREFIX_SIZE: usize = NODE_PREFIX_SIZE + 4;
/// Deepest tree accepted.
const MAX_DEPTH: u16 = 48;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BTree2Record {
    /// Type 1: huge object stored unfiltered.
    HugeObject { address: u64, length: u64, id: u64 },
    /// Type 2: huge object stored through the heap's filters.
    FilteredHugeObject {
        address: u64,
        filtered_length: u64,
        filter_mask: u32,
        memory_size: u64,
        id: u64,
    },
    /// Type 5: link name hash of a dense group.
    LinkName { hash: u32, heap_id: [u8; 7] },
    /// Type 6: link creation order of a dense group.
    LinkCreationOrder { order: u64, heap_id: [u8; 7] },
    /// Type 8: attribute name hash.
    AttributeName {
        heap_id: [u8; 8],
        flags: u8,
        creation_order: u32,
        hash: u32,
    },
    /// Type 9: attribute creation order.
    AttributeCreationOrder {
        heap_id: [u8; 8],
        flags: u8,
        creation_order: u32,
    },
    /// Type 10: unfiltered chunk; offsets are in chunk units.
    Chunk { address: u64, scaled_offsets: Vec<u64> },
    /// Type 11: filtered chunk.
    FilteredChunk {
        address: u64,
        chunk_size: u64,
        filter_mask: u32,
        scaled_offsets: Vec<u64>,
    },
    Other { record_type: u8, bytes: Vec<u8> },
}

#[derive(Debug, Clone, Copy)]
struct NodeInfo {
    max_nrec: u64,
    cum_max_nrec: u64,
    cum_max_nrec_size: usize,
}

/// An open v2 B-tree header and the derived node geometry.
pub struct BTree2<'f> {
    file: &'f OpenFile,
    address: u64,
    record_type: u8,
    record_size: usize,
    depth: u16,
    root_address: u64,
    root_nrec: u16,
    total_records: u64,
    node_info: Vec<NodeInfo>,
    max_nrec_size: usize,
    /// Dataset rank, for chunk records.
    ndims: usize,
    /// Width of the chunk size field of filtered chunk records.
    chunk_size_len: usize,
}

impl<'f> BTree2<'f> {
    /// `ndims` and `chunk_size_len` only matter for chunk record types 10 and 11.
    pub fn open(file: &'f OpenFile, address: u64, ndims: usize, chunk_size_len: usize) -> Result<Self, Error> {
        let ctx = file.ctx();
        let len = NODE_PREFIX_SIZE + 4 + 2 + 2 + 1 + 1 + ctx.offset_size + 2 + ctx.length_size + 4;
        let raw = file.read_signed_block(address, len, BTHD_SIGNATURE)?;
        let mut cursor = Cursor::new(&raw, ctx);
        cursor.skip(4)?;
        let version = cursor.read_u8()?;
        if version != 0 {
            return Err(Error::InvalidFileStructure(format!(
                "Unsupported v2 B-tree header version {} at {}",
                version, address
            )));
        }
        let record_type = cursor.read_u8()?;
        let node_size = cursor.read_u32()? as usize;
        let record_size = cursor.read_u16()? as usize;
        let depth = cursor.read_u16()?;
        let _split_percent = cursor.read_u8()?;
        let _merge_percent = cursor.read_u8()?;
        let root_address = cursor.read_offset()?;
        let root_nrec = cursor.read_u16()?;
        let total_records = cursor.read_length()?;

        if depth > MAX_DEPTH {
            return Err(Error::InvalidFileStructure(format!(
                "v2 B-tree at {} has depth {}",
                address, depth
            )));
        }
        if record_size == 0 || node_size <= METADATA_PREFIX_SIZE {
            return Err(Error::InvalidFileStructure(format!(
                "v2 B-tree at {} has node size {} and record size {}",
                address, node_size, record_size
            )));
        }

        let leaf_max = ((node_size - METADATA_PREFIX_SIZE) / record_size) as u64;
        let max_nrec_size = bytes_needed(leaf_max);
        let mut node_info = vec![NodeInfo {
            max_nrec: leaf_max,
            cum_max_nrec: leaf_max,
            cum_max_nrec_size: 0,
        }];
        for u in 1..=depth as usize {
            let prev = node_info[u - 1];
            let pointer_size = ctx.offset_size
                + max_nrec_size
                + if u > 1 { prev.cum_max_nrec_size } else { 0 };
            let usable = node_size
                .checked_sub(METADATA_PREFIX_SIZE + pointer_size)
                .ok_or_else(|| {
                    Error::InvalidFileStructure(format!("v2 B-tree node size {} too small", node_size))
                })?;
            let max_nrec = (usable / (record_size + pointer_size)) as u64;
            let cum_max_nrec = (max_nrec + 1)
                .saturating_mul(prev.cum_max_nrec)
                .saturating_add(max_nrec);
            node_info.push(NodeInfo {
                max_nrec,
                cum_max_nrec,
                cum_max_nrec_size: bytes_needed(cum_max_nrec),
            });
        }

        debug!(
            "v2 B-tree at {}: type {}, depth {}, {} records",
            address, record_type, depth, total_records
        );

        Ok(BTree2 {
            file,
            address,
            record_type,
            record_size,
            depth,
            root_address,
            root_nrec,
            total_records,
            node_info,
            max_nrec_size,
            ndims,
            chunk_size_len,
        })
    }

    pub fn record_type(&self) -> u8 {
        self.record_type
    }

    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    /// Every record, in key order.
    pub fn records(&self) -> Result<Vec<BTree2Record>, Error> {
        // the header's count is untrusted; no more records than the file can hold
        let fit = self.file.len() / self.record_size as u64;
        let mut out = Vec::with_capacity(self.total_records.min(fit) as usize);
        if self.root_address != UNDEF_ADDR && self.root_nrec > 0 {
            self.walk(self.root_address, self.root_nrec as usize, self.depth as usize, &mut out)?;
        }
        Ok(out)
    }

    fn walk(&self, address: u64, nrec: usize, depth: usize, out: &mut Vec<BTree2Record>) -> Result<(), Error> {
        if depth == 0 {
            let raw = self.read_node(address, nrec, 0, BTLF_SIGNATURE)?;
            let mut cursor = Cursor::new(&raw, self.file.ctx());
            cursor.skip(NODE_PREFIX_SIZE)?;
            for _ in 0..nrec {
                out.push(self.read_record(&mut cursor)?);
            }
            return Ok(());
        }

        let pointer_size = self.pointer_size(depth);
        let raw = self.read_node(address, nrec, (nrec + 1) * pointer_size, BTIN_SIGNATURE)?;
        let ctx = self.file.ctx();
        let mut records = Cursor::new(&raw, ctx);
        records.skip(NODE_PREFIX_SIZE)?;
        let mut pointers = Cursor::new(&raw, ctx);
        pointers.seek(NODE_PREFIX_SIZE + nrec * self.record_size);

        for i in 0..=nrec {
            let child = pointers.read_offset()?;
            let child_nrec = pointers.read_uint(self.max_nrec_size)?;
            if child_nrec > self.node_info[depth - 1].max_nrec {
                return Err(Error::InvalidFileStructure(format!(
                    "v2 B-tree node at {} points to a child with {} records",
                    address, child_nrec
                )));
            }
            let child_nrec = child_nrec as usize;
            if depth > 1 {
                let _total = pointers.read_uint(self.node_info[depth - 1].cum_max_nrec_size)?;
            }
            self.walk(child, child_nrec, depth - 1, out)?;
            if i < nrec {
                out.push(self.read_record(&mut records)?);
            }
        }
        Ok(())
    }

    fn pointer_size(&self, depth: usize) -> usize {
        let ctx = self.file.ctx();
        ctx.offset_size
            + self.max_nrec_size
            + if depth > 1 {
                self.node_info[depth - 1].cum_max_nrec_size
            } else {
                0
            }
    }

    fn read_node(&self, address: u64, nrec: usize, pointers: usize, signature: &[u8; 4]) -> Result<Vec<u8>, Error> {
        let len = NODE_PREFIX_SIZE + nrec * self.record_size + pointers;
        let raw = self.file.read_signed_block(address, len, signature)?;
        if raw[5] != self.record_type {
            return Err(Error::InvalidFileStructure(format!(
                "v2 B-tree node at {} has record type {}, header {} says {}",
                address, raw[5], self.address, self.record_type
            )));
        }
        Ok(raw)
    }

    fn read_record(&self, cursor: &mut Cursor<'_>) -> Result<BTree2Record, Error> {
        let start = cursor.position();
        let record = match self.record_type {
            1 => BTree2Record::HugeObject {
                address: cursor.read_offset()?,
                length: cursor.read_length()?,
                id: cursor.read_length()?,
            },
            2 => BTree2Record::FilteredHugeObject {
                address: cursor.read_offset()?,
                filtered_length: cursor.read_length()?,
                filter_mask: cursor.read_u32()?,
                memory_size: cursor.read_length()?,
                id: cursor.read_length()?,
            },
            5 => {
                let hash = cursor.read_u32()?;
                BTree2Record::LinkName {
                    hash,
                    heap_id: read_array(cursor)?,
                }
            }
            6 => {
                let order = cursor.read_u64()?;
                BTree2Record::LinkCreationOrder {
                    order,
                    heap_id: read_array(cursor)?,
                }
            }
            8 => BTree2Record::AttributeName {
                heap_id: read_array(cursor)?,
                flags: cursor.read_u8()?,
                creation_order: cursor.read_u32()?,
                hash: cursor.read_u32()?,
            },
            9 => BTree2Record::AttributeCreationOrder {
                heap_id: read_array(cursor)?,
                flags: cursor.read_u8()?,
                creation_order: cursor.read_u32()?,
            },
            10 => {
                let address = cursor.read_offset()?;
                BTree2Record::Chunk {
                    address,
                    scaled_offsets: self.read_scaled(cursor)?,
                }
            }
            11 => {
                let address = cursor.read_offset()?;
                let chunk_size = cursor.read_uint(self.chunk_size_len)?;
                let filter_mask = cursor.read_u32()?;
                BTree2Record::FilteredChunk {
                    address,
                    chunk_size,
                    filter_mask,
                    scaled_offsets: self.read_scaled(cursor)?,
                }
            }
            record_type => BTree2Record::Other {
                record_type,
                bytes: cursor.read_bytes(self.record_size)?.to_vec(),
            },
        };
        cursor.seek(start + self.record_size);
        Ok(record)
    }

    fn read_scaled(&self, cursor: &mut Cursor<'_>) -> Result<Vec<u64>, Error> {
        (0..self.ndims).map(|_| cursor.read_u64()).collect()
    }

    /// Location and length of a huge heap object.
    pub fn find_huge_object(&self, wanted: u64) -> Result<Option<(u64, u64)>, Error> {
        for record in self.records()? {
            match record {
                BTree2Record::HugeObject { address, length, id } if id == wanted => {
                    return Ok(Some((address, length)));
                }
                BTree2Record::FilteredHugeObject {
                    address,
                    filtered_length,
                    id,
                    ..
                } if id == wanted => return Ok(Some((address, filtered_length))),
                _ => {}
            }
        }
        Ok(None)
    }
}

fn read_array<const N: usize>(cursor: &mut Cursor<'_>) -> Result<[u8; N], Error> {
    let mut out = [0u8; N];
    out.copy_from_slice(cursor.read_bytes(N)?);
    Ok(out)
}

/// Width of the chunk size field in filtered chunk records.
pub fn chunk_size_len(chunk_bytes: u64) -> usize {
    let bits = crate::io::log2_floor(chunk_bytes.max(1)) as usize;
    (1 + (bits + 8) / 8).min(8)
}
