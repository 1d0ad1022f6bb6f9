//! In-memory builders for the HDF5 structures the reader understands.
//!
//! Files use 8-byte offsets and lengths and a version 0 superblock. Every
//! builder appends to one buffer and returns the address of what it wrote.

#![allow(dead_code)]

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use h5chunk::object_header::{
    MSG_DATASPACE, MSG_DATATYPE, MSG_DATA_LAYOUT, MSG_FILL_VALUE, MSG_FILTER_PIPELINE, MSG_LINK,
    MSG_LINK_INFO, MSG_SYMBOL_TABLE,
};

pub const UNDEF: u64 = u64::MAX;
const SUPERBLOCK_SIZE: usize = 96;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pad8(v: &mut Vec<u8>) {
    while v.len() % 8 != 0 {
        v.push(0);
    }
}

// ---- Messages ----

pub fn dataspace(shape: &[u64], max_shape: Option<&[u64]>) -> Vec<u8> {
    let flags = if max_shape.is_some() { 1 } else { 0 };
    let mut b = vec![1, shape.len() as u8, flags, 0, 0, 0, 0, 0];
    for d in shape {
        b.extend_from_slice(&d.to_le_bytes());
    }
    for d in max_shape.unwrap_or(&[]) {
        b.extend_from_slice(&d.to_le_bytes());
    }
    b
}

pub fn datatype_float(size: u32) -> Vec<u8> {
    let mut b = vec![0x11, 0x20, 0x3f, 0x00];
    b.extend_from_slice(&size.to_le_bytes());
    b.extend_from_slice(&[0; 12]);
    b
}

pub fn datatype_int(size: u32, signed: bool) -> Vec<u8> {
    let mut b = vec![0x10, if signed { 0x08 } else { 0 }, 0, 0];
    b.extend_from_slice(&size.to_le_bytes());
    b.extend_from_slice(&0u16.to_le_bytes());
    b.extend_from_slice(&((size * 8) as u16).to_le_bytes());
    b
}

/// Version 3 compound datatype of `(name, byte offset, member datatype)`.
pub fn datatype_compound(members: &[(&str, u8, Vec<u8>)], size: u32) -> Vec<u8> {
    let mut b = vec![0x36, members.len() as u8, 0, 0];
    b.extend_from_slice(&size.to_le_bytes());
    for (name, offset, datatype) in members {
        b.extend_from_slice(name.as_bytes());
        b.push(0);
        b.push(*offset);
        b.extend_from_slice(datatype);
    }
    b
}

pub fn layout_contiguous(address: u64, size: u64) -> Vec<u8> {
    let mut b = vec![3, 1];
    b.extend_from_slice(&address.to_le_bytes());
    b.extend_from_slice(&size.to_le_bytes());
    b
}

pub fn layout_compact(data: &[u8]) -> Vec<u8> {
    let mut b = vec![3, 0];
    b.extend_from_slice(&(data.len() as u16).to_le_bytes());
    b.extend_from_slice(data);
    b
}

/// Version 3 chunked layout; `chunk` excludes the element size.
pub fn layout_btree_v1(btree: u64, chunk: &[u64], elem_size: u32) -> Vec<u8> {
    let mut b = vec![3, 2, chunk.len() as u8 + 1];
    b.extend_from_slice(&btree.to_le_bytes());
    for &d in chunk {
        b.extend_from_slice(&(d as u32).to_le_bytes());
    }
    b.extend_from_slice(&elem_size.to_le_bytes());
    b
}

fn layout_v4(chunk: &[u64], elem_size: u32, flags: u8, index_type: u8) -> Vec<u8> {
    let mut b = vec![4, 2, flags, chunk.len() as u8 + 1, 4];
    for &d in chunk {
        b.extend_from_slice(&(d as u32).to_le_bytes());
    }
    b.extend_from_slice(&elem_size.to_le_bytes());
    b.push(index_type);
    b
}

pub fn layout_single_chunk(address: u64, chunk: &[u64], elem_size: u32) -> Vec<u8> {
    let mut b = layout_v4(chunk, elem_size, 0, 1);
    b.extend_from_slice(&address.to_le_bytes());
    b
}

pub fn layout_implicit(address: u64, chunk: &[u64], elem_size: u32) -> Vec<u8> {
    let mut b = layout_v4(chunk, elem_size, 0, 2);
    b.extend_from_slice(&address.to_le_bytes());
    b
}

pub fn layout_fixed_array(header: u64, chunk: &[u64], elem_size: u32, page_bits: u8) -> Vec<u8> {
    let mut b = layout_v4(chunk, elem_size, 0, 3);
    b.push(page_bits);
    b.extend_from_slice(&header.to_le_bytes());
    b
}

/// Creation parameters of every extensible array the builder writes: element
/// bits, index block elements, minimum data block elements, minimum super
/// block data pointers and data block page bits.
pub const EA_PARAMS: [u8; 5] = [32, 2, 2, 2, 1];

pub fn layout_extensible_array(header: u64, chunk: &[u64], elem_size: u32) -> Vec<u8> {
    let mut b = layout_v4(chunk, elem_size, 0, 4);
    b.extend_from_slice(&EA_PARAMS);
    b.extend_from_slice(&header.to_le_bytes());
    b
}

const BTREE2_NODE_SIZE: u32 = 2048;

pub fn layout_btree_v2(header: u64, chunk: &[u64], elem_size: u32) -> Vec<u8> {
    let mut b = layout_v4(chunk, elem_size, 0, 5);
    b.extend_from_slice(&BTREE2_NODE_SIZE.to_le_bytes());
    b.extend_from_slice(&[100, 40]);
    b.extend_from_slice(&header.to_le_bytes());
    b
}

pub fn layout_virtual() -> Vec<u8> {
    let mut b = vec![4, 3];
    b.extend_from_slice(&UNDEF.to_le_bytes());
    b.extend_from_slice(&0u32.to_le_bytes());
    b
}

pub fn fill_value(value: &[u8]) -> Vec<u8> {
    let mut b = vec![2, 2, 2, 1];
    b.extend_from_slice(&(value.len() as u32).to_le_bytes());
    b.extend_from_slice(value);
    b
}

pub fn deflate_pipeline(level: u32) -> Vec<u8> {
    let mut b = vec![2, 1];
    b.extend_from_slice(&1u16.to_le_bytes());
    b.extend_from_slice(&0u16.to_le_bytes());
    b.extend_from_slice(&1u16.to_le_bytes());
    b.extend_from_slice(&level.to_le_bytes());
    b
}

/// A pipeline with one filter no decoder is registered for.
pub fn unknown_pipeline(id: u16, optional: bool) -> Vec<u8> {
    let mut b = vec![2, 1];
    b.extend_from_slice(&id.to_le_bytes());
    if id >= 256 {
        b.extend_from_slice(&0u16.to_le_bytes());
    }
    b.extend_from_slice(&(optional as u16).to_le_bytes());
    b.extend_from_slice(&0u16.to_le_bytes());
    b
}

pub fn hard_link(name: &str, address: u64) -> Vec<u8> {
    let mut b = vec![1, 0, name.len() as u8];
    b.extend_from_slice(name.as_bytes());
    b.extend_from_slice(&address.to_le_bytes());
    b
}

pub fn soft_link(name: &str, target: &str) -> Vec<u8> {
    let mut b = vec![1, 0x08, 1, name.len() as u8];
    b.extend_from_slice(name.as_bytes());
    b.extend_from_slice(&(target.len() as u16).to_le_bytes());
    b.extend_from_slice(target.as_bytes());
    b
}

pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn f64_bytes(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

// ---- Chunk B-tree records ----

#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// Chunk corner followed by the zero element offset.
    pub offsets: Vec<u64>,
    pub size: u32,
    pub filter_mask: u32,
    pub address: u64,
}

pub enum Member {
    Dataset(u64),
    Group(GroupAddrs),
    SoftLink(String),
}

#[derive(Debug, Clone, Copy)]
pub struct GroupAddrs {
    pub object_header: u64,
    pub btree: u64,
    pub heap: u64,
}

/// A row-major chunked dataset description for [`H5Builder::chunked_dataset`].
pub struct ChunkedSpec<'a> {
    pub shape: &'a [u64],
    pub chunk: &'a [u64],
    /// Chunks (by corner) the file never writes.
    pub skip: &'a dyn Fn(&[u64]) -> bool,
    pub deflate: bool,
    /// Leaf capacity; more chunks than this make a two-level tree.
    pub leaf_size: usize,
    pub fill: Option<f64>,
}

/// The value stored at every element: its row-major position.
pub fn linear_value(index: &[u64], shape: &[u64]) -> f64 {
    index
        .iter()
        .zip(shape)
        .fold(0u64, |acc, (&i, &n)| acc * n + i) as f64
}

pub struct H5Builder {
    buf: Vec<u8>,
}

impl Default for H5Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl H5Builder {
    pub fn new() -> Self {
        H5Builder {
            buf: vec![0; SUPERBLOCK_SIZE],
        }
    }

    pub fn alloc(&mut self, bytes: &[u8]) -> u64 {
        pad8(&mut self.buf);
        let address = self.buf.len() as u64;
        self.buf.extend_from_slice(bytes);
        address
    }

    pub fn patch(&mut self, address: u64, bytes: &[u8]) {
        let start = address as usize;
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Writes the superblock pointing at `root` and returns the file bytes.
    pub fn finish(mut self, root: GroupAddrs) -> Vec<u8> {
        pad8(&mut self.buf);
        let mut sb = b"\x89HDF\r\n\x1a\n".to_vec();
        sb.extend_from_slice(&[0, 0, 0, 0, 0, 8, 8, 0]);
        sb.extend_from_slice(&4u16.to_le_bytes());
        sb.extend_from_slice(&16u16.to_le_bytes());
        sb.extend_from_slice(&0u32.to_le_bytes());
        for address in [0, UNDEF, self.buf.len() as u64, UNDEF] {
            sb.extend_from_slice(&address.to_le_bytes());
        }
        sb.extend_from_slice(&0u64.to_le_bytes());
        sb.extend_from_slice(&root.object_header.to_le_bytes());
        sb.extend_from_slice(&1u32.to_le_bytes());
        sb.extend_from_slice(&0u32.to_le_bytes());
        sb.extend_from_slice(&root.btree.to_le_bytes());
        sb.extend_from_slice(&root.heap.to_le_bytes());
        assert_eq!(sb.len(), SUPERBLOCK_SIZE);
        self.patch(0, &sb);
        self.buf
    }

    /// A version 1 object header holding `messages`.
    pub fn object_header(&mut self, messages: &[(u16, Vec<u8>)]) -> u64 {
        let mut body = Vec::new();
        for (msg_type, data) in messages {
            let mut data = data.clone();
            pad8(&mut data);
            body.extend_from_slice(&msg_type.to_le_bytes());
            body.extend_from_slice(&(data.len() as u16).to_le_bytes());
            body.extend_from_slice(&[0; 4]);
            body.extend_from_slice(&data);
        }
        let mut b = vec![1, 0];
        b.extend_from_slice(&(messages.len() as u16).to_le_bytes());
        b.extend_from_slice(&1u32.to_le_bytes());
        b.extend_from_slice(&(body.len() as u32).to_le_bytes());
        b.extend_from_slice(&[0; 4]);
        b.extend_from_slice(&body);
        self.alloc(&b)
    }

    /// Object header of a dataset with the given layout and optional extras.
    pub fn dataset(
        &mut self,
        space: Vec<u8>,
        datatype: Vec<u8>,
        layout: Vec<u8>,
        filters: Option<Vec<u8>>,
        fill: Option<Vec<u8>>,
    ) -> u64 {
        let mut messages = vec![(MSG_DATASPACE, space), (MSG_DATATYPE, datatype)];
        if let Some(fill) = fill {
            messages.push((MSG_FILL_VALUE, fill));
        }
        if let Some(filters) = filters {
            messages.push((MSG_FILTER_PIPELINE, filters));
        }
        messages.push((MSG_DATA_LAYOUT, layout));
        self.object_header(&messages)
    }

    pub fn contiguous_f64(&mut self, shape: &[u64], values: &[f64]) -> u64 {
        let data = f64_bytes(values);
        let address = self.alloc(&data);
        self.dataset(
            dataspace(shape, None),
            datatype_float(8),
            layout_contiguous(address, data.len() as u64),
            None,
            None,
        )
    }

    // ---- Groups ----

    /// An old-style group with no members yet.
    pub fn empty_group(&mut self) -> GroupAddrs {
        let mut heap = b"HEAP\0\0\0\0".to_vec();
        let data = self.alloc(&[0; 8]);
        heap.extend_from_slice(&8u64.to_le_bytes());
        heap.extend_from_slice(&UNDEF.to_le_bytes());
        heap.extend_from_slice(&data.to_le_bytes());
        let heap = self.alloc(&heap);

        let mut tree = b"TREE\0\0".to_vec();
        tree.extend_from_slice(&0u16.to_le_bytes());
        tree.extend_from_slice(&UNDEF.to_le_bytes());
        tree.extend_from_slice(&UNDEF.to_le_bytes());
        tree.extend_from_slice(&[0; 24]);
        let btree = self.alloc(&tree);

        let mut stab = btree.to_le_bytes().to_vec();
        stab.extend_from_slice(&heap.to_le_bytes());
        let object_header = self.object_header(&[(MSG_SYMBOL_TABLE, stab)]);
        GroupAddrs {
            object_header,
            btree,
            heap,
        }
    }

    /// Gives an old-style group its members through a fresh heap and symbol table node.
    pub fn set_members(&mut self, group: GroupAddrs, members: &[(&str, Member)]) {
        let mut names = vec![0u8; 8];
        let mut entries = Vec::new();
        let mut last_offset = 0u64;
        for (name, member) in members {
            let name_offset = names.len() as u64;
            last_offset = name_offset;
            names.extend_from_slice(name.as_bytes());
            names.push(0);
            pad8(&mut names);

            let mut entry = name_offset.to_le_bytes().to_vec();
            match member {
                Member::Dataset(address) => {
                    entry.extend_from_slice(&address.to_le_bytes());
                    entry.extend_from_slice(&[0; 24]);
                }
                Member::Group(g) => {
                    entry.extend_from_slice(&g.object_header.to_le_bytes());
                    entry.extend_from_slice(&1u32.to_le_bytes());
                    entry.extend_from_slice(&0u32.to_le_bytes());
                    entry.extend_from_slice(&g.btree.to_le_bytes());
                    entry.extend_from_slice(&g.heap.to_le_bytes());
                }
                Member::SoftLink(path) => {
                    let link_offset = names.len() as u32;
                    names.extend_from_slice(path.as_bytes());
                    names.push(0);
                    pad8(&mut names);
                    entry.extend_from_slice(&UNDEF.to_le_bytes());
                    entry.extend_from_slice(&2u32.to_le_bytes());
                    entry.extend_from_slice(&0u32.to_le_bytes());
                    entry.extend_from_slice(&link_offset.to_le_bytes());
                    entry.extend_from_slice(&[0; 12]);
                }
            }
            entries.push(entry);
        }

        let data = self.alloc(&names);
        let mut heap = (names.len() as u64).to_le_bytes().to_vec();
        heap.extend_from_slice(&UNDEF.to_le_bytes());
        heap.extend_from_slice(&data.to_le_bytes());
        self.patch(group.heap + 8, &heap);

        let mut snod = b"SNOD\x01\0".to_vec();
        snod.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        for entry in &entries {
            snod.extend_from_slice(entry);
        }
        let snod = self.alloc(&snod);

        self.patch(group.btree + 6, &1u16.to_le_bytes());
        let mut keys = 0u64.to_le_bytes().to_vec();
        keys.extend_from_slice(&snod.to_le_bytes());
        keys.extend_from_slice(&last_offset.to_le_bytes());
        self.patch(group.btree + 24, &keys);
    }

    pub fn group(&mut self, members: &[(&str, Member)]) -> GroupAddrs {
        let group = self.empty_group();
        self.set_members(group, members);
        group
    }

    /// A new-style group whose links sit in its object header.
    pub fn compact_link_group(&mut self, links: &[Vec<u8>]) -> u64 {
        let mut info = vec![0, 0];
        info.extend_from_slice(&UNDEF.to_le_bytes());
        info.extend_from_slice(&UNDEF.to_le_bytes());
        let mut messages = vec![(MSG_LINK_INFO, info)];
        messages.extend(links.iter().map(|l| (MSG_LINK, l.clone())));
        self.object_header(&messages)
    }

    // ---- Chunk indices ----

    /// A version 1 chunk B-tree over `leaves`, one leaf node per slice.
    /// `rank` counts the trailing element dimension.
    pub fn chunk_btree(&mut self, rank: usize, leaves: &[Vec<ChunkRecord>]) -> u64 {
        let write_key = |b: &mut Vec<u8>, r: &ChunkRecord| {
            b.extend_from_slice(&r.size.to_le_bytes());
            b.extend_from_slice(&r.filter_mask.to_le_bytes());
            for &o in &r.offsets {
                b.extend_from_slice(&o.to_le_bytes());
            }
        };
        let node = |level: u8, entries: &[(ChunkRecord, u64)], last: &ChunkRecord| {
            let mut b = b"TREE\x01".to_vec();
            b.push(level);
            b.extend_from_slice(&(entries.len() as u16).to_le_bytes());
            b.extend_from_slice(&UNDEF.to_le_bytes());
            b.extend_from_slice(&UNDEF.to_le_bytes());
            for (key, child) in entries {
                write_key(&mut b, key);
                b.extend_from_slice(&child.to_le_bytes());
            }
            write_key(&mut b, last);
            b
        };
        let empty = ChunkRecord {
            offsets: vec![0; rank],
            size: 0,
            filter_mask: 0,
            address: UNDEF,
        };

        let mut children = Vec::new();
        for leaf in leaves {
            let entries: Vec<_> = leaf.iter().map(|r| (r.clone(), r.address)).collect();
            let last = leaf.last().unwrap_or(&empty);
            let bytes = node(0, &entries, last);
            children.push((leaf.first().unwrap_or(&empty).clone(), self.alloc(&bytes)));
        }
        if children.len() == 1 {
            return children[0].1;
        }
        let last = leaves.last().and_then(|l| l.last()).unwrap_or(&empty).clone();
        let bytes = node(1, &children, &last);
        self.alloc(&bytes)
    }

    /// A fixed array index of unfiltered chunk addresses in linear chunk order.
    pub fn fixed_array(&mut self, addresses: &[u64]) -> u64 {
        let mut dblock = b"FADB\0\0".to_vec();
        dblock.extend_from_slice(&0u64.to_le_bytes());
        for a in addresses {
            dblock.extend_from_slice(&a.to_le_bytes());
        }
        dblock.extend_from_slice(&[0; 4]);
        let dblock = self.alloc(&dblock);

        let mut header = b"FAHD\0\0\x08\x0a".to_vec();
        header.extend_from_slice(&(addresses.len() as u64).to_le_bytes());
        header.extend_from_slice(&dblock.to_le_bytes());
        header.extend_from_slice(&[0; 4]);
        let header = self.alloc(&header);
        self.patch(dblock + 6, &header.to_le_bytes());
        header
    }

    /// An extensible array index. Elements are `(address, filtered size)` in
    /// linear chunk order.
    ///
    /// Laid out with [`EA_PARAMS`]: elements 0-1 sit in the index block, 2-7
    /// in its two direct data blocks and 8-15 behind one super block. Data
    /// blocks of more than two elements are paged; a page whose chunks are
    /// all missing is left uninitialized.
    pub fn extensible_array(&mut self, elements: &[(u64, u32)], filtered: bool) -> u64 {
        assert!(elements.len() <= 16, "at most 16 elements fit this layout");
        let client = filtered as u8;
        let elem_size: u8 = if filtered { 16 } else { 8 };
        let encode = |b: &mut Vec<u8>, i: usize| {
            let (address, size) = elements.get(i).copied().unwrap_or((UNDEF, 0));
            b.extend_from_slice(&address.to_le_bytes());
            if filtered {
                b.extend_from_slice(&size.to_le_bytes());
                b.extend_from_slice(&0u32.to_le_bytes());
            }
        };
        let prefix = |signature: &[u8; 4], block_offset: Option<u32>| {
            let mut b = signature.to_vec();
            b.extend_from_slice(&[0, client]);
            b.extend_from_slice(&0u64.to_le_bytes());
            if let Some(offset) = block_offset {
                b.extend_from_slice(&offset.to_le_bytes());
            }
            b
        };
        let page_written =
            |first: usize| (first..first + 2).any(|i| elements.get(i).is_some_and(|e| e.0 != UNDEF));
        let data_block = |first: usize, nelmts: usize| {
            let mut b = prefix(b"EADB", Some(first as u32 - 2));
            if nelmts <= 2 {
                for i in first..first + nelmts {
                    encode(&mut b, i);
                }
                b.extend_from_slice(&[0; 4]);
                return b;
            }
            b.extend_from_slice(&[0; 4]);
            for page in (first..first + nelmts).step_by(2) {
                for i in page..page + 2 {
                    if page_written(page) {
                        encode(&mut b, i);
                    } else {
                        b.extend(std::iter::repeat_n(0u8, elem_size as usize));
                    }
                }
                b.extend_from_slice(&[0; 4]);
            }
            b
        };

        let n = elements.len();
        let direct0 = if n > 2 { self.alloc(&data_block(2, 2)) } else { UNDEF };
        let direct1 = if n > 4 { self.alloc(&data_block(4, 4)) } else { UNDEF };
        let mut super_block = UNDEF;
        if n > 8 {
            let first = self.alloc(&data_block(8, 4));
            let second = if n > 12 { self.alloc(&data_block(12, 4)) } else { UNDEF };
            let mut b = prefix(b"EASB", Some(6));
            for block in [8, 12] {
                b.push((page_written(block) as u8) << 7 | (page_written(block + 2) as u8) << 6);
            }
            b.extend_from_slice(&first.to_le_bytes());
            b.extend_from_slice(&second.to_le_bytes());
            b.extend_from_slice(&[0; 4]);
            super_block = self.alloc(&b);
        }

        let mut iblock = prefix(b"EAIB", None);
        encode(&mut iblock, 0);
        encode(&mut iblock, 1);
        for address in [direct0, direct1, super_block] {
            iblock.extend_from_slice(&address.to_le_bytes());
        }
        // the other 29 super block slots
        for _ in 0..29 {
            iblock.extend_from_slice(&UNDEF.to_le_bytes());
        }
        iblock.extend_from_slice(&[0; 4]);
        let iblock = self.alloc(&iblock);

        let mut header = b"EAHD\0".to_vec();
        header.extend_from_slice(&[client, elem_size]);
        header.extend_from_slice(&EA_PARAMS);
        // super and data block statistics
        for _ in 0..4 {
            header.extend_from_slice(&0u64.to_le_bytes());
        }
        // max index set, then realized elements
        header.extend_from_slice(&(n as u64).to_le_bytes());
        header.extend_from_slice(&(n as u64).to_le_bytes());
        header.extend_from_slice(&iblock.to_le_bytes());
        header.extend_from_slice(&[0; 4]);
        self.alloc(&header)
    }

    /// A depth 0 version 2 B-tree of chunk records, type 11 when `filtered`
    /// and type 10 otherwise. `chunk` excludes the element size.
    pub fn chunk_btree2(&mut self, chunk: &[u64], elem_size: u64, records: &[ChunkRecord], filtered: bool) -> u64 {
        let rank = chunk.len();
        let size_len = h5chunk::btree2::chunk_size_len(chunk.iter().product::<u64>() * elem_size);
        let record_type: u8 = if filtered { 11 } else { 10 };
        let record_size = 8 + rank * 8 + if filtered { size_len + 4 } else { 0 };

        let mut leaf = b"BTLF\0".to_vec();
        leaf.push(record_type);
        for r in records {
            leaf.extend_from_slice(&r.address.to_le_bytes());
            if filtered {
                leaf.extend_from_slice(&(r.size as u64).to_le_bytes()[..size_len]);
                leaf.extend_from_slice(&r.filter_mask.to_le_bytes());
            }
            for d in 0..rank {
                leaf.extend_from_slice(&(r.offsets[d] / chunk[d]).to_le_bytes());
            }
        }
        leaf.extend_from_slice(&[0; 4]);
        let root = self.alloc(&leaf);

        let mut header = b"BTHD\0".to_vec();
        header.push(record_type);
        header.extend_from_slice(&BTREE2_NODE_SIZE.to_le_bytes());
        header.extend_from_slice(&(record_size as u16).to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes());
        header.extend_from_slice(&[100, 40]);
        header.extend_from_slice(&root.to_le_bytes());
        header.extend_from_slice(&(records.len() as u16).to_le_bytes());
        header.extend_from_slice(&(records.len() as u64).to_le_bytes());
        header.extend_from_slice(&[0; 4]);
        self.alloc(&header)
    }

    /// Writes the chunks of `spec` in row-major tile order, skipping the
    /// ones it says are missing. Element values are their row-major
    /// positions; padding past the shape holds -1.
    pub fn chunk_records(&mut self, spec: &ChunkedSpec<'_>) -> Vec<ChunkRecord> {
        let rank = spec.shape.len();
        let chunk_elems: u64 = spec.chunk.iter().product();
        let mut records = Vec::new();
        for corner in tile_corners(spec.shape, spec.chunk) {
            if (spec.skip)(corner.as_slice()) {
                continue;
            }
            let mut values = Vec::with_capacity(chunk_elems as usize);
            let mut idx = vec![0u64; rank];
            for _ in 0..chunk_elems {
                let global: Vec<u64> = corner.iter().zip(&idx).map(|(c, i)| c + i).collect();
                let inside = global.iter().zip(spec.shape).all(|(g, n)| g < n);
                values.push(if inside { linear_value(&global, spec.shape) } else { -1.0 });
                odometer(&mut idx, spec.chunk);
            }
            let mut data = f64_bytes(&values);
            if spec.deflate {
                data = deflate(&data);
            }
            let address = self.alloc(&data);
            records.push(ChunkRecord {
                offsets: corner.iter().copied().chain([0]).collect(),
                size: data.len() as u32,
                filter_mask: 0,
                address,
            });
        }
        records
    }

    fn chunked_header(&mut self, spec: &ChunkedSpec<'_>, max_shape: Option<&[u64]>, layout: Vec<u8>) -> u64 {
        self.dataset(
            dataspace(spec.shape, max_shape),
            datatype_float(8),
            layout,
            spec.deflate.then(|| deflate_pipeline(6)),
            spec.fill.map(|f| fill_value(&f.to_le_bytes())),
        )
    }

    /// Writes a chunked `f64` dataset indexed by a version 1 B-tree.
    pub fn chunked_dataset(&mut self, spec: &ChunkedSpec<'_>) -> u64 {
        let records = self.chunk_records(spec);
        let leaves: Vec<Vec<ChunkRecord>> = if records.is_empty() {
            vec![Vec::new()]
        } else {
            records.chunks(spec.leaf_size.max(1)).map(<[_]>::to_vec).collect()
        };
        let btree = self.chunk_btree(spec.shape.len() + 1, &leaves);
        self.chunked_header(spec, None, layout_btree_v1(btree, spec.chunk, 8))
    }

    /// Writes a chunked `f64` dataset with an unlimited first dimension,
    /// indexed by an extensible array.
    pub fn extensible_array_dataset(&mut self, spec: &ChunkedSpec<'_>) -> u64 {
        let records = self.chunk_records(spec);
        let elements: Vec<(u64, u32)> = tile_corners(spec.shape, spec.chunk)
            .iter()
            .map(|corner| {
                records
                    .iter()
                    .find(|r| r.offsets[..corner.len()] == corner[..])
                    .map_or((UNDEF, 0), |r| (r.address, r.size))
            })
            .collect();
        let header = self.extensible_array(&elements, spec.deflate);
        let mut max_shape = spec.shape.to_vec();
        max_shape[0] = UNDEF;
        self.chunked_header(spec, Some(max_shape.as_slice()), layout_extensible_array(header, spec.chunk, 8))
    }

    /// Writes a chunked `f64` dataset with every dimension unlimited,
    /// indexed by a version 2 B-tree.
    pub fn btree2_dataset(&mut self, spec: &ChunkedSpec<'_>) -> u64 {
        let records = self.chunk_records(spec);
        let header = self.chunk_btree2(spec.chunk, 8, &records, spec.deflate);
        let max_shape = vec![UNDEF; spec.shape.len()];
        self.chunked_header(spec, Some(max_shape.as_slice()), layout_btree_v2(header, spec.chunk, 8))
    }
}

/// Corners of every chunk tile covering `shape`, in row-major tile order.
pub fn tile_corners(shape: &[u64], chunk: &[u64]) -> Vec<Vec<u64>> {
    let ntiles: Vec<u64> = shape.iter().zip(chunk).map(|(&n, &c)| n.div_ceil(c)).collect();
    let mut tile = vec![0u64; shape.len()];
    let mut corners = Vec::new();
    for _ in 0..ntiles.iter().product::<u64>() {
        corners.push(tile.iter().zip(chunk).map(|(t, c)| t * c).collect());
        odometer(&mut tile, &ntiles);
    }
    corners
}

/// Advances a row-major counter; wraps to zero after the last position.
pub fn odometer(idx: &mut [u64], shape: &[u64]) {
    for k in (0..idx.len()).rev() {
        idx[k] += 1;
        if idx[k] < shape[k] {
            return;
        }
        idx[k] = 0;
    }
}
