//! Version 1 B-trees.
//!
//! The same node format serves two trees: type 1 indexes raw data chunks by
//! their offsets in the variable, type 0 indexes the symbol table nodes of an
//! old-style group. Sibling addresses are parsed but never followed; lookup
//! and traversal are recursive descent from the root.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::chunk_index::ChunkLocation;
use crate::error::Error;
use crate::io::{Cursor, OpenFile, UNDEF_ADDR};
use crate::tiling::Tiling;

const TREE_SIGNATURE: &[u8; 4] = b"TREE";

const NODE_TYPE_GROUP: u8 = 0;
const NODE_TYPE_CHUNK: u8 = 1;

// ---- Node header ----

/// Fields shared by both node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub node_type: u8,
    /// 0 for leaves.
    pub level: u8,
    pub entries_used: usize,
    pub left_sibling: u64,
    pub right_sibling: u64,
}

/// Reads a node's header and the bytes of its `entries_used` key/child pairs.
fn read_node(
    file: &OpenFile,
    address: u64,
    expected_type: u8,
    entry_size: usize,
) -> Result<(NodeHeader, Vec<u8>), Error> {
    let ctx = file.ctx();
    let header_size = 8 + 2 * ctx.offset_size;
    let raw = file.read_signed_block(address, header_size, TREE_SIGNATURE)?;
    let mut cursor = Cursor::new(&raw, ctx);
    cursor.skip(4)?;
    let node_type = cursor.read_u8()?;
    if node_type != expected_type {
        return Err(Error::InvalidFileStructure(format!(
            "B-tree node at {} has type {} (expected {})",
            address, node_type, expected_type
        )));
    }
    let level = cursor.read_u8()?;
    let entries_used = cursor.read_u16()? as usize;
    let left_sibling = cursor.read_offset()?;
    let right_sibling = cursor.read_offset()?;

    let body = file.read_bytes(address + header_size as u64, entries_used * entry_size)?;
    Ok((
        NodeHeader {
            node_type,
            level,
            entries_used,
            left_sibling,
            right_sibling,
        },
        body,
    ))
}

fn is_unallocated(address: u64) -> bool {
    address == 0 || address == UNDEF_ADDR
}

// ---- Chunk data tree (type 1) ----

/// Key of a raw data chunk entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkKey {
    /// Stored (possibly filtered) size of the chunk in bytes.
    pub chunk_size: u32,
    pub filter_mask: u32,
    /// Chunk offsets including the trailing element-size dimension.
    pub offsets: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BTree1Entry {
    pub key: ChunkKey,
    /// Tile order of `key.offsets`.
    pub order: i64,
    /// Chunk address in a leaf, child node address otherwise.
    pub child: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BTree1Node {
    pub address: u64,
    pub header: NodeHeader,
    pub entries: Vec<BTree1Entry>,
}

/// A chunk B-tree rooted at one address, with a node cache keyed by address.
pub struct BTree1Data<'f> {
    file: &'f OpenFile,
    root_address: u64,
    ndim_storage: usize,
    tiling: Tiling,
    max_depth: usize,
    cache: Mutex<HashMap<u64, Arc<BTree1Node>>>,
    read_hit: AtomicUsize,
    read_miss: AtomicUsize,
}

impl<'f> BTree1Data<'f> {
    /// `storage_dims` are the layout's chunk dims, element size last.
    pub fn open(
        file: &'f OpenFile,
        root_address: u64,
        var_shape: &[i64],
        storage_dims: &[i64],
        max_depth: usize,
    ) -> Result<Self, Error> {
        if storage_dims.len() <= var_shape.len() {
            return Err(Error::InvalidFileStructure(format!(
                "chunk dims {:?} must have one more dimension than shape {:?}",
                storage_dims, var_shape
            )));
        }
        if storage_dims.iter().any(|&d| d <= 0) {
            return Err(Error::InvalidFileStructure(format!(
                "non-positive chunk dims {:?}",
                storage_dims
            )));
        }
        let tree = BTree1Data {
            file,
            root_address,
            ndim_storage: storage_dims.len(),
            tiling: Tiling::new(var_shape, storage_dims),
            max_depth,
            cache: Mutex::new(HashMap::new()),
            read_hit: AtomicUsize::new(0),
            read_miss: AtomicUsize::new(0),
        };
        if !is_unallocated(root_address) {
            tree.read_node(root_address)?;
        }
        Ok(tree)
    }

    pub fn tiling(&self) -> &Tiling {
        &self.tiling
    }

    /// (hits, misses) of the node cache.
    pub fn cache_stats(&self) -> (usize, usize) {
        (
            self.read_hit.load(Ordering::Relaxed),
            self.read_miss.load(Ordering::Relaxed),
        )
    }

    /// Reads a node through the cache.
    pub fn read_node(&self, address: u64) -> Result<Arc<BTree1Node>, Error> {
        if let Some(node) = self.lock_cache().get(&address) {
            self.read_hit.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(node));
        }
        self.read_miss.fetch_add(1, Ordering::Relaxed);
        let node = Arc::new(self.parse_node(address)?);
        self.lock_cache().insert(address, Arc::clone(&node));
        Ok(node)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<BTree1Node>>> {
        // A poisoned cache only means another reader panicked mid-insert.
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn parse_node(&self, address: u64) -> Result<BTree1Node, Error> {
        let ctx = self.file.ctx();
        let entry_size = 4 + 4 + 8 * self.ndim_storage + ctx.offset_size;
        let (header, body) = read_node(self.file, address, NODE_TYPE_CHUNK, entry_size)?;

        let mut cursor = Cursor::new(&body, ctx);
        let mut entries = Vec::with_capacity(header.entries_used);
        for _ in 0..header.entries_used {
            let chunk_size = cursor.read_u32()?;
            let filter_mask = cursor.read_u32()?;
            let offsets = (0..self.ndim_storage)
                .map(|_| cursor.read_u64())
                .collect::<Result<Vec<_>, _>>()?;
            let child = cursor.read_offset()?;
            let index: Vec<i64> = offsets.iter().map(|&o| o as i64).collect();
            entries.push(BTree1Entry {
                order: self.tiling.order(&index),
                key: ChunkKey {
                    chunk_size,
                    filter_mask,
                    offsets,
                },
                child,
            });
        }

        for pair in entries.windows(2) {
            if pair[0].order >= pair[1].order {
                warn!(
                    "B-tree node at {} is out of order: {:?} then {:?}",
                    address, pair[0].key.offsets, pair[1].key.offsets
                );
            }
        }
        debug!(
            "B-tree node {} level {} with {} entries",
            address, header.level, header.entries_used
        );

        Ok(BTree1Node {
            address,
            header,
            entries,
        })
    }

    fn location(&self, entry: &BTree1Entry) -> ChunkLocation {
        let offsets = entry.key.offsets[..self.tiling.rank()]
            .iter()
            .map(|&o| o as i64)
            .collect();
        if is_unallocated(entry.child) {
            return ChunkLocation::missing(offsets);
        }
        ChunkLocation::new(
            offsets,
            entry.child,
            entry.key.chunk_size as u64,
            Some(entry.key.filter_mask),
        )
    }

    /// Finds the chunk with the given tile order. `None` means the chunk was
    /// never written.
    pub fn find_chunk(&self, order: i64) -> Result<Option<ChunkLocation>, Error> {
        if is_unallocated(self.root_address) {
            return Ok(None);
        }
        let mut node = self.read_node(self.root_address)?;
        for _ in 0..=self.max_depth {
            // last entry whose successor does not start after the wanted order
            let mut found = None;
            for (i, entry) in node.entries.iter().enumerate() {
                found = Some(entry);
                if let Some(next) = node.entries.get(i + 1) {
                    if order < next.order {
                        break;
                    }
                }
            }
            let Some(entry) = found else {
                return Ok(None);
            };
            if node.header.level == 0 {
                return Ok((entry.order == order).then(|| self.location(entry)));
            }
            node = self.read_node(entry.child)?;
        }
        Err(Error::InvalidFileStructure(format!(
            "B-tree at {} deeper than {} levels",
            self.root_address, self.max_depth
        )))
    }

    /// Finds the chunk whose minimum corner is `offsets`.
    pub fn find_chunk_at(&self, offsets: &[i64]) -> Result<Option<ChunkLocation>, Error> {
        self.find_chunk(self.tiling.order(offsets))
    }

    /// Depth-first walk over every leaf entry.
    pub fn entries(&self) -> BTree1Entries<'_, 'f> {
        let stack = if is_unallocated(self.root_address) {
            Vec::new()
        } else {
            vec![Frame::Pending(self.root_address, 0)]
        };
        BTree1Entries { tree: self, stack }
    }
}

enum Frame {
    Pending(u64, usize),
    Visiting(Arc<BTree1Node>, usize, usize),
}

/// Iterator over `(tile order, chunk location)` of every chunk in the tree.
pub struct BTree1Entries<'t, 'f> {
    tree: &'t BTree1Data<'f>,
    stack: Vec<Frame>,
}

impl Iterator for BTree1Entries<'_, '_> {
    type Item = Result<(i64, ChunkLocation), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.stack.pop()? {
                Frame::Pending(address, depth) => {
                    if depth > self.tree.max_depth {
                        self.stack.clear();
                        return Some(Err(Error::InvalidFileStructure(format!(
                            "B-tree deeper than {} levels",
                            self.tree.max_depth
                        ))));
                    }
                    match self.tree.read_node(address) {
                        Ok(node) => self.stack.push(Frame::Visiting(node, 0, depth)),
                        Err(e) => {
                            self.stack.clear();
                            return Some(Err(e));
                        }
                    }
                }
                Frame::Visiting(node, idx, depth) => {
                    let Some(entry) = node.entries.get(idx) else {
                        continue;
                    };
                    let entry = entry.clone();
                    let is_leaf = node.header.level == 0;
                    self.stack.push(Frame::Visiting(node, idx + 1, depth));
                    if is_leaf {
                        return Some(Ok((entry.order, self.tree.location(&entry))));
                    }
                    self.stack.push(Frame::Pending(entry.child, depth + 1));
                }
            }
        }
    }
}

// ---- Group symbol table tree (type 0) ----

/// Entry of a group tree: heap offset of the first name in the subtree, and a
/// child node (internal) or symbol table node (leaf) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupEntry {
    pub key: u64,
    pub child_address: u64,
}

/// The B-tree of an old-style group.
pub struct BTreeSymbolTable<'f> {
    file: &'f OpenFile,
    root_address: u64,
    max_depth: usize,
}

impl<'f> BTreeSymbolTable<'f> {
    pub fn new(file: &'f OpenFile, root_address: u64, max_depth: usize) -> Self {
        BTreeSymbolTable {
            file,
            root_address,
            max_depth,
        }
    }

    fn read_entries(&self, address: u64) -> Result<(NodeHeader, Vec<GroupEntry>), Error> {
        let ctx = self.file.ctx();
        let entry_size = ctx.length_size + ctx.offset_size;
        let (header, body) = read_node(self.file, address, NODE_TYPE_GROUP, entry_size)?;
        let mut cursor = Cursor::new(&body, ctx);
        let mut entries = Vec::with_capacity(header.entries_used);
        for _ in 0..header.entries_used {
            let key = cursor.read_length()?;
            let child_address = cursor.read_offset()?;
            if !is_unallocated(child_address) {
                entries.push(GroupEntry { key, child_address });
            }
        }
        Ok((header, entries))
    }

    /// Flattens the tree into its leaf entries, whose children are symbol table nodes.
    pub fn read_group_entries(&self) -> Result<Vec<GroupEntry>, Error> {
        let mut result = Vec::new();
        self.read_all_entries(self.root_address, 0, &mut result)?;
        Ok(result)
    }

    fn read_all_entries(&self, address: u64, depth: usize, out: &mut Vec<GroupEntry>) -> Result<(), Error> {
        if depth > self.max_depth {
            return Err(Error::InvalidFileStructure(
                "HDF5 group B-tree recursion depth exceeded".to_string(),
            ));
        }
        let (header, entries) = self.read_entries(address)?;
        if header.level == 0 {
            out.extend(entries);
        } else {
            for entry in entries {
                self.read_all_entries(entry.child_address, depth + 1, out)?;
            }
        }
        Ok(())
    }
}
