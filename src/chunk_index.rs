//! Chunk locations and the indices that produce them.
//!
//! Every on-disk chunk indexing scheme is wrapped in a [`ChunkIndex`]; the
//! readers only ever see [`ChunkLocation`]s. A [`ChunkPlan`] turns an index
//! into the list of chunks covering a wanted region, with a missing
//! placeholder for every tile the file never wrote.

use std::collections::HashMap;

use log::debug;

use crate::btree1::BTree1Data;
use crate::btree2::{chunk_size_len, BTree2, BTree2Record};
use crate::error::Error;
use crate::extensible_array::ExtensibleArrayIndex;
use crate::fixed_array::FixedArrayIndex;
use crate::index_nd::IndexND;
use crate::io::{OpenFile, UNDEF_ADDR};
use crate::layout::DataLayout;
use crate::section::IndexSpace;
use crate::tiling::Tiling;

/// Where one chunk lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLocation {
    /// Minimum corner of the chunk in variable index space.
    pub offsets: Vec<i64>,
    pub address: u64,
    pub size_on_disk: u64,
    /// `None` bypasses the filter pipeline.
    pub filter_mask: Option<u32>,
}

impl ChunkLocation {
    pub fn new(offsets: Vec<i64>, address: u64, size_on_disk: u64, filter_mask: Option<u32>) -> Self {
        ChunkLocation {
            offsets,
            address,
            size_on_disk,
            filter_mask,
        }
    }

    /// A chunk that was never written.
    pub fn missing(offsets: Vec<i64>) -> Self {
        ChunkLocation {
            offsets,
            address: UNDEF_ADDR,
            size_on_disk: 0,
            filter_mask: None,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.address == 0 || self.address == UNDEF_ADDR
    }

    /// The chunk's extent in variable index space.
    pub fn space(&self, chunk: &[i64]) -> IndexSpace {
        IndexSpace::from_corner(&self.offsets, &chunk[..self.offsets.len()])
    }
}

pub type ChunkIter<'a> = Box<dyn Iterator<Item = Result<ChunkLocation, Error>> + 'a>;

/// One on-disk chunk indexing scheme.
pub trait ChunkIndex {
    fn kind(&self) -> &'static str;

    /// Tiling of the variable by this index's chunks.
    fn tiling(&self) -> &Tiling;

    /// Every chunk the index records, in no particular order.
    fn chunks(&self) -> ChunkIter<'_>;

    /// The chunk whose minimum corner is `offsets`; `None` if never written.
    fn find_chunk(&self, offsets: &[i64]) -> Result<Option<ChunkLocation>, Error>;
}

// ---- Chunk plans ----

/// Chunks covering a wanted region, one per tile, in tile order.
pub struct ChunkPlan<'i> {
    index: &'i dyn ChunkIndex,
    tiles: Option<IndexND>,
}

impl<'i> ChunkPlan<'i> {
    /// Fails with `OutOfRange` when `want` extends past the tiling's padded shape.
    pub fn new(index: &'i dyn ChunkIndex, want: &IndexSpace) -> Result<Self, Error> {
        if want.is_empty() {
            return Ok(ChunkPlan { index, tiles: None });
        }
        let tiles = index.tiling().section(&want.bounding_box())?;
        debug!("{} index: {} tiles cover {}", index.kind(), tiles.total_elements(), want);
        Ok(ChunkPlan {
            index,
            tiles: Some(IndexND::new(tiles)),
        })
    }
}

impl Iterator for ChunkPlan<'_> {
    type Item = Result<ChunkLocation, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let tile = self.tiles.as_mut()?.next()?;
        let offsets = self.index.tiling().index(&tile);
        Some(
            self.index
                .find_chunk(&offsets)
                .map(|found| found.unwrap_or_else(|| ChunkLocation::missing(offsets))),
        )
    }
}

// ---- Chunk grid ----

/// Row-major linearisation of chunk coordinates, as used by the array
/// indices. With `swizzle`, the unlimited dimension varies slowest.
#[derive(Debug, Clone)]
pub struct ChunkGrid {
    chunk: Vec<i64>,
    /// `order[i]` is the variable dimension at linear position `i`.
    order: Vec<usize>,
    down: Vec<u64>,
    count: u64,
}

impl ChunkGrid {
    /// `max_shape` entries of `u64::MAX` are unlimited and fall back to `shape`.
    pub fn new(shape: &[i64], max_shape: Option<&[u64]>, chunk: &[i64], swizzle: Option<usize>) -> Self {
        let rank = shape.len();
        let counts: Vec<u64> = (0..rank)
            .map(|d| {
                let extent = match max_shape.and_then(|m| m.get(d)) {
                    Some(&m) if m != u64::MAX => m.max(shape[d] as u64),
                    _ => shape[d] as u64,
                };
                extent.div_ceil(chunk[d].max(1) as u64).max(1)
            })
            .collect();
        let mut order: Vec<usize> = (0..rank).collect();
        if let Some(u) = swizzle.filter(|&u| u < rank) {
            order.remove(u);
            order.insert(0, u);
        }
        let mut down = vec![1u64; rank];
        for i in (0..rank.saturating_sub(1)).rev() {
            down[i] = down[i + 1].saturating_mul(counts[order[i + 1]]);
        }
        let count = counts.iter().fold(1u64, |acc, &n| acc.saturating_mul(n));
        ChunkGrid {
            chunk: chunk[..rank].to_vec(),
            order,
            down,
            count,
        }
    }

    /// Number of chunks in the grid.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Linear index of the chunk at `offsets`.
    pub fn linear(&self, offsets: &[i64]) -> u64 {
        self.order
            .iter()
            .zip(&self.down)
            .map(|(&d, &down)| (offsets[d] / self.chunk[d]) as u64 * down)
            .sum()
    }

    /// Minimum corner of the chunk at linear index `index`.
    pub fn offsets(&self, mut index: u64) -> Vec<i64> {
        let mut offsets = vec![0i64; self.order.len()];
        for (&d, &down) in self.order.iter().zip(&self.down) {
            offsets[d] = (index / down) as i64 * self.chunk[d];
            index %= down;
        }
        offsets
    }
}

/// Bytes of one unfiltered chunk: the product of the storage dims.
pub fn chunk_bytes(storage_dims: &[i64]) -> u64 {
    storage_dims.iter().map(|&d| d.max(0) as u64).product()
}

// ---- Adapters ----

impl ChunkIndex for BTree1Data<'_> {
    fn kind(&self) -> &'static str {
        "btree1"
    }

    fn tiling(&self) -> &Tiling {
        BTree1Data::tiling(self)
    }

    fn chunks(&self) -> ChunkIter<'_> {
        Box::new(self.entries().map(|entry| entry.map(|(_, location)| location)))
    }

    fn find_chunk(&self, offsets: &[i64]) -> Result<Option<ChunkLocation>, Error> {
        self.find_chunk_at(offsets)
    }
}

/// A dataset stored as exactly one chunk.
pub struct SingleChunkIndex {
    tiling: Tiling,
    location: ChunkLocation,
}

impl SingleChunkIndex {
    pub fn new(shape: &[i64], storage_dims: &[i64], address: u64, filtered: Option<(u64, u32)>) -> Self {
        let offsets = vec![0; shape.len()];
        let location = match filtered {
            Some((size, mask)) => ChunkLocation::new(offsets, address, size, Some(mask)),
            None => ChunkLocation::new(offsets, address, chunk_bytes(storage_dims), None),
        };
        SingleChunkIndex {
            tiling: Tiling::new(shape, storage_dims),
            location,
        }
    }
}

impl ChunkIndex for SingleChunkIndex {
    fn kind(&self) -> &'static str {
        "single chunk"
    }

    fn tiling(&self) -> &Tiling {
        &self.tiling
    }

    fn chunks(&self) -> ChunkIter<'_> {
        Box::new(std::iter::once(Ok(self.location.clone())))
    }

    fn find_chunk(&self, offsets: &[i64]) -> Result<Option<ChunkLocation>, Error> {
        Ok((offsets == self.location.offsets.as_slice()).then(|| self.location.clone()))
    }
}

/// Unfiltered chunks laid out back to back in linear chunk order.
pub struct ImplicitIndex {
    tiling: Tiling,
    grid: ChunkGrid,
    address: u64,
    chunk_bytes: u64,
    nchunks: u64,
}

impl ImplicitIndex {
    pub fn new(shape: &[i64], max_shape: Option<&[u64]>, storage_dims: &[i64], address: u64) -> Self {
        let tiling = Tiling::new(shape, storage_dims);
        let nchunks = tiling.tile_count() as u64;
        ImplicitIndex {
            grid: ChunkGrid::new(shape, max_shape, storage_dims, None),
            tiling,
            address,
            chunk_bytes: chunk_bytes(storage_dims),
            nchunks,
        }
    }

    fn location(&self, offsets: Vec<i64>) -> ChunkLocation {
        if self.address == 0 || self.address == UNDEF_ADDR {
            return ChunkLocation::missing(offsets);
        }
        let address = self.address + self.grid.linear(&offsets) * self.chunk_bytes;
        ChunkLocation::new(offsets, address, self.chunk_bytes, None)
    }
}

impl ChunkIndex for ImplicitIndex {
    fn kind(&self) -> &'static str {
        "implicit"
    }

    fn tiling(&self) -> &Tiling {
        &self.tiling
    }

    fn chunks(&self) -> ChunkIter<'_> {
        Box::new((0..self.nchunks).map(move |order| {
            Ok(self.location(self.tiling.order_to_index(order as i64)))
        }))
    }

    fn find_chunk(&self, offsets: &[i64]) -> Result<Option<ChunkLocation>, Error> {
        Ok(Some(self.location(offsets.to_vec())))
    }
}

/// Chunk records of a v2 B-tree, keyed by chunk corner.
pub struct BTree2Index {
    tiling: Tiling,
    chunks: HashMap<Vec<i64>, ChunkLocation>,
}

impl BTree2Index {
    pub fn open(file: &OpenFile, header_address: u64, shape: &[i64], storage_dims: &[i64]) -> Result<Self, Error> {
        let rank = shape.len();
        let bytes = chunk_bytes(storage_dims);
        let tree = BTree2::open(file, header_address, rank, chunk_size_len(bytes))?;
        let scale = |scaled: &[u64]| -> Vec<i64> {
            scaled
                .iter()
                .zip(storage_dims)
                .map(|(&s, &c)| s as i64 * c)
                .collect()
        };

        let mut chunks = HashMap::new();
        for record in tree.records()? {
            let location = match record {
                BTree2Record::Chunk {
                    address,
                    scaled_offsets,
                } => ChunkLocation::new(scale(&scaled_offsets), address, bytes, None),
                BTree2Record::FilteredChunk {
                    address,
                    chunk_size,
                    filter_mask,
                    scaled_offsets,
                } => ChunkLocation::new(scale(&scaled_offsets), address, chunk_size, Some(filter_mask)),
                other => {
                    return Err(Error::InvalidFileStructure(format!(
                        "v2 B-tree at {} holds {:?}, not chunk records",
                        header_address, other
                    )));
                }
            };
            chunks.insert(location.offsets.clone(), location);
        }
        debug!("v2 B-tree chunk index at {}: {} chunks", header_address, chunks.len());
        Ok(BTree2Index {
            tiling: Tiling::new(shape, storage_dims),
            chunks,
        })
    }
}

impl ChunkIndex for BTree2Index {
    fn kind(&self) -> &'static str {
        "btree2"
    }

    fn tiling(&self) -> &Tiling {
        &self.tiling
    }

    fn chunks(&self) -> ChunkIter<'_> {
        Box::new(self.chunks.values().cloned().map(Ok))
    }

    fn find_chunk(&self, offsets: &[i64]) -> Result<Option<ChunkLocation>, Error> {
        Ok(self.chunks.get(offsets).cloned())
    }
}

/// Opens the chunk index of a chunked layout.
pub fn open_chunk_index<'f>(
    file: &'f OpenFile,
    layout: &DataLayout,
    shape: &[i64],
    max_shape: Option<&[u64]>,
    max_depth: usize,
) -> Result<Box<dyn ChunkIndex + 'f>, Error> {
    if let Some(dims) = layout.chunk_dims() {
        if dims.len() != shape.len() + 1 || dims.iter().any(|&d| d <= 0) {
            return Err(Error::InvalidFileStructure(format!(
                "chunk dims {:?} do not fit shape {:?}",
                dims, shape
            )));
        }
    }
    let index: Box<dyn ChunkIndex + 'f> = match layout {
        DataLayout::BTreeV1 {
            btree_address,
            chunk_dims,
        } => Box::new(BTree1Data::open(file, *btree_address, shape, chunk_dims, max_depth)?),
        DataLayout::SingleChunk {
            address,
            chunk_dims,
            filtered,
        } => Box::new(SingleChunkIndex::new(shape, chunk_dims, *address, *filtered)),
        DataLayout::Implicit {
            address,
            chunk_dims,
        } => Box::new(ImplicitIndex::new(shape, max_shape, chunk_dims, *address)),
        DataLayout::FixedArray {
            header_address,
            chunk_dims,
            ..
        } => Box::new(FixedArrayIndex::open(file, *header_address, shape, max_shape, chunk_dims)?),
        DataLayout::ExtensibleArray {
            header_address,
            chunk_dims,
            params,
        } => Box::new(ExtensibleArrayIndex::open(
            file,
            *header_address,
            shape,
            max_shape,
            chunk_dims,
            params,
        )?),
        DataLayout::BTreeV2 {
            header_address,
            chunk_dims,
            ..
        } => Box::new(BTree2Index::open(file, *header_address, shape, chunk_dims)?),
        other => return Err(Error::UnsupportedLayout(format!("{} is not chunked", other.name()))),
    };
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_grid_row_major() {
        let grid = ChunkGrid::new(&[10, 6], None, &[4, 3], None);
        // 3 x 2 chunks
        assert_eq!(grid.linear(&[0, 0]), 0);
        assert_eq!(grid.linear(&[0, 3]), 1);
        assert_eq!(grid.linear(&[4, 0]), 2);
        assert_eq!(grid.linear(&[8, 3]), 5);
        assert_eq!(grid.offsets(5), vec![8, 3]);
        assert_eq!(grid.offsets(2), vec![4, 0]);
        assert_eq!(grid.count(), 6);
    }

    #[test]
    fn test_chunk_grid_uses_max_shape() {
        let grid = ChunkGrid::new(&[4, 4], Some(&[4, 8]), &[2, 2], None);
        assert_eq!(grid.linear(&[2, 0]), 4);
        assert_eq!(grid.offsets(5), vec![2, 2]);
        assert_eq!(grid.count(), 8);
    }

    #[test]
    fn test_chunk_grid_swizzled_unlimited() {
        // dim 1 unlimited: it varies slowest
        let grid = ChunkGrid::new(&[4, 6], Some(&[4, u64::MAX]), &[2, 3], Some(1));
        assert_eq!(grid.linear(&[2, 0]), 1);
        assert_eq!(grid.linear(&[0, 3]), 2);
        assert_eq!(grid.offsets(3), vec![2, 3]);
    }

    #[test]
    fn test_single_chunk_plan() {
        let index = SingleChunkIndex::new(&[5, 7], &[5, 7, 4], 1000, None);
        let want = IndexSpace::new(vec![1, 1], vec![2, 3]);
        let plan: Vec<_> = ChunkPlan::new(&index, &want).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(plan, vec![ChunkLocation::new(vec![0, 0], 1000, 140, None)]);
    }

    #[test]
    fn test_implicit_addresses_and_missing_plan() {
        let index = ImplicitIndex::new(&[4, 4], None, &[2, 2, 8], 5000);
        let chunks: Vec<_> = index.chunks().collect::<Result<_, _>>().unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].offsets, vec![2, 2]);
        assert_eq!(chunks[3].address, 5000 + 3 * 32);

        let unallocated = ImplicitIndex::new(&[4, 4], None, &[2, 2, 8], UNDEF_ADDR);
        let plan = ChunkPlan::new(&unallocated, &IndexSpace::from_shape(&[4, 4])).unwrap();
        assert!(plan.map(|c| c.unwrap()).all(|c| c.is_missing()));
    }

    #[test]
    fn test_plan_outside_padded_shape_fails() {
        let index = SingleChunkIndex::new(&[4], &[4, 1], 10, None);
        let want = IndexSpace::new(vec![2], vec![4]);
        assert!(matches!(ChunkPlan::new(&index, &want), Err(Error::OutOfRange(_))));
        let empty = IndexSpace::new(vec![0], vec![0]);
        assert_eq!(ChunkPlan::new(&index, &empty).unwrap().count(), 0);
    }
}
