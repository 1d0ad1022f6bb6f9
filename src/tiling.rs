//! Tiling of a variable's index space into chunk-shaped tiles.
//!
//! Indices are points in the variable's index space; tiles are points in the
//! coarser "tile space" of shape roughly `var_shape / chunk`. The linear
//! row-major rank of a tile is its order, which is the sort key of the chunk
//! B-tree.

use std::fmt;

use crate::error::Error;
use crate::section::IndexSpace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tiling {
    rank: usize,
    chunk: Vec<i64>,
    /// May exceed the variable shape when a chunk is larger than the variable.
    index_shape: Vec<i64>,
    tile_shape: Vec<i64>,
    tile_strider: Vec<i64>,
}

impl Tiling {
    /// `chunk_shape` may carry extra trailing dimensions (the element size of
    /// HDF5 storage dims); those are ignored for indexing.
    ///
    /// # Panics
    /// If `chunk_shape` has fewer dimensions than `var_shape`, or a chunk
    /// dimension is not positive.
    pub fn new(var_shape: &[i64], chunk_shape: &[i64]) -> Self {
        assert!(
            chunk_shape.len() >= var_shape.len(),
            "chunk rank {} is less than variable rank {}",
            chunk_shape.len(),
            var_shape.len()
        );
        let rank = var_shape.len();
        let chunk = chunk_shape.to_vec();
        assert!(chunk[..rank].iter().all(|&c| c > 0), "chunk dims must be positive");

        let index_shape: Vec<i64> = (0..rank).map(|i| var_shape[i].max(chunk[i])).collect();
        let tile_shape: Vec<i64> = (0..rank)
            .map(|i| (index_shape[i] + chunk[i] - 1) / chunk[i])
            .collect();
        let mut tile_strider = vec![0; rank];
        let mut accum = 1;
        for k in (0..rank).rev() {
            tile_strider[k] = accum;
            accum *= tile_shape[k];
        }

        Tiling {
            rank,
            chunk,
            index_shape,
            tile_shape,
            tile_strider,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Chunk dims, including any trailing storage dims.
    pub fn chunk(&self) -> &[i64] {
        &self.chunk
    }

    pub fn index_shape(&self) -> &[i64] {
        &self.index_shape
    }

    pub fn tile_shape(&self) -> &[i64] {
        &self.tile_shape
    }

    pub fn tile_strider(&self) -> &[i64] {
        &self.tile_strider
    }

    /// Number of tiles covering the index space.
    pub fn tile_count(&self) -> i64 {
        self.tile_shape.iter().product()
    }

    /// Which tile an index point falls in.
    ///
    /// Only the first `min(rank, index.len())` axes are used. Points beyond
    /// the variable shape but inside the padded index shape are allowed.
    pub fn tile(&self, index: &[i64]) -> Vec<i64> {
        let use_rank = self.rank.min(index.len());
        (0..use_rank).map(|i| index[i] / self.chunk[i]).collect()
    }

    /// Minimum corner of a tile, inverse of [`Tiling::tile`].
    pub fn index(&self, tile: &[i64]) -> Vec<i64> {
        (0..self.rank).map(|i| tile[i] * self.chunk[i]).collect()
    }

    /// Linear row-major rank of the tile containing `index`.
    pub fn order(&self, index: &[i64]) -> i64 {
        self.tile(index)
            .iter()
            .zip(&self.tile_strider)
            .map(|(t, s)| t * s)
            .sum()
    }

    /// Minimum corner of the tile with the given order.
    ///
    /// Lossy: `order_to_index(order(x))` is the corner of x's tile, not x.
    pub fn order_to_index(&self, order: i64) -> Vec<i64> {
        let mut tile = vec![0; self.rank];
        let mut rem = order;
        for k in 0..self.rank {
            tile[k] = rem / self.tile_strider[k];
            rem -= tile[k] * self.tile_strider[k];
        }
        self.index(&tile)
    }

    /// Converts a region of index space into the region of tile space covering it.
    pub fn section(&self, index_section: &IndexSpace) -> Result<IndexSpace, Error> {
        if index_section.rank() != self.rank {
            return Err(Error::OutOfRange(format!(
                "section {} has rank {}, tiling has rank {}",
                index_section,
                index_section.rank(),
                self.rank
            )));
        }
        let last = index_section.last();
        for (axis, &l) in last.iter().enumerate() {
            if l >= self.index_shape[axis] {
                return Err(Error::OutOfRange(format!(
                    "section {} exceeds index shape {:?} on axis {}",
                    index_section, self.index_shape, axis
                )));
            }
        }
        let start = self.tile(index_section.start());
        let limit = self.tile(&last);
        let length = (0..self.rank).map(|i| limit[i] - start[i] + 1).collect();
        Ok(IndexSpace::new(start, length))
    }
}

impl fmt::Display for Tiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tiling(chunk={:?}, tileShape={:?}, indexShape={:?})",
            self.chunk, self.tile_shape, self.index_shape
        )
    }
}
