//! Transfer of elements between two differently-shaped rectangular regions.
//!
//! A [`Chunker`] walks the overlap of a source region (typically one chunk)
//! and a destination region (the requested section) and yields the maximal
//! contiguous runs they share. Element offsets are row-major within each
//! region; the byte-level helpers multiply by the element size.

use crate::error::Error;
use crate::section::IndexSpace;

/// A run of `nelems` elements starting at `src_elem` in the source and
/// `dest_elem` in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferChunk {
    pub nelems: usize,
    pub src_elem: usize,
    pub dest_elem: usize,
}

/// Iterator over the transfer runs between two regions, in ascending
/// destination order.
#[derive(Debug, Clone)]
pub struct Chunker {
    /// First overlapping source index per axis, relative to the source start.
    src_first: Vec<i64>,
    dest_first: Vec<i64>,
    /// Step per overlap element, in source and destination index units.
    src_step: Vec<i64>,
    dest_step: Vec<i64>,
    src_strides: Vec<i64>,
    dest_strides: Vec<i64>,
    counts: Vec<i64>,
    /// Axes before this one are walked odometer-style; the rest form one run.
    merge_axis: usize,
    run: usize,
    counter: Vec<i64>,
    nelems: usize,
    done: bool,
}

fn row_major_strides(shape: &[i64]) -> Vec<i64> {
    let mut strides = vec![1; shape.len()];
    for k in (0..shape.len().saturating_sub(1)).rev() {
        strides[k] = strides[k + 1] * shape[k + 1];
    }
    strides
}

impl Chunker {
    pub fn new(src: &IndexSpace, dest: &IndexSpace) -> Self {
        let rank = src.rank();
        let overlap = dest.intersect(src);
        let empty = rank != dest.rank() || overlap.is_empty();

        let mut src_first = vec![0; rank];
        let mut dest_first = vec![0; rank];
        let mut src_step = vec![1; rank];
        let mut dest_step = vec![1; rank];
        let mut counts = vec![0; rank];
        if !empty {
            for i in 0..rank {
                let x = overlap.start()[i];
                src_first[i] = (x - src.start()[i]) / src.stride()[i];
                dest_first[i] = (x - dest.start()[i]) / dest.stride()[i];
                src_step[i] = overlap.stride()[i] / src.stride()[i];
                dest_step[i] = overlap.stride()[i] / dest.stride()[i];
                counts[i] = overlap.shape()[i];
            }
        }

        // Merge inner axes into one run while they are contiguous in both regions.
        let mut merge_axis = rank;
        let mut run: i64 = 1;
        if !empty && rank > 0 && src_step[rank - 1] == 1 && dest_step[rank - 1] == 1 {
            merge_axis = rank - 1;
            run = counts[rank - 1];
            while merge_axis > 0 {
                let a = merge_axis;
                let full = counts[a] == src.shape()[a] && counts[a] == dest.shape()[a];
                let b = a - 1;
                if !full || src_step[b] != 1 || dest_step[b] != 1 {
                    break;
                }
                merge_axis = b;
                run *= counts[b];
            }
        }

        let nelems = if empty {
            0
        } else {
            overlap.total_elements() as usize
        };

        Chunker {
            src_first,
            dest_first,
            src_step,
            dest_step,
            src_strides: row_major_strides(src.shape()),
            dest_strides: row_major_strides(dest.shape()),
            counts,
            merge_axis,
            run: run as usize,
            counter: vec![0; merge_axis],
            nelems,
            done: nelems == 0,
        }
    }

    /// Total elements the two regions share.
    pub fn nelems(&self) -> usize {
        self.nelems
    }

    /// Copies the shared elements of `src` (laid out as the source region) into
    /// `dest` (laid out as the destination region). Returns the number of runs.
    pub fn transfer_ba(self, src: &[u8], elem_size: usize, dest: &mut [u8]) -> Result<usize, Error> {
        let mut runs = 0;
        for tc in self {
            let n = tc.nelems * elem_size;
            let s = tc.src_elem * elem_size;
            let d = tc.dest_elem * elem_size;
            let from = src.get(s..s + n).ok_or_else(|| short_buffer("source", s + n, src.len()))?;
            let dest_len = dest.len();
            let to = dest
                .get_mut(d..d + n)
                .ok_or_else(|| short_buffer("destination", d + n, dest_len))?;
            to.copy_from_slice(from);
            runs += 1;
        }
        Ok(runs)
    }

    /// Copies the shared elements into a new buffer shaped as the intersection.
    pub fn copy_out(self, src: &[u8], elem_size: usize) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(self.nelems * elem_size);
        for tc in self {
            let s = tc.src_elem * elem_size;
            let n = tc.nelems * elem_size;
            let from = src.get(s..s + n).ok_or_else(|| short_buffer("source", s + n, src.len()))?;
            out.extend_from_slice(from);
        }
        Ok(out)
    }

    /// Writes the fill value into every shared destination element.
    pub fn transfer_missing(self, fill: &[u8], elem_size: usize, dest: &mut [u8]) -> Result<(), Error> {
        let pattern = fill_elements(fill, elem_size, 1);
        for tc in self {
            let d = tc.dest_elem * elem_size;
            let n = tc.nelems * elem_size;
            let dest_len = dest.len();
            let to = dest
                .get_mut(d..d + n)
                .ok_or_else(|| short_buffer("destination", d + n, dest_len))?;
            if elem_size > 0 {
                for elem in to.chunks_exact_mut(elem_size) {
                    elem.copy_from_slice(&pattern);
                }
            }
        }
        Ok(())
    }
}

fn short_buffer(which: &str, needed: usize, have: usize) -> Error {
    Error::InvalidFileStructure(format!(
        "{} buffer too small for chunk transfer: need {} bytes, have {}",
        which, needed, have
    ))
}

/// `nelems` copies of the fill value. An empty fill means zeros; a fill value
/// of the wrong width is truncated or zero-padded to `elem_size`.
pub fn fill_elements(fill: &[u8], elem_size: usize, nelems: usize) -> Vec<u8> {
    let mut pattern = vec![0u8; elem_size];
    let n = fill.len().min(elem_size);
    pattern[..n].copy_from_slice(&fill[..n]);
    if pattern.iter().all(|&b| b == 0) {
        return vec![0u8; elem_size * nelems];
    }
    pattern.repeat(nelems)
}

impl Iterator for Chunker {
    type Item = TransferChunk;

    fn next(&mut self) -> Option<TransferChunk> {
        if self.done {
            return None;
        }
        let rank = self.counts.len();
        let mut src_elem = 0;
        let mut dest_elem = 0;
        for a in 0..rank {
            let c = if a < self.merge_axis { self.counter[a] } else { 0 };
            src_elem += (self.src_first[a] + c * self.src_step[a]) * self.src_strides[a];
            dest_elem += (self.dest_first[a] + c * self.dest_step[a]) * self.dest_strides[a];
        }
        let tc = TransferChunk {
            nelems: self.run,
            src_elem: src_elem as usize,
            dest_elem: dest_elem as usize,
        };

        // advance the odometer over the outer axes
        let mut axis = self.merge_axis;
        loop {
            if axis == 0 {
                self.done = true;
                break;
            }
            axis -= 1;
            self.counter[axis] += 1;
            if self.counter[axis] < self.counts[axis] {
                break;
            }
            self.counter[axis] = 0;
        }
        Some(tc)
    }
}
