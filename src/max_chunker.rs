//! Splits a section into pieces of bounded element count.

use crate::index_nd::IndexND;
use crate::section::{IndexSpace, Section};

/// Iterates consecutive sub-regions of a section, each holding at most
/// `max_elements` elements. The pieces tile the section exactly.
#[derive(Debug, Clone)]
pub struct MaxChunker {
    space: IndexSpace,
    piece: Vec<i64>,
    corners: IndexND,
}

impl MaxChunker {
    pub fn new(max_elements: usize, section: &Section) -> Self {
        let space = IndexSpace::from_section(section);
        let rank = space.rank();
        let max = max_elements.max(1) as i64;

        // Innermost axes are taken whole while they fit, the next one partially.
        let mut piece = vec![1; rank];
        let mut inner = 1i64;
        for axis in (0..rank).rev() {
            let len = space.shape()[axis];
            if inner * len <= max {
                piece[axis] = len;
                inner *= len;
            } else {
                piece[axis] = (max / inner).max(1);
                break;
            }
        }

        let grid: Vec<i64> = (0..rank)
            .map(|i| {
                let len = space.shape()[i];
                if len == 0 { 0 } else { (len + piece[i] - 1) / piece[i] }
            })
            .collect();
        let corners = IndexND::new(IndexSpace::new(vec![0; rank], grid));

        MaxChunker {
            space,
            piece,
            corners,
        }
    }
}

impl Iterator for MaxChunker {
    type Item = IndexSpace;

    fn next(&mut self) -> Option<IndexSpace> {
        let cell = self.corners.next()?;
        let rank = self.space.rank();
        let mut start = Vec::with_capacity(rank);
        let mut shape = Vec::with_capacity(rank);
        for i in 0..rank {
            let first = cell[i] * self.piece[i];
            let len = self.piece[i].min(self.space.shape()[i] - first);
            start.push(self.space.start()[i] + first * self.space.stride()[i]);
            shape.push(len);
        }
        Some(IndexSpace::with_stride(start, shape, self.space.stride().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(shape: &[i64], max: usize) {
        let section = Section::from_shape(shape);
        let mut total = 0;
        for piece in MaxChunker::new(max, &section) {
            assert!(piece.total_elements() as usize <= max);
            total += piece.total_elements();
        }
        assert_eq!(total, section.total_elements());
    }

    #[test]
    fn test_max_chunk_shape() {
        check(&[20, 30, 40], 10000);
        check(&[20, 30, 40], 3333);
        check(&[20, 30, 40], 1111);
        check(&[20, 30, 40], 7);
        check(&[20, 30, 40], 100_000);
    }

    #[test]
    fn test_pieces_cover_strided_section() {
        let section: Section = "1:9:2, 0:5".parse().unwrap();
        let pieces: Vec<_> = MaxChunker::new(12, &section).collect();
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].start(), &[1, 0]);
        assert_eq!(pieces[1].start(), &[5, 0]);
        assert_eq!(pieces[2].shape(), &[1, 6]);
        assert_eq!(pieces.iter().map(|p| p.total_elements()).sum::<i64>(), 30);
    }

    #[test]
    fn test_scalar_section() {
        let pieces: Vec<_> = MaxChunker::new(10, &Section::from_shape(&[])).collect();
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].total_elements(), 1);
    }
}
