//! Row-major odometer over the points of an [`IndexSpace`].

use crate::section::IndexSpace;

/// Yields every point of a region, last axis fastest.
#[derive(Debug, Clone)]
pub struct IndexND {
    space: IndexSpace,
    counter: Vec<i64>,
    done: bool,
}

impl IndexND {
    pub fn new(space: IndexSpace) -> Self {
        let done = space.is_empty();
        IndexND {
            counter: vec![0; space.rank()],
            space,
            done,
        }
    }
}

impl Iterator for IndexND {
    type Item = Vec<i64>;

    fn next(&mut self) -> Option<Vec<i64>> {
        if self.done {
            return None;
        }
        let point = (0..self.space.rank())
            .map(|i| self.space.start()[i] + self.counter[i] * self.space.stride()[i])
            .collect();

        let mut axis = self.space.rank();
        loop {
            if axis == 0 {
                self.done = true;
                break;
            }
            axis -= 1;
            self.counter[axis] += 1;
            if self.counter[axis] < self.space.shape()[axis] {
                break;
            }
            self.counter[axis] = 0;
        }
        Some(point)
    }
}
