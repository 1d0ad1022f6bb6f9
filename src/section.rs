//! Rectangular sub-regions of N-dimensional arrays.
//!
//! A [`Section`] is a list of inclusive, possibly strided ranges, one per axis,
//! written like `"1:2, 0:12"` or `"0:10:2"`. An [`IndexSpace`] is the same region
//! as start, shape (element count per axis) and stride, which is what the
//! chunk transfer machinery works with.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

// ---- Range ----

/// Inclusive range `first..=last` stepping by `stride`. An empty range has `last == first - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    first: i64,
    last: i64,
    stride: i64,
}

impl Range {
    pub fn new(first: i64, last: i64) -> Result<Self, Error> {
        Self::with_stride(first, last, 1)
    }

    pub fn with_stride(first: i64, last: i64, stride: i64) -> Result<Self, Error> {
        if first < 0 {
            return Err(Error::InvalidSection(format!("negative first index {}", first)));
        }
        if last < first - 1 {
            return Err(Error::InvalidSection(format!(
                "last {} is before first {}",
                last, first
            )));
        }
        if stride < 1 {
            return Err(Error::InvalidSection(format!("stride {} must be positive", stride)));
        }
        Ok(Range {
            first,
            last,
            stride,
        })
    }

    /// The whole axis `0..len`.
    pub fn full(len: i64) -> Self {
        Range {
            first: 0,
            last: len.max(0) - 1,
            stride: 1,
        }
    }

    pub fn first(&self) -> i64 {
        self.first
    }

    pub fn last(&self) -> i64 {
        self.last
    }

    pub fn stride(&self) -> i64 {
        self.stride
    }

    /// Number of elements selected.
    pub fn length(&self) -> i64 {
        if self.last < self.first {
            0
        } else {
            (self.last - self.first) / self.stride + 1
        }
    }

    /// Last element actually selected, which may be before `last` when strided.
    pub fn last_element(&self) -> i64 {
        self.first + (self.length() - 1).max(0) * self.stride
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stride == 1 {
            write!(f, "{}:{}", self.first, self.last)
        } else {
            write!(f, "{}:{}:{}", self.first, self.last, self.stride)
        }
    }
}

impl FromStr for Range {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| -> Result<i64, Error> {
            part.trim()
                .parse::<i64>()
                .map_err(|_| Error::InvalidSection(format!("bad index '{}' in '{}'", part, s)))
        };
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [single] => {
                let i = parse(single)?;
                Range::new(i, i)
            }
            [first, last] => Range::new(parse(first)?, parse(last)?),
            [first, last, stride] => Range::with_stride(parse(first)?, parse(last)?, parse(stride)?),
            _ => Err(Error::InvalidSection(format!("bad range '{}'", s))),
        }
    }
}

// ---- Section ----

/// One range per axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Section {
    ranges: Vec<Range>,
}

impl Section {
    pub fn new(ranges: Vec<Range>) -> Self {
        Section { ranges }
    }

    /// The full extent of an array of `shape`.
    pub fn from_shape(shape: &[i64]) -> Self {
        Section {
            ranges: shape.iter().map(|&n| Range::full(n)).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.ranges.len()
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    /// Selected element count per axis.
    pub fn shape(&self) -> Vec<i64> {
        self.ranges.iter().map(Range::length).collect()
    }

    pub fn total_elements(&self) -> i64 {
        self.ranges.iter().map(Range::length).product()
    }

    /// Checks every range lies within an array of `shape`.
    pub fn check_in(&self, shape: &[i64]) -> Result<(), Error> {
        if self.rank() != shape.len() {
            return Err(Error::OutOfRange(format!(
                "section {} has rank {}, array has rank {}",
                self,
                self.rank(),
                shape.len()
            )));
        }
        for (axis, (range, &len)) in self.ranges.iter().zip(shape).enumerate() {
            if range.length() > 0 && range.last() >= len {
                return Err(Error::OutOfRange(format!(
                    "section {} exceeds shape {:?} on axis {}",
                    self, shape, axis
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", range)?;
        }
        Ok(())
    }
}

impl FromStr for Section {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let partial: SectionPartial = s.parse()?;
        let ranges = partial
            .ranges
            .into_iter()
            .map(|r| r.ok_or_else(|| Error::InvalidSection(format!("'{}' has an open axis", s))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Section { ranges })
    }
}

// ---- SectionPartial ----

/// A section where some axes (`":"`) mean "the whole axis".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SectionPartial {
    ranges: Vec<Option<Range>>,
}

impl SectionPartial {
    pub fn new(ranges: Vec<Option<Range>>) -> Self {
        SectionPartial { ranges }
    }

    pub fn ranges(&self) -> &[Option<Range>] {
        &self.ranges
    }

    /// Resolves `partial` against `shape`. `None` selects everything.
    pub fn fill(partial: Option<&SectionPartial>, shape: &[i64]) -> Result<Section, Error> {
        let section = match partial {
            None => Section::from_shape(shape),
            Some(p) => {
                if p.ranges.len() != shape.len() {
                    return Err(Error::OutOfRange(format!(
                        "section of rank {} for array of shape {:?}",
                        p.ranges.len(),
                        shape
                    )));
                }
                Section::new(
                    p.ranges
                        .iter()
                        .zip(shape)
                        .map(|(r, &len)| r.unwrap_or_else(|| Range::full(len)))
                        .collect(),
                )
            }
        };
        section.check_in(shape)?;
        Ok(section)
    }
}

impl From<Section> for SectionPartial {
    fn from(section: Section) -> Self {
        SectionPartial {
            ranges: section.ranges.into_iter().map(Some).collect(),
        }
    }
}

impl FromStr for SectionPartial {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(SectionPartial { ranges: Vec::new() });
        }
        let ranges = trimmed
            .split(',')
            .map(|part| {
                let part = part.trim();
                if part == ":" {
                    Ok(None)
                } else {
                    part.parse::<Range>().map(Some)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SectionPartial { ranges })
    }
}

// ---- IndexSpace ----

/// Rectangular region as start, per-axis element count, and stride.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexSpace {
    start: Vec<i64>,
    shape: Vec<i64>,
    stride: Vec<i64>,
}

impl IndexSpace {
    pub fn new(start: Vec<i64>, shape: Vec<i64>) -> Self {
        let stride = vec![1; start.len()];
        Self::with_stride(start, shape, stride)
    }

    pub fn with_stride(start: Vec<i64>, shape: Vec<i64>, stride: Vec<i64>) -> Self {
        debug_assert_eq!(start.len(), shape.len());
        debug_assert_eq!(start.len(), stride.len());
        IndexSpace {
            start,
            shape: shape.into_iter().map(|n| n.max(0)).collect(),
            stride,
        }
    }

    /// Region anchored at `start` whose extent is the first `start.len()` entries of `dims`.
    ///
    /// Chunk dims carry a trailing element-size dimension that is dropped here.
    pub fn from_corner(start: &[i64], dims: &[i64]) -> Self {
        Self::new(start.to_vec(), dims[..start.len()].to_vec())
    }

    pub fn from_shape(shape: &[i64]) -> Self {
        Self::new(vec![0; shape.len()], shape.to_vec())
    }

    pub fn from_section(section: &Section) -> Self {
        IndexSpace {
            start: section.ranges().iter().map(Range::first).collect(),
            shape: section.ranges().iter().map(Range::length).collect(),
            stride: section.ranges().iter().map(Range::stride).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.start.len()
    }

    pub fn start(&self) -> &[i64] {
        &self.start
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn stride(&self) -> &[i64] {
        &self.stride
    }

    pub fn is_strided(&self) -> bool {
        self.stride.iter().any(|&s| s != 1)
    }

    /// Last selected index on each axis.
    pub fn last(&self) -> Vec<i64> {
        (0..self.rank())
            .map(|i| self.start[i] + (self.shape[i] - 1) * self.stride[i])
            .collect()
    }

    pub fn total_elements(&self) -> i64 {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.shape.iter().any(|&n| n == 0)
    }

    /// The unit-stride box spanning this region.
    pub fn bounding_box(&self) -> IndexSpace {
        let last = self.last();
        IndexSpace::new(
            self.start.clone(),
            (0..self.rank())
                .map(|i| last[i] - self.start[i] + 1)
                .collect(),
        )
    }

    /// True if every element of `other` is an element of `self`.
    pub fn contains(&self, other: &IndexSpace) -> bool {
        if other.rank() != self.rank() {
            return false;
        }
        if other.is_empty() {
            return true;
        }
        let (last, other_last) = (self.last(), other.last());
        (0..self.rank()).all(|i| {
            if self.shape[i] == 0 || other.start[i] < self.start[i] || other_last[i] > last[i] {
                return false;
            }
            let s = self.stride[i];
            s == 1
                || ((other.start[i] - self.start[i]) % s == 0
                    && (other.shape[i] == 1 || other.stride[i] % s == 0))
        })
    }

    pub fn intersects(&self, other: &IndexSpace) -> bool {
        !self.intersect(other).is_empty()
    }

    /// The elements common to both regions; empty (zero shape) if disjoint.
    pub fn intersect(&self, other: &IndexSpace) -> IndexSpace {
        let rank = self.rank().min(other.rank());
        let mut start = Vec::with_capacity(rank);
        let mut shape = Vec::with_capacity(rank);
        let mut stride = Vec::with_capacity(rank);
        for i in 0..rank {
            let (s, n, d) = intersect_axis(
                (self.start[i], self.shape[i], self.stride[i]),
                (other.start[i], other.shape[i], other.stride[i]),
            );
            start.push(s);
            shape.push(n);
            stride.push(d);
        }
        IndexSpace {
            start,
            shape,
            stride,
        }
    }

    pub fn section(&self) -> Section {
        Section::new(
            (0..self.rank())
                .map(|i| Range {
                    first: self.start[i],
                    last: self.start[i] + (self.shape[i] - 1) * self.stride[i],
                    stride: self.stride[i],
                })
                .collect(),
        )
    }
}

impl fmt::Display for IndexSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.section())
    }
}

/// Intersects two arithmetic progressions given as (start, count, step).
fn intersect_axis(a: (i64, i64, i64), b: (i64, i64, i64)) -> (i64, i64, i64) {
    let (s1, n1, d1) = a;
    let (s2, n2, d2) = b;
    if n1 <= 0 || n2 <= 0 {
        return (s1.max(s2), 0, 1);
    }
    let lo = s1.max(s2);
    let hi = (s1 + (n1 - 1) * d1).min(s2 + (n2 - 1) * d2);
    if lo > hi {
        return (lo, 0, 1);
    }
    // first element of `a` at or after lo, then walk until it also lies on `b`
    let mut x = s1 + ((lo - s1 + d1 - 1) / d1) * d1;
    let mut found = false;
    for _ in 0..d2 {
        if x > hi {
            break;
        }
        if (x - s2) % d2 == 0 {
            found = true;
            break;
        }
        x += d1;
    }
    if !found {
        return (lo, 0, 1);
    }
    let step = lcm(d1, d2);
    (x, (hi - x) / step + 1, step)
}

fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

fn lcm(a: i64, b: i64) -> i64 {
    a / gcd(a, b) * b
}
