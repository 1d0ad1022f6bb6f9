//! The data layout message: where and how a dataset's raw data is stored.

use std::fmt;

use crate::error::Error;
use crate::io::{Cursor, Hdf5Ctx};

const LAYOUT_CLASS_COMPACT: u8 = 0;
const LAYOUT_CLASS_CONTIGUOUS: u8 = 1;
const LAYOUT_CLASS_CHUNKED: u8 = 2;
const LAYOUT_CLASS_VIRTUAL: u8 = 3;

const INDEX_SINGLE_CHUNK: u8 = 1;
const INDEX_IMPLICIT: u8 = 2;
const INDEX_FIXED_ARRAY: u8 = 3;
const INDEX_EXTENSIBLE_ARRAY: u8 = 4;
const INDEX_BTREE_V2: u8 = 5;

const SINGLE_INDEX_WITH_FILTER: u8 = 0x02;

/// Creation parameters of an extensible array chunk index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensibleArrayParams {
    pub max_nelmts_bits: u8,
    pub index_block_elements: u8,
    pub data_block_min_elements: u8,
    pub super_block_min_data_ptrs: u8,
    pub max_dblk_page_nelmts_bits: u8,
}

/// Physical storage of a dataset. Chunked variants carry the storage chunk
/// dims, whose last entry is the element size in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataLayout {
    Compact {
        data: Vec<u8>,
    },
    Contiguous {
        address: u64,
        /// Not recorded by layout versions 1 and 2.
        size: Option<u64>,
    },
    BTreeV1 {
        btree_address: u64,
        chunk_dims: Vec<i64>,
    },
    SingleChunk {
        address: u64,
        chunk_dims: Vec<i64>,
        /// (size on disk, filter mask) when the chunk went through filters.
        filtered: Option<(u64, u32)>,
    },
    Implicit {
        address: u64,
        chunk_dims: Vec<i64>,
    },
    FixedArray {
        header_address: u64,
        chunk_dims: Vec<i64>,
        page_bits: u8,
    },
    ExtensibleArray {
        header_address: u64,
        chunk_dims: Vec<i64>,
        params: ExtensibleArrayParams,
    },
    BTreeV2 {
        header_address: u64,
        chunk_dims: Vec<i64>,
        node_size: u32,
    },
    Virtual {
        heap_address: u64,
        heap_index: u32,
    },
}

impl DataLayout {
    pub fn parse(data: &[u8], ctx: Hdf5Ctx) -> Result<Self, Error> {
        let mut c = Cursor::new(data, ctx);
        let version = c.read_u8()?;
        match version {
            1 | 2 => parse_v1(&mut c),
            3 | 4 => parse_v3(&mut c, version),
            _ => Err(Error::InvalidFileStructure(format!(
                "Unsupported data layout version: {}",
                version
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataLayout::Compact { .. } => "compact",
            DataLayout::Contiguous { .. } => "contiguous",
            DataLayout::BTreeV1 { .. } => "btree1",
            DataLayout::SingleChunk { .. } => "single chunk",
            DataLayout::Implicit { .. } => "implicit",
            DataLayout::FixedArray { .. } => "fixed array",
            DataLayout::ExtensibleArray { .. } => "extensible array",
            DataLayout::BTreeV2 { .. } => "btree2",
            DataLayout::Virtual { .. } => "virtual",
        }
    }

    /// Storage chunk dims for chunked layouts, element size last.
    pub fn chunk_dims(&self) -> Option<&[i64]> {
        match self {
            DataLayout::BTreeV1 { chunk_dims, .. }
            | DataLayout::SingleChunk { chunk_dims, .. }
            | DataLayout::Implicit { chunk_dims, .. }
            | DataLayout::FixedArray { chunk_dims, .. }
            | DataLayout::ExtensibleArray { chunk_dims, .. }
            | DataLayout::BTreeV2 { chunk_dims, .. } => Some(chunk_dims),
            _ => None,
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.chunk_dims().is_some()
    }
}

impl fmt::Display for DataLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.chunk_dims() {
            Some(dims) => write!(f, "{} {:?}", self.name(), dims),
            None => f.write_str(self.name()),
        }
    }
}

fn parse_v1(c: &mut Cursor<'_>) -> Result<DataLayout, Error> {
    // version(1) + dimensionality(1) + class(1) + reserved(5)
    let ndims = c.read_u8()? as usize;
    let class = c.read_u8()?;
    c.skip(5)?;
    let address = if class != LAYOUT_CLASS_COMPACT {
        c.read_offset()?
    } else {
        0
    };
    let dims = (0..ndims)
        .map(|_| c.read_u32().map(|d| d as i64))
        .collect::<Result<Vec<_>, _>>()?;
    match class {
        LAYOUT_CLASS_COMPACT => {
            let size = c.read_u32()? as usize;
            Ok(DataLayout::Compact {
                data: c.read_bytes(size)?.to_vec(),
            })
        }
        LAYOUT_CLASS_CONTIGUOUS => Ok(DataLayout::Contiguous {
            address,
            size: None,
        }),
        LAYOUT_CLASS_CHUNKED => Ok(DataLayout::BTreeV1 {
            btree_address: address,
            chunk_dims: dims,
        }),
        _ => Err(Error::InvalidFileStructure(format!(
            "Unknown data layout class {}",
            class
        ))),
    }
}

fn parse_v3(c: &mut Cursor<'_>, version: u8) -> Result<DataLayout, Error> {
    let class = c.read_u8()?;
    match class {
        LAYOUT_CLASS_COMPACT => {
            let size = c.read_u16()? as usize;
            Ok(DataLayout::Compact {
                data: c.read_bytes(size)?.to_vec(),
            })
        }
        LAYOUT_CLASS_CONTIGUOUS => Ok(DataLayout::Contiguous {
            address: c.read_offset()?,
            size: Some(c.read_length()?),
        }),
        LAYOUT_CLASS_CHUNKED if version == 3 => {
            let ndims = c.read_u8()? as usize;
            let btree_address = c.read_offset()?;
            let chunk_dims = (0..ndims)
                .map(|_| c.read_u32().map(|d| d as i64))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(DataLayout::BTreeV1 {
                btree_address,
                chunk_dims,
            })
        }
        LAYOUT_CLASS_CHUNKED => parse_v4_chunked(c),
        LAYOUT_CLASS_VIRTUAL if version == 4 => Ok(DataLayout::Virtual {
            heap_address: c.read_offset()?,
            heap_index: c.read_u32()?,
        }),
        _ => Err(Error::InvalidFileStructure(format!(
            "Unknown data layout class {} in version {}",
            class, version
        ))),
    }
}

fn parse_v4_chunked(c: &mut Cursor<'_>) -> Result<DataLayout, Error> {
    let flags = c.read_u8()?;
    let ndims = c.read_u8()? as usize;
    let dim_width = c.read_u8()? as usize;
    if !(1..=8).contains(&dim_width) {
        return Err(Error::InvalidFileStructure(format!(
            "Chunk dimension width {} out of range",
            dim_width
        )));
    }
    let chunk_dims = (0..ndims)
        .map(|_| c.read_uint(dim_width).map(|d| d as i64))
        .collect::<Result<Vec<_>, _>>()?;
    let index_type = c.read_u8()?;
    match index_type {
        INDEX_SINGLE_CHUNK => {
            let filtered = if flags & SINGLE_INDEX_WITH_FILTER != 0 {
                Some((c.read_length()?, c.read_u32()?))
            } else {
                None
            };
            Ok(DataLayout::SingleChunk {
                address: c.read_offset()?,
                chunk_dims,
                filtered,
            })
        }
        INDEX_IMPLICIT => Ok(DataLayout::Implicit {
            address: c.read_offset()?,
            chunk_dims,
        }),
        INDEX_FIXED_ARRAY => {
            let page_bits = c.read_u8()?;
            Ok(DataLayout::FixedArray {
                header_address: c.read_offset()?,
                chunk_dims,
                page_bits,
            })
        }
        INDEX_EXTENSIBLE_ARRAY => {
            let params = ExtensibleArrayParams {
                max_nelmts_bits: c.read_u8()?,
                index_block_elements: c.read_u8()?,
                data_block_min_elements: c.read_u8()?,
                super_block_min_data_ptrs: c.read_u8()?,
                max_dblk_page_nelmts_bits: c.read_u8()?,
            };
            Ok(DataLayout::ExtensibleArray {
                header_address: c.read_offset()?,
                chunk_dims,
                params,
            })
        }
        INDEX_BTREE_V2 => {
            let node_size = c.read_u32()?;
            // split and merge percentages
            c.skip(2)?;
            Ok(DataLayout::BTreeV2 {
                header_address: c.read_offset()?,
                chunk_dims,
                node_size,
            })
        }
        _ => Err(Error::UnsupportedLayout(format!(
            "chunk index type {}",
            index_type
        ))),
    }
}
