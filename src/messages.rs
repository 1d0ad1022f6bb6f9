//! Parsers for the object header messages a dataset or group reader needs.

use log::debug;

use crate::error::Error;
use crate::io::{Cursor, Hdf5Ctx};
use crate::models::{DType, ElementType};

// ---- Dataspace ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataspace {
    /// Empty for scalars.
    pub shape: Vec<i64>,
    pub max_shape: Option<Vec<u64>>,
    /// A null dataspace holds no elements at all.
    pub null: bool,
}

pub fn parse_dataspace(data: &[u8], ctx: Hdf5Ctx) -> Result<Dataspace, Error> {
    let mut c = Cursor::new(data, ctx);
    let version = c.read_u8()?;
    let rank = c.read_u8()? as usize;
    let flags = c.read_u8()?;
    let null = match version {
        // v1: version(1) + rank(1) + flags(1) + reserved(5)
        1 => {
            c.skip(5)?;
            false
        }
        // v2: version(1) + rank(1) + flags(1) + type(1)
        2 => c.read_u8()? == 2,
        _ => {
            return Err(Error::InvalidFileStructure(format!(
                "Unsupported HDF5 dataspace version: {}",
                version
            )));
        }
    };
    let mut shape = Vec::with_capacity(rank);
    for _ in 0..rank {
        shape.push(c.read_length()? as i64);
    }
    let max_shape = if flags & 0x01 != 0 {
        Some((0..rank).map(|_| c.read_length()).collect::<Result<Vec<_>, _>>()?)
    } else {
        None
    };
    Ok(Dataspace {
        shape,
        max_shape,
        null,
    })
}

// ---- Datatype ----

const DT_CLASS_FIXED_POINT: u8 = 0;
const DT_CLASS_FLOATING_POINT: u8 = 1;
const DT_CLASS_TIME: u8 = 2;
const DT_CLASS_STRING: u8 = 3;
const DT_CLASS_BITFIELD: u8 = 4;
const DT_CLASS_OPAQUE: u8 = 5;
const DT_CLASS_COMPOUND: u8 = 6;
const DT_CLASS_REFERENCE: u8 = 7;
const DT_CLASS_ENUM: u8 = 8;
const DT_CLASS_VLEN: u8 = 9;
const DT_CLASS_ARRAY: u8 = 10;

fn integer_dtype(size: usize, signed: bool) -> Result<DType, Error> {
    match (size, signed) {
        (8, true) => Ok(DType::Int64),
        (4, true) => Ok(DType::Int32),
        (2, true) => Ok(DType::Int16),
        (1, true) => Ok(DType::Int8),
        (8, false) => Ok(DType::Uint64),
        (4, false) => Ok(DType::Uint32),
        (2, false) => Ok(DType::Uint16),
        (1, false) => Ok(DType::Uint8),
        _ => Err(Error::UnsupportedDType(format!(
            "HDF5 integer: size={}, signed={}",
            size, signed
        ))),
    }
}

pub fn parse_datatype(data: &[u8]) -> Result<ElementType, Error> {
    if data.len() < 8 {
        return Err(Error::UnexpectedEof);
    }

    // Datatype message: class_and_version(1) + class_bit_fields(3) + size(4)
    let dt_class = data[0] & 0x0F;
    let bits0 = data[1];
    let size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let big_endian = bits0 & 0x01 != 0;

    let dtype = match dt_class {
        DT_CLASS_FIXED_POINT => integer_dtype(size, bits0 & 0x08 != 0)?,
        DT_CLASS_BITFIELD => integer_dtype(size, false)?,
        DT_CLASS_FLOATING_POINT => match size {
            8 => DType::Float64,
            4 => DType::Float32,
            2 => DType::Float16,
            _ => {
                return Err(Error::UnsupportedDType(format!("HDF5 float: size={}", size)));
            }
        },
        DT_CLASS_STRING => DType::FixedString(size),
        DT_CLASS_ENUM => {
            // the base integer type follows the 8-byte header
            let base = parse_datatype(&data[8..])?;
            return Ok(ElementType::new(base.dtype, size).with_big_endian(base.big_endian));
        }
        DT_CLASS_VLEN => {
            if bits0 & 0x0F == 1 {
                DType::VlenString
            } else {
                DType::Vlen(Box::new(parse_datatype(&data[8..])?))
            }
        }
        DT_CLASS_OPAQUE | DT_CLASS_COMPOUND | DT_CLASS_REFERENCE | DT_CLASS_ARRAY => {
            debug!("datatype class {} read as opaque bytes", dt_class);
            DType::Opaque(size)
        }
        DT_CLASS_TIME => {
            return Err(Error::UnsupportedDType("HDF5 time datatype".to_string()));
        }
        _ => {
            return Err(Error::UnsupportedDType(format!(
                "HDF5 datatype class {} not supported",
                dt_class
            )));
        }
    };
    let big_endian = big_endian && dtype.is_numeric();
    Ok(ElementType::new(dtype, size).with_big_endian(big_endian))
}

// ---- Fill value ----

/// Fill value bytes from a new-style fill value message; `None` when undefined.
pub fn parse_fill_value(data: &[u8]) -> Result<Option<Vec<u8>>, Error> {
    let mut c = Cursor::new(data, Hdf5Ctx::default());
    let version = c.read_u8()?;
    let defined = match version {
        // version(1) + alloc time(1) + write time(1) + defined(1)
        1 | 2 => {
            c.skip(2)?;
            let defined = c.read_u8()? != 0;
            if version == 2 && !defined {
                return Ok(None);
            }
            defined
        }
        3 => {
            let flags = c.read_u8()?;
            if flags & 0x20 == 0 {
                return Ok(None);
            }
            true
        }
        _ => {
            return Err(Error::InvalidFileStructure(format!(
                "Unsupported fill value message version {}",
                version
            )));
        }
    };
    if c.remaining() < 4 {
        return Ok(None);
    }
    let size = c.read_u32()? as usize;
    let value = c.read_bytes(size)?.to_vec();
    Ok((defined && size > 0).then_some(value))
}

/// Fill value bytes from the old-style message: size(4) + value.
pub fn parse_fill_value_old(data: &[u8]) -> Result<Option<Vec<u8>>, Error> {
    let mut c = Cursor::new(data, Hdf5Ctx::default());
    let size = c.read_u32()? as usize;
    let value = c.read_bytes(size)?.to_vec();
    Ok((size > 0).then_some(value))
}

// ---- Links ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    Hard(u64),
    Soft(String),
    External { file: String, path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub target: LinkTarget,
    pub creation_order: Option<u64>,
}

pub fn parse_link(data: &[u8], ctx: Hdf5Ctx) -> Result<Link, Error> {
    let mut c = Cursor::new(data, ctx);
    let version = c.read_u8()?;
    if version != 1 {
        return Err(Error::InvalidFileStructure(format!(
            "Unsupported link message version {}",
            version
        )));
    }
    let flags = c.read_u8()?;
    let link_type = if flags & 0x08 != 0 { c.read_u8()? } else { 0 };
    let creation_order = if flags & 0x04 != 0 {
        Some(c.read_u64()?)
    } else {
        None
    };
    if flags & 0x10 != 0 {
        let _charset = c.read_u8()?;
    }
    let name_len = c.read_uint(1 << (flags & 0x03))? as usize;
    let name = String::from_utf8_lossy(c.read_bytes(name_len)?).into_owned();
    let target = match link_type {
        0 => LinkTarget::Hard(c.read_offset()?),
        1 => {
            let len = c.read_u16()? as usize;
            LinkTarget::Soft(String::from_utf8_lossy(c.read_bytes(len)?).into_owned())
        }
        64 => {
            let len = c.read_u16()? as usize;
            let info = c.read_bytes(len)?;
            // flags(1) + file name + NUL + object path + NUL
            let mut parts = info.get(1..).unwrap_or(&[]).split(|&b| b == 0);
            let file = String::from_utf8_lossy(parts.next().unwrap_or(&[])).into_owned();
            let path = String::from_utf8_lossy(parts.next().unwrap_or(&[])).into_owned();
            LinkTarget::External { file, path }
        }
        other => {
            return Err(Error::InvalidFileStructure(format!(
                "Unknown link type {} for '{}'",
                other, name
            )));
        }
    };
    Ok(Link {
        name,
        target,
        creation_order,
    })
}

/// Where a new-style group keeps its links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub max_creation_index: Option<u64>,
    pub fractal_heap_address: u64,
    pub name_btree_address: u64,
    pub creation_order_btree_address: Option<u64>,
}

pub fn parse_link_info(data: &[u8], ctx: Hdf5Ctx) -> Result<LinkInfo, Error> {
    let mut c = Cursor::new(data, ctx);
    let _version = c.read_u8()?;
    let flags = c.read_u8()?;
    let max_creation_index = if flags & 0x01 != 0 {
        Some(c.read_u64()?)
    } else {
        None
    };
    let fractal_heap_address = c.read_offset()?;
    let name_btree_address = c.read_offset()?;
    let creation_order_btree_address = if flags & 0x02 != 0 {
        Some(c.read_offset()?)
    } else {
        None
    };
    Ok(LinkInfo {
        max_creation_index,
        fractal_heap_address,
        name_btree_address,
        creation_order_btree_address,
    })
}

/// Symbol table message of an old-style group: (B-tree address, local heap address).
pub fn parse_symbol_table_message(data: &[u8], ctx: Hdf5Ctx) -> Result<(u64, u64), Error> {
    let mut c = Cursor::new(data, ctx);
    Ok((c.read_offset()?, c.read_offset()?))
}
