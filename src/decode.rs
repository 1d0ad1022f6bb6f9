//! Turns raw element bytes into typed arrays.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use half::f16;

use crate::error::Error;
use crate::global_heap::HeapSideTable;
use crate::models::{ArrayData, DType, ElementType, TypedArray};

/// Number of elements in a shape; a scalar has one.
pub fn shape_elements(shape: &[i64]) -> usize {
    shape.iter().map(|&d| d.max(0) as usize).product()
}

macro_rules! decode_fixed {
    ($raw:expr, $n:expr, $big:expr, $t:ty, $read:ident) => {{
        let mut out = vec![<$t>::default(); $n];
        if $big {
            BigEndian::$read($raw, &mut out);
        } else {
            LittleEndian::$read($raw, &mut out);
        }
        out
    }};
}

/// Decodes `n` fixed-width numeric elements.
fn decode_numeric(raw: &[u8], element: &ElementType, n: usize) -> Result<ArrayData, Error> {
    let need = n * element.size;
    let raw = raw.get(..need).ok_or(Error::UnexpectedEof)?;
    let big = element.big_endian;
    let data = match element.dtype {
        DType::Int8 => ArrayData::Int8(raw.iter().map(|&b| b as i8).collect()),
        DType::Uint8 => ArrayData::Uint8(raw.to_vec()),
        DType::Int16 => ArrayData::Int16(decode_fixed!(raw, n, big, i16, read_i16_into)),
        DType::Uint16 => ArrayData::Uint16(decode_fixed!(raw, n, big, u16, read_u16_into)),
        DType::Int32 => ArrayData::Int32(decode_fixed!(raw, n, big, i32, read_i32_into)),
        DType::Uint32 => ArrayData::Uint32(decode_fixed!(raw, n, big, u32, read_u32_into)),
        DType::Int64 => ArrayData::Int64(decode_fixed!(raw, n, big, i64, read_i64_into)),
        DType::Uint64 => ArrayData::Uint64(decode_fixed!(raw, n, big, u64, read_u64_into)),
        DType::Float32 => ArrayData::Float32(decode_fixed!(raw, n, big, f32, read_f32_into)),
        DType::Float64 => ArrayData::Float64(decode_fixed!(raw, n, big, f64, read_f64_into)),
        DType::Float16 => {
            let bits = decode_fixed!(raw, n, big, u16, read_u16_into);
            ArrayData::Float16(bits.into_iter().map(f16::from_bits).collect())
        }
        _ => return Err(Error::UnsupportedDType(format!("{:?} is not numeric", element.dtype))),
    };
    Ok(data)
}

/// Strips the NUL (or space) padding of a fixed-length string.
fn fixed_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end_matches(' ').to_string()
}

/// Decodes the elements of `raw`; variable-length elements need the side
/// table of their resolved heap values.
pub fn decode_data(
    raw: &[u8],
    element: &ElementType,
    n: usize,
    heap: Option<&HeapSideTable>,
) -> Result<ArrayData, Error> {
    if element.dtype.is_numeric() {
        return decode_numeric(raw, element, n);
    }
    let need = n * element.size;
    if raw.len() < need {
        return Err(Error::UnexpectedEof);
    }
    let data = match &element.dtype {
        DType::FixedString(width) => ArrayData::String(
            raw[..need]
                .chunks_exact((*width).max(1))
                .map(fixed_string)
                .collect(),
        ),
        DType::Opaque(width) => {
            ArrayData::Opaque(raw[..need].chunks_exact((*width).max(1)).map(<[u8]>::to_vec).collect())
        }
        DType::VlenString | DType::Vlen(_) => {
            let heap = heap.ok_or_else(|| {
                Error::Other("variable-length data read without its heap values".to_string())
            })?;
            let values = (0..n).map(|i| heap.get(i * element.size).unwrap_or(&[]));
            match &element.dtype {
                DType::Vlen(base) => ArrayData::Vlen(
                    values
                        .map(|bytes| decode_data(bytes, base, bytes.len() / base.size.max(1), None))
                        .collect::<Result<_, _>>()?,
                ),
                _ => ArrayData::String(values.map(|b| String::from_utf8_lossy(b).into_owned()).collect()),
            }
        }
        other => return Err(Error::UnsupportedDType(format!("{:?}", other))),
    };
    Ok(data)
}

/// Decodes a row-major buffer of `shape` into a typed array.
pub fn decode_array(
    raw: &[u8],
    element: &ElementType,
    shape: &[i64],
    heap: Option<&HeapSideTable>,
) -> Result<TypedArray, Error> {
    let data = decode_data(raw, element, shape_elements(shape), heap)?;
    Ok(TypedArray {
        element: element.clone(),
        shape: shape.to_vec(),
        data,
    })
}

/// Size of one element of a vlen base type (1 for strings).
pub fn vlen_base_size(element: &ElementType) -> usize {
    match &element.dtype {
        DType::Vlen(base) => base.size.max(1),
        _ => 1,
    }
}
