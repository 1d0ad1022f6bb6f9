use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::filters::FilterPipeline;
use crate::io::OpenFile;
use crate::layout::DataLayout;
use crate::messages::{parse_dataspace, parse_datatype, parse_fill_value, parse_fill_value_old};
use crate::object_header::{
    ObjectHeader, MSG_DATASPACE, MSG_DATATYPE, MSG_DATA_LAYOUT, MSG_FILL_VALUE, MSG_FILL_VALUE_OLD,
    MSG_FILTER_PIPELINE,
};
use crate::section::IndexSpace;

/// Element type of a dataset, as far as decoding is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float16,
    Float32,
    Float64,
    /// Fixed-length string of the given byte width.
    FixedString(usize),
    VlenString,
    /// Variable-length sequence of the base type.
    Vlen(Box<ElementType>),
    /// Uninterpreted bytes: opaque, compound, reference and array types.
    Opaque(usize),
}

impl DType {
    pub fn is_numeric(&self) -> bool {
        !matches!(
            self,
            DType::FixedString(_) | DType::VlenString | DType::Vlen(_) | DType::Opaque(_)
        )
    }

    pub fn is_vlen(&self) -> bool {
        matches!(self, DType::VlenString | DType::Vlen(_))
    }
}

/// A datatype plus its storage size and byte order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementType {
    pub dtype: DType,
    /// Bytes per stored element.
    pub size: usize,
    #[serde(default)]
    pub big_endian: bool,
}

impl ElementType {
    pub fn new(dtype: DType, size: usize) -> Self {
        ElementType {
            dtype,
            size,
            big_endian: false,
        }
    }

    pub fn with_big_endian(mut self, big_endian: bool) -> Self {
        self.big_endian = big_endian;
        self
    }
}

/// Decoded element values.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Uint8(Vec<u8>),
    Uint16(Vec<u16>),
    Uint32(Vec<u32>),
    Uint64(Vec<u64>),
    Float16(Vec<half::f16>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    String(Vec<String>),
    Vlen(Vec<ArrayData>),
    Opaque(Vec<Vec<u8>>),
}

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            ArrayData::Int8(v) => v.len(),
            ArrayData::Int16(v) => v.len(),
            ArrayData::Int32(v) => v.len(),
            ArrayData::Int64(v) => v.len(),
            ArrayData::Uint8(v) => v.len(),
            ArrayData::Uint16(v) => v.len(),
            ArrayData::Uint32(v) => v.len(),
            ArrayData::Uint64(v) => v.len(),
            ArrayData::Float16(v) => v.len(),
            ArrayData::Float32(v) => v.len(),
            ArrayData::Float64(v) => v.len(),
            ArrayData::String(v) => v.len(),
            ArrayData::Vlen(v) => v.len(),
            ArrayData::Opaque(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of all numeric values; strings and opaque elements count as zero.
    pub fn sum_f64(&self) -> f64 {
        match self {
            ArrayData::Int8(v) => v.iter().map(|&x| x as f64).sum(),
            ArrayData::Int16(v) => v.iter().map(|&x| x as f64).sum(),
            ArrayData::Int32(v) => v.iter().map(|&x| x as f64).sum(),
            ArrayData::Int64(v) => v.iter().map(|&x| x as f64).sum(),
            ArrayData::Uint8(v) => v.iter().map(|&x| x as f64).sum(),
            ArrayData::Uint16(v) => v.iter().map(|&x| x as f64).sum(),
            ArrayData::Uint32(v) => v.iter().map(|&x| x as f64).sum(),
            ArrayData::Uint64(v) => v.iter().map(|&x| x as f64).sum(),
            ArrayData::Float16(v) => v.iter().map(|x| x.to_f64()).sum(),
            ArrayData::Float32(v) => v.iter().map(|&x| x as f64).sum(),
            ArrayData::Float64(v) => v.iter().sum(),
            ArrayData::Vlen(v) => v.iter().map(|x| x.sum_f64()).sum(),
            ArrayData::String(_) | ArrayData::Opaque(_) => 0.0,
        }
    }
}

/// An N-dimensional array of decoded values, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedArray {
    pub element: ElementType,
    pub shape: Vec<i64>,
    pub data: ArrayData,
}

impl TypedArray {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sum_f64(&self) -> f64 {
        self.data.sum_f64()
    }
}

/// A decoded piece of a variable together with where it lies in the variable.
#[derive(Debug, Clone, PartialEq)]
pub struct ArraySection {
    pub array: TypedArray,
    pub section: IndexSpace,
}

/// Everything needed to read one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableInfo {
    pub name: String,
    pub shape: Vec<i64>,
    /// `u64::MAX` marks an unlimited dimension.
    pub max_shape: Option<Vec<u64>>,
    pub element: ElementType,
    pub layout: DataLayout,
    pub filters: FilterPipeline,
    /// Empty means zeros.
    pub fill_value: Vec<u8>,
}

impl VariableInfo {
    /// Collects a dataset's description from its object header.
    pub fn from_header(
        file: &OpenFile,
        name: &str,
        header: &ObjectHeader,
        max_depth: usize,
    ) -> Result<Self, Error> {
        let ctx = file.ctx();
        let required = |msg_type: u16, what: &str| -> Result<Vec<u8>, Error> {
            header.message_data(file, msg_type, max_depth)?.ok_or_else(|| {
                Error::InvalidFileStructure(format!("dataset '{}' has no {} message", name, what))
            })
        };

        let space = parse_dataspace(&required(MSG_DATASPACE, "dataspace")?, ctx)?;
        let element = parse_datatype(&required(MSG_DATATYPE, "datatype")?)?;
        let layout = DataLayout::parse(&required(MSG_DATA_LAYOUT, "data layout")?, ctx)?;
        let filters = match header.message_data(file, MSG_FILTER_PIPELINE, max_depth)? {
            Some(data) => FilterPipeline::parse(&data)?,
            None => FilterPipeline::default(),
        };
        let fill_value = match header.message_data(file, MSG_FILL_VALUE, max_depth)? {
            Some(data) => parse_fill_value(&data)?,
            None => match header.message_data(file, MSG_FILL_VALUE_OLD, max_depth)? {
                Some(data) => parse_fill_value_old(&data)?,
                None => None,
            },
        };

        Ok(VariableInfo {
            name: name.to_string(),
            shape: if space.null { vec![0] } else { space.shape },
            max_shape: space.max_shape,
            element,
            layout,
            filters,
            fill_value: fill_value.unwrap_or_default(),
        })
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn elem_size(&self) -> usize {
        self.element.size
    }

    pub fn total_elements(&self) -> i64 {
        self.shape.iter().product()
    }
}
