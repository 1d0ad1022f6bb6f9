//! Filter pipeline messages and the decoders that undo them.
//!
//! Filters run in reverse pipeline order when reading. Bit `i` of a chunk's
//! filter mask set means filter `i` was skipped when the chunk was written.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::sync::Arc;

use flate2::read::ZlibDecoder;
use log::{trace, warn};

use crate::error::Error;
use crate::io::Cursor;

pub const FILTER_DEFLATE: u16 = 1;
pub const FILTER_SHUFFLE: u16 = 2;
pub const FILTER_FLETCHER32: u16 = 3;
pub const FILTER_SZIP: u16 = 4;
pub const FILTER_NBIT: u16 = 5;
pub const FILTER_SCALEOFFSET: u16 = 6;
pub const FILTER_ZSTD: u16 = 32015;

/// One entry of a filter pipeline message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterInfo {
    pub id: u16,
    pub name: String,
    /// Optional filters may be skipped when no decoder is available.
    pub optional: bool,
    pub client_data: Vec<u32>,
}

/// An ordered filter pipeline as stored in the dataset's header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPipeline {
    filters: Vec<FilterInfo>,
}

fn standard_name(id: u16) -> &'static str {
    match id {
        FILTER_DEFLATE => "deflate",
        FILTER_SHUFFLE => "shuffle",
        FILTER_FLETCHER32 => "fletcher32",
        FILTER_SZIP => "szip",
        FILTER_NBIT => "nbit",
        FILTER_SCALEOFFSET => "scaleoffset",
        FILTER_ZSTD => "zstd",
        _ => "unknown",
    }
}

fn trim_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl FilterPipeline {
    pub fn new(filters: Vec<FilterInfo>) -> Self {
        FilterPipeline { filters }
    }

    /// Parses a filter pipeline message body (versions 1 and 2).
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(data, Default::default());
        let version = cursor.read_u8()?;
        let nfilters = cursor.read_u8()? as usize;
        match version {
            1 => cursor.skip(6)?,
            2 => {}
            _ => {
                return Err(Error::InvalidFileStructure(format!(
                    "Unsupported filter pipeline version {}",
                    version
                )));
            }
        }

        let mut filters = Vec::with_capacity(nfilters);
        for _ in 0..nfilters {
            let id = cursor.read_u16()?;
            let name_len = if version == 1 || id >= 256 {
                cursor.read_u16()? as usize
            } else {
                0
            };
            let flags = cursor.read_u16()?;
            let nvalues = cursor.read_u16()? as usize;
            let name = if version == 1 {
                // padded to a multiple of eight
                trim_name(cursor.read_bytes((name_len + 7) & !7)?)
            } else {
                trim_name(cursor.read_bytes(name_len)?)
            };
            let client_data = (0..nvalues)
                .map(|_| cursor.read_u32())
                .collect::<Result<Vec<_>, _>>()?;
            if version == 1 && nvalues % 2 == 1 {
                cursor.skip(4)?;
            }
            filters.push(FilterInfo {
                id,
                name: if name.is_empty() {
                    standard_name(id).to_string()
                } else {
                    name
                },
                optional: flags & 1 != 0,
                client_data,
            });
        }
        Ok(FilterPipeline { filters })
    }

    pub fn filters(&self) -> &[FilterInfo] {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Undoes the pipeline on one chunk's stored bytes.
    pub fn apply(
        &self,
        data: Vec<u8>,
        filter_mask: u32,
        registry: &FilterRegistry,
        elem_size: usize,
    ) -> Result<Vec<u8>, Error> {
        let mut data = data;
        for (i, info) in self.filters.iter().enumerate().rev() {
            if i < 32 && filter_mask & (1 << i) != 0 {
                trace!("filter {} skipped by mask {:#x}", info.name, filter_mask);
                continue;
            }
            match registry.get(info.id) {
                Some(filter) => data = filter.decode(data, info, elem_size)?,
                None if info.optional => {
                    warn!("No decoder for optional filter {} ({}), skipping", info.id, info.name);
                }
                None => {
                    return Err(Error::UnsupportedFilter {
                        id: info.id,
                        name: info.name.clone(),
                    });
                }
            }
        }
        Ok(data)
    }
}

impl fmt::Display for FilterPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.filters.iter().map(|f| f.name.as_str()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

// ---- Decoders ----

/// Reverses one filter on read.
pub trait ChunkFilter: Send + Sync {
    fn id(&self) -> u16;

    fn name(&self) -> &str;

    /// Decodes `data`; `elem_size` is the dataset's element size in bytes.
    fn decode(&self, data: Vec<u8>, info: &FilterInfo, elem_size: usize) -> Result<Vec<u8>, Error>;
}

fn filter_error(filter: &str, message: impl fmt::Display) -> Error {
    Error::Filter {
        filter: filter.to_string(),
        message: message.to_string(),
    }
}

pub struct Deflate;

impl ChunkFilter for Deflate {
    fn id(&self) -> u16 {
        FILTER_DEFLATE
    }

    fn name(&self) -> &str {
        "deflate"
    }

    fn decode(&self, data: Vec<u8>, _info: &FilterInfo, _elem_size: usize) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(data.len() * 4);
        ZlibDecoder::new(&data[..])
            .read_to_end(&mut out)
            .map_err(|e| filter_error(self.name(), e))?;
        Ok(out)
    }
}

pub struct Shuffle;

impl ChunkFilter for Shuffle {
    fn id(&self) -> u16 {
        FILTER_SHUFFLE
    }

    fn name(&self) -> &str {
        "shuffle"
    }

    fn decode(&self, data: Vec<u8>, info: &FilterInfo, elem_size: usize) -> Result<Vec<u8>, Error> {
        let size = info.client_data.first().map(|&s| s as usize).unwrap_or(elem_size);
        Ok(unshuffle(&data, size))
    }
}

/// Inverse of the byte shuffle: byte `b` of element `i` is at `b * n + i`.
/// Trailing bytes that do not fill an element are left in place.
pub fn unshuffle(data: &[u8], elem_size: usize) -> Vec<u8> {
    if elem_size <= 1 || data.len() < elem_size {
        return data.to_vec();
    }
    let n = data.len() / elem_size;
    let mut out = vec![0u8; data.len()];
    for b in 0..elem_size {
        let plane = &data[b * n..(b + 1) * n];
        for (i, &byte) in plane.iter().enumerate() {
            out[i * elem_size + b] = byte;
        }
    }
    let tail = n * elem_size;
    out[tail..].copy_from_slice(&data[tail..]);
    out
}

pub struct Fletcher32 {
    pub verify: bool,
}

impl ChunkFilter for Fletcher32 {
    fn id(&self) -> u16 {
        FILTER_FLETCHER32
    }

    fn name(&self) -> &str {
        "fletcher32"
    }

    fn decode(&self, mut data: Vec<u8>, _info: &FilterInfo, _elem_size: usize) -> Result<Vec<u8>, Error> {
        if data.len() < 4 {
            return Err(filter_error(self.name(), "chunk shorter than its checksum"));
        }
        let body_len = data.len() - 4;
        if self.verify {
            let tail = &data[body_len..];
            let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
            let calculated = fletcher32(&data[..body_len]);
            // files written before 1.6.3 stored the checksum byte-swapped
            if stored != calculated && stored != calculated.swap_bytes() {
                return Err(Error::ChecksumMismatch {
                    context: "fletcher32 chunk".to_string(),
                    expected: stored,
                    calculated,
                });
            }
        }
        data.truncate(body_len);
        Ok(data)
    }
}

/// Fletcher-32 over big-endian 16-bit words, odd trailing byte as the high half.
pub fn fletcher32(data: &[u8]) -> u32 {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    let mut words = data.chunks_exact(2);
    loop {
        let mut n = 0;
        for word in words.by_ref().take(360) {
            sum1 += ((word[0] as u32) << 8) | word[1] as u32;
            sum2 += sum1;
            n += 1;
        }
        if n == 0 {
            break;
        }
        sum1 = (sum1 & 0xffff) + (sum1 >> 16);
        sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    }
    if let [last] = words.remainder() {
        sum1 += (*last as u32) << 8;
        sum2 += sum1;
        sum1 = (sum1 & 0xffff) + (sum1 >> 16);
        sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    }
    sum1 = (sum1 & 0xffff) + (sum1 >> 16);
    sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    (sum2 << 16) | sum1
}

pub struct Zstd;

impl ChunkFilter for Zstd {
    fn id(&self) -> u16 {
        FILTER_ZSTD
    }

    fn name(&self) -> &str {
        "zstd"
    }

    fn decode(&self, data: Vec<u8>, _info: &FilterInfo, _elem_size: usize) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        zstd::stream::copy_decode(std::io::Cursor::new(data), &mut out)
            .map_err(|e| filter_error(self.name(), e))?;
        Ok(out)
    }
}

// ---- Registry ----

/// Decoders by filter id. Shared read-only by concurrent workers.
#[derive(Clone)]
pub struct FilterRegistry {
    filters: HashMap<u16, Arc<dyn ChunkFilter>>,
}

impl FilterRegistry {
    pub fn empty() -> Self {
        FilterRegistry {
            filters: HashMap::new(),
        }
    }

    /// Deflate, shuffle, fletcher32 and zstd.
    pub fn with_builtins(verify_checksums: bool) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(Deflate));
        registry.register(Arc::new(Shuffle));
        registry.register(Arc::new(Fletcher32 {
            verify: verify_checksums,
        }));
        registry.register(Arc::new(Zstd));
        registry
    }

    /// Adds or replaces the decoder for `filter.id()`.
    pub fn register(&mut self, filter: Arc<dyn ChunkFilter>) {
        self.filters.insert(filter.id(), filter);
    }

    pub fn get(&self, id: u16) -> Option<&Arc<dyn ChunkFilter>> {
        self.filters.get(&id)
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::with_builtins(true)
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.filters.keys().collect();
        ids.sort();
        f.debug_struct("FilterRegistry").field("ids", &ids).finish()
    }
}
