//! Global heap collections and the side table of variable-length values.
//!
//! Variable-length elements are stored in fixed-size records holding a
//! reference into a global heap collection. Reading resolves every reference
//! into a [`HeapSideTable`] keyed by the record's byte offset; the raw record
//! buffer itself is never rewritten.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::error::Error;
use crate::io::{Cursor, OpenFile};

const GCOL_SIGNATURE: &[u8; 4] = b"GCOL";

/// One global heap collection, parsed eagerly.
#[derive(Debug, Clone)]
pub struct GlobalHeap {
    address: u64,
    objects: HashMap<u16, Vec<u8>>,
}

impl GlobalHeap {
    pub fn load(file: &OpenFile, address: u64) -> Result<Self, Error> {
        let ctx = file.ctx();
        let head = file.read_signed_block(address, 8 + ctx.length_size, GCOL_SIGNATURE)?;
        let mut c = Cursor::new(&head, ctx);
        c.skip(8)?;
        let size = c.read_length()? as usize;
        if size < head.len() {
            return Err(Error::InvalidFileStructure(format!(
                "Global heap at {} has size {}",
                address, size
            )));
        }
        let raw = file.read_bytes_upto(address, size)?;
        let mut c = Cursor::new(&raw, ctx);
        c.seek(head.len());

        let mut objects = HashMap::new();
        // object header: index(2) + refcount(2) + reserved(4) + size(L)
        while c.remaining() >= 8 + ctx.length_size {
            let index = c.read_u16()?;
            if index == 0 {
                break;
            }
            c.skip(6)?;
            let len = c.read_length()? as usize;
            let data = c.read_bytes(len)?;
            objects.insert(index, data.to_vec());
            let pad = (8 - len % 8) % 8;
            if c.remaining() < pad {
                break;
            }
            c.skip(pad)?;
        }
        debug!("Global heap at {}: {} objects", address, objects.len());
        Ok(GlobalHeap { address, objects })
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn object(&self, index: u16) -> Option<&[u8]> {
        self.objects.get(&index).map(|v| v.as_slice())
    }
}

/// Collections loaded so far, keyed by address. Safe to share between threads.
#[derive(Debug, Default)]
pub struct GlobalHeapCache {
    heaps: Mutex<HashMap<u64, Arc<GlobalHeap>>>,
}

impl GlobalHeapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, file: &OpenFile, address: u64) -> Result<Arc<GlobalHeap>, Error> {
        let mut heaps = self.heaps.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(heap) = heaps.get(&address) {
            return Ok(Arc::clone(heap));
        }
        let heap = Arc::new(GlobalHeap::load(file, address)?);
        heaps.insert(address, Arc::clone(&heap));
        Ok(heap)
    }
}

/// A variable-length element record: sequence length, collection, object index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlenRef {
    pub length: u32,
    pub collection: u64,
    pub index: u32,
}

impl VlenRef {
    /// On-disk record size.
    pub fn size(offset_size: usize) -> usize {
        4 + offset_size + 4
    }

    pub fn read(cursor: &mut Cursor<'_>) -> Result<Self, Error> {
        Ok(VlenRef {
            length: cursor.read_u32()?,
            collection: cursor.read_offset()?,
            index: cursor.read_u32()?,
        })
    }

    pub fn is_null(&self, file: &OpenFile) -> bool {
        self.length == 0 || self.collection == 0 || file.ctx().is_undefined(self.collection)
    }
}

/// Variable-length values of a record buffer, keyed by record byte offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapSideTable {
    values: BTreeMap<usize, Vec<u8>>,
}

impl HeapSideTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, offset: usize, value: Vec<u8>) {
        self.values.insert(offset, value);
    }

    pub fn get(&self, offset: usize) -> Option<&[u8]> {
        self.values.get(&offset).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values in record order.
    pub fn values(&self) -> impl Iterator<Item = (&usize, &Vec<u8>)> {
        self.values.iter()
    }

    /// Dereferences every record of `raw`. `base_size` is the size of one
    /// sequence element (1 for strings). Null references become empty values.
    pub fn resolve(
        file: &OpenFile,
        cache: &GlobalHeapCache,
        raw: &[u8],
        elem_size: usize,
        base_size: usize,
    ) -> Result<Self, Error> {
        let mut table = HeapSideTable::new();
        if elem_size == 0 {
            return Ok(table);
        }
        for (i, record) in raw.chunks_exact(elem_size).enumerate() {
            let offset = i * elem_size;
            let vref = VlenRef::read(&mut Cursor::new(record, file.ctx()))?;
            if vref.is_null(file) {
                table.insert(offset, Vec::new());
                continue;
            }
            let heap = cache.get(file, vref.collection)?;
            let index = u16::try_from(vref.index).map_err(|_| {
                Error::InvalidFileStructure(format!("Global heap index {} out of range", vref.index))
            })?;
            let value = match heap.object(index) {
                Some(data) => {
                    let want = (vref.length as usize).saturating_mul(base_size.max(1));
                    data[..want.min(data.len())].to_vec()
                }
                None => {
                    warn!(
                        "Global heap {} has no object {}, using an empty value",
                        vref.collection, index
                    );
                    Vec::new()
                }
            };
            table.insert(offset, value);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{Hdf5Ctx, MemorySource};

    fn collection(objects: &[(u16, &[u8])]) -> Vec<u8> {
        let mut b = GCOL_SIGNATURE.to_vec();
        b.extend_from_slice(&[1, 0, 0, 0]);
        b.extend_from_slice(&4096u64.to_le_bytes());
        for (index, data) in objects {
            b.extend_from_slice(&index.to_le_bytes());
            b.extend_from_slice(&1u16.to_le_bytes());
            b.extend_from_slice(&[0; 4]);
            b.extend_from_slice(&(data.len() as u64).to_le_bytes());
            b.extend_from_slice(data);
            b.resize(b.len().div_ceil(8) * 8, 0);
        }
        b.resize(4096, 0);
        b
    }

    fn vlen(length: u32, collection: u64, index: u32) -> Vec<u8> {
        let mut b = length.to_le_bytes().to_vec();
        b.extend_from_slice(&collection.to_le_bytes());
        b.extend_from_slice(&index.to_le_bytes());
        b
    }

    #[test]
    fn test_collection_objects() {
        let bytes = collection(&[(1, b"first"), (2, b"second value")]);
        let file = OpenFile::new(Box::new(MemorySource::new(bytes)), Hdf5Ctx::default(), 0);
        let heap = GlobalHeap::load(&file, 0).unwrap();
        assert_eq!(heap.object(1), Some(&b"first"[..]));
        assert_eq!(heap.object(2), Some(&b"second value"[..]));
        assert_eq!(heap.object(3), None);
    }

    #[test]
    fn test_side_table_keyed_by_record_offset() {
        let mut bytes = vec![0u8; 64];
        bytes.extend(collection(&[(1, b"alpha"), (2, b"be")]));
        let file = OpenFile::new(Box::new(MemorySource::new(bytes)), Hdf5Ctx::default(), 0);
        let cache = GlobalHeapCache::new();

        let mut records = vlen(5, 64, 1);
        records.extend(vlen(0, 0, 0));
        records.extend(vlen(2, 64, 2));
        let table = HeapSideTable::resolve(&file, &cache, &records, 16, 1).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(0), Some(&b"alpha"[..]));
        assert_eq!(table.get(16), Some(&b""[..]));
        assert_eq!(table.get(32), Some(&b"be"[..]));
        // the raw records are untouched
        assert_eq!(&records[..4], &5u32.to_le_bytes());
    }
}
