//! Serial reads: assembling a region from chunks, and iterating a variable
//! piece by piece.

use log::{debug, trace};

use crate::chunk_index::{open_chunk_index, ChunkIndex, ChunkLocation, ChunkPlan};
use crate::chunker::{fill_elements, Chunker};
use crate::decode::{decode_array, vlen_base_size};
use crate::error::Error;
use crate::filters::FilterRegistry;
use crate::global_heap::{GlobalHeapCache, HeapSideTable};
use crate::io::OpenFile;
use crate::layout::DataLayout;
use crate::max_chunker::MaxChunker;
use crate::models::{ArraySection, TypedArray, VariableInfo};
use crate::section::IndexSpace;

/// Per-variable decoding context: immutable, shared by every worker.
#[derive(Debug, Clone)]
pub struct ChunkDecoder {
    var: VariableInfo,
    registry: FilterRegistry,
}

impl ChunkDecoder {
    pub fn new(var: &VariableInfo, registry: FilterRegistry) -> Self {
        ChunkDecoder {
            var: var.clone(),
            registry,
        }
    }

    pub fn variable(&self) -> &VariableInfo {
        &self.var
    }

    fn elem_size(&self) -> usize {
        self.var.elem_size()
    }

    /// Extent of a chunk in variable index space.
    pub fn chunk_space(&self, location: &ChunkLocation) -> Result<IndexSpace, Error> {
        let dims = self.var.layout.chunk_dims().ok_or_else(|| {
            Error::UnsupportedLayout(format!("{} has no chunks", self.var.layout.name()))
        })?;
        Ok(location.space(dims))
    }

    /// The chunk's bytes after the filter pipeline; fill for a missing chunk.
    pub fn chunk_bytes(&self, file: &OpenFile, location: &ChunkLocation) -> Result<Vec<u8>, Error> {
        let space = self.chunk_space(location)?;
        if location.is_missing() {
            trace!("missing chunk {:?}", location.offsets);
            return Ok(fill_elements(
                &self.var.fill_value,
                self.elem_size(),
                space.total_elements() as usize,
            ));
        }
        let raw = file.read_bytes(location.address, location.size_on_disk as usize)?;
        match location.filter_mask {
            Some(mask) if !self.var.filters.is_empty() => {
                self.var.filters.apply(raw, mask, &self.registry, self.elem_size())
            }
            _ => Ok(raw),
        }
    }

    /// Copies the part of one chunk inside `want` into `dest`, laid out as `want`.
    pub fn transfer(
        &self,
        file: &OpenFile,
        location: &ChunkLocation,
        want: &IndexSpace,
        dest: &mut [u8],
    ) -> Result<(), Error> {
        let chunker = Chunker::new(&self.chunk_space(location)?, want);
        if chunker.nelems() == 0 {
            return Ok(());
        }
        if location.is_missing() {
            return chunker.transfer_missing(&self.var.fill_value, self.elem_size(), dest);
        }
        let data = self.chunk_bytes(file, location)?;
        chunker.transfer_ba(&data, self.elem_size(), dest)?;
        Ok(())
    }

    /// Decodes the part of one chunk inside `want`; `None` if they do not meet.
    pub fn section(
        &self,
        file: &OpenFile,
        heap_cache: &GlobalHeapCache,
        location: &ChunkLocation,
        want: &IndexSpace,
    ) -> Result<Option<ArraySection>, Error> {
        let space = self.chunk_space(location)?;
        let section = want.intersect(&space);
        if section.is_empty() {
            return Ok(None);
        }
        let data = self.chunk_bytes(file, location)?;
        let bytes = Chunker::new(&space, &section).copy_out(&data, self.elem_size())?;
        let array = self.decode(file, heap_cache, &bytes, section.shape())?;
        Ok(Some(ArraySection { array, section }))
    }

    /// Decodes bytes laid out as `shape`, resolving variable-length values.
    pub fn decode(
        &self,
        file: &OpenFile,
        heap_cache: &GlobalHeapCache,
        bytes: &[u8],
        shape: &[i64],
    ) -> Result<TypedArray, Error> {
        let element = &self.var.element;
        if element.dtype.is_vlen() {
            let heap = HeapSideTable::resolve(file, heap_cache, bytes, element.size, vlen_base_size(element))?;
            return decode_array(bytes, element, shape, Some(&heap));
        }
        decode_array(bytes, element, shape, None)
    }
}

/// Assembles the bytes of `want` from the chunks of `index`.
pub fn read_region(
    file: &OpenFile,
    index: &dyn ChunkIndex,
    decoder: &ChunkDecoder,
    want: &IndexSpace,
) -> Result<Vec<u8>, Error> {
    let elem_size = decoder.elem_size();
    let mut dest = vec![0u8; want.total_elements() as usize * elem_size];
    let mut nchunks = 0;
    for location in ChunkPlan::new(index, want)? {
        decoder.transfer(file, &location?, want, &mut dest)?;
        nchunks += 1;
    }
    debug!(
        "read {} from {} chunks of {} index",
        want,
        nchunks,
        index.kind()
    );
    Ok(dest)
}

/// Bytes of `want` from a contiguous layout; unallocated storage reads as fill.
pub fn read_contiguous(file: &OpenFile, var: &VariableInfo, address: u64, want: &IndexSpace) -> Result<Vec<u8>, Error> {
    let elem_size = var.elem_size();
    let full = IndexSpace::from_shape(&var.shape);
    let mut dest = vec![0u8; want.total_elements() as usize * elem_size];
    let chunker = Chunker::new(&full, want);
    if address == 0 || file.ctx().is_undefined(address) {
        chunker.transfer_missing(&var.fill_value, elem_size, &mut dest)?;
        return Ok(dest);
    }
    for run in chunker {
        let n = run.nelems * elem_size;
        let d = run.dest_elem * elem_size;
        let bytes = file.read_bytes(address + (run.src_elem * elem_size) as u64, n)?;
        dest[d..d + n].copy_from_slice(&bytes);
    }
    Ok(dest)
}

/// Bytes of `want` from data stored inside the object header.
pub fn read_compact(var: &VariableInfo, data: &[u8], want: &IndexSpace) -> Result<Vec<u8>, Error> {
    let elem_size = var.elem_size();
    let mut dest = vec![0u8; want.total_elements() as usize * elem_size];
    Chunker::new(&IndexSpace::from_shape(&var.shape), want).transfer_ba(data, elem_size, &mut dest)?;
    Ok(dest)
}

/// Bytes of `want` for any readable layout.
pub fn read_bytes(
    file: &OpenFile,
    decoder: &ChunkDecoder,
    want: &IndexSpace,
    max_depth: usize,
) -> Result<Vec<u8>, Error> {
    let var = decoder.variable();
    match &var.layout {
        DataLayout::Compact { data } => read_compact(var, data, want),
        DataLayout::Contiguous { address, .. } => read_contiguous(file, var, *address, want),
        DataLayout::Virtual { .. } => Err(Error::UnsupportedLayout("virtual".to_string())),
        DataLayout::BTreeV1 { .. }
        | DataLayout::SingleChunk { .. }
        | DataLayout::Implicit { .. }
        | DataLayout::FixedArray { .. }
        | DataLayout::ExtensibleArray { .. }
        | DataLayout::BTreeV2 { .. } => {
            let index = open_chunk_index(
                file,
                &var.layout,
                &var.shape,
                var.max_shape.as_deref(),
                max_depth,
            )?;
            read_region(file, index.as_ref(), decoder, want)
        }
    }
}

// ---- Serial section iterator ----

/// One unit of work when a variable is read piece by piece.
#[derive(Debug, Clone)]
pub enum Piece {
    Chunk(ChunkLocation),
    Region(IndexSpace),
}

/// Pieces covering `want`: chunks for chunked layouts, bounded regions otherwise.
pub fn plan_pieces<'f>(
    file: &'f OpenFile,
    var: &VariableInfo,
    want: &IndexSpace,
    max_section_elements: usize,
    max_depth: usize,
) -> Result<Box<dyn Iterator<Item = Result<Piece, Error>> + 'f>, Error> {
    match &var.layout {
        DataLayout::Virtual { .. } => Err(Error::UnsupportedLayout("virtual".to_string())),
        layout if layout.is_chunked() => {
            let index = open_chunk_index(file, layout, &var.shape, var.max_shape.as_deref(), max_depth)?;
            let locations: Vec<_> = ChunkPlan::new(index.as_ref(), want)?.collect();
            Ok(Box::new(locations.into_iter().map(|l| l.map(Piece::Chunk))))
        }
        _ if want.is_empty() => Ok(Box::new(std::iter::empty())),
        _ => Ok(Box::new(
            MaxChunker::new(max_section_elements, &want.section()).map(|s| Ok(Piece::Region(s))),
        )),
    }
}

/// Reads and decodes one piece; `None` if it holds nothing of `want`.
pub fn decode_piece(
    file: &OpenFile,
    decoder: &ChunkDecoder,
    heap_cache: &GlobalHeapCache,
    piece: &Piece,
    want: &IndexSpace,
    max_depth: usize,
) -> Result<Option<ArraySection>, Error> {
    match piece {
        Piece::Chunk(location) => decoder.section(file, heap_cache, location, want),
        Piece::Region(space) => {
            let bytes = read_bytes(file, decoder, space, max_depth)?;
            let array = decoder.decode(file, heap_cache, &bytes, space.shape())?;
            Ok(Some(ArraySection {
                array,
                section: space.clone(),
            }))
        }
    }
}

/// Yields a variable as `(section, array)` pieces, in plan order.
pub struct ChunkSectionIter<'a> {
    file: &'a OpenFile,
    decoder: ChunkDecoder,
    heap_cache: &'a GlobalHeapCache,
    want: IndexSpace,
    pieces: std::vec::IntoIter<Piece>,
    max_depth: usize,
}

impl<'a> ChunkSectionIter<'a> {
    pub fn new(
        file: &'a OpenFile,
        decoder: ChunkDecoder,
        heap_cache: &'a GlobalHeapCache,
        want: IndexSpace,
        max_section_elements: usize,
        max_depth: usize,
    ) -> Result<Self, Error> {
        let pieces = plan_pieces(file, decoder.variable(), &want, max_section_elements, max_depth)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ChunkSectionIter {
            file,
            decoder,
            heap_cache,
            want,
            pieces: pieces.into_iter(),
            max_depth,
        })
    }
}

impl Iterator for ChunkSectionIter<'_> {
    type Item = Result<ArraySection, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let piece = self.pieces.next()?;
            let result = decode_piece(self.file, &self.decoder, self.heap_cache, &piece, &self.want, self.max_depth);
            match result {
                Ok(None) => continue,
                Ok(Some(section)) => return Some(Ok(section)),
                Err(e) => {
                    self.pieces = Vec::new().into_iter();
                    return Some(Err(e));
                }
            }
        }
    }
}
