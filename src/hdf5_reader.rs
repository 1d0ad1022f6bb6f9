//! HDF5 file reader.
//!
//! Opens a file through a [`SourceOpener`], locates the superblock, builds the
//! group hierarchy and reads datasets whole, by section, or chunk by chunk
//! (serially or on a pool of worker threads).

use std::path::Path;
use std::sync::Arc;

use log::debug;

use crate::chunk_index::{open_chunk_index, ChunkIndex};
use crate::chunk_reader::{read_bytes, ChunkDecoder, ChunkSectionIter};
use crate::concurrent::{self, ConcurrentChunkIter, ConcurrentRead};
use crate::config::ReaderConfig;
use crate::decode::decode_array;
use crate::error::Error;
use crate::filters::FilterRegistry;
use crate::global_heap::GlobalHeapCache;
use crate::group::GroupArena;
use crate::io::{MemoryOpener, OpenFile, PathOpener, SourceOpener};
use crate::models::{ArraySection, TypedArray, VariableInfo};
use crate::object_header::ObjectHeader;
use crate::section::{IndexSpace, SectionPartial};
use crate::superblock::Superblock;

// ---- Hdf5Reader ----

/// Reader for HDF5 (.h5 / .hdf5) files.
///
/// Holds one open source for metadata and serial reads. Concurrent reads open
/// a private source per worker through the same opener.
pub struct Hdf5Reader {
    opener: Arc<dyn SourceOpener>,
    file: OpenFile,
    superblock: Superblock,
    config: Arc<ReaderConfig>,
    registry: FilterRegistry,
    heap_cache: GlobalHeapCache,
    groups: GroupArena,
}

impl Hdf5Reader {
    /// Opens an HDF5 file using memory mapping and the default configuration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with(Arc::new(PathOpener::new(path.as_ref())), ReaderConfig::default())
    }

    /// Reads a file held in memory.
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Result<Self, Error> {
        Self::open_with(Arc::new(MemoryOpener::new(bytes)), ReaderConfig::default())
    }

    pub fn open_with(opener: Arc<dyn SourceOpener>, config: ReaderConfig) -> Result<Self, Error> {
        let source = opener.open()?;
        if source.len() < 16 {
            return Err(Error::InvalidFileStructure(
                "File too small to be a valid HDF5 file".to_string(),
            ));
        }
        let superblock = Superblock::find(source.as_ref())?;
        let file = OpenFile::new(source, superblock.ctx, superblock.base_address);
        let groups = GroupArena::build(&file, &superblock.root, config.max_recursion_depth)?;
        debug!("opened {}: {} groups", opener.location(), groups.len());
        Ok(Hdf5Reader {
            opener,
            file,
            superblock,
            registry: FilterRegistry::with_builtins(config.verify_checksums),
            config: Arc::new(config),
            heap_cache: GlobalHeapCache::new(),
            groups,
        })
    }

    /// Replaces the filter decoders, e.g. to add a custom filter.
    pub fn with_registry(mut self, registry: FilterRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn groups(&self) -> &GroupArena {
        &self.groups
    }

    pub fn file(&self) -> &OpenFile {
        &self.file
    }

    /// Absolute paths of every dataset.
    pub fn variable_names(&self) -> Vec<String> {
        self.groups.datasets().into_iter().map(|(path, _)| path).collect()
    }

    /// Describes the dataset at `path`.
    pub fn variable(&self, path: &str) -> Result<VariableInfo, Error> {
        let address = self
            .groups
            .find_dataset(path)
            .ok_or_else(|| Error::ObjectNotFound(path.to_string()))?;
        let depth = self.config.max_recursion_depth;
        let header = ObjectHeader::read(&self.file, address, depth)?;
        VariableInfo::from_header(&self.file, path, &header, depth)
    }

    /// The chunk index of a chunked variable.
    pub fn chunk_index(&self, var: &VariableInfo) -> Result<Box<dyn ChunkIndex + '_>, Error> {
        open_chunk_index(
            &self.file,
            &var.layout,
            &var.shape,
            var.max_shape.as_deref(),
            self.config.max_recursion_depth,
        )
    }

    fn want_space(var: &VariableInfo, want: Option<&SectionPartial>) -> Result<IndexSpace, Error> {
        let section = SectionPartial::fill(want, &var.shape)?;
        Ok(IndexSpace::from_section(&section))
    }

    fn decoder(&self, var: &VariableInfo) -> ChunkDecoder {
        ChunkDecoder::new(var, self.registry.clone())
    }

    // ---- Serial reads ----

    /// Reads `want` (everything if `None`) into one typed array.
    pub fn read(&self, var: &VariableInfo, want: Option<&SectionPartial>) -> Result<TypedArray, Error> {
        let space = Self::want_space(var, want)?;
        if space.is_empty() {
            return decode_array(&[], &var.element, space.shape(), None);
        }
        let decoder = self.decoder(var);
        let bytes = read_bytes(&self.file, &decoder, &space, self.config.max_recursion_depth)?;
        decoder.decode(&self.file, &self.heap_cache, &bytes, space.shape())
    }

    /// Yields `want` piece by piece: one piece per chunk for chunked layouts,
    /// bounded pieces otherwise.
    pub fn chunk_iter(&self, var: &VariableInfo, want: Option<&SectionPartial>) -> Result<ChunkSectionIter<'_>, Error> {
        let space = Self::want_space(var, want)?;
        ChunkSectionIter::new(
            &self.file,
            self.decoder(var),
            &self.heap_cache,
            space,
            self.config.max_section_elements,
            self.config.max_recursion_depth,
        )
    }

    // ---- Concurrent reads ----

    fn concurrent_read(
        &self,
        var: &VariableInfo,
        want: Option<&SectionPartial>,
        nthreads: Option<usize>,
    ) -> Result<ConcurrentRead, Error> {
        Ok(ConcurrentRead {
            opener: Arc::clone(&self.opener),
            ctx: self.file.ctx(),
            base_address: self.file.base_address(),
            decoder: Arc::new(self.decoder(var)),
            want: Self::want_space(var, want)?,
            nthreads: self.config.resolve_threads(nthreads),
            config: Arc::clone(&self.config),
        })
    }

    /// Reads `want` on worker threads, handing each decoded section to
    /// `on_chunk` as it arrives. `done` runs exactly once: after every worker
    /// has exited, or before returning if the read never started.
    pub fn read_chunks_concurrent<F, D>(
        &self,
        var: &VariableInfo,
        want: Option<&SectionPartial>,
        nthreads: Option<usize>,
        on_chunk: F,
        done: D,
    ) -> Result<(), Error>
    where
        F: FnMut(ArraySection),
        D: FnOnce(),
    {
        let read = match self.concurrent_read(var, want, nthreads) {
            Ok(read) => read,
            Err(e) => {
                done();
                return Err(e);
            }
        };
        concurrent::read_chunks_concurrent(read, on_chunk, done)
    }

    /// Iterator over sections decoded on worker threads, in completion order.
    pub fn concurrent_chunk_iter(
        &self,
        var: &VariableInfo,
        want: Option<&SectionPartial>,
        nthreads: Option<usize>,
    ) -> Result<ConcurrentChunkIter, Error> {
        ConcurrentChunkIter::spawn(self.concurrent_read(var, want, nthreads)?)
    }
}
