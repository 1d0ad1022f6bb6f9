//! Read-only access to chunked HDF5 datasets.
//!
//! Locates the chunks of a dataset through whichever index the file uses,
//! runs them through the filter pipeline, and assembles any rectangular
//! section, either serially or on a pool of worker threads.

pub mod btree1;
pub mod btree2;
pub mod chunk_index;
pub mod chunk_reader;
pub mod chunker;
pub mod concurrent;
pub mod config;
pub mod decode;
pub mod error;
pub mod extensible_array;
pub mod filters;
pub mod fixed_array;
pub mod fractal_heap;
pub mod global_heap;
pub mod group;
pub mod hdf5_reader;
pub mod index_nd;
pub mod io;
pub mod layout;
pub mod max_chunker;
pub mod messages;
pub mod models;
pub mod object_header;
pub mod section;
pub mod superblock;
pub mod symbol_table;
pub mod tiling;

pub use chunk_index::{ChunkIndex, ChunkLocation, ChunkPlan};
pub use chunker::Chunker;
pub use concurrent::ConcurrentChunkIter;
pub use config::ReaderConfig;
pub use error::Error;
pub use filters::{ChunkFilter, FilterPipeline, FilterRegistry};
pub use hdf5_reader::Hdf5Reader;
pub use io::{ByteSource, MemoryOpener, OpenFile, PathOpener, SourceOpener};
pub use layout::DataLayout;
pub use models::{ArrayData, ArraySection, DType, ElementType, TypedArray, VariableInfo};
pub use section::{IndexSpace, Range, Section, SectionPartial};
pub use tiling::Tiling;
