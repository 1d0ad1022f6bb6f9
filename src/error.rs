//! Error types for chunked HDF5 reads.

use thiserror::Error;

/// All errors that can occur while locating, reading or decoding chunked data.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying byte source.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A read ran past the end of the file or of a parsed block.
    #[error("Unexpected end of file")]
    UnexpectedEof,

    /// No HDF5 superblock signature was found.
    #[error("Invalid magic number. Expected HDF5 signature, found {found:?}")]
    InvalidMagicNumber { found: Vec<u8> },

    /// An on-disk structure did not start with its signature.
    #[error("Expected {expected} signature at address {address}, found {found:?}")]
    InvalidSignature {
        expected: String,
        found: Vec<u8>,
        address: u64,
    },

    /// File structure is invalid (wrong node type, impossible sizes, broken links).
    #[error("Invalid file structure: {0}")]
    InvalidFileStructure(String),

    /// Physical layout recognized but not readable.
    #[error("Unsupported data layout: {0}")]
    UnsupportedLayout(String),

    /// Non-optional filter with no registered decoder.
    #[error("Unsupported filter {id} ({name})")]
    UnsupportedFilter { id: u16, name: String },

    /// Datatype that cannot be decoded into a typed array.
    #[error("Unsupported dtype: {0}")]
    UnsupportedDType(String),

    /// Requested region lies outside the addressable index space.
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Section string could not be parsed.
    #[error("Invalid section: {0}")]
    InvalidSection(String),

    /// Huge fractal heap object with no way to locate it.
    #[error("Cannot resolve huge heap object: {0}")]
    HugeObjectUnresolved(String),

    /// A filter failed to decode chunk bytes.
    #[error("Filter '{filter}' failed: {message}")]
    Filter { filter: String, message: String },

    /// Checksum verification failed.
    #[error("Checksum mismatch in {context}. Expected: {expected:#010x}, Got: {calculated:#010x}")]
    ChecksumMismatch {
        context: String,
        expected: u32,
        calculated: u32,
    },

    /// Requested dataset or group not found.
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// A concurrent read worker failed or panicked.
    #[error("Worker failed: {0}")]
    Worker(String),

    /// Other unspecified error.
    #[error("{0}")]
    Other(String),
}
