//! Reader configuration.

use serde::{Deserialize, Serialize};

/// Default number of elements per piece when iterating a non-chunked variable.
pub const DEFAULT_MAX_SECTION_ELEMENTS: usize = 100_000;

/// Tuning knobs shared read-only by every reader and worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Worker threads for concurrent reads. `None` uses half the available parallelism.
    pub nthreads: Option<usize>,
    /// Capacity of the producer to worker queue of chunk locations.
    pub work_queue_depth: usize,
    /// Capacity of the worker to consumer queue of decoded sections.
    pub result_queue_depth: usize,
    /// Largest piece yielded by the serial iterator over compact and contiguous data.
    pub max_section_elements: usize,
    /// Verify Fletcher-32 checksums when that filter is present.
    pub verify_checksums: bool,
    /// Bound on every recursive structure walk (B-trees, group nesting, header continuations).
    pub max_recursion_depth: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            nthreads: None,
            work_queue_depth: 32,
            result_queue_depth: 10,
            max_section_elements: DEFAULT_MAX_SECTION_ELEMENTS,
            verify_checksums: true,
            max_recursion_depth: 64,
        }
    }
}

impl ReaderConfig {
    /// Thread count for a concurrent read: the explicit request, else the configured
    /// value, else half the available parallelism. Never less than one.
    pub fn resolve_threads(&self, requested: Option<usize>) -> usize {
        requested
            .or(self.nthreads)
            .unwrap_or_else(default_threads)
            .max(1)
    }
}

/// Half the platform's available parallelism, at least one.
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}
