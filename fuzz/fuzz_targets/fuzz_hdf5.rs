#![no_main]
use h5chunk::{Hdf5Reader, ReaderConfig};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    let config = ReaderConfig {
        max_recursion_depth: 16,
        max_section_elements: 4096,
        ..ReaderConfig::default()
    };
    let opener = Arc::new(h5chunk::MemoryOpener::new(data.to_vec()));
    let reader = match Hdf5Reader::open_with(opener, config) {
        Ok(r) => r,
        Err(_) => return,
    };

    for name in reader.variable_names() {
        let Ok(var) = reader.variable(&name) else {
            continue;
        };
        // Malformed shapes can claim huge extents; only read what is plausibly on disk.
        if var.total_elements() as u64 > data.len() as u64 * 64 {
            continue;
        }
        let _ = reader.read(&var, None);
        if let Ok(iter) = reader.chunk_iter(&var, None) {
            for piece in iter.take(64) {
                let _ = piece;
            }
        }
        if let Ok(iter) = reader.concurrent_chunk_iter(&var, None, Some(2)) {
            for piece in iter.take(64) {
                let _ = piece;
            }
        }
    }
});
