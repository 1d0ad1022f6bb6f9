//! Concurrent chunk reading.
//!
//! A producer thread plans the pieces of the wanted region and feeds them
//! through a bounded work queue to a pool of workers. Each worker opens its
//! own handle on the file, reads, filters and decodes, and sends the decoded
//! section to the consumer over a second bounded queue. Results arrive in
//! no particular order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::chunk_reader::{decode_piece, plan_pieces, ChunkDecoder, Piece};
use crate::config::ReaderConfig;
use crate::error::Error;
use crate::global_heap::GlobalHeapCache;
use crate::io::{Hdf5Ctx, OpenFile, SourceOpener};
use crate::models::ArraySection;
use crate::section::IndexSpace;

/// Everything a concurrent read needs, owned so threads can outlive the caller's borrows.
#[derive(Clone)]
pub struct ConcurrentRead {
    pub opener: Arc<dyn SourceOpener>,
    pub ctx: Hdf5Ctx,
    pub base_address: u64,
    pub decoder: Arc<ChunkDecoder>,
    pub want: IndexSpace,
    pub nthreads: usize,
    pub config: Arc<ReaderConfig>,
}

/// State shared by the producer, the workers and the consumer.
struct Shared {
    abort_flag: AtomicBool,
    error_capture: Mutex<Option<Error>>,
}

impl Shared {
    fn signal_error(&self, err: Error) {
        let mut guard = self.error_capture.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_none() {
            *guard = Some(err);
        }
        self.abort_flag.store(true, Ordering::SeqCst);
    }

    fn abort(&self) {
        self.abort_flag.store(true, Ordering::SeqCst);
    }

    fn should_abort(&self) -> bool {
        self.abort_flag.load(Ordering::Relaxed)
    }

    fn take_error(&self) -> Option<Error> {
        self.error_capture.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

/// Iterator over decoded sections produced by background workers.
///
/// Ends after every thread has exited; a failure in any thread is yielded
/// once, as the last item. Dropping the iterator stops the workers.
pub struct ConcurrentChunkIter {
    results: Option<Receiver<ArraySection>>,
    handles: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl ConcurrentChunkIter {
    pub fn spawn(read: ConcurrentRead) -> Result<Self, Error> {
        let nthreads = read.nthreads.max(1);
        let (work_tx, work_rx) = sync_channel::<Piece>(read.config.work_queue_depth.max(1));
        let (result_tx, result_rx) = sync_channel::<ArraySection>(read.config.result_queue_depth.max(1));
        let work_rx = Arc::new(Mutex::new(work_rx));
        let shared = Arc::new(Shared {
            abort_flag: AtomicBool::new(false),
            error_capture: Mutex::new(None),
        });
        debug!(
            "concurrent read of {} over {} with {} workers",
            read.decoder.variable().name,
            read.want,
            nthreads
        );

        let mut handles = Vec::with_capacity(nthreads + 1);
        {
            let read = read.clone();
            let shared = Arc::clone(&shared);
            handles.push(
                thread::Builder::new()
                    .name("h5chunk-producer".to_string())
                    .spawn(move || produce(read, work_tx, &shared))?,
            );
        }
        for i in 0..nthreads {
            let read = read.clone();
            let shared = Arc::clone(&shared);
            let work_rx = Arc::clone(&work_rx);
            let result_tx = result_tx.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("h5chunk-worker-{}", i))
                    .spawn(move || work(read, &work_rx, result_tx, &shared))?,
            );
        }

        Ok(ConcurrentChunkIter {
            results: Some(result_rx),
            handles,
            shared,
        })
    }

    /// Waits for every thread and reports the first failure.
    fn join(&mut self) -> Result<(), Error> {
        let mut panicked = false;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                panicked = true;
            }
        }
        if let Some(err) = self.shared.take_error() {
            return Err(err);
        }
        if panicked {
            return Err(Error::Worker("a chunk reader thread panicked".to_string()));
        }
        Ok(())
    }

    /// Drains nothing further; joins the threads and returns any failure not yet yielded.
    pub fn finish(mut self) -> Result<(), Error> {
        if self.results.is_some() {
            self.shared.abort();
            self.results = None;
        }
        self.join()
    }
}

impl Iterator for ConcurrentChunkIter {
    type Item = Result<ArraySection, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let received = self.results.as_ref()?.recv();
        match received {
            Ok(section) => Some(Ok(section)),
            Err(_) => {
                // every worker has hung up
                self.results = None;
                self.join().err().map(Err)
            }
        }
    }
}

impl Drop for ConcurrentChunkIter {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.shared.abort();
        self.results = None;
        if let Err(e) = self.join() {
            debug!("concurrent read dropped after failure: {}", e);
        }
    }
}

fn produce(read: ConcurrentRead, work_tx: SyncSender<Piece>, shared: &Shared) {
    let file = match OpenFile::reopen(read.opener.as_ref(), read.ctx, read.base_address) {
        Ok(file) => file,
        Err(e) => return shared.signal_error(e),
    };
    let pieces = match plan_pieces(
        &file,
        read.decoder.variable(),
        &read.want,
        read.config.max_section_elements,
        read.config.max_recursion_depth,
    ) {
        Ok(pieces) => pieces,
        Err(e) => return shared.signal_error(e),
    };
    let mut sent = 0usize;
    for piece in pieces {
        if shared.should_abort() {
            break;
        }
        match piece {
            Ok(piece) => {
                if work_tx.send(piece).is_err() {
                    break;
                }
                sent += 1;
            }
            Err(e) => return shared.signal_error(e),
        }
        thread::yield_now();
    }
    debug!("producer queued {} pieces", sent);
}

fn work(
    read: ConcurrentRead,
    work_rx: &Mutex<Receiver<Piece>>,
    result_tx: SyncSender<ArraySection>,
    shared: &Shared,
) {
    let file = match OpenFile::reopen(read.opener.as_ref(), read.ctx, read.base_address) {
        Ok(file) => file,
        Err(e) => return shared.signal_error(e),
    };
    let heap_cache = GlobalHeapCache::new();
    let max_depth = read.config.max_recursion_depth;
    loop {
        if shared.should_abort() {
            break;
        }
        let piece = {
            let rx = work_rx.lock().unwrap_or_else(|p| p.into_inner());
            match rx.recv() {
                Ok(piece) => piece,
                Err(_) => break,
            }
        };
        match decode_piece(&file, &read.decoder, &heap_cache, &piece, &read.want, max_depth) {
            Ok(Some(section)) => {
                if result_tx.send(section).is_err() {
                    shared.abort();
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("chunk read failed: {}", e);
                return shared.signal_error(e);
            }
        }
    }
}

/// Runs a concurrent read to completion, handing each section to `on_chunk`
/// on the calling thread. `done` runs once, after every worker has exited,
/// whether or not the read succeeded.
pub fn read_chunks_concurrent<F, D>(read: ConcurrentRead, mut on_chunk: F, done: D) -> Result<(), Error>
where
    F: FnMut(ArraySection),
    D: FnOnce(),
{
    let mut iter = match ConcurrentChunkIter::spawn(read) {
        Ok(iter) => iter,
        Err(e) => {
            done();
            return Err(e);
        }
    };
    let mut failure = None;
    for item in iter.by_ref() {
        match item {
            Ok(section) => on_chunk(section),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    let joined = iter.finish();
    done();
    match failure {
        Some(e) => Err(e),
        None => joined,
    }
}
