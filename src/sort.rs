//! External sorter. Splits a line source into sorted chunk files.

use log;
use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::thread;

use rayon::slice::ParallelSliceMut;

use crate::buffer::RecordBatch;
use crate::chunk::{self, chunk_path};
use crate::codec::{RecordCodec, RmpCodec};
use crate::file;

/// Default capacity of the line prefetch queue.
pub const DEFAULT_PREFETCH_CAPACITY: usize = 10_000;

/// Sorting error.
#[derive(Debug)]
pub enum SortError<S: Error, D: Error> {
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Common I/O error on chunk files or output sinks.
    IO(io::Error),
    /// Data serialization error.
    SerializationError(S),
    /// Data deserialization error.
    DeserializationError(D),
    /// Input data source error
    InputError(io::Error),
}

impl<S, D> Error for SortError<S, D>
where
    S: Error + 'static,
    D: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            SortError::ThreadPoolBuildError(err) => err,
            SortError::IO(err) => err,
            SortError::SerializationError(err) => err,
            SortError::DeserializationError(err) => err,
            SortError::InputError(err) => err,
        })
    }
}

impl<S: Error, D: Error> Display for SortError<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::SerializationError(err) => write!(f, "data serialization error: {}", err),
            SortError::DeserializationError(err) => write!(f, "data deserialization error: {}", err),
            SortError::InputError(err) => write!(f, "input data source error: {}", err),
        }
    }
}

/// Chunk splitting error.
///
/// Carries the chunks that were completely written before the failure. They stay valid and the caller owns
/// them the same way as after a successful split.
#[derive(Debug)]
pub struct SplitError<S: Error, D: Error> {
    /// Chunks created before the failure.
    pub chunks: Vec<PathBuf>,
    /// The failure itself.
    pub error: SortError<S, D>,
}

impl<S, D> Error for SplitError<S, D>
where
    S: Error + 'static,
    D: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.error)
    }
}

impl<S: Error, D: Error> Display for SplitError<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} chunks created)", self.error, self.chunks.len())
    }
}

type CodecSortError<T, C> =
    SortError<<C as RecordCodec<T>>::SerializationError, <C as RecordCodec<T>>::DeserializationError>;
type CodecSplitError<T, C> =
    SplitError<<C as RecordCodec<T>>::SerializationError, <C as RecordCodec<T>>::DeserializationError>;

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder<T, C = RmpCodec<T>>
where
    T: Send,
    C: RecordCodec<T>,
{
    /// Number of threads to be used to sort data in parallel.
    threads_number: Option<usize>,
    /// Directory to store chunks in.
    chunk_dir: Option<Box<Path>>,
    /// Chunk file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Input bytes consumed by a batch before it is spilled.
    memory_budget: u64,
    /// Capacity of the line prefetch queue.
    prefetch_capacity: usize,
    /// Chunk zstd compression level.
    compression_level: i32,

    /// Record codec type.
    codec_type: PhantomData<C>,
    /// Record type.
    item_type: PhantomData<T>,
}

impl<T, C> ExternalSorterBuilder<T, C>
where
    T: Send,
    C: RecordCodec<T>,
{
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<T, C>, CodecSortError<T, C>> {
        ExternalSorter::new(
            self.threads_number,
            self.chunk_dir.as_deref(),
            self.memory_budget,
            self.rw_buf_size,
            self.prefetch_capacity,
            self.compression_level,
        )
    }

    /// Sets number of threads to be used to sort data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder<T, C> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store chunks. By default chunks are stored next to the source.
    pub fn with_chunk_dir(mut self, path: &Path) -> ExternalSorterBuilder<T, C> {
        self.chunk_dir = Some(path.into());
        return self;
    }

    /// Sets number of input line bytes a batch accumulates before it is sorted and saved.
    pub fn with_memory_budget(mut self, budget: u64) -> ExternalSorterBuilder<T, C> {
        self.memory_budget = budget;
        return self;
    }

    /// Sets chunk read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder<T, C> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets the number of lines read ahead of parsing.
    pub fn with_prefetch_capacity(mut self, capacity: usize) -> ExternalSorterBuilder<T, C> {
        self.prefetch_capacity = capacity;
        return self;
    }

    /// Sets chunk compression level. `0` selects the zstd default.
    pub fn with_compression_level(mut self, level: i32) -> ExternalSorterBuilder<T, C> {
        self.compression_level = level;
        return self;
    }
}

impl<T, C> Default for ExternalSorterBuilder<T, C>
where
    T: Send,
    C: RecordCodec<T>,
{
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            chunk_dir: None,
            rw_buf_size: None,
            memory_budget: u64::MAX,
            prefetch_capacity: DEFAULT_PREFETCH_CAPACITY,
            compression_level: 0,
            codec_type: PhantomData,
            item_type: PhantomData,
        }
    }
}

/// External sorter. Drains a line source into sorted chunk files that are later merged by a
/// [`KWayMerger`](crate::KWayMerger).
pub struct ExternalSorter<T, C = RmpCodec<T>>
where
    T: Send,
    C: RecordCodec<T>,
{
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory to store chunks in.
    chunk_dir: Option<PathBuf>,
    /// Input bytes consumed by a batch before it is spilled.
    memory_budget: u64,
    /// Chunk file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Capacity of the line prefetch queue.
    prefetch_capacity: usize,
    /// Chunk zstd compression level.
    compression_level: i32,

    /// Record codec type.
    codec_type: PhantomData<C>,
    /// Record type.
    item_type: PhantomData<T>,
}

impl<T, C> ExternalSorter<T, C>
where
    T: Send,
    C: RecordCodec<T>,
{
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads to be used to sort data in parallel. If the parameter is [`None`]
    ///   threads number will be selected based on available CPU core number.
    /// * `chunk_dir` - Directory to store chunks in. If the parameter is [`None`] chunks are created next to
    ///   the source file.
    /// * `memory_budget` - Input line bytes a batch accumulates before it is spilled.
    /// * `rw_buf_size` - Chunks file read/write buffer size.
    /// * `prefetch_capacity` - Number of lines read ahead of parsing.
    /// * `compression_level` - Chunk zstd compression level.
    pub fn new(
        threads_number: Option<usize>,
        chunk_dir: Option<&Path>,
        memory_budget: u64,
        rw_buf_size: Option<usize>,
        prefetch_capacity: usize,
        compression_level: i32,
    ) -> Result<Self, CodecSortError<T, C>> {
        return Ok(ExternalSorter {
            thread_pool: Self::init_thread_pool(threads_number)?,
            chunk_dir: chunk_dir.map(Path::to_path_buf),
            memory_budget,
            rw_buf_size,
            prefetch_capacity: prefetch_capacity.max(1),
            compression_level,
            codec_type: PhantomData,
            item_type: PhantomData,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, CodecSortError<T, C>> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    /// Splits the source into sorted chunks.
    /// Returns chunk paths in creation order.
    ///
    /// # Arguments
    /// * `source` - Path of the line source, zstd compressed sources are decompressed transparently
    /// * `parse` - Function converting a line into a record, lines it fails on are skipped
    pub fn split<P, E>(&self, source: &Path, parse: P) -> Result<Vec<PathBuf>, CodecSplitError<T, C>>
    where
        T: Ord,
        P: Fn(&str) -> Result<T, E>,
        E: Display,
    {
        self.split_by(source, parse, T::cmp)
    }

    /// Splits the source into chunks sorted using a custom compare function.
    /// Returns chunk paths in creation order. The caller owns the chunks and is expected to remove them
    /// once they are merged.
    ///
    /// # Arguments
    /// * `source` - Path of the line source, zstd compressed sources are decompressed transparently
    /// * `parse` - Function converting a line into a record, lines it fails on are skipped
    /// * `compare` - Function to be used to compare records
    pub fn split_by<P, E, F>(
        &self,
        source: &Path,
        parse: P,
        compare: F,
    ) -> Result<Vec<PathBuf>, CodecSplitError<T, C>>
    where
        P: Fn(&str) -> Result<T, E>,
        E: Display,
        F: Fn(&T, &T) -> Ordering + Sync + Send,
    {
        let reader = file::open_lines(source, self.rw_buf_size).map_err(|err| SplitError {
            chunks: Vec::new(),
            error: SortError::InputError(err),
        })?;

        log::info!("splitting {} into chunks", source.display());

        thread::scope(|scope| -> Result<Vec<PathBuf>, CodecSplitError<T, C>> {
            let (lines_tx, lines_rx) = crossbeam_channel::bounded(self.prefetch_capacity);
            scope.spawn(move || file::prefetch_lines(reader, lines_tx));

            let mut chunks = Vec::new();
            let mut batch = RecordBatch::new(self.memory_budget);
            let mut line_number: u64 = 0;
            let mut skipped: u64 = 0;

            for line in lines_rx.iter() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        return Err(SplitError {
                            chunks,
                            error: SortError::InputError(err),
                        })
                    }
                };
                line_number += 1;

                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        skipped += 1;
                        log::warn!("skipping line {} of {}: {}", line_number, source.display(), err);
                        continue;
                    }
                };

                match parse(&line) {
                    Ok(item) => batch.push(item, line.len()),
                    Err(err) => {
                        skipped += 1;
                        log::warn!("skipping line {} of {}: {}", line_number, source.display(), err);
                        continue;
                    }
                }

                if batch.is_full() {
                    self.flush_batch(source, &mut batch, &mut chunks, &compare)?;
                }
            }

            if !batch.is_empty() {
                self.flush_batch(source, &mut batch, &mut chunks, &compare)?;
            }

            log::info!(
                "{} split done (lines: {}, skipped: {}, chunks: {})",
                source.display(),
                line_number,
                skipped,
                chunks.len()
            );

            return Ok(chunks);
        })
    }

    fn flush_batch<F>(
        &self,
        source: &Path,
        batch: &mut RecordBatch<T>,
        chunks: &mut Vec<PathBuf>,
        compare: &F,
    ) -> Result<(), CodecSplitError<T, C>>
    where
        F: Fn(&T, &T) -> Ordering + Sync + Send,
    {
        log::debug!("sorting chunk data ({} records, {} bytes) ...", batch.len(), batch.mem_size());
        self.thread_pool.install(|| {
            batch.par_sort_by(compare);
        });

        let path = chunk_path(source, self.chunk_dir.as_deref(), chunks.len());
        log::debug!("saving chunk data to {}", path.display());

        if let Err(err) =
            chunk::write_chunk::<T, C>(&path, batch.as_slice(), self.compression_level, self.rw_buf_size)
        {
            return Err(SplitError {
                chunks: std::mem::take(chunks),
                error: err,
            });
        }

        chunks.push(path);
        batch.clear();

        return Ok(());
    }
}
