//! `chunk-sort` is a line-oriented external sort implementation.
//!
//! External sorting handles datasets that do not fit into the main memory of a computer. Sorting is achieved in
//! two passes. During the first pass the input is split into batches limited by the number of input bytes they
//! were parsed from, every batch is sorted and saved to a compressed chunk file. During the second pass the
//! chunks are merged together using a k-way merge. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `chunk-sort` supports the following features:
//!
//! * **Line sources:**
//!   the input is a text file, one record per line. Lines are parsed by a user supplied function, lines it
//!   fails on are skipped and reported. Files with the `.zst` extension are decompressed transparently.
//! * **Compressed chunks:**
//!   chunks are stored as zstd streams next to the source (or in a configured directory) and named
//!   `<source>.chunk.<sequence>.zst`. The caller owns the chunks and removes them after the merge.
//! * **Serialization format agnostic:**
//!   records are stored using `MessagePack` by default, any [`RecordCodec`] can be used instead.
//! * **Concurrent merge:**
//!   every chunk is decoded on its own thread into a bounded queue, memory used by decoded records is limited
//!   regardless of the number of chunks.
//! * **Streaming and file output:**
//!   merged records are either sent to a channel consumed by a callback or written to a file.
//!
//! # Example
//!
//! ```no_run
//! use std::fs;
//! use std::path::Path;
//!
//! use chunk_sort::{ExternalSorter, ExternalSorterBuilder, KWayMerger};
//!
//! fn main() {
//!     let sorter: ExternalSorter<i64> = ExternalSorterBuilder::new()
//!         .with_memory_budget(50 * 1024 * 1024)
//!         .build()
//!         .unwrap();
//!
//!     let chunks = sorter.split(Path::new("input.txt"), |line| line.parse::<i64>()).unwrap();
//!
//!     KWayMerger::<i64>::new()
//!         .merge_to_file(&chunks, Path::new("output.txt"), i64::cmp)
//!         .unwrap();
//!
//!     for chunk in chunks {
//!         fs::remove_file(chunk).unwrap();
//!     }
//! }
//! ```

pub mod buffer;
pub mod chunk;
pub mod codec;
pub mod file;
pub mod merger;
pub mod record;
pub mod sort;

pub use buffer::RecordBatch;
pub use chunk::ChunkReader;
pub use codec::{RecordCodec, RmpCodec};
pub use merger::{DoneSignal, KWayMerger};
pub use record::Record;
pub use sort::{ExternalSorter, ExternalSorterBuilder, SortError, SplitError};

pub use crossbeam_channel;
