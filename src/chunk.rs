//! Chunk files: compressed sorted runs of records.
//!
//! A chunk is a single zstd stream holding the number of records as a little-endian `u64` followed by the
//! records encoded one after another by a [`RecordCodec`].

use std::fs;
use std::io::{self, prelude::*};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::codec::RecordCodec;
use crate::file::{Compression, Sink, COMPRESSED_EXT};
use crate::sort::SortError;

type ChunkError<T, C> =
    SortError<<C as RecordCodec<T>>::SerializationError, <C as RecordCodec<T>>::DeserializationError>;

/// Returns the path of the chunk number `seq` created from `source`.
///
/// Chunks are placed next to the source unless `dir` is given, in which case the source file name is used
/// inside that directory.
pub fn chunk_path(source: &Path, dir: Option<&Path>, seq: usize) -> PathBuf {
    let base = match (dir, source.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => source.to_path_buf(),
    };

    let mut path = base.into_os_string();
    path.push(format!(".chunk.{:08}.{}", seq, COMPRESSED_EXT));

    return PathBuf::from(path);
}

/// Writes `items` to a new chunk file at `path`.
///
/// If writing fails half-way the incomplete file is removed.
pub fn write_chunk<T, C>(
    path: &Path,
    items: &[T],
    level: i32,
    buf_size: Option<usize>,
) -> Result<(), ChunkError<T, C>>
where
    C: RecordCodec<T>,
{
    let result = dump::<T, C>(path, items, level, buf_size);

    if result.is_err() && path.exists() {
        log::warn!("removing incomplete chunk {}", path.display());
        if let Err(err) = fs::remove_file(path) {
            log::warn!("incomplete chunk {} not removed: {}", path.display(), err);
        }
    }

    return result;
}

fn dump<T, C>(path: &Path, items: &[T], level: i32, buf_size: Option<usize>) -> Result<(), ChunkError<T, C>>
where
    C: RecordCodec<T>,
{
    let mut sink = Sink::create(path, Compression::Zstd, level, buf_size).map_err(SortError::IO)?;

    sink.write_all(&(items.len() as u64).to_le_bytes())
        .map_err(SortError::IO)?;

    for item in items {
        C::encode(&mut sink, item).map_err(SortError::SerializationError)?;
    }

    sink.finish().map_err(SortError::IO)?;

    return Ok(());
}

/// Sequential chunk reader. Yields the records of a chunk in their on-disk order.
pub struct ChunkReader<T, C> {
    reader: zstd::stream::read::Decoder<'static, io::BufReader<fs::File>>,
    remaining: Option<u64>,

    item_type: PhantomData<T>,
    codec_type: PhantomData<C>,
}

impl<T, C> ChunkReader<T, C>
where
    C: RecordCodec<T>,
{
    /// Opens a chunk file for reading. The record count is read lazily with the first record.
    pub fn open(path: &Path, buf_size: Option<usize>) -> io::Result<Self> {
        let file = fs::File::open(path)?;
        let reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        return Ok(ChunkReader {
            reader: zstd::stream::read::Decoder::with_buffer(reader)?,
            remaining: None,
            item_type: PhantomData,
            codec_type: PhantomData,
        });
    }

    fn read_count(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.reader.read_exact(&mut buf)?;

        return Ok(u64::from_le_bytes(buf));
    }
}

impl<T, C> Iterator for ChunkReader<T, C>
where
    C: RecordCodec<T>,
{
    type Item = Result<T, ChunkError<T, C>>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = match self.remaining {
            Some(remaining) => remaining,
            None => match self.read_count() {
                Ok(count) => count,
                Err(err) => {
                    self.remaining = Some(0);
                    return Some(Err(SortError::IO(err)));
                }
            },
        };

        if remaining == 0 {
            self.remaining = Some(0);
            return None;
        }

        match C::decode(&mut self.reader) {
            Ok(item) => {
                self.remaining = Some(remaining - 1);
                Some(Ok(item))
            }
            Err(err) => {
                self.remaining = Some(0);
                Some(Err(SortError::DeserializationError(err)))
            }
        }
    }
}
