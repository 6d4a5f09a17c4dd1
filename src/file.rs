//! Line sources and output sinks with transparent zstd compression.

use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;
use std::string;

use crossbeam_channel::Sender;

/// File name extension of zstd compressed files.
pub const COMPRESSED_EXT: &str = "zst";

/// Compression applied to a file, detected from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd,
}

impl Compression {
    pub fn from_path(path: &Path) -> Self {
        match path.extension() {
            Some(ext) if ext == COMPRESSED_EXT => Compression::Zstd,
            _ => Compression::None,
        }
    }
}

fn buffered<T>(inner: T, buf_size: Option<usize>) -> io::BufReader<T>
where
    T: Read,
{
    match buf_size {
        Some(buf_size) => io::BufReader::with_capacity(buf_size, inner),
        None => io::BufReader::new(inner),
    }
}

/// Opens a file for sequential line reading, decompressing it if the path carries the compressed extension.
pub fn open_lines(path: &Path, buf_size: Option<usize>) -> io::Result<Box<dyn BufRead + Send>> {
    let file = fs::File::open(path)?;

    let reader: Box<dyn BufRead + Send> = match Compression::from_path(path) {
        Compression::Zstd => {
            let decoder = zstd::stream::read::Decoder::with_buffer(buffered(file, buf_size))?;
            Box::new(io::BufReader::new(decoder))
        }
        Compression::None => Box::new(buffered(file, buf_size)),
    };

    return Ok(reader);
}

/// Line delivered by [`prefetch_lines`]. The outer error is a read failure and ends the stream, the inner one
/// marks a line that is not valid UTF-8.
pub type PrefetchedLine = io::Result<Result<String, string::FromUtf8Error>>;

/// Reads lines from the reader and pushes them to the channel until the input is exhausted, a read error
/// occurs or the receiving side is gone. Line terminators (`\n` or `\r\n`) are stripped. A read error is
/// forwarded and ends the stream.
pub fn prefetch_lines(mut reader: impl BufRead, lines: Sender<PrefetchedLine>) {
    loop {
        let mut buf = Vec::new();
        let line = match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if buf.ends_with(b"\n") {
                    buf.pop();
                    if buf.ends_with(b"\r") {
                        buf.pop();
                    }
                }
                Ok(String::from_utf8(buf))
            }
            Err(err) => Err(err),
        };

        let failed = line.is_err();
        if lines.send(line).is_err() || failed {
            break;
        }
    }
}

/// Sequential output sink. Either a plain buffered file or a zstd stream on top of it.
pub enum Sink {
    Plain(io::BufWriter<fs::File>),
    Zstd(zstd::stream::write::Encoder<'static, io::BufWriter<fs::File>>),
}

impl Sink {
    /// Creates (or truncates) the file at `path`. Output is compressed if `compression` is [`Compression::Zstd`].
    pub fn create(
        path: &Path,
        compression: Compression,
        level: i32,
        buf_size: Option<usize>,
    ) -> io::Result<Self> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };

        return Ok(match compression {
            Compression::Zstd => Sink::Zstd(zstd::stream::write::Encoder::new(writer, level)?),
            Compression::None => Sink::Plain(writer),
        });
    }

    /// Finishes the compressed stream (if any) and flushes all buffered data to the file.
    pub fn finish(self) -> io::Result<()> {
        let mut writer = match self {
            Sink::Zstd(encoder) => encoder.finish()?,
            Sink::Plain(writer) => writer,
        };
        writer.flush()?;

        return Ok(());
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(writer) => writer.write(buf),
            Sink::Zstd(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(writer) => writer.flush(),
            Sink::Zstd(encoder) => encoder.flush(),
        }
    }
}
