use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

use env_logger;
use log;

use chunk_sort::{ExternalSorter, ExternalSorterBuilder, KWayMerger, RecordCodec};

struct U32Codec;

impl RecordCodec<u32> for U32Codec {
    type SerializationError = io::Error;
    type DeserializationError = io::Error;

    fn encode<W: Write>(writer: &mut W, item: &u32) -> Result<(), Self::SerializationError> {
        writer.write_all(&item.to_le_bytes())
    }

    fn decode<R: Read>(reader: &mut R) -> Result<u32, Self::DeserializationError> {
        let mut buf: [u8; 4] = [0; 4];
        reader.read_exact(&mut buf)?;

        return Ok(u32::from_le_bytes(buf));
    }
}

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let sorter: ExternalSorter<u32, U32Codec> = ExternalSorterBuilder::new()
        .with_chunk_dir(Path::new("./"))
        .with_memory_budget(1_000_000)
        .build()
        .unwrap();

    let chunks = sorter.split(Path::new("input.txt"), |line| line.parse::<u32>()).unwrap();

    let merger: KWayMerger<u32, U32Codec> = KWayMerger::new().with_dedup(true);
    merger.merge_to_file(&chunks, Path::new("output.txt"), u32::cmp).unwrap();

    for chunk in chunks {
        fs::remove_file(chunk).unwrap();
    }
}
