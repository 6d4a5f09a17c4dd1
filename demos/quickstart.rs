use std::fs;
use std::path::Path;

use env_logger;
use log;

use chunk_sort::{crossbeam_channel, ExternalSorter, ExternalSorterBuilder, KWayMerger};

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let sorter: ExternalSorter<String> = ExternalSorterBuilder::new()
        .with_memory_budget(50 * 1024 * 1024)
        .build()
        .unwrap();

    let chunks = sorter
        .split(Path::new("input.txt"), |line| Ok::<_, String>(line.to_string()))
        .unwrap();

    KWayMerger::<String>::new()
        .merge_streaming(
            &chunks,
            String::cmp,
            crossbeam_channel::bounded(10_000),
            |lines, done| {
                for line in lines {
                    println!("{}", line);
                }
                done.done();
            },
        )
        .unwrap();

    for chunk in chunks {
        fs::remove_file(chunk).unwrap();
    }
}
