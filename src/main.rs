use std::cmp::Ordering;
use std::fmt::Display;
use std::fs;
use std::path::PathBuf;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use chunk_sort::{ExternalSorterBuilder, KWayMerger, Record};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let chunk_size = arg_parser.value_of("chunk_size").expect("value is required");
    let options = Options {
        input: PathBuf::from(arg_parser.value_of("input").expect("value is required")),
        output: PathBuf::from(arg_parser.value_of("output").expect("value is required")),
        order: arg_parser.value_of_t_or_exit("sort"),
        chunk_dir: arg_parser.value_of("chunk_dir").map(PathBuf::from),
        memory_budget: chunk_size.parse::<ByteSize>().expect("value is pre-validated").as_u64(),
        threads: arg_parser
            .is_present("threads")
            .then(|| arg_parser.value_of_t_or_exit("threads")),
        unique: arg_parser.is_present("unique"),
        keep_chunks: arg_parser.is_present("keep_chunks"),
    };

    let result = if arg_parser.is_present("numeric") {
        run(&options, |line: &str| line.trim().parse::<i64>())
    } else {
        run(&options, |line: &str| Ok::<_, String>(line.to_string()))
    };

    if let Err(err) = result {
        log::error!("{}", err);
        process::exit(1);
    }
}

struct Options {
    input: PathBuf,
    output: PathBuf,
    order: Order,
    chunk_dir: Option<PathBuf>,
    memory_budget: u64,
    threads: Option<usize>,
    unique: bool,
    keep_chunks: bool,
}

fn run<T, P, E>(options: &Options, parse: P) -> Result<(), String>
where
    T: Record + Ord + serde::Serialize + serde::de::DeserializeOwned,
    P: Fn(&str) -> Result<T, E>,
    E: Display,
{
    let mut sorter_builder: ExternalSorterBuilder<T> =
        ExternalSorterBuilder::new().with_memory_budget(options.memory_budget);
    if let Some(threads) = options.threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(chunk_dir) = &options.chunk_dir {
        sorter_builder = sorter_builder.with_chunk_dir(chunk_dir);
    }

    let sorter = sorter_builder
        .build()
        .map_err(|err| format!("sorter initialization error: {}", err))?;

    let compare: fn(&T, &T) -> Ordering = match options.order {
        Order::Asc => |a: &T, b: &T| a.cmp(b),
        Order::Desc => |a: &T, b: &T| a.cmp(b).reverse(),
    };

    let chunks = match sorter.split_by(&options.input, parse, compare) {
        Ok(chunks) => chunks,
        Err(err) => {
            if !options.keep_chunks {
                remove_chunks(&err.chunks);
            }
            return Err(format!("data sorting error: {}", err));
        }
    };

    let result = KWayMerger::<T>::new()
        .with_dedup(options.unique)
        .merge_to_file(&chunks, &options.output, compare)
        .map_err(|err| format!("chunks merging error: {}", err));

    match &result {
        Ok(records) => log::info!("{} records written to {}", records, options.output.display()),
        Err(_) => log::warn!("merge failed, {} chunks left in place", chunks.len()),
    }

    if result.is_ok() && !options.keep_chunks {
        remove_chunks(&chunks);
    }

    return result.map(|_| ());
}

fn remove_chunks(chunks: &[PathBuf]) {
    for chunk in chunks {
        if let Err(err) = fs::remove_file(chunk) {
            log::warn!("chunk {} removal error: {}", chunk.display(), err);
        }
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Order::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Order as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("chunk-sort")
        .about("external line sorter")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted, .zst files are decompressed")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file, compressed if the name ends with .zst")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("sort")
                .short('s')
                .long("sort")
                .help("sorting order")
                .takes_value(true)
                .default_value("asc")
                .possible_values(Order::possible_values()),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("chunk_dir")
                .short('d')
                .long("chunk-dir")
                .help("directory to store chunks in, defaults to the input file directory")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("chunk_size")
                .short('c')
                .long("chunk-size")
                .help("input bytes sorted in memory per chunk")
                .required(true)
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Chunk size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("numeric")
                .short('n')
                .long("numeric")
                .help("compare lines as integers, other lines are skipped"),
        )
        .arg(
            clap::Arg::new("unique")
                .short('u')
                .long("unique")
                .help("collapse consecutive equal lines of the sorted output"),
        )
        .arg(
            clap::Arg::new("keep_chunks")
                .short('k')
                .long("keep-chunks")
                .help("do not remove chunk files after merging"),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
