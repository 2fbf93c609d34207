use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use ext_line_sort::buffer::mem::MemoryLimitedBufferBuilder;
use ext_line_sort::{ChunkFormat, ExternalSorterBuilder, RmpChunkFormat, SortOrder, TextChunkFormat};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let order: Order = arg_parser.value_of_t_or_exit("sort");
    let format: Format = arg_parser.value_of_t_or_exit("format");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let chunk_size: usize = arg_parser.value_of_t_or_exit("chunk_size");
    let chunk_memory: Option<u64> = arg_parser.value_of("chunk_memory").map(|v| {
        v.parse::<ByteSize>().expect("value is pre-validated").as_u64()
    });
    let max_open_chunks: Option<usize> = arg_parser
        .is_present("max_open_chunks")
        .then(|| arg_parser.value_of_t_or_exit("max_open_chunks"));

    let input = arg_parser.value_of("input").expect("value is required");
    let output = arg_parser.value_of("output").expect("value is required");

    let mut sorter_builder = ExternalSorterBuilder::new()
        .with_buffer(MemoryLimitedBufferBuilder::new(
            chunk_size,
            chunk_memory.unwrap_or(u64::MAX),
        ))
        .with_order(match order {
            Order::Asc => SortOrder::Asc,
            Order::Desc => SortOrder::Desc,
        })
        .with_strict(arg_parser.is_present("strict"));

    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    if let Some(max_open_chunks) = max_open_chunks {
        sorter_builder = sorter_builder.with_max_open_chunks(max_open_chunks);
    }

    let result = match format {
        Format::Text => sort::<TextChunkFormat>(sorter_builder, input, output),
        Format::Msgpack => sort::<RmpChunkFormat>(sorter_builder, input, output),
    };

    if let Err(code) = result {
        process::exit(code);
    }
}

fn sort<F: ChunkFormat>(
    sorter_builder: ExternalSorterBuilder<MemoryLimitedBufferBuilder>,
    input: &str,
    output: &str,
) -> Result<(), i32> {
    let sorter = match sorter_builder.with_format::<F>().build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            return Err(1);
        }
    };

    let report = match sorter.sort(input, output) {
        Ok(report) => report,
        Err(err) => {
            log::error!("data sorting error: {}", err);
            log::error!("{} lines written", err.lines_written());
            for chunk in err.failed_chunks() {
                log::error!("chunk {} was not read", chunk);
            }
            return Err(1);
        }
    };

    for failure in &report.failed_chunks {
        log::warn!("chunk {} skipped: {}", failure.chunk(), failure.cause());
    }
    log::info!(
        "{} of {} lines written, {} chunks used, {} chunks skipped",
        report.lines_written,
        report.lines_read,
        report.chunks,
        report.failed_chunks.len()
    );

    return Ok(());
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

#[derive(Copy, Clone, clap::ArgEnum)]
enum Format {
    Text,
    Msgpack,
}

impl Format {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Format::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Format as clap::ArgEnum>::from_str(s, false)
    }
}

fn positive_number(v: &str) -> Result<(), String> {
    match v.parse::<usize>() {
        Ok(0) => Err("value must be positive".to_string()),
        Ok(_) => Ok(()),
        Err(err) => Err(format!("number format incorrect: {}", err)),
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("ext-line-sort")
        .about("external merge sort for text files")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
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
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("chunk_size")
                .short('c')
                .long("chunk-size")
                .help("maximum number of lines per chunk")
                .takes_value(true)
                .default_value("1000")
                .validator(positive_number),
        )
        .arg(
            clap::Arg::new("chunk_memory")
                .short('m')
                .long("chunk-memory")
                .help("maximum memory consumed by a chunk, e.g. 50MB")
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Chunk memory format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("format")
                .short('f')
                .long("format")
                .help("chunk files format")
                .takes_value(true)
                .default_value("text")
                .possible_values(Format::possible_values()),
        )
        .arg(
            clap::Arg::new("max_open_chunks")
                .long("max-open-chunks")
                .help("maximum number of chunks opened simultaneously during the merge")
                .takes_value(true)
                .validator(positive_number),
        )
        .arg(
            clap::Arg::new("strict")
                .long("strict")
                .help("fail on unreadable chunks instead of skipping them"),
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
