use std::fs;
use std::path;

use env_logger;
use log;

use ext_line_sort::{ExternalSorter, ExternalSorterBuilder};

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let numbers: Vec<String> = (0..10_000u64).map(|i| ((i * 7919) % 10_007).to_string()).collect();
    fs::write("input.txt", numbers.join("\n")).unwrap();

    let sorter: ExternalSorter = ExternalSorterBuilder::new()
        .with_chunk_size(1000)
        .with_tmp_dir(path::Path::new("./"))
        .build()
        .unwrap();

    let report = sorter.sort("input.txt", "output.txt").unwrap();
    log::info!("{} lines sorted using {} chunks", report.lines_written, report.chunks);
}
