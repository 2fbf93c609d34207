//! `ext-line-sort` sorts text files that do not fit into memory.
//!
//! External sorting is a class of sorting algorithms that can handle massive amounts of data. External sorting
//! is required when the data being sorted do not fit into the main memory (RAM) of a computer and instead must be
//! resided in slower external memory, usually a hard disk drive. Sorting is achieved in two passes. During the
//! first pass it sorts chunks of data that each fit in RAM, during the second pass it merges the sorted chunks
//! together. For more information see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! * **Chunking:**
//!   the input file is read line by line, every `chunk_size` lines are sorted in memory and saved
//!   to a temporary chunk file. Trailing whitespace of every line is stripped.
//! * **Merging:**
//!   all chunks are merged in a single pass using a binary heap keyed by the current line of every chunk.
//!   Equal lines are emitted in chunk creation order. A chunk that can not be read is skipped and reported.
//! * **Cleanup:**
//!   every sort uses its own temporary directory which is removed when the sort completes, successfully or not.
//!
//! The merge keeps one file open per chunk. Use [`ExternalSorterBuilder::with_max_open_chunks`] to fail fast
//! instead of hitting the system open files limit. Chunks of a process killed in the middle of a sort are not
//! reclaimed; their directories start with [`lifecycle::CHUNK_DIR_PREFIX`].
//!
//! # Example
//!
//! ```no_run
//! use ext_line_sort::{ExternalSorter, ExternalSorterBuilder, SortOrder};
//!
//! fn main() {
//!     let sorter: ExternalSorter = ExternalSorterBuilder::new()
//!         .with_chunk_size(100_000)
//!         .with_order(SortOrder::Asc)
//!         .with_tmp_dir(std::path::Path::new("./"))
//!         .build()
//!         .unwrap();
//!
//!     let report = sorter.sort("input.txt", "output.txt").unwrap();
//!     println!("{} lines sorted", report.lines_written);
//! }
//! ```

pub mod buffer;
pub mod chunk;
pub mod chunker;
pub mod lifecycle;
pub mod merger;
pub mod sort;

pub use buffer::{ChunkBuffer, ChunkBufferBuilder, LimitedBuffer, LimitedBufferBuilder, DEFAULT_CHUNK_SIZE};
pub use chunk::{Chunk, ChunkError, ChunkFormat, ChunkId, ChunkReadError, Line, RmpChunkFormat, TextChunkFormat};
pub use chunker::Chunker;
pub use lifecycle::{cleanup, ChunkRegistry};
pub use merger::{BinaryHeapMerger, MergeKey, MergeReport, Merger, SortOrder};
pub use sort::{sort_file, ExternalSorter, ExternalSorterBuilder, SortError, SortReport};
