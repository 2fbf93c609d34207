//! Binary heap merger.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::fs;
use std::io::{self, prelude::*};
use std::marker::PhantomData;
use std::path::Path;

use crate::chunk::{Chunk, ChunkFormat, ChunkId, ChunkReadError, Line, TextChunkFormat};
use crate::sort::SortError;

/// Lines ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Ascending lexicographic order.
    #[default]
    Asc,
    /// Descending lexicographic order.
    Desc,
}

impl SortOrder {
    /// Compares two items according to the order.
    pub fn compare<T: Ord + ?Sized>(&self, a: &T, b: &T) -> Ordering {
        match self {
            SortOrder::Asc => a.cmp(b),
            SortOrder::Desc => a.cmp(b).reverse(),
        }
    }
}

/// Merge heap key.
/// Items are compared using the sort order; equal items are ordered by ascending chunk identifier
/// whatever the sort order is, which makes the merge output deterministic.
#[derive(Debug)]
pub struct MergeKey<T> {
    value: T,
    chunk: ChunkId,
    order: SortOrder,
}

impl<T: Ord> MergeKey<T> {
    pub fn new(value: T, chunk: ChunkId, order: SortOrder) -> Self {
        MergeKey { value, chunk, order }
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

impl<T: Ord> Ord for MergeKey<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order
            .compare(&self.value, &other.value)
            .then_with(|| self.chunk.cmp(&other.chunk))
    }
}

impl<T: Ord> PartialOrd for MergeKey<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> PartialEq for MergeKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for MergeKey<T> {}

/// Binary heap merger implementation.
/// Merges multiple sorted inputs into a single sorted output.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of items,
/// *n* is the number of chunks (inputs).
///
/// An input that yields an error is reported once as `Err((chunk, error))` and then dropped;
/// the remaining inputs are merged as usual.
pub struct BinaryHeapMerger<T, E, C>
where
    T: Ord,
    C: Iterator<Item = Result<T, E>>,
{
    // binary heap is max-heap by default so we reverse it to convert it to min-heap
    items: BinaryHeap<(Reverse<MergeKey<T>>, usize)>,
    chunks: Vec<(ChunkId, C)>,
    failures: VecDeque<(ChunkId, E)>,
    order: SortOrder,
    initiated: bool,
}

impl<T, E, C> BinaryHeapMerger<T, E, C>
where
    T: Ord,
    C: Iterator<Item = Result<T, E>>,
{
    /// Creates an instance of a binary heap merger using chunks as inputs.
    /// Chunk items should be sorted according to `order` otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `chunks` - Chunks to be merged in a single sorted one
    /// * `order` - Chunk items order
    pub fn new<I, IC>(chunks: I, order: SortOrder) -> Self
    where
        I: IntoIterator<Item = (ChunkId, IC)>,
        IC: IntoIterator<Item = Result<T, E>, IntoIter = C>,
    {
        let chunks = Vec::from_iter(chunks.into_iter().map(|(id, c)| (id, c.into_iter())));
        let items = BinaryHeap::with_capacity(chunks.len());

        return BinaryHeapMerger {
            chunks,
            items,
            failures: VecDeque::new(),
            order,
            initiated: false,
        };
    }

    fn advance(&mut self, slot: usize) {
        let (id, chunk) = &mut self.chunks[slot];
        match chunk.next() {
            Some(Ok(item)) => self.items.push((Reverse(MergeKey::new(item, *id, self.order)), slot)),
            Some(Err(err)) => self.failures.push_back((*id, err)),
            None => {}
        }
    }
}

impl<T, E, C> Iterator for BinaryHeapMerger<T, E, C>
where
    T: Ord,
    C: Iterator<Item = Result<T, E>>,
{
    type Item = Result<T, (ChunkId, E)>;

    /// Returns the next item from the inputs in the merge order.
    fn next(&mut self) -> Option<Self::Item> {
        if !self.initiated {
            for slot in 0..self.chunks.len() {
                self.advance(slot);
            }
            self.initiated = true;
        }

        if let Some(failure) = self.failures.pop_front() {
            return Some(Err(failure));
        }

        let (Reverse(key), slot) = self.items.pop()?;
        self.advance(slot);

        return Some(Ok(key.into_value()));
    }
}

/// Result of a merge phase.
#[derive(Debug, Default)]
pub struct MergeReport {
    /// Number of lines written to the output.
    pub lines_written: u64,
    /// Chunks that could not be read. Their remaining lines are missing from the output.
    pub failed_chunks: Vec<ChunkReadError>,
}

/// Merges chunk files into the output file.
#[derive(Clone)]
pub struct Merger<F = TextChunkFormat> {
    rw_buf_size: Option<usize>,
    order: SortOrder,
    max_open_chunks: Option<usize>,
    strict: bool,

    format: PhantomData<F>,
}

impl<F: ChunkFormat> Merger<F> {
    /// Creates a new merger.
    ///
    /// # Arguments
    /// * `rw_buf_size` - Chunk and output files read/write buffer size
    /// * `order` - Order the chunks were sorted in
    /// * `max_open_chunks` - Maximum number of chunks opened simultaneously, unlimited if [`None`]
    /// * `strict` - Abort on the first chunk read error instead of skipping the chunk
    pub fn new(rw_buf_size: Option<usize>, order: SortOrder, max_open_chunks: Option<usize>, strict: bool) -> Self {
        Merger {
            rw_buf_size,
            order,
            max_open_chunks,
            strict,
            format: PhantomData,
        }
    }

    /// Merges `chunks` into a file created at `output`.
    /// Chunks that fail to open or read are skipped and reported unless the merger is strict.
    ///
    /// If the merge is aborted by an output or strict chunk error the partially written output file is left
    /// in place; the error tells how many lines it holds.
    pub fn merge_chunks(&self, chunks: &[Chunk], output: &Path) -> Result<MergeReport, SortError> {
        if let Some(limit) = self.max_open_chunks {
            if chunks.len() > limit {
                return Err(SortError::ResourceExhausted {
                    chunks: chunks.len(),
                    limit,
                });
            }
        }

        let mut report = MergeReport::default();
        let mut cursors = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match chunk.open::<F>(self.rw_buf_size) {
                Ok(cursor) => cursors.push((chunk.id(), cursor)),
                Err(err) => self.on_chunk_error(ChunkReadError::new(chunk.id(), err), &mut report)?,
            }
        }
        log::debug!("merging {} chunks", cursors.len());

        let file = fs::File::create(output).map_err(|err| Self::output_error(&report, err))?;
        let mut output_writer = match self.rw_buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };

        for item in BinaryHeapMerger::new(cursors, self.order) {
            match item {
                Ok(line) => {
                    Self::write_line(&mut output_writer, &line).map_err(|err| Self::output_error(&report, err))?;
                    report.lines_written += 1;
                }
                Err((chunk, err)) => self.on_chunk_error(ChunkReadError::new(chunk, err), &mut report)?,
            }
        }

        output_writer.flush().map_err(|err| Self::output_error(&report, err))?;

        log::info!("{} lines merged into {}", report.lines_written, output.display());
        return Ok(report);
    }

    fn on_chunk_error(&self, err: ChunkReadError, report: &mut MergeReport) -> Result<(), SortError> {
        if self.strict {
            return Err(SortError::ChunkRead {
                error: err,
                lines_written: report.lines_written,
                failed_chunks: report.failed_chunks.iter().map(|failure| failure.chunk()).collect(),
            });
        }

        log::warn!("skipping chunk: {}", err);
        report.failed_chunks.push(err);
        return Ok(());
    }

    fn write_line(writer: &mut impl Write, line: &Line) -> io::Result<()> {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")
    }

    fn output_error(report: &MergeReport, err: io::Error) -> SortError {
        SortError::OutputWrite {
            lines_written: report.lines_written,
            failed_chunks: report.failed_chunks.iter().map(|failure| failure.chunk()).collect(),
            source: err,
        }
    }
}
