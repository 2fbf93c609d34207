//! External sorter.

use log;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::chunk::{ChunkError, ChunkFormat, ChunkId, ChunkReadError, Line, TextChunkFormat};
use crate::chunker::Chunker;
use crate::lifecycle::ChunkRegistry;
use crate::merger::{Merger, SortOrder};
use crate::{ChunkBufferBuilder, LimitedBufferBuilder};

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Input file can not be opened for reading.
    InputNotFound { path: PathBuf, source: io::Error },
    /// Input data stream error.
    InputRead(io::Error),
    /// Temporary directory creation error.
    TempDir(io::Error),
    /// Chunk file writing error.
    ChunkWrite(ChunkError),
    /// Chunk file reading error. Returned only by strict sorters, otherwise the chunk is skipped.
    ChunkRead {
        error: ChunkReadError,
        lines_written: u64,
        failed_chunks: Vec<ChunkId>,
    },
    /// Output file writing error.
    OutputWrite {
        lines_written: u64,
        failed_chunks: Vec<ChunkId>,
        source: io::Error,
    },
    /// Number of chunks exceeds the configured open chunks limit.
    ResourceExhausted { chunks: usize, limit: usize },
    /// Chunk size is zero.
    InvalidChunkSize,
}

impl SortError {
    /// Number of lines written to the output before the error occurred.
    pub fn lines_written(&self) -> u64 {
        match &self {
            SortError::OutputWrite { lines_written, .. } => *lines_written,
            SortError::ChunkRead { lines_written, .. } => *lines_written,
            _ => 0,
        }
    }

    /// Chunks that failed to be read, including the one that aborted a strict sort.
    pub fn failed_chunks(&self) -> Vec<ChunkId> {
        match &self {
            SortError::OutputWrite { failed_chunks, .. } => failed_chunks.clone(),
            SortError::ChunkRead {
                error, failed_chunks, ..
            } => failed_chunks.iter().copied().chain(Some(error.chunk())).collect(),
            _ => Vec::new(),
        }
    }
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::InputNotFound { source, .. } => Some(source),
            SortError::InputRead(err) => Some(err),
            SortError::TempDir(err) => Some(err),
            SortError::ChunkWrite(err) => Some(err),
            SortError::ChunkRead { error, .. } => Some(error),
            SortError::OutputWrite { source, .. } => Some(source),
            SortError::ResourceExhausted { .. } => None,
            SortError::InvalidChunkSize => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::InputNotFound { path, source } => {
                write!(f, "input file {} can not be opened: {}", path.display(), source)
            }
            SortError::InputRead(err) => write!(f, "input data stream error: {}", err),
            SortError::TempDir(err) => write!(f, "temporary directory not created: {}", err),
            SortError::ChunkWrite(err) => write!(f, "chunk not saved: {}", err),
            SortError::ChunkRead {
                error, lines_written, ..
            } => write!(f, "{} after {} lines", error, lines_written),
            SortError::OutputWrite {
                lines_written, source, ..
            } => write!(f, "output writing failed after {} lines: {}", lines_written, source),
            SortError::ResourceExhausted { chunks, limit } => {
                write!(f, "{} chunks exceed the open chunks limit {}", chunks, limit)
            }
            SortError::InvalidChunkSize => write!(f, "chunk size must be positive"),
        }
    }
}

/// Sorting outcome.
#[derive(Debug, Default)]
pub struct SortReport {
    /// Number of lines read from the input.
    pub lines_read: u64,
    /// Number of lines written to the output.
    pub lines_written: u64,
    /// Number of created chunks.
    pub chunks: usize,
    /// Chunks skipped during the merge.
    pub failed_chunks: Vec<ChunkReadError>,
}

impl SortReport {
    /// Checks that every input line reached the output.
    pub fn is_complete(&self) -> bool {
        self.failed_chunks.is_empty() && self.lines_read == self.lines_written
    }
}

/// Sort job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobState {
    Created,
    Chunking,
    Merging,
    Failed,
    CleaningUp,
    Done,
}

/// State of a single sort invocation. Owns the job temporary chunks.
pub(crate) struct SortJob<'a> {
    input: &'a Path,
    output: &'a Path,
    registry: ChunkRegistry,
    states: Vec<JobState>,
}

impl<'a> SortJob<'a> {
    pub(crate) fn new(input: &'a Path, output: &'a Path, tmp_dir: Option<&Path>) -> Result<Self, SortError> {
        let registry = ChunkRegistry::new(tmp_dir).map_err(SortError::TempDir)?;

        return Ok(SortJob {
            input,
            output,
            registry,
            states: vec![JobState::Created],
        });
    }

    pub(crate) fn states(&self) -> &[JobState] {
        &self.states
    }

    fn transition(&mut self, state: JobState) {
        log::debug!("sort job {:?} -> {:?}", self.state(), state);
        self.states.push(state);
    }

    fn state(&self) -> JobState {
        *self.states.last().unwrap_or(&JobState::Created)
    }

    /// Runs the job to completion. Temporary chunks are removed whatever the outcome is.
    pub(crate) fn run<B, F>(&mut self, chunker: &Chunker<B, F>, merger: &Merger<F>) -> Result<SortReport, SortError>
    where
        B: ChunkBufferBuilder<Line>,
        F: ChunkFormat,
    {
        let result = self.sort(chunker, merger);
        if let Err(err) = &result {
            log::debug!("sort job failed: {}", err);
            self.transition(JobState::Failed);
        }

        self.transition(JobState::CleaningUp);
        self.registry.cleanup();
        self.transition(JobState::Done);
        log::trace!("sort job states: {:?}", self.states());

        return result;
    }

    fn sort<B, F>(&mut self, chunker: &Chunker<B, F>, merger: &Merger<F>) -> Result<SortReport, SortError>
    where
        B: ChunkBufferBuilder<Line>,
        F: ChunkFormat,
    {
        self.transition(JobState::Chunking);
        chunker.create_sorted_chunks(self.input, &mut self.registry)?;

        self.transition(JobState::Merging);
        let merge_report = merger.merge_chunks(self.registry.chunks(), self.output)?;

        return Ok(SortReport {
            lines_read: self.registry.chunks().iter().map(|chunk| chunk.len() as u64).sum(),
            lines_written: merge_report.lines_written,
            chunks: self.registry.chunks().len(),
            failed_chunks: merge_report.failed_chunks,
        });
    }
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder<B = LimitedBufferBuilder, F = TextChunkFormat>
where
    B: ChunkBufferBuilder<Line>,
    F: ChunkFormat,
{
    /// Directory to be used to store temporary data.
    tmp_dir: Option<PathBuf>,
    /// Chunk file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Chunk buffer builder.
    buffer_builder: B,
    /// Lines order.
    order: SortOrder,
    /// Maximum number of chunks opened simultaneously.
    max_open_chunks: Option<usize>,
    /// Abort on chunk read errors.
    strict: bool,

    /// Chunk format type.
    format: PhantomData<F>,
}

impl ExternalSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }
}

impl<B, F> ExternalSorterBuilder<B, F>
where
    B: ChunkBufferBuilder<Line>,
    F: ChunkFormat,
{
    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<B, F>, SortError> {
        ExternalSorter::new(
            self.tmp_dir.as_deref(),
            self.buffer_builder,
            self.rw_buf_size,
            self.order,
            self.max_open_chunks,
            self.strict,
        )
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<B, F> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets buffer builder.
    pub fn with_buffer<B2>(self, buffer_builder: B2) -> ExternalSorterBuilder<B2, F>
    where
        B2: ChunkBufferBuilder<Line>,
    {
        ExternalSorterBuilder {
            tmp_dir: self.tmp_dir,
            rw_buf_size: self.rw_buf_size,
            buffer_builder,
            order: self.order,
            max_open_chunks: self.max_open_chunks,
            strict: self.strict,
            format: PhantomData,
        }
    }

    /// Sets number of lines per chunk.
    pub fn with_chunk_size(self, chunk_size: usize) -> ExternalSorterBuilder<LimitedBufferBuilder, F> {
        self.with_buffer(LimitedBufferBuilder::new(chunk_size, false))
    }

    /// Sets chunk serialization format.
    pub fn with_format<F2>(self) -> ExternalSorterBuilder<B, F2>
    where
        F2: ChunkFormat,
    {
        ExternalSorterBuilder {
            tmp_dir: self.tmp_dir,
            rw_buf_size: self.rw_buf_size,
            buffer_builder: self.buffer_builder,
            order: self.order,
            max_open_chunks: self.max_open_chunks,
            strict: self.strict,
            format: PhantomData,
        }
    }

    /// Sets chunk read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder<B, F> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets lines order.
    pub fn with_order(mut self, order: SortOrder) -> ExternalSorterBuilder<B, F> {
        self.order = order;
        return self;
    }

    /// Sets maximum number of chunks opened simultaneously during the merge.
    pub fn with_max_open_chunks(mut self, max_open_chunks: usize) -> ExternalSorterBuilder<B, F> {
        self.max_open_chunks = Some(max_open_chunks);
        return self;
    }

    /// Makes the sorter fail on the first unreadable chunk instead of skipping it.
    pub fn with_strict(mut self, strict: bool) -> ExternalSorterBuilder<B, F> {
        self.strict = strict;
        return self;
    }
}

impl<B, F> Default for ExternalSorterBuilder<B, F>
where
    B: ChunkBufferBuilder<Line>,
    F: ChunkFormat,
{
    fn default() -> Self {
        ExternalSorterBuilder {
            tmp_dir: None,
            rw_buf_size: None,
            buffer_builder: B::default(),
            order: SortOrder::default(),
            max_open_chunks: None,
            strict: false,
            format: PhantomData,
        }
    }
}

/// External sorter.
pub struct ExternalSorter<B = LimitedBufferBuilder, F = TextChunkFormat>
where
    B: ChunkBufferBuilder<Line>,
    F: ChunkFormat,
{
    /// Directory to be used to store temporary data.
    tmp_dir: Option<PathBuf>,
    /// Input splitter.
    chunker: Chunker<B, F>,
    /// Chunks merger.
    merger: Merger<F>,
}

impl<B, F> ExternalSorter<B, F>
where
    B: ChunkBufferBuilder<Line>,
    F: ChunkFormat,
{
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `tmp_path` - Directory to be used to store temporary data. If paramater is [`None`] default OS temporary
    ///   directory will be used.
    /// * `buffer_builder` - An instance of a buffer builder that will be used for chunk buffer creation.
    /// * `rw_buf_size` - Chunks file read/write buffer size.
    /// * `order` - Lines order.
    /// * `max_open_chunks` - Maximum number of chunks, hence simultaneously open files. Unlimited if [`None`].
    /// * `strict` - Fail on the first unreadable chunk instead of skipping it.
    pub fn new(
        tmp_path: Option<&Path>,
        buffer_builder: B,
        rw_buf_size: Option<usize>,
        order: SortOrder,
        max_open_chunks: Option<usize>,
        strict: bool,
    ) -> Result<Self, SortError> {
        if buffer_builder.chunk_size() == 0 {
            return Err(SortError::InvalidChunkSize);
        }

        return Ok(ExternalSorter {
            tmp_dir: tmp_path.map(Path::to_path_buf),
            chunker: Chunker::new(buffer_builder, rw_buf_size, order, max_open_chunks),
            merger: Merger::new(rw_buf_size, order, max_open_chunks, strict),
        });
    }

    /// Sorts lines of the `input` file into the `output` file.
    /// The output file is not created if the input can not be opened.
    ///
    /// # Arguments
    /// * `input` - File to be sorted
    /// * `output` - Result file
    pub fn sort(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<SortReport, SortError> {
        let (input, output) = (input.as_ref(), output.as_ref());
        log::info!("sorting {} into {}", input.display(), output.display());

        let mut job = SortJob::new(input, output, self.tmp_dir.as_deref())?;
        let report = job.run(&self.chunker, &self.merger)?;

        log::info!(
            "sorting done: {} lines written from {} chunks",
            report.lines_written,
            report.chunks
        );
        return Ok(report);
    }
}

/// Sorts lines of the `input` file into the `output` file using chunks of at most `chunk_size` lines.
/// Temporary chunks are stored in the default OS temporary directory.
pub fn sort_file(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    chunk_size: usize,
) -> Result<SortReport, SortError> {
    ExternalSorterBuilder::new()
        .with_chunk_size(chunk_size)
        .build()?
        .sort(input, output)
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::{Path, PathBuf};

    use rand::seq::SliceRandom;
    use rand::Rng;
    use rstest::*;

    use super::{sort_file, ExternalSorter, ExternalSorterBuilder, JobState, SortError, SortJob};
    use crate::chunk::RmpChunkFormat;
    use crate::merger::SortOrder;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    /// Writes `lines` random numbers, one per line.
    fn generate_input(path: &Path, lines: usize) {
        let mut rng = rand::thread_rng();
        let content: String = (0..lines)
            .map(|_| format!("{}\n", rng.gen_range(1..=1_000_000)))
            .collect();
        fs::write(path, content).unwrap();
    }

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path).unwrap().lines().map(String::from).collect()
    }

    fn chunks_dir(tmp_dir: &tempfile::TempDir) -> PathBuf {
        let path = tmp_dir.path().join("chunks");
        fs::create_dir(&path).unwrap();
        return path;
    }

    fn sorter(chunks_dir: &Path, chunk_size: usize) -> ExternalSorter {
        ExternalSorterBuilder::new()
            .with_chunk_size(chunk_size)
            .with_tmp_dir(chunks_dir)
            .build()
            .unwrap()
    }

    #[rstest]
    fn test_sort_scenario(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        let output = tmp_dir.path().join("output.txt");
        fs::write(&input, "5\n3\n5\n1\n").unwrap();

        let report = sort_file(&input, &output, 2).unwrap();

        assert_eq!(report.chunks, 2);
        assert_eq!(report.lines_written, 4);
        assert!(report.is_complete());
        assert_eq!(read_lines(&output), vec!["1", "3", "5", "5"]);
    }

    #[rstest]
    fn test_sort_random(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        let output = tmp_dir.path().join("output.txt");
        let chunks_dir = chunks_dir(&tmp_dir);
        generate_input(&input, 1000);

        let report = sorter(&chunks_dir, 64).sort(&input, &output).unwrap();

        let mut expected = read_lines(&input);
        expected.sort();
        assert_eq!(read_lines(&output), expected);
        assert_eq!(report.lines_read, 1000);
        assert_eq!(report.lines_written, 1000);
        assert_eq!(report.chunks, 16);
        assert_eq!(fs::read_dir(&chunks_dir).unwrap().count(), 0);
    }

    #[rstest]
    fn test_chunk_size_independence(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        let chunks_dir = chunks_dir(&tmp_dir);

        let mut lines: Vec<String> = (0..50).map(|i| format!("line {}", i % 17)).collect();
        lines.shuffle(&mut rand::thread_rng());
        fs::write(&input, lines.join("\n")).unwrap();

        let outputs: Vec<Vec<String>> = [1, 7, 50, 100]
            .iter()
            .map(|chunk_size| {
                let output = tmp_dir.path().join(format!("output-{}.txt", chunk_size));
                let report = sorter(&chunks_dir, *chunk_size).sort(&input, &output).unwrap();
                assert!(report.is_complete());
                read_lines(&output)
            })
            .collect();

        lines.sort();
        for output in outputs {
            assert_eq!(output, lines);
        }
    }

    #[rstest]
    fn test_sort_idempotent(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        let first = tmp_dir.path().join("first.txt");
        let second = tmp_dir.path().join("second.txt");
        generate_input(&input, 300);

        sort_file(&input, &first, 32).unwrap();
        sort_file(&first, &second, 32).unwrap();

        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[rstest]
    fn test_sort_empty_input(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        let output = tmp_dir.path().join("output.txt");
        fs::write(&input, "").unwrap();

        let report = sort_file(&input, &output, 10).unwrap();

        assert_eq!(report.chunks, 0);
        assert_eq!(report.lines_written, 0);
        assert!(output.exists());
        assert_eq!(fs::read_to_string(&output).unwrap(), "");
    }

    #[rstest]
    fn test_sort_missing_input(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("missing.txt");
        let output = tmp_dir.path().join("output.txt");
        let chunks_dir = chunks_dir(&tmp_dir);

        let result = sorter(&chunks_dir, 10).sort(&input, &output);

        assert!(matches!(result, Err(SortError::InputNotFound { .. })));
        assert!(!output.exists());
        assert_eq!(fs::read_dir(&chunks_dir).unwrap().count(), 0);
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_sort_order_and_format(tmp_dir: tempfile::TempDir, #[case] reversed: bool) {
        let input = tmp_dir.path().join("input.txt");
        let output = tmp_dir.path().join("output.txt");
        generate_input(&input, 200);

        let order = if reversed { SortOrder::Desc } else { SortOrder::Asc };
        let sorter: ExternalSorter<_, RmpChunkFormat> = ExternalSorterBuilder::new()
            .with_chunk_size(9)
            .with_format::<RmpChunkFormat>()
            .with_order(order)
            .with_rw_buf_size(128)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        sorter.sort(&input, &output).unwrap();

        let mut expected = read_lines(&input);
        expected.sort();
        if reversed {
            expected.reverse();
        }
        assert_eq!(read_lines(&output), expected);
    }

    #[rstest]
    fn test_sort_open_chunks_limit(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        let output = tmp_dir.path().join("output.txt");
        let chunks_dir = chunks_dir(&tmp_dir);
        generate_input(&input, 100);

        let sorter = ExternalSorterBuilder::new()
            .with_chunk_size(10)
            .with_max_open_chunks(4)
            .with_tmp_dir(&chunks_dir)
            .build()
            .unwrap();

        let result = sorter.sort(&input, &output);

        assert!(matches!(result, Err(SortError::ResourceExhausted { limit: 4, .. })));
        assert!(!output.exists());
        assert_eq!(fs::read_dir(&chunks_dir).unwrap().count(), 0);
    }

    #[rstest]
    fn test_sort_output_error_removes_chunks(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        let output = tmp_dir.path().join("missing").join("output.txt");
        let chunks_dir = chunks_dir(&tmp_dir);
        generate_input(&input, 40);

        let result = sorter(&chunks_dir, 8).sort(&input, &output);

        match result {
            Err(err @ SortError::OutputWrite { .. }) => {
                assert_eq!(err.lines_written(), 0);
                assert!(err.failed_chunks().is_empty());
            }
            other => panic!("unexpected sort result: {:?}", other),
        }
        assert_eq!(fs::read_dir(&chunks_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_invalid_chunk_size() {
        let result = ExternalSorterBuilder::new().with_chunk_size(0).build();
        assert!(matches!(result, Err(SortError::InvalidChunkSize)));
    }

    #[rstest]
    fn test_job_states(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        let output = tmp_dir.path().join("output.txt");
        fs::write(&input, "b\na\n").unwrap();
        let sorter = sorter(tmp_dir.path(), 1);

        let mut job = SortJob::new(&input, &output, Some(tmp_dir.path())).unwrap();
        job.run(&sorter.chunker, &sorter.merger).unwrap();
        assert_eq!(
            job.states(),
            &[
                JobState::Created,
                JobState::Chunking,
                JobState::Merging,
                JobState::CleaningUp,
                JobState::Done
            ]
        );

        let missing = tmp_dir.path().join("missing.txt");
        let mut job = SortJob::new(&missing, &output, Some(tmp_dir.path())).unwrap();
        assert!(job.run(&sorter.chunker, &sorter.merger).is_err());
        assert_eq!(
            job.states(),
            &[
                JobState::Created,
                JobState::Chunking,
                JobState::Failed,
                JobState::CleaningUp,
                JobState::Done
            ]
        );
    }

    #[rstest]
    fn test_no_chunks_left_after_sort(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        let output = tmp_dir.path().join("output.txt");
        let chunks_dir = chunks_dir(&tmp_dir);
        generate_input(&input, 50);

        let sorter = sorter(&chunks_dir, 5);
        let mut job = SortJob::new(&input, &output, Some(&chunks_dir)).unwrap();
        job.run(&sorter.chunker, &sorter.merger).unwrap();

        let job_dir = job.registry.path().to_path_buf();
        assert_eq!(fs::read_dir(&job_dir).unwrap().count(), 0);

        drop(job);
        assert_eq!(fs::read_dir(&chunks_dir).unwrap().count(), 0);
    }
}
