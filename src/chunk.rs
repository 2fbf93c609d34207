//! Disk-resident sorted chunks.

use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// A single line of text. Trailing whitespace is stripped before a line enters a chunk.
pub type Line = String;

/// Job-scoped chunk identifier. Identifiers are assigned sequentially starting from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(usize);

impl ChunkId {
    pub fn new(index: usize) -> Self {
        ChunkId(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Chunk reading or writing error.
#[derive(Debug)]
pub enum ChunkError {
    /// Common I/O error.
    IO(io::Error),
    /// Data serialization error.
    SerializationError(rmp_serde::encode::Error),
    /// Data deserialization error.
    DeserializationError(rmp_serde::decode::Error),
}

impl Error for ChunkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            ChunkError::IO(err) => err,
            ChunkError::SerializationError(err) => err,
            ChunkError::DeserializationError(err) => err,
        })
    }
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ChunkError::IO(err) => write!(f, "chunk I/O operation failed: {}", err),
            ChunkError::SerializationError(err) => write!(f, "chunk serialization error: {}", err),
            ChunkError::DeserializationError(err) => write!(f, "chunk deserialization error: {}", err),
        }
    }
}

impl From<io::Error> for ChunkError {
    fn from(err: io::Error) -> Self {
        ChunkError::IO(err)
    }
}

/// A chunk that could not be read during the merge.
#[derive(Debug)]
pub struct ChunkReadError {
    chunk: ChunkId,
    cause: ChunkError,
}

impl ChunkReadError {
    pub fn new(chunk: ChunkId, cause: ChunkError) -> Self {
        ChunkReadError { chunk, cause }
    }

    /// Identifier of the chunk that failed.
    pub fn chunk(&self) -> ChunkId {
        self.chunk
    }

    pub fn cause(&self) -> &ChunkError {
        &self.cause
    }
}

impl Error for ChunkReadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.cause)
    }
}

impl fmt::Display for ChunkReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk {} read error: {}", self.chunk, self.cause)
    }
}

/// Chunk serialization format. Provides methods for storing lines in a chunk file and reading them back.
pub trait ChunkFormat {
    /// Chunk file extension.
    const EXTENSION: &'static str;

    /// Dumps lines to a chunk file.
    fn dump<W: Write>(writer: &mut W, lines: impl IntoIterator<Item = Line>) -> Result<(), ChunkError>;

    /// Loads the next line from a chunk file. Returns `None` when the chunk is exhausted.
    fn load<R: BufRead>(reader: &mut io::Take<R>) -> Result<Option<Line>, ChunkError>;
}

/// Plain text chunk format: one `\n` terminated line per record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextChunkFormat;

impl ChunkFormat for TextChunkFormat {
    const EXTENSION: &'static str = "txt";

    fn dump<W: Write>(writer: &mut W, lines: impl IntoIterator<Item = Line>) -> Result<(), ChunkError> {
        for line in lines.into_iter() {
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        }

        return Ok(());
    }

    fn load<R: BufRead>(reader: &mut io::Take<R>) -> Result<Option<Line>, ChunkError> {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if line.ends_with('\n') {
            line.pop();
        }

        return Ok(Some(line));
    }
}

/// RMP (Rust MessagePack) chunk format.
/// It uses MessagePack as a data serialization format.
/// For more information see https://msgpack.org/.
#[derive(Debug, Clone, Copy, Default)]
pub struct RmpChunkFormat;

impl ChunkFormat for RmpChunkFormat {
    const EXTENSION: &'static str = "rmp";

    fn dump<W: Write>(mut writer: &mut W, lines: impl IntoIterator<Item = Line>) -> Result<(), ChunkError> {
        for line in lines.into_iter() {
            rmp_serde::encode::write(&mut writer, &line).map_err(ChunkError::SerializationError)?;
        }

        return Ok(());
    }

    fn load<R: BufRead>(reader: &mut io::Take<R>) -> Result<Option<Line>, ChunkError> {
        if reader.limit() == 0 {
            return Ok(None);
        }

        rmp_serde::decode::from_read(reader)
            .map(Some)
            .map_err(ChunkError::DeserializationError)
    }
}

/// Handle to a sorted chunk stored on file system.
#[derive(Debug, Clone)]
pub struct Chunk {
    id: ChunkId,
    path: PathBuf,
    len: usize,
}

impl Chunk {
    /// Writes already sorted lines to a new chunk file at `path`.
    /// A partially written file is removed if writing fails.
    pub fn create<F: ChunkFormat>(
        id: ChunkId,
        path: PathBuf,
        lines: impl IntoIterator<Item = Line>,
        buf_size: Option<usize>,
    ) -> Result<Self, ChunkError> {
        let mut len = 0;
        let result = Self::write::<F>(&path, lines.into_iter().inspect(|_| len += 1), buf_size);
        if let Err(err) = result {
            if let Err(rm_err) = fs::remove_file(&path) {
                log::warn!("partial chunk {} not removed: {}", path.display(), rm_err);
            }
            return Err(err);
        }

        return Ok(Chunk { id, path, len });
    }

    fn write<F: ChunkFormat>(
        path: &Path,
        lines: impl IntoIterator<Item = Line>,
        buf_size: Option<usize>,
    ) -> Result<(), ChunkError> {
        let file = fs::File::create(path)?;
        let mut chunk_writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };

        F::dump(&mut chunk_writer, lines)?;
        chunk_writer.flush()?;

        return Ok(());
    }

    /// Opens a merge cursor positioned at the first line of the chunk.
    pub fn open<F: ChunkFormat>(&self, buf_size: Option<usize>) -> Result<MergeCursor<F>, ChunkError> {
        let file = fs::File::open(&self.path)?;
        let file_len = file.metadata()?.len();

        let chunk_reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        return Ok(MergeCursor::new(self.id, chunk_reader.take(file_len)));
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of lines stored in the chunk.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Read position within a single chunk during the merge.
pub struct MergeCursor<F> {
    chunk: ChunkId,
    reader: io::Take<io::BufReader<fs::File>>,

    format: PhantomData<F>,
}

impl<F: ChunkFormat> MergeCursor<F> {
    fn new(chunk: ChunkId, reader: io::Take<io::BufReader<fs::File>>) -> Self {
        MergeCursor {
            chunk,
            reader,
            format: PhantomData,
        }
    }

    pub fn chunk(&self) -> ChunkId {
        self.chunk
    }
}

impl<F: ChunkFormat> Iterator for MergeCursor<F> {
    type Item = Result<Line, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        F::load(&mut self.reader).transpose()
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use rstest::*;

    use super::{Chunk, ChunkError, ChunkFormat, ChunkId, RmpChunkFormat, TextChunkFormat};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn saved_lines() -> Vec<String> {
        vec!["", "alpha", "beta gamma", "delta", "", "epsilon\tzeta"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn check_chunk<F: ChunkFormat>(tmp_dir: &tempfile::TempDir, buf_size: Option<usize>) {
        let saved = saved_lines();
        let path = tmp_dir.path().join(format!("chunk.{}", F::EXTENSION));

        let chunk = Chunk::create::<F>(ChunkId::new(3), path.clone(), saved.clone(), buf_size).unwrap();
        assert_eq!(chunk.id(), ChunkId::new(3));
        assert_eq!(chunk.len(), saved.len());
        assert_eq!(chunk.path(), path.as_path());

        let cursor = chunk.open::<F>(buf_size).unwrap();
        assert_eq!(cursor.chunk(), ChunkId::new(3));

        let restored: Result<Vec<String>, ChunkError> = cursor.collect();
        assert_eq!(restored.unwrap(), saved);
    }

    #[rstest]
    #[case(None)]
    #[case(Some(4))]
    fn test_text_chunk(tmp_dir: tempfile::TempDir, #[case] buf_size: Option<usize>) {
        check_chunk::<TextChunkFormat>(&tmp_dir, buf_size);

        let content = fs::read_to_string(tmp_dir.path().join("chunk.txt")).unwrap();
        assert_eq!(content, "\nalpha\nbeta gamma\ndelta\n\nepsilon\tzeta\n");
    }

    #[rstest]
    fn test_rmp_chunk(tmp_dir: tempfile::TempDir) {
        check_chunk::<RmpChunkFormat>(&tmp_dir, None);
    }

    #[rstest]
    fn test_empty_chunk(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("empty.txt");
        let chunk = Chunk::create::<TextChunkFormat>(ChunkId::new(0), path, Vec::new(), None).unwrap();
        assert!(chunk.is_empty());

        let mut cursor = chunk.open::<TextChunkFormat>(None).unwrap();
        assert!(cursor.next().is_none());
    }

    #[rstest]
    fn test_open_removed_chunk(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("removed.txt");
        let chunk = Chunk::create::<TextChunkFormat>(ChunkId::new(1), path.clone(), vec!["a".to_string()], None)
            .unwrap();
        fs::remove_file(&path).unwrap();

        match chunk.open::<TextChunkFormat>(None) {
            Err(ChunkError::IO(err)) => assert_eq!(err.kind(), std::io::ErrorKind::NotFound),
            _ => panic!("chunk opening must fail"),
        }
    }

    #[rstest]
    fn test_create_in_missing_dir(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("missing").join("chunk.txt");
        let result = Chunk::create::<TextChunkFormat>(ChunkId::new(0), path, vec!["a".to_string()], None);
        assert!(matches!(result, Err(ChunkError::IO(_))));
    }
}
