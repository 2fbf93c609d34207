//! Temporary chunk lifecycle.
//!
//! Every sort job gets its own temporary directory, so chunk names only have to be unique within a job.
//! Chunks left behind by a killed process are not reclaimed automatically; they can be recognised by the
//! [`CHUNK_DIR_PREFIX`] of their directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::chunk::{Chunk, ChunkId};

/// Prefix of job temporary directories.
pub const CHUNK_DIR_PREFIX: &str = "ext-line-sort-";

/// Removes chunk files. Chunks that no longer exist are skipped, so calling it twice is harmless.
/// Returns the number of removed files.
pub fn cleanup(chunks: &[Chunk]) -> usize {
    let mut removed = 0;

    for chunk in chunks {
        match fs::remove_file(chunk.path()) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("chunk {} not removed: {}", chunk.path().display(), err),
        }
    }

    return removed;
}

/// Job-scoped registry of temporary chunks.
/// Allocates chunk identifiers and file names and removes every registered chunk when dropped.
pub struct ChunkRegistry {
    dir: tempfile::TempDir,
    chunks: Vec<Chunk>,
    next_id: usize,
}

impl ChunkRegistry {
    /// Creates a registry backed by a fresh directory inside `tmp_path`,
    /// or inside the default OS temporary directory if it is [`None`].
    pub fn new(tmp_path: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(CHUNK_DIR_PREFIX);

        let dir = if let Some(tmp_path) = tmp_path {
            builder.tempdir_in(tmp_path)
        } else {
            builder.tempdir()
        }?;

        log::info!("using {} as a temporary directory", dir.path().display());

        return Ok(ChunkRegistry {
            dir,
            chunks: Vec::new(),
            next_id: 0,
        });
    }

    /// Reserves the next chunk identifier and its file path.
    pub fn allocate(&mut self, extension: &str) -> (ChunkId, PathBuf) {
        let id = ChunkId::new(self.next_id);
        self.next_id += 1;

        let path = self.dir.path().join(format!("chunk-{:06}.{}", id.index(), extension));
        return (id, path);
    }

    /// Takes ownership of a written chunk.
    pub fn register(&mut self, chunk: Chunk) {
        log::debug!("chunk {} registered ({} lines)", chunk.id(), chunk.len());
        self.chunks.push(chunk);
    }

    /// Registered chunks in creation order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Job temporary directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Removes all registered chunk files.
    pub fn cleanup(&mut self) -> usize {
        let removed = cleanup(&self.chunks);
        if removed > 0 {
            log::debug!("{} chunk files removed", removed);
        }
        return removed;
    }
}

impl Drop for ChunkRegistry {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use rstest::*;

    use super::{cleanup, ChunkRegistry, CHUNK_DIR_PREFIX};
    use crate::chunk::{Chunk, ChunkId, TextChunkFormat};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn write_chunk(registry: &mut ChunkRegistry, lines: &[&str]) -> ChunkId {
        let (id, path) = registry.allocate("txt");
        let lines = lines.iter().map(|line| line.to_string());
        let chunk = Chunk::create::<TextChunkFormat>(id, path, lines, None).unwrap();
        registry.register(chunk);
        return id;
    }

    #[rstest]
    fn test_allocate(tmp_dir: tempfile::TempDir) {
        let mut registry = ChunkRegistry::new(Some(tmp_dir.path())).unwrap();

        let (id0, path0) = registry.allocate("txt");
        let (id1, path1) = registry.allocate("txt");

        assert_eq!(id0, ChunkId::new(0));
        assert_eq!(id1, ChunkId::new(1));
        assert_eq!(path0, registry.path().join("chunk-000000.txt"));
        assert_eq!(path1, registry.path().join("chunk-000001.txt"));
        assert!(registry.path().starts_with(tmp_dir.path()));

        let dir_name = registry.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(dir_name.starts_with(CHUNK_DIR_PREFIX));
    }

    #[rstest]
    fn test_cleanup_is_idempotent(tmp_dir: tempfile::TempDir) {
        let mut registry = ChunkRegistry::new(Some(tmp_dir.path())).unwrap();
        write_chunk(&mut registry, &["a", "b"]);
        write_chunk(&mut registry, &["c"]);

        fs::remove_file(registry.chunks()[0].path()).unwrap();

        assert_eq!(registry.cleanup(), 1);
        assert_eq!(registry.cleanup(), 0);
        assert_eq!(cleanup(registry.chunks()), 0);
        assert!(registry.chunks().iter().all(|chunk| !chunk.path().exists()));
    }

    #[rstest]
    fn test_drop_removes_everything(tmp_dir: tempfile::TempDir) {
        let mut registry = ChunkRegistry::new(Some(tmp_dir.path())).unwrap();
        write_chunk(&mut registry, &["a"]);
        write_chunk(&mut registry, &["b"]);

        let job_dir = registry.path().to_path_buf();
        assert_eq!(fs::read_dir(&job_dir).unwrap().count(), 2);

        drop(registry);

        assert!(!job_dir.exists());
        assert_eq!(fs::read_dir(tmp_dir.path()).unwrap().count(), 0);
    }
}
