//! Input splitting into sorted chunks.

use std::fs;
use std::io::{self, prelude::*};
use std::marker::PhantomData;
use std::path::Path;

use crate::chunk::{Chunk, ChunkFormat, ChunkId, Line, TextChunkFormat};
use crate::lifecycle::ChunkRegistry;
use crate::merger::SortOrder;
use crate::sort::SortError;
use crate::{ChunkBuffer, ChunkBufferBuilder, LimitedBufferBuilder};

/// Splits an input file into sorted chunks.
#[derive(Clone)]
pub struct Chunker<B = LimitedBufferBuilder, F = TextChunkFormat> {
    buffer_builder: B,
    rw_buf_size: Option<usize>,
    order: SortOrder,
    max_chunks: Option<usize>,

    format: PhantomData<F>,
}

impl<B, F> Chunker<B, F>
where
    B: ChunkBufferBuilder<Line>,
    F: ChunkFormat,
{
    /// Creates a new chunker.
    ///
    /// # Arguments
    /// * `buffer_builder` - Builder of the in-memory buffers that bound each chunk
    /// * `rw_buf_size` - Input and chunk files read/write buffer size
    /// * `order` - Order of lines within a chunk
    /// * `max_chunks` - Maximum number of chunks, unlimited if [`None`]
    pub fn new(buffer_builder: B, rw_buf_size: Option<usize>, order: SortOrder, max_chunks: Option<usize>) -> Self {
        Chunker {
            buffer_builder,
            rw_buf_size,
            order,
            max_chunks,
            format: PhantomData,
        }
    }

    /// Reads `input` line by line and stores it as sorted chunks registered in `registry`.
    /// Returns chunk identifiers in creation order. Empty input produces no chunks.
    pub fn create_sorted_chunks(&self, input: &Path, registry: &mut ChunkRegistry) -> Result<Vec<ChunkId>, SortError> {
        let file = fs::File::open(input).map_err(|err| SortError::InputNotFound {
            path: input.to_path_buf(),
            source: err,
        })?;
        let input_reader = match self.rw_buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        let mut chunk_buf = self.buffer_builder.build();
        let mut chunk_ids = Vec::new();

        for line in input_reader.lines() {
            let mut line = line.map_err(SortError::InputRead)?;
            line.truncate(line.trim_end().len());
            chunk_buf.push(line);

            if chunk_buf.is_full() {
                chunk_ids.push(self.create_chunk(chunk_buf, registry)?);
                chunk_buf = self.buffer_builder.build();
            }
        }

        if !chunk_buf.is_empty() {
            chunk_ids.push(self.create_chunk(chunk_buf, registry)?);
        }

        log::info!("{} sorted chunks created from {}", chunk_ids.len(), input.display());

        return Ok(chunk_ids);
    }

    fn create_chunk(&self, mut buffer: B::Buffer, registry: &mut ChunkRegistry) -> Result<ChunkId, SortError> {
        if let Some(limit) = self.max_chunks {
            if registry.chunks().len() >= limit {
                return Err(SortError::ResourceExhausted {
                    chunks: registry.chunks().len() + 1,
                    limit,
                });
            }
        }

        log::debug!("sorting chunk data ({} lines) ...", buffer.len());
        let order = self.order;
        buffer.as_mut_slice().sort_unstable_by(|a, b| order.compare(a, b));

        let (id, path) = registry.allocate(F::EXTENSION);
        log::debug!("saving chunk {} to {}", id, path.display());
        let chunk = Chunk::create::<F>(id, path, buffer, self.rw_buf_size).map_err(SortError::ChunkWrite)?;
        registry.register(chunk);

        return Ok(id);
    }
}
