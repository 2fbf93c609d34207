//! Limited chunk buffer implementations.

/// Default number of lines per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Buffer builder.
pub trait ChunkBufferBuilder<T>: Default {
    type Buffer: ChunkBuffer<T>;

    /// Creates a new buffer.
    fn build(&self) -> Self::Buffer;

    /// Returns the maximum number of items a single buffer holds.
    fn chunk_size(&self) -> usize;
}

/// Base limited buffer interface.
pub trait ChunkBuffer<T>: IntoIterator<Item = T> {
    /// Adds a new element to the buffer.
    fn push(&mut self, item: T);

    /// Returns buffer length
    fn len(&self) -> usize;

    /// Checks if the buffer reached the limit.
    fn is_full(&self) -> bool;

    /// Returns buffered items as a mutable slice so they can be sorted in place.
    fn as_mut_slice(&mut self) -> &mut [T];

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct LimitedBufferBuilder {
    buffer_limit: usize,
    preallocate: bool,
}

impl LimitedBufferBuilder {
    /// Creates a builder of buffers holding at most `buffer_limit` items.
    /// If `preallocate` is set each buffer reserves its full capacity upfront.
    pub fn new(buffer_limit: usize, preallocate: bool) -> Self {
        LimitedBufferBuilder {
            buffer_limit,
            preallocate,
        }
    }
}

impl<T> ChunkBufferBuilder<T> for LimitedBufferBuilder {
    type Buffer = LimitedBuffer<T>;

    fn build(&self) -> Self::Buffer {
        if self.preallocate {
            LimitedBuffer::with_capacity(self.buffer_limit)
        } else {
            LimitedBuffer::new(self.buffer_limit)
        }
    }

    fn chunk_size(&self) -> usize {
        self.buffer_limit
    }
}

impl Default for LimitedBufferBuilder {
    fn default() -> Self {
        LimitedBufferBuilder {
            buffer_limit: DEFAULT_CHUNK_SIZE,
            preallocate: false,
        }
    }
}

/// Buffer limited by elements count.
pub struct LimitedBuffer<T> {
    limit: usize,
    inner: Vec<T>,
}

impl<T> LimitedBuffer<T> {
    pub fn new(limit: usize) -> Self {
        LimitedBuffer {
            limit,
            inner: Vec::new(),
        }
    }

    pub fn with_capacity(limit: usize) -> Self {
        LimitedBuffer {
            limit,
            inner: Vec::with_capacity(limit),
        }
    }
}

impl<T> ChunkBuffer<T> for LimitedBuffer<T> {
    fn push(&mut self, item: T) {
        self.inner.push(item);
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn is_full(&self) -> bool {
        self.inner.len() >= self.limit
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        self.inner.as_mut_slice()
    }
}

impl<T> IntoIterator for LimitedBuffer<T> {
    type Item = T;
    type IntoIter = <Vec<T> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}


#[cfg(feature = "memory-limit")]
pub mod mem {
    use deepsize;

    use super::{ChunkBuffer, ChunkBufferBuilder, DEFAULT_CHUNK_SIZE};

    /// Builder of buffers bounded both by lines count and by consumed memory.
    #[derive(Clone)]
    pub struct MemoryLimitedBufferBuilder {
        lines_limit: usize,
        buffer_limit: u64,
    }

    impl MemoryLimitedBufferBuilder {
        pub fn new(lines_limit: usize, buffer_limit: u64) -> Self {
            MemoryLimitedBufferBuilder {
                lines_limit,
                buffer_limit,
            }
        }
    }

    impl<T> ChunkBufferBuilder<T> for MemoryLimitedBufferBuilder
    where
        T: deepsize::DeepSizeOf,
    {
        type Buffer = MemoryLimitedBuffer<T>;

        fn build(&self) -> Self::Buffer {
            MemoryLimitedBuffer::new(self.lines_limit, self.buffer_limit)
        }

        fn chunk_size(&self) -> usize {
            self.lines_limit
        }
    }

    impl Default for MemoryLimitedBufferBuilder {
        fn default() -> Self {
            MemoryLimitedBufferBuilder {
                lines_limit: DEFAULT_CHUNK_SIZE,
                buffer_limit: u64::MAX,
            }
        }
    }

    /// Buffer limited by consumed memory.
    pub struct MemoryLimitedBuffer<T> {
        lines_limit: usize,
        limit: u64,
        current_size: u64,
        inner: Vec<T>,
    }

    impl<T> MemoryLimitedBuffer<T> {
        pub fn new(lines_limit: usize, limit: u64) -> Self {
            MemoryLimitedBuffer {
                lines_limit,
                limit,
                current_size: 0,
                inner: Vec::new(),
            }
        }

        pub fn mem_size(&self) -> u64 {
            self.current_size
        }
    }

    impl<T> ChunkBuffer<T> for MemoryLimitedBuffer<T>
    where
        T: deepsize::DeepSizeOf,
    {
        fn push(&mut self, item: T) {
            self.current_size += item.deep_size_of() as u64;
            self.inner.push(item);
        }

        fn len(&self) -> usize {
            self.inner.len()
        }

        fn is_full(&self) -> bool {
            self.current_size >= self.limit || self.inner.len() >= self.lines_limit
        }

        fn as_mut_slice(&mut self) -> &mut [T] {
            self.inner.as_mut_slice()
        }
    }

    impl<T> IntoIterator for MemoryLimitedBuffer<T> {
        type Item = T;
        type IntoIter = <Vec<T> as IntoIterator>::IntoIter;

        fn into_iter(self) -> Self::IntoIter {
            self.inner.into_iter()
        }
    }

}
