//! Pool configuration and the block geometry derived from it.

use std::mem;

use crate::{
    block::{BLOCK_HEADER_SIZE, CHUNK_HEADER_SIZE},
    error::{PoolError, Result},
    utils::{adjust, boundary},
};

/// Default number of chunks per block.
pub const DEFAULT_COUNT: usize = 64;

/// Default chunk alignment: the pointer size.
pub const DEFAULT_ALIGN: usize = mem::size_of::<usize>();

/// Default granularity the chunk count is rounded up to.
pub const DEFAULT_GRANULARITY: usize = 1;

/// Configuration of a [`crate::Pool`].
///
/// All values are normalized when the pool is built, so any combination is
/// accepted as long as the resulting block size fits in memory:
///
/// - `align` is rounded up to a power of two, and to at least the pointer size.
/// - `chunk_size` is raised to at least the pointer size, then the chunk
///   header is added and the total rounded up to the alignment.
/// - `count` is raised to at least one and rounded up to a multiple of
///   `count_granularity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Usable bytes per chunk.
    pub chunk_size: usize,
    /// Chunks per block.
    pub count: usize,
    /// Alignment of every pointer handed out by the pool.
    pub align: usize,
    /// The chunk count is rounded up to a multiple of this value.
    pub count_granularity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            chunk_size: mem::size_of::<usize>(),
            count: DEFAULT_COUNT,
            align: DEFAULT_ALIGN,
            count_granularity: DEFAULT_GRANULARITY,
        }
    }
}

impl PoolConfig {
    /// Configuration for chunks of `chunk_size` bytes with default count and alignment.
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            ..Self::default()
        }
    }

    /// Configuration sized and aligned for values of type `T`.
    #[must_use]
    pub fn for_type<T>() -> Self {
        Self::new(mem::size_of::<T>()).with_align(mem::align_of::<T>())
    }

    /// Chunks aligned for 256 bit SIMD loads.
    #[must_use]
    pub fn simd(chunk_size: usize) -> Self {
        Self::new(chunk_size).with_align(32)
    }

    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    #[must_use]
    pub fn with_align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    #[must_use]
    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.count_granularity = granularity;
        self
    }

    /// Computes the block layout for this configuration.
    pub(crate) fn geometry(&self) -> Result<Geometry> {
        const MAX_ALIGN: usize = 1 << (usize::BITS - 2);

        if self.align > MAX_ALIGN {
            return Err(PoolError::invalid_config(format!(
                "alignment {} is too large",
                self.align
            )));
        }

        let alignment = boundary(self.align).max(mem::size_of::<usize>());
        let storage = self.chunk_size.max(mem::size_of::<usize>());

        let stride = storage
            .checked_add(CHUNK_HEADER_SIZE)
            .and_then(|size| adjust(size, alignment))
            .ok_or_else(|| {
                PoolError::invalid_config(format!("chunk size {} overflows", self.chunk_size))
            })?;

        let count = adjust(self.count.max(1), self.count_granularity.max(1)).ok_or_else(|| {
            PoolError::invalid_config(format!("chunk count {} overflows", self.count))
        })?;

        // The first chunk starts one header before an aligned address so that
        // its storage is aligned.
        let first = adjust(BLOCK_HEADER_SIZE + CHUNK_HEADER_SIZE, alignment)
            .map(|data| data - CHUNK_HEADER_SIZE)
            .ok_or_else(|| PoolError::invalid_config("block header overflows"))?;

        let allocate = stride
            .checked_mul(count)
            .and_then(|chunks| chunks.checked_add(first))
            .and_then(|size| adjust(size, alignment))
            .filter(|size| *size <= isize::MAX as usize)
            .ok_or_else(|| {
                PoolError::invalid_config(format!(
                    "{count} chunks of {stride} bytes do not fit in one block"
                ))
            })?;

        Ok(Geometry {
            alignment,
            stride,
            count,
            first,
            allocate,
        })
    }
}

/// Normalized block layout.
///
/// ```text
/// base                first                first + stride
///  +--------+---------+--------+-----------+--------+-----------+
///  | header | padding | parent |   data    | parent |   data    | ...
///  +--------+---------+--------+-----------+--------+-----------+
///                              ^ aligned            ^ aligned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    /// Alignment of blocks and of every chunk's storage.
    pub alignment: usize,
    /// Bytes per chunk, header included.
    pub stride: usize,
    /// Chunks per block.
    pub count: usize,
    /// Offset of the first chunk from the block base.
    pub first: usize,
    /// Bytes requested from the backend per block.
    pub allocate: usize,
}

impl Geometry {
    /// Usable bytes per chunk.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.stride - CHUNK_HEADER_SIZE
    }
}
