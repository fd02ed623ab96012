use std::ops::Range;

use crate::{CodecError, MAX_CHUNK_SIZE, MAX_TOTAL_CHUNKS};

/// How a payload of `total_size` bytes is cut into `chunk_size` pieces.
///
/// Invariant: `total_chunks == ceil(total_size / chunk_size)`,
/// `total_chunks <= MAX_TOTAL_CHUNKS` and `1 <= chunk_size <= MAX_CHUNK_SIZE`. Every chunk is `chunk_size` bytes
/// except possibly the last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    total_size: u64,
    chunk_size: u32,
    total_chunks: u32,
}

impl ChunkLayout {
    /// Computes the layout for a payload of `total_size` bytes.
    pub fn new(total_size: u64, chunk_size: u32) -> Result<Self, CodecError> {
        check_chunk_size(chunk_size)?;
        let total_chunks = total_size.div_ceil(u64::from(chunk_size));
        let total_chunks = u32::try_from(total_chunks)
            .ok()
            .filter(|&n| n <= MAX_TOTAL_CHUNKS)
            .ok_or(CodecError::TooManyChunks(total_size))?;
        Ok(Self {
            total_size,
            chunk_size,
            total_chunks,
        })
    }

    /// Rebuilds a layout from the three values a peer declared, checking that
    /// they agree with each other.
    pub fn from_parts(
        total_size: u64,
        chunk_size: u32,
        total_chunks: u32,
    ) -> Result<Self, CodecError> {
        let layout = Self::new(total_size, chunk_size)?;
        if layout.total_chunks != total_chunks {
            return Err(CodecError::ChunkCountMismatch {
                declared: total_chunks,
                expected: layout.total_chunks,
            });
        }
        Ok(layout)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Returns `true` if `index` is a valid chunk index for this layout.
    pub fn contains(&self, index: u32) -> bool {
        index < self.total_chunks
    }

    /// Byte range of chunk `index` within the payload.
    pub fn chunk_range(&self, index: u32) -> Option<Range<u64>> {
        if !self.contains(index) {
            return None;
        }
        let start = u64::from(index) * u64::from(self.chunk_size);
        let end = (start + u64::from(self.chunk_size)).min(self.total_size);
        Some(start..end)
    }

    /// Exact payload length of chunk `index`.
    pub fn chunk_len(&self, index: u32) -> Option<usize> {
        self.chunk_range(index).map(|r| (r.end - r.start) as usize)
    }
}

fn check_chunk_size(chunk_size: u32) -> Result<(), CodecError> {
    if chunk_size == 0 {
        return Err(CodecError::ZeroChunkSize);
    }
    if chunk_size > MAX_CHUNK_SIZE {
        return Err(CodecError::ChunkSizeTooLarge(chunk_size));
    }
    Ok(())
}
