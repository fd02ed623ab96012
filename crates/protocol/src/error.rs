//! Codec errors.

/// Errors produced while encoding or decoding a [`TransferMessage`](crate::TransferMessage).
///
/// Every decode error means the frame is malformed; none is recoverable
/// within a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("empty message")]
    Empty,

    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("message truncated while reading {field}")]
    Truncated { field: &'static str },

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("invalid flag byte 0x{0:02x}")]
    InvalidFlag(u8),

    #[error("file name is not valid UTF-8: {0}")]
    InvalidFileName(String),

    #[error("file name too long: {0} bytes (max {max})", max = u16::MAX)]
    FileNameTooLong(usize),

    #[error("chunk size must be at least 1 byte")]
    ZeroChunkSize,

    #[error("chunk size {0} exceeds maximum {max}", max = crate::MAX_CHUNK_SIZE)]
    ChunkSizeTooLarge(u32),

    #[error("total size {0} needs more than {max} chunks", max = crate::MAX_TOTAL_CHUNKS)]
    TooManyChunks(u64),

    #[error("declared {declared} chunks but size requires {expected}")]
    ChunkCountMismatch { declared: u32, expected: u32 },

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("chunk {index} payload is {actual} bytes, expected {expected}")]
    PayloadLengthMismatch {
        index: u32,
        expected: usize,
        actual: usize,
    },
}
