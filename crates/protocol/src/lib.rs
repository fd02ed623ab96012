//! Wire protocol for peerpipe chunked transfers.
//!
//! A transfer is exactly three kinds of discrete message, always in this order:
//!
//! ```text
//! Metadata, Chunk(0), Chunk(1), ..., Chunk(total_chunks - 1), Complete
//! ```
//!
//! This crate owns the binary encoding of those messages and the chunk
//! arithmetic both peers must agree on. It knows nothing about connections.

pub mod constants;
mod error;
mod layout;
mod message;

pub use constants::{
    CONNECT_TIMEOUT, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MAX_MESSAGE_SIZE, MAX_TOTAL_CHUNKS,
    PROGRESS_STEP,
};
pub use error::CodecError;
pub use layout::ChunkLayout;
pub use message::{Digest, Metadata, TAG_CHUNK, TAG_COMPLETE, TAG_METADATA, TransferMessage};
