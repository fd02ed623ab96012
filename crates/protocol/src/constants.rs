use std::time::Duration;

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;

/// Largest chunk size a peer will accept in `Metadata` (16 MiB).
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Most chunks a single transfer may declare.
///
/// Bounds the receiver's per-chunk bookkeeping, which is sized from
/// `Metadata` before any payload arrives.
pub const MAX_TOTAL_CHUNKS: u32 = 1 << 20;

/// Largest encoded message either peer will produce or accept.
///
/// A full chunk plus its header, or a metadata message with the longest
/// representable file name, whichever is larger.
pub const MAX_MESSAGE_SIZE: usize = MAX_CHUNK_SIZE as usize + 64 * 1024 + 64;

/// Time allowed for a connection to open before the session is abandoned.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Receiver progress is reported each time it crosses a new multiple of this
/// many percent.
pub const PROGRESS_STEP: u8 = 5;
