//! Transfer messages and their binary encoding.
//!
//! # Wire format
//!
//! One message per transport frame. Integers are big-endian.
//!
//! ```text
//! METADATA: [1: 0x01][8: total_size][4: chunk_size][4: total_chunks]
//!           [2: name_len][name_len: file_name UTF-8]
//! CHUNK:    [1: 0x02][4: index][4: payload_len][payload_len: payload]
//! COMPLETE: [1: 0x03][1: has_digest 0x00|0x01][32: SHA-256, present iff has_digest]
//! ```

use crate::{ChunkLayout, CodecError, MAX_CHUNK_SIZE};

/// Tag byte of a `Metadata` message.
pub const TAG_METADATA: u8 = 0x01;

/// Tag byte of a `Chunk` message.
pub const TAG_CHUNK: u8 = 0x02;

/// Tag byte of a `Complete` message.
pub const TAG_COMPLETE: u8 = 0x03;

/// SHA-256 digest of a whole payload.
pub type Digest = [u8; 32];

/// Describes the payload about to be transferred. Sent exactly once, first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

impl Metadata {
    /// Builds metadata for `file_name` from an already validated layout.
    pub fn new(file_name: impl Into<String>, layout: ChunkLayout) -> Self {
        Self {
            file_name: file_name.into(),
            total_size: layout.total_size(),
            chunk_size: layout.chunk_size(),
            total_chunks: layout.total_chunks(),
        }
    }

    /// Returns the chunk layout these fields describe.
    pub fn layout(&self) -> Result<ChunkLayout, CodecError> {
        ChunkLayout::from_parts(self.total_size, self.chunk_size, self.total_chunks)
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMessage {
    Metadata(Metadata),
    Chunk { index: u32, payload: Vec<u8> },
    /// No more messages follow. `digest` is the SHA-256 of the whole payload
    /// when the sender computed one.
    Complete { digest: Option<Digest> },
}

impl TransferMessage {
    /// Short lowercase name of the message kind, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Metadata(_) => "metadata",
            Self::Chunk { .. } => "chunk",
            Self::Complete { .. } => "complete",
        }
    }

    /// Encodes the message into a single frame.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Metadata(meta) => {
                let name = meta.file_name.as_bytes();
                if name.len() > u16::MAX as usize {
                    return Err(CodecError::FileNameTooLong(name.len()));
                }
                let mut buf = Vec::with_capacity(1 + 8 + 4 + 4 + 2 + name.len());
                buf.push(TAG_METADATA);
                buf.extend_from_slice(&meta.total_size.to_be_bytes());
                buf.extend_from_slice(&meta.chunk_size.to_be_bytes());
                buf.extend_from_slice(&meta.total_chunks.to_be_bytes());
                buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
                buf.extend_from_slice(name);
                Ok(buf)
            }
            Self::Chunk { index, payload } => {
                if payload.len() > MAX_CHUNK_SIZE as usize {
                    return Err(CodecError::PayloadTooLarge(payload.len()));
                }
                let mut buf = Vec::with_capacity(1 + 4 + 4 + payload.len());
                buf.push(TAG_CHUNK);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                buf.extend_from_slice(payload);
                Ok(buf)
            }
            Self::Complete { digest } => {
                let mut buf = Vec::with_capacity(2 + 32);
                buf.push(TAG_COMPLETE);
                match digest {
                    Some(d) => {
                        buf.push(0x01);
                        buf.extend_from_slice(d);
                    }
                    None => buf.push(0x00),
                }
                Ok(buf)
            }
        }
    }

    /// Decodes a single frame.
    ///
    /// When `layout` is given (the receiver has already seen `Metadata`), a
    /// chunk whose index is in range must carry exactly the number of bytes
    /// the layout assigns to that index. Out-of-range indices are left for the
    /// caller to reject; the codec only judges structure.
    pub fn decode(raw: &[u8], layout: Option<&ChunkLayout>) -> Result<Self, CodecError> {
        let mut r = Reader::new(raw);
        let tag = r.u8("tag").map_err(|_| CodecError::Empty)?;

        let msg = match tag {
            TAG_METADATA => {
                let total_size = r.u64("total_size")?;
                let chunk_size = r.u32("chunk_size")?;
                let total_chunks = r.u32("total_chunks")?;
                let name_len = r.u16("name_len")? as usize;
                let name = r.take(name_len, "file_name")?;
                let file_name = String::from_utf8(name.to_vec())
                    .map_err(|e| CodecError::InvalidFileName(e.to_string()))?;

                let meta = Metadata {
                    file_name,
                    total_size,
                    chunk_size,
                    total_chunks,
                };
                meta.layout()?;
                Self::Metadata(meta)
            }
            TAG_CHUNK => {
                let index = r.u32("index")?;
                let len = r.u32("payload_len")? as usize;
                if len > MAX_CHUNK_SIZE as usize {
                    return Err(CodecError::PayloadTooLarge(len));
                }
                let payload = r.take(len, "payload")?;
                if let Some(expected) = layout.and_then(|l| l.chunk_len(index)) {
                    if expected != len {
                        return Err(CodecError::PayloadLengthMismatch {
                            index,
                            expected,
                            actual: len,
                        });
                    }
                }
                Self::Chunk {
                    index,
                    payload: payload.to_vec(),
                }
            }
            TAG_COMPLETE => {
                let digest = match r.u8("has_digest")? {
                    0x00 => None,
                    0x01 => {
                        let mut d = [0u8; 32];
                        d.copy_from_slice(r.take(32, "digest")?);
                        Some(d)
                    }
                    other => return Err(CodecError::InvalidFlag(other)),
                };
                Self::Complete { digest }
            }
            other => return Err(CodecError::UnknownTag(other)),
        };

        r.finish()?;
        Ok(msg)
    }
}

/// Bounds-checked big-endian reader over a frame.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(CodecError::Truncated { field })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, CodecError> {
        Ok(self.array::<1>(field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.array(field)?))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.array(field)?))
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.array(field)?))
    }

    fn finish(self) -> Result<(), CodecError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

impl std::fmt::Display for TransferMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Metadata(m) => write!(
                f,
                "metadata(name={:?}, size={}, chunks={})",
                m.file_name, m.total_size, m.total_chunks
            ),
            Self::Chunk { index, payload } => write!(f, "chunk({index}, {} bytes)", payload.len()),
            Self::Complete { digest: Some(d) } => write!(f, "complete(sha256={})", hex::encode(d)),
            Self::Complete { digest: None } => write!(f, "complete"),
        }
    }
}
