use std::fmt;
use std::io::SeekFrom;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

use peerpipe_protocol::ChunkLayout;

use crate::TransferError;

/// Where the bytes of an outgoing transfer come from.
pub enum ByteSource {
    /// A file on disk, sized by `stat` and read chunk by chunk.
    File(PathBuf),
    /// A stream of unknown length, drained into memory before sending since
    /// `Metadata` needs the total size up front.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    Bytes(Vec<u8>),
}

impl ByteSource {
    pub fn stdin() -> Self {
        Self::Reader(Box::new(tokio::io::stdin()))
    }

    /// Sizes the source and returns a reader that serves chunks by index.
    pub(crate) async fn open(self, chunk_size: u32) -> Result<ChunkSource, TransferError> {
        let body = match self {
            Self::File(path) => {
                let file = tokio::fs::File::open(&path).await?;
                let size = file.metadata().await?.len();
                Body::File { file, path, size }
            }
            Self::Reader(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Body::Memory(buf)
            }
            Self::Bytes(bytes) => Body::Memory(bytes),
        };

        let total_size = match &body {
            Body::File { size, .. } => *size,
            Body::Memory(bytes) => bytes.len() as u64,
        };
        let layout = ChunkLayout::new(total_size, chunk_size)
            .map_err(|e| TransferError::InvalidParameters(e.to_string()))?;
        Ok(ChunkSource { layout, body })
    }
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Reader(_) => f.write_str("Reader(..)"),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
        }
    }
}

enum Body {
    File {
        file: tokio::fs::File,
        path: PathBuf,
        size: u64,
    },
    Memory(Vec<u8>),
}

/// A sized source that hands out chunk payloads.
pub(crate) struct ChunkSource {
    layout: ChunkLayout,
    body: Body,
}

impl ChunkSource {
    pub(crate) fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Reads the payload of chunk `index`.
    ///
    /// A file that shrank since it was sized fails with an I/O error rather
    /// than producing a short chunk.
    pub(crate) async fn read_chunk(&mut self, index: u32) -> Result<Vec<u8>, TransferError> {
        let range = self.layout.chunk_range(index).ok_or_else(|| {
            TransferError::InvalidParameters(format!(
                "chunk {index} outside {} chunks",
                self.layout.total_chunks()
            ))
        })?;

        match &mut self.body {
            Body::File { file, path, .. } => {
                let mut buf = vec![0u8; (range.end - range.start) as usize];
                file.seek(SeekFrom::Start(range.start)).await?;
                file.read_exact(&mut buf).await.map_err(|e| {
                    std::io::Error::new(e.kind(), format!("{}: {e}", path.display()))
                })?;
                Ok(buf)
            }
            Body::Memory(bytes) => Ok(bytes[range.start as usize..range.end as usize].to_vec()),
        }
    }
}
