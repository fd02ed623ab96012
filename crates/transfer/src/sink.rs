use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{TransferError, validate_file_name};

/// A boxed future returned by [`TransferSink::persist`].
pub type SinkFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<PathBuf>, TransferError>> + Send + 'a>>;

/// Destination for a received payload.
pub trait TransferSink: Send {
    /// Stores `bytes` under `file_name`. Returns the path written, if the
    /// sink writes to the filesystem.
    fn persist<'a>(&'a mut self, file_name: &'a str, bytes: &'a [u8]) -> SinkFuture<'a>;
}

/// Writes each payload to a file inside one directory.
///
/// Data goes to `<name>.part` first and is renamed into place once fully
/// written, so a failed write never leaves a truncated file under the final
/// name.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn write(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf, TransferError> {
        validate_file_name(file_name)?;

        let target = self.dir.join(file_name);
        let partial = self.dir.join(format!("{file_name}.part"));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Err(e) = write_file(&partial, bytes).await {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                warn!(path = %partial.display(), "failed to remove partial file: {cleanup}");
            }
            return Err(e.into());
        }
        tokio::fs::rename(&partial, &target).await?;

        debug!(path = %target.display(), bytes = bytes.len(), "payload written");
        Ok(target)
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

impl TransferSink for DirectorySink {
    fn persist<'a>(&'a mut self, file_name: &'a str, bytes: &'a [u8]) -> SinkFuture<'a> {
        Box::pin(async move { self.write(file_name, bytes).await.map(Some) })
    }
}

/// Writes payloads to any async writer (stdout, a socket, a `Vec<u8>`).
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl WriterSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> TransferSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn persist<'a>(&'a mut self, _file_name: &'a str, bytes: &'a [u8]) -> SinkFuture<'a> {
        Box::pin(async move {
            self.writer.write_all(bytes).await?;
            self.writer.flush().await?;
            Ok(None)
        })
    }
}
