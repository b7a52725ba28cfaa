//! Local file byte source, read in fixed-size chunks

use super::{ByteSource, Opened, SourceError};
use futures::future::BoxFuture;
use futures::StreamExt;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const CHUNK_SIZE: usize = 64 * 1024;

pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn fetch(&self, offset: u64) -> Result<Opened, SourceError> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let total_bytes = file.metadata().await?.len();
        file.seek(SeekFrom::Start(offset)).await?;

        let chunks = futures::stream::unfold(Some(file), |state| async move {
            let mut file = state?;
            let mut buf = vec![0u8; CHUNK_SIZE];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(buf), Some(file)))
                }
                Err(e) => Some((Err(SourceError::Io(e)), None)),
            }
        })
        .boxed();

        Ok(Opened { chunks, total_bytes: Some(total_bytes) })
    }
}

impl ByteSource for FileSource {
    fn open(&mut self, offset: u64) -> BoxFuture<'_, Result<Opened, SourceError>> {
        Box::pin(self.fetch(offset))
    }
}
